//! Runtime around the cache: listener, connection serving and the static
//! origin the cache fronts.

pub mod master;
pub mod origin;
pub mod service;
