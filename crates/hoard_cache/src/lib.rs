//! HTTP response cache placed between a dispatcher and an origin handler.
//!
//! [`CacheHandler`] decides per exchange whether a response may be stored
//! ([`CachePolicy`]), derives its [`CacheKey`], replays live entries from a
//! pluggable [`CacheStore`] and otherwise runs the origin through a capture
//! so the response reaches the caller and the store unchanged.

mod capture;
mod entry;
mod handler;
mod key;
mod policy;
mod sink;
mod store;

pub use entry::CacheEntry;
pub use handler::CacheHandler;
pub use key::CacheKey;
pub use policy::{CacheDecision, CachePolicy, MAX_TTL_SECS, SkipReason};
pub use sink::{BufferedSink, Handler, HandlerError, ResponseSink};
pub use store::{CacheStore, DiskStore, MemoryStore, StoreError};
