//! Handler chain and output sink abstractions shared by the cache, the
//! origin and the host runtime.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Request, Response, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The origin could not produce a response. Never cached.
    #[error("origin failed with status {status}: {source}")]
    Origin {
        status: StatusCode,
        #[source]
        source: anyhow::Error,
    },
    /// Writing to the caller failed; the caller is gone.
    #[error("response sink closed: {0}")]
    Sink(#[from] std::io::Error),
}

impl HandlerError {
    pub fn origin(status: StatusCode, source: impl Into<anyhow::Error>) -> Self {
        Self::Origin {
            status,
            source: source.into(),
        }
    }

    /// Status the caller should see for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Origin { status, .. } => *status,
            Self::Sink(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Where a handler writes its response.
///
/// Headers are staged through `headers_mut` and go out with `write_head`.
/// Writing body before the head implies `200 OK`.
#[async_trait]
pub trait ResponseSink: Send {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    async fn write_head(&mut self, status: StatusCode) -> std::io::Result<()>;

    async fn write_body(&mut self, chunk: Bytes) -> std::io::Result<()>;
}

/// One stage of the request-processing chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(
        &self,
        req: &Request<Bytes>,
        sink: &mut dyn ResponseSink,
    ) -> Result<StatusCode, HandlerError>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for std::sync::Arc<H> {
    async fn serve(
        &self,
        req: &Request<Bytes>,
        sink: &mut dyn ResponseSink,
    ) -> Result<StatusCode, HandlerError> {
        (**self).serve(req, sink).await
    }
}

/// Sink that collects the whole response in memory.
#[derive(Debug, Default)]
pub struct BufferedSink {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Written status, or `200 OK` if nothing was written yet.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn head_written(&self) -> bool {
        self.status.is_some()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_response(self) -> Response<Bytes> {
        let mut response = Response::new(self.body.freeze());
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

#[async_trait]
impl ResponseSink for BufferedSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_head(&mut self, status: StatusCode) -> std::io::Result<()> {
        if self.status.is_none() {
            self.status = Some(status);
        }
        Ok(())
    }

    async fn write_body(&mut self, chunk: Bytes) -> std::io::Result<()> {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(&chunk);
        Ok(())
    }
}
