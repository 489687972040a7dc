//! Tee between the origin and the caller's sink.
//!
//! Every header and body write is forwarded to the caller as it happens and
//! copied into a buffer for the storage decision. Nothing is re-ordered or
//! merged. If the capture is dropped before `finish` (the request future was
//! cancelled) the buffered copy is simply discarded.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

use crate::sink::ResponseSink;

/// Response as the caller received it.
#[derive(Debug)]
pub(crate) struct CapturedResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

#[derive(Debug)]
pub(crate) enum CaptureOutcome {
    Complete(CapturedResponse),
    /// Body exceeded the configured object limit.
    TooLarge { limit: usize },
    /// A write to the caller failed part way.
    Aborted,
}

pub(crate) struct CaptureSink<'a> {
    inner: &'a mut dyn ResponseSink,
    staged: HeaderMap,
    sent: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
    limit: Option<usize>,
    overflowed: bool,
    aborted: bool,
}

impl<'a> CaptureSink<'a> {
    pub(crate) fn new(inner: &'a mut dyn ResponseSink, limit: Option<usize>) -> Self {
        Self {
            inner,
            staged: HeaderMap::new(),
            sent: None,
            body: BytesMut::new(),
            limit,
            overflowed: false,
            aborted: false,
        }
    }

    /// Send the head with `status` if the origin never wrote one.
    pub(crate) async fn ensure_head(&mut self, status: StatusCode) -> std::io::Result<()> {
        if self.sent.is_some() {
            return Ok(());
        }
        let headers = self.staged.clone();
        for (name, value) in headers.iter() {
            self.inner.headers_mut().append(name.clone(), value.clone());
        }
        self.sent = Some((status, headers));
        if let Err(e) = self.inner.write_head(status).await {
            self.aborted = true;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> CaptureOutcome {
        if self.aborted {
            return CaptureOutcome::Aborted;
        }
        if self.overflowed {
            return CaptureOutcome::TooLarge {
                limit: self.limit.unwrap_or(0),
            };
        }
        match self.sent {
            Some((status, headers)) => CaptureOutcome::Complete(CapturedResponse {
                status,
                headers,
                body: self.body.freeze(),
            }),
            None => CaptureOutcome::Aborted,
        }
    }
}

#[async_trait]
impl<'a> ResponseSink for CaptureSink<'a> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.staged
    }

    async fn write_head(&mut self, status: StatusCode) -> std::io::Result<()> {
        self.ensure_head(status).await
    }

    async fn write_body(&mut self, chunk: Bytes) -> std::io::Result<()> {
        self.ensure_head(StatusCode::OK).await?;

        if let Err(e) = self.inner.write_body(chunk.clone()).await {
            self.aborted = true;
            return Err(e);
        }

        if !self.overflowed {
            match self.limit {
                Some(limit) if self.body.len() + chunk.len() > limit => {
                    self.overflowed = true;
                    self.body = BytesMut::new();
                }
                _ => self.body.extend_from_slice(&chunk),
            }
        }
        Ok(())
    }
}
