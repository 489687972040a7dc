//! Static file origin served behind the cache.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use hoard_cache::{Handler, HandlerError, ResponseSink};
use hoard_config::ServerConfig;
use http::{
    HeaderValue, Method, Request, StatusCode,
    header::{ALLOW, CONTENT_TYPE, LAST_MODIFIED},
};
use httpdate::fmt_http_date;
use mime_guess::mime;
use tokio::fs;
use tracing::debug;

const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";

/// Serves files below `root`; directory requests map to `index`.
#[derive(Debug, Clone)]
pub struct StaticOrigin {
    root: PathBuf,
    index: String,
}

impl StaticOrigin {
    pub fn new(root: impl Into<PathBuf>, index: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index: index.into(),
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self::new(server.root(), server.index())
    }
}

#[async_trait]
impl Handler for StaticOrigin {
    async fn serve(
        &self,
        req: &Request<Bytes>,
        sink: &mut dyn ResponseSink,
    ) -> Result<StatusCode, HandlerError> {
        if !matches!(*req.method(), Method::GET | Method::HEAD) {
            sink.headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return write_text(sink, StatusCode::METHOD_NOT_ALLOWED).await;
        }

        let Some(rel) = resolve_relative_path(req.uri().path(), &self.index) else {
            return write_text(sink, StatusCode::NOT_FOUND).await;
        };
        let mut file_path = self.root.join(&rel);

        let mut metadata = match fs::metadata(&file_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return write_text(sink, StatusCode::NOT_FOUND).await;
            }
            Err(e) => return Err(HandlerError::origin(StatusCode::INTERNAL_SERVER_ERROR, e)),
        };

        if metadata.is_dir() {
            file_path.push(&self.index);
            metadata = match fs::metadata(&file_path).await {
                Ok(meta) if meta.is_file() => meta,
                _ => return write_text(sink, StatusCode::NOT_FOUND).await,
            };
        }

        debug!(target: "hoard::origin", path = %file_path.display(), "Serving static file");

        let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
        let content_type = if mime.type_() == mime::TEXT {
            format!("{}; charset=utf-8", mime.essence_str())
        } else {
            mime.essence_str().to_string()
        };

        let headers = sink.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        if let Some(value) = metadata
            .modified()
            .ok()
            .and_then(|t| HeaderValue::from_str(&fmt_http_date(t)).ok())
        {
            headers.insert(LAST_MODIFIED, value);
        }

        if *req.method() == Method::HEAD {
            sink.write_head(StatusCode::OK).await?;
            return Ok(StatusCode::OK);
        }

        let body = match fs::read(&file_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return write_text(sink, StatusCode::NOT_FOUND).await;
            }
            Err(e) => return Err(HandlerError::origin(StatusCode::INTERNAL_SERVER_ERROR, e)),
        };

        sink.write_head(StatusCode::OK).await?;
        sink.write_body(Bytes::from(body)).await?;
        Ok(StatusCode::OK)
    }
}

async fn write_text(
    sink: &mut dyn ResponseSink,
    status: StatusCode,
) -> Result<StatusCode, HandlerError> {
    sink.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN_UTF8));
    sink.write_head(status).await?;
    sink.write_body(Bytes::from(format!("{status}\n"))).await?;
    Ok(status)
}

/// Map a request path to a path relative to the root, rejecting traversal.
fn resolve_relative_path(req_path: &str, index: &str) -> Option<String> {
    if !is_safe_request_path(req_path) {
        return None;
    }

    let tail = req_path.trim_start_matches('/');
    if tail.is_empty() {
        Some(index.to_string())
    } else {
        Some(tail.to_string())
    }
}

fn is_safe_request_path(path: &str) -> bool {
    let decoded = decode_path_for_check(path);
    if decoded.contains("//") || decoded.contains('\\') {
        return false;
    }
    !decoded.split('/').any(|segment| segment == "..")
}

/// Decode only the escapes that matter for traversal checks.
fn decode_path_for_check(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(h1), Some(h2)) = (from_hex(bytes[i + 1]), from_hex(bytes[i + 2])) {
                match (h1 << 4) | h2 {
                    value @ (b'.' | b'/' | b'\\') => out.push(value as char),
                    _ => out.push_str(&path[i..i + 3]),
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn from_hex(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
