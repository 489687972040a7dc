//! Bridge between hyper and the handler chain.

use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use hoard_cache::{BufferedSink, Handler, HandlerError};
use http::{HeaderValue, Request, Response, StatusCode, header::CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use tracing::{error, warn};

pub type SharedHandler = Arc<dyn Handler>;

/// hyper `service_fn` entry point: collect the body, then dispatch.
pub async fn handle_request(
    req: Request<Incoming>,
    handler: SharedHandler,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(target: "hoard::master", error = ?e, "Failed to read request body");
            return Ok(simple_response(StatusCode::BAD_REQUEST));
        }
    };

    Ok(dispatch(handler.as_ref(), Request::from_parts(parts, body)).await)
}

/// Run one decoded request through `handler` and build the reply.
pub async fn dispatch(handler: &dyn Handler, req: Request<Bytes>) -> Response<Full<Bytes>> {
    let mut sink = BufferedSink::new();

    match handler.serve(&req, &mut sink).await {
        // Nothing written: answer with the bare status the handler returned.
        Ok(status) if !sink.head_written() => simple_response(status),
        Ok(_) => sink.into_response().map(Full::new),
        Err(HandlerError::Origin { status, source }) => {
            error!(
                target: "hoard::origin",
                method = %req.method(),
                uri = %req.uri(),
                %status,
                error = ?source,
                "Origin failed"
            );
            simple_response(status)
        }
        Err(e) => {
            error!(target: "hoard::master", error = ?e, "Handler failed");
            simple_response(e.status())
        }
    }
}

fn simple_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{status}\n"))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
