use std::{net::SocketAddr, sync::Arc};

use hyper::{Request, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{Instrument, debug, error, info, instrument};

use crate::service::{SharedHandler, handle_request};

pub(crate) async fn bind_listener(listen_addr: &str) -> anyhow::Result<TcpListener> {
    info!(
        target: "hoard::master",
        listen = %listen_addr,
        "Binding listener"
    );

    match TcpListener::bind(listen_addr).await {
        Ok(listener) => {
            info!(
                target: "hoard::master",
                listen = %listen_addr,
                "Bind() successful"
            );
            Ok(listener)
        }
        Err(e) => {
            error!(
                target: "hoard::master",
                listen = %listen_addr,
                error = ?e,
                "Failed to bind listener"
            );
            Err(e.into())
        }
    }
}

struct AcceptedConn {
    stream: TcpStream,
    addr: SocketAddr,
    permit: OwnedSemaphorePermit,
}

async fn accept_with_permit(
    listener: &TcpListener,
    listen_addr: &str,
    semaphore: &Arc<Semaphore>,
) -> anyhow::Result<AcceptedConn> {
    // Take the permit first so a saturated server stops accepting.
    let permit = match semaphore.clone().acquire_owned().await {
        Ok(p) => p,
        Err(e) => {
            error!(
                target: "hoard::master",
                listen = %listen_addr,
                error = ?e,
                "Failed to acquire connection permit"
            );
            return Err(e.into());
        }
    };

    let (stream, addr) = match listener.accept().await {
        Ok(pair) => pair,
        Err(e) => {
            error!(
                target: "hoard::master",
                listen = %listen_addr,
                error = ?e,
                "Failed to accept connection"
            );
            return Err(e.into());
        }
    };

    debug!(
        target: "hoard::master",
        listen = %listen_addr,
        client_addr = %addr,
        available_permits = semaphore.available_permits(),
        "Connection accepted"
    );

    Ok(AcceptedConn {
        stream,
        addr,
        permit,
    })
}

#[instrument(
    skip(listener, semaphore, handler),
    fields(
        listen = %listen_addr,
        available_permits = semaphore.available_permits(),
    )
)]
pub(crate) async fn accept_loop(
    listener: TcpListener,
    listen_addr: String,
    semaphore: Arc<Semaphore>,
    handler: SharedHandler,
) -> anyhow::Result<()> {
    info!(
        target: "hoard::master",
        listen = %listen_addr,
        "accept_loop started for listening socket"
    );

    loop {
        let AcceptedConn { stream, addr, permit } =
            accept_with_permit(&listener, &listen_addr, &semaphore).await?;

        let handler = handler.clone();
        let span = tracing::info_span!(
            "connection",
            client_addr = %addr,
            listen = %listen_addr,
        );

        tokio::spawn(
            async move {
                let _permit = permit;
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move { handle_request(req, handler).await }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    error!(
                        target: "hoard::master",
                        client_addr = %addr,
                        error = ?e,
                        "Error while serving connection"
                    );
                } else {
                    debug!(
                        target: "hoard::master",
                        client_addr = %addr,
                        "Connection closed"
                    );
                }
            }
            .instrument(span),
        );
    }
}
