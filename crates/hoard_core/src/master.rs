use std::sync::Arc;

use hoard_config::HoardConfig;
use tracing::{error, info, instrument};

use crate::master::accept::{accept_loop, bind_listener};

mod accept;
mod startup;

pub struct Master {
    cfg: Arc<HoardConfig>,
}

impl Master {
    pub fn new(cfg: HoardConfig) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    /// Build the handler chain, bind the listener and serve until Ctrl-C.
    #[instrument(skip(self), fields(
        listen = %self.cfg.server().listen(),
        log_level = %self.cfg.global().log_level(),
    ))]
    pub async fn run(self) -> anyhow::Result<()> {
        self.log_startup();

        let semaphore = self.init_semaphore();
        let store = self.build_store()?;
        let handler = self.build_handler(store);

        let listen_addr = self.cfg.server().listen().to_string();
        let listener = bind_listener(&listen_addr).await?;

        info!(
            target: "hoard::master",
            listen = %listen_addr,
            "Cache front ready"
        );

        tokio::select! {
            res = accept_loop(listener, listen_addr.clone(), semaphore, handler) => {
                if let Err(e) = &res {
                    error!(
                        target: "hoard::master",
                        listen = %listen_addr,
                        error = ?e,
                        "accept_loop exited with an error"
                    );
                }
                res
            }
            _ = tokio::signal::ctrl_c() => {
                info!(target: "hoard::master", "Shutdown signal received");
                Ok(())
            }
        }
    }
}
