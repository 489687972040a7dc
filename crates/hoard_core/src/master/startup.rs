use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use hoard_cache::{CacheHandler, CacheStore, DiskStore, MemoryStore};
use hoard_config::StoreKind;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::Master;
use crate::{origin::StaticOrigin, service::SharedHandler};

const SWEEP_INTERVAL_MIN: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL_MAX: Duration = Duration::from_secs(60);

impl Master {
    pub(super) fn log_startup(&self) {
        info!(target: "hoard::master", "Starting HOARD");
        let cache = self.cfg.cache();
        info!(
            target: "hoard::master",
            listen = %self.cfg.server().listen(),
            root = %self.cfg.server().root(),
            cacheable_paths = ?cache.cacheable_paths(),
            default_max_age_secs = cache.default_max_age_secs(),
            max_object_bytes = ?cache.max_object_bytes(),
            store = ?cache.store(),
            "Configuration loaded"
        );
    }

    pub(super) fn init_semaphore(&self) -> Arc<Semaphore> {
        let max_conns = self.cfg.server().max_connections();
        let semaphore = Arc::new(Semaphore::new(max_conns));
        info!(
            target: "hoard::master",
            max_conns,
            "Connection semaphore initialized"
        );
        semaphore
    }

    /// Build the configured backend and start its expiry sweeper.
    pub(super) fn build_store(&self) -> anyhow::Result<Arc<dyn CacheStore>> {
        let cache = self.cfg.cache();
        let every = sweep_interval(cache.default_max_age_secs());
        match cache.store() {
            StoreKind::Memory => {
                let store = Arc::new(MemoryStore::new());
                let swept = store.clone();
                spawn_sweeper("memory", every, move || {
                    let store = swept.clone();
                    async move { store.remove_expired() }
                });
                Ok(store as Arc<dyn CacheStore>)
            }
            StoreKind::Disk => {
                let dir = cache
                    .cache_dir()
                    .context("store = \"disk\" requires cache.cache_dir")?;
                let store = Arc::new(DiskStore::new(dir));
                info!(
                    target: "hoard::master",
                    cache_dir = %dir,
                    "Disk cache store selected"
                );
                let swept = store.clone();
                spawn_sweeper("disk", every, move || {
                    let store = swept.clone();
                    async move {
                        store.remove_expired().await.unwrap_or_else(|e| {
                            warn!(target: "hoard::store", layer = "disk", error = %e, "Sweep failed");
                            0
                        })
                    }
                });
                Ok(store as Arc<dyn CacheStore>)
            }
        }
    }

    pub(super) fn build_handler(&self, store: Arc<dyn CacheStore>) -> SharedHandler {
        let origin = StaticOrigin::from_config(self.cfg.server());
        Arc::new(CacheHandler::new(
            Arc::new(self.cfg.cache().clone()),
            store,
            origin,
        ))
    }
}

fn sweep_interval(default_max_age_secs: u64) -> Duration {
    Duration::from_secs(default_max_age_secs).clamp(SWEEP_INTERVAL_MIN, SWEEP_INTERVAL_MAX)
}

fn spawn_sweeper<F, Fut>(layer: &'static str, every: Duration, sweep: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = usize> + Send + 'static,
{
    info!(
        target: "hoard::master",
        layer,
        interval_secs = every.as_secs(),
        "Cache store sweeper started"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            sweep().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::sweep_interval;

    #[test]
    fn sweep_interval_is_clamped() {
        assert_eq!(sweep_interval(0), Duration::from_secs(1));
        assert_eq!(sweep_interval(30), Duration::from_secs(30));
        assert_eq!(sweep_interval(86_400), Duration::from_secs(60));
    }
}
