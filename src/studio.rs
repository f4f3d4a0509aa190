use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::CachedStore;
use crate::config::Config;
use crate::engine::Engine;
use crate::notify::NotifyHub;
use crate::scheduler::Scheduler;

/// Everything a connection needs: the engine for catalog work and reports, and the
/// scheduler, reading through the cache, for bookings.
pub struct Studio {
    pub engine: Arc<Engine>,
    pub scheduler: Scheduler<CachedStore<Engine>>,
}

impl Studio {
    /// Replay the WAL under `config.data_dir` and wire the layers together.
    pub fn open(config: &Config) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(
            config.wal_path(),
            notify,
            config.on_band_delete,
        )?);
        info!(
            "studio opened: {} (on band delete: {:?})",
            config.wal_path().display(),
            config.on_band_delete
        );
        Ok(Self::with_engine(engine, config.cache_ttl, config.store_timeout))
    }

    pub fn with_engine(engine: Arc<Engine>, cache_ttl: Duration, store_timeout: Duration) -> Self {
        let cache = CachedStore::new(engine.clone(), &engine.notify, cache_ttl);
        Self {
            engine,
            scheduler: Scheduler::new(Arc::new(cache), store_timeout),
        }
    }
}
