use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::OnDelete;

/// Server settings, read once at startup from `BANDROOM_*` variables.
/// Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Staleness bound of the read cache.
    pub cache_ttl: Duration,
    /// Bound on every storage call made by the scheduler.
    pub store_timeout: Duration,
    pub on_band_delete: OnDelete,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "bandroom".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            cache_ttl: Duration::from_millis(2000),
            store_timeout: Duration::from_millis(2000),
            on_band_delete: OnDelete::Cascade,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            bind: lookup("BANDROOM_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "BANDROOM_PORT").unwrap_or(d.port),
            data_dir: lookup("BANDROOM_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            password: lookup("BANDROOM_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "BANDROOM_MAX_CONNECTIONS")
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "BANDROOM_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            metrics_port: parsed(&lookup, "BANDROOM_METRICS_PORT"),
            cache_ttl: parsed(&lookup, "BANDROOM_CACHE_TTL_MS")
                .map_or(d.cache_ttl, Duration::from_millis),
            store_timeout: parsed(&lookup, "BANDROOM_STORE_TIMEOUT_MS")
                .map_or(d.store_timeout, Duration::from_millis),
            on_band_delete: lookup("BANDROOM_ON_BAND_DELETE")
                .and_then(|v| OnDelete::parse(&v))
                .unwrap_or(d.on_band_delete),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("studio.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
