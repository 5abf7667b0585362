//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::ratelimit::RateConfig;

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Directory for the filesystem blob store.
    pub data_dir: PathBuf,
    /// RocksDB path; when set it replaces the filesystem store.
    pub db_path: Option<PathBuf>,
    /// Cadence of the dirty-document flush timer.
    pub flush_interval: Duration,
    /// Per-connection rate limiting.
    pub rate: RateConfig,
    /// Whether `GET /debug/state` answers. Off in production.
    pub expose_debug_state: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            data_dir: PathBuf::from("data"),
            db_path: None,
            flush_interval: Duration::from_secs(1),
            rate: RateConfig::default(),
            expose_debug_state: true,
        }
    }
}

impl ServerConfig {
    /// Read configuration from the environment: `PORT`, `DATA_DIR`,
    /// `DB_PATH`, `TANDEM_ENV` (`production` hides the debug endpoint).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.bind_addr = format!("0.0.0.0:{port}");
            }
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }
        if std::env::var("TANDEM_ENV").as_deref() == Ok("production") {
            config.expose_debug_state = false;
        }
        config
    }

    /// Config for tests: explicit bind address, isolated data dir, fast
    /// flushes.
    pub fn for_testing(bind_addr: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            data_dir: data_dir.into(),
            db_path: None,
            flush_interval: Duration::from_millis(100),
            rate: RateConfig::default(),
            expose_debug_state: true,
        }
    }
}
