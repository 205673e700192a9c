// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own tuning vars — this module
// covers the core server settings.

use std::net::SocketAddr;
use std::time::Duration;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string; unset means in-memory session store.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `cinder_relay=debug`).
    pub log_filter: String,
    /// How often the inactivity reaper sweeps the store.
    pub reaper_interval: Duration,
    /// Sessions idle longer than this are reaped.
    pub inactivity_threshold: Duration,
}

const DEFAULT_REAPER_INTERVAL_SECS: u64 = 300;
const DEFAULT_INACTIVITY_THRESHOLD_SECS: u64 = 1800;

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CINDER_RELAY_HOST` | `0.0.0.0` |
    /// | `CINDER_RELAY_PORT` | `8080` |
    /// | `CINDER_RELAY_DATABASE_URL` | *(none — in-memory store)* |
    /// | `CINDER_RELAY_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `CINDER_RELAY_LOG_FILTER` | `info` |
    /// | `CINDER_RELAY_REAPER_INTERVAL_SECS` | `300` |
    /// | `CINDER_RELAY_INACTIVITY_THRESHOLD_SECS` | `1800` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CINDER_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CINDER_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("CINDER_RELAY_DATABASE_URL").ok();
        let cors_origins = env("CINDER_RELAY_CORS_ORIGINS").ok();

        let log_filter =
            env("CINDER_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let reaper_interval = env("CINDER_RELAY_REAPER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS));

        let inactivity_threshold = env("CINDER_RELAY_INACTIVITY_THRESHOLD_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_INACTIVITY_THRESHOLD_SECS));

        Self {
            listen_addr,
            database_url,
            cors_origins,
            log_filter,
            reaper_interval,
            inactivity_threshold,
        }
    }
}
