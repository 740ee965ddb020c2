// Coordinator configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The record and blob service clients receive their endpoints
// from here; nothing else in the crate reads the environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Core coordinator configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Base URL of the record service (user / workspace metadata).
    pub records_base_url: String,
    /// Service key sent to the record service.
    pub records_service_key: String,
    /// Base URL of the blob store holding playground file bytes.
    pub blobs_base_url: String,
    /// Service key sent to the blob store.
    pub blobs_service_key: String,
    /// Largest accepted `save_file` payload, in bytes.
    pub max_save_bytes: usize,
    /// Token-bucket capacity for the `save_file` operation.
    pub save_rate_capacity: f64,
    /// Token-bucket refill rate for the `save_file` operation, per second.
    pub save_rate_refill_per_sec: f64,
    /// How long an ownerless workspace is kept before teardown.
    pub drain_grace: Duration,
    /// Log filter directive (e.g. `info`, `sandpit_relay=debug`).
    pub log_filter: String,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SANDPIT_RELAY_HOST` | `0.0.0.0` |
    /// | `SANDPIT_RELAY_PORT` | `4000` |
    /// | `SANDPIT_RELAY_RECORDS_URL` | `http://localhost:8787` |
    /// | `SANDPIT_RELAY_RECORDS_SERVICE_KEY` | dev-only placeholder |
    /// | `SANDPIT_RELAY_BLOBS_URL` | `http://localhost:8788` |
    /// | `SANDPIT_RELAY_BLOBS_SERVICE_KEY` | dev-only placeholder |
    /// | `SANDPIT_RELAY_MAX_SAVE_BYTES` | `131072` |
    /// | `SANDPIT_RELAY_SAVE_RATE_CAPACITY` | `5` |
    /// | `SANDPIT_RELAY_SAVE_RATE_REFILL_PER_SEC` | `1` |
    /// | `SANDPIT_RELAY_DRAIN_GRACE_SECS` | `20` |
    /// | `SANDPIT_RELAY_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("SANDPIT_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("SANDPIT_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4000);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let records_base_url = env("SANDPIT_RELAY_RECORDS_URL")
            .unwrap_or_else(|_| "http://localhost:8787".into());
        let records_service_key = env("SANDPIT_RELAY_RECORDS_SERVICE_KEY")
            .unwrap_or_else(|_| "sandpit_local_development_records_key".into());

        let blobs_base_url = env("SANDPIT_RELAY_BLOBS_URL")
            .unwrap_or_else(|_| "http://localhost:8788".into());
        let blobs_service_key = env("SANDPIT_RELAY_BLOBS_SERVICE_KEY")
            .unwrap_or_else(|_| "sandpit_local_development_blobs_key".into());

        let max_save_bytes = env("SANDPIT_RELAY_MAX_SAVE_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(131_072);

        let save_rate_capacity = env("SANDPIT_RELAY_SAVE_RATE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|capacity: &f64| *capacity > 0.0)
            .unwrap_or(5.0);
        let save_rate_refill_per_sec = env("SANDPIT_RELAY_SAVE_RATE_REFILL_PER_SEC")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|refill: &f64| *refill > 0.0)
            .unwrap_or(1.0);

        let drain_grace_secs: u64 = env("SANDPIT_RELAY_DRAIN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let log_filter = env("SANDPIT_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            records_base_url,
            records_service_key,
            blobs_base_url,
            blobs_service_key,
            max_save_bytes,
            save_rate_capacity,
            save_rate_refill_per_sec,
            drain_grace: Duration::from_secs(drain_grace_secs),
            log_filter,
        }
    }

    /// Returns true when using a development-only service key.
    pub fn is_dev_service_key(&self) -> bool {
        self.records_service_key == "sandpit_local_development_records_key"
            || self.blobs_service_key == "sandpit_local_development_blobs_key"
    }
}
