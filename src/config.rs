//! Server configuration.
//!
//! No external config crate is in the dependency stack, so configuration is a
//! plain struct with a `Default` and an `from_env` override, mirroring
//! `DatabaseConfig` elsewhere in this codebase.

use std::env;

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host/port to bind the HTTP+websocket listener on.
    pub host: String,
    pub port: u16,

    /// SQLite connection string for the operation store.
    pub database_url: String,

    /// Capacity of a Hub's inbound operation queue before `OVERLOADED`.
    pub inbound_queue_capacity: usize,
    /// Capacity of a session's outbound broadcast channel before it is dropped.
    pub outbound_queue_capacity: usize,

    /// History retention window: operations older than this many versions
    /// behind `current_version` may be truncated once snapshotted.
    pub retention_window: u64,

    /// Sessions idle longer than this are reaped by the sweeper.
    pub session_idle_timeout_secs: u64,
    /// How often the idle sweeper runs.
    pub sweep_interval_secs: u64,
    /// Grace period a Hub with zero subscribers stays alive before eviction.
    pub hub_idle_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: "sqlite://collab.db".to_string(),
            inbound_queue_capacity: 1024,
            outbound_queue_capacity: 64,
            retention_window: 1000,
            session_idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
            hub_idle_grace_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Overlay environment variables onto the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = env::var("COLLAB_HOST") {
            config.host = host;
        }
        if let Ok(port) = env::var("COLLAB_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(url) = env::var("COLLAB_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(v) = env::var("COLLAB_INBOUND_QUEUE_CAPACITY") {
            if let Ok(v) = v.parse() {
                config.inbound_queue_capacity = v;
            }
        }
        if let Ok(v) = env::var("COLLAB_OUTBOUND_QUEUE_CAPACITY") {
            if let Ok(v) = v.parse() {
                config.outbound_queue_capacity = v;
            }
        }
        if let Ok(v) = env::var("COLLAB_RETENTION_WINDOW") {
            if let Ok(v) = v.parse() {
                config.retention_window = v;
            }
        }
        if let Ok(v) = env::var("COLLAB_SESSION_IDLE_TIMEOUT_SECS") {
            if let Ok(v) = v.parse() {
                config.session_idle_timeout_secs = v;
            }
        }

        config
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ServerConfig::default();
        assert_eq!(config.inbound_queue_capacity, 1024);
        assert_eq!(config.outbound_queue_capacity, 64);
        assert_eq!(config.retention_window, 1000);
        assert_eq!(config.session_idle_timeout_secs, 1800);
    }
}
