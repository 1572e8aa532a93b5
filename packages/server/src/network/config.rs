//! Network configuration for the HTTP and RPC listeners.

use std::time::Duration;

/// Listener and transport limits.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for every listener.
    pub host: String,
    /// HTTP port. 0 means OS-assigned.
    pub port: u16,
    /// RPC port. 0 means OS-assigned.
    pub rpc_port: u16,
    /// Dedicated Prometheus port; exposition is always served on the main
    /// HTTP port too.
    pub metrics_port: Option<u16>,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time an HTTP request may take end to end.
    pub request_timeout: Duration,
    /// Largest accepted HTTP body and RPC frame, in bytes.
    pub max_request_bytes: usize,
    /// Concurrent RPC connections; further connections wait for a slot.
    pub rpc_max_connections: usize,
    /// How long shutdown waits for in-flight requests.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            rpc_port: 0,
            metrics_port: None,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            max_request_bytes: 16 * 1024 * 1024,
            rpc_max_connections: 1024,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// `host:port` for the HTTP listener.
    #[must_use]
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert!(config.metrics_port.is_none());
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.max_request_bytes, 16_777_216);
        assert_eq!(config.http_addr(), "0.0.0.0:0");
    }
}
