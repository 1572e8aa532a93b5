//! Process configuration from the environment.
//!
//! [`RuntimeConfig`] is a clap derive struct whose every field has an `env`
//! fallback, so `predictor-serve` is configured the same way whether it is
//! given flags or only environment variables. Library users call
//! [`RuntimeConfig::from_env`].

use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Parser;

use crate::metrics::DeploymentLabels;
use crate::network::NetworkConfig;
use crate::service::ServerConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "predictor-serve", about = "Serve a component over HTTP and RPC")]
pub struct RuntimeConfig {
    #[arg(long, env = "PREDICTOR_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PREDICTOR_HTTP_PORT", default_value_t = 9000)]
    pub http_port: u16,

    #[arg(long, env = "PREDICTOR_RPC_PORT", default_value_t = 5000)]
    pub rpc_port: u16,

    /// Serve the Prometheus exposition on this port as well.
    #[arg(long, env = "PREDICTOR_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Runtime worker threads; defaults to the number of CPUs.
    #[arg(long, env = "PREDICTOR_WORKERS")]
    pub workers: Option<usize>,

    #[arg(long, env = "PREDICTOR_RPC_MAX_CONNECTIONS", default_value_t = 1024)]
    pub rpc_max_connections: usize,

    #[arg(
        long,
        env = "INCLUDE_METRICS_IN_CLIENT_RESPONSE",
        default_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub include_metrics_in_response: bool,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, env = "PREDICTOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "PREDICTOR_LOG_JSON", default_value = "false", value_parser = BoolishValueParser::new())]
    pub log_json: bool,

    #[arg(long, env = "PREDICTOR_MAX_REQUEST_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_request_bytes: usize,

    #[arg(long, env = "PREDICTOR_CALL_TIMEOUT_MS", default_value_t = 30_000)]
    pub call_timeout_ms: u64,

    #[arg(long, env = "PREDICTOR_MAX_CONCURRENT_OPERATIONS", default_value_t = 1000)]
    pub max_concurrent_operations: u32,

    /// Comma-separated list; `*` allows any origin.
    #[arg(long, env = "PREDICTOR_CORS_ORIGINS", default_value = "*", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    #[arg(long, env = "PREDICTIVE_UNIT_ID", default_value = "0")]
    pub predictive_unit_id: String,

    #[arg(long, env = "PREDICTIVE_UNIT_IMAGE", default_value = "")]
    pub predictive_unit_image: String,

    #[arg(long, env = "SELDON_DEPLOYMENT_ID", default_value = "")]
    pub deployment_name: String,

    #[arg(long, env = "PREDICTOR_ID", default_value = "")]
    pub predictor_name: String,

    #[arg(long, env = "PREDICTOR_MODEL_NAME", default_value = "")]
    pub model_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 9000,
            rpc_port: 5000,
            metrics_port: None,
            workers: None,
            rpc_max_connections: 1024,
            include_metrics_in_response: true,
            log_level: "info".to_string(),
            log_json: false,
            max_request_bytes: 16 * 1024 * 1024,
            call_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            cors_origins: vec!["*".to_string()],
            predictive_unit_id: "0".to_string(),
            predictive_unit_image: String::new(),
            deployment_name: String::new(),
            predictor_name: String::new(),
            model_name: String::new(),
        }
    }
}

impl RuntimeConfig {
    /// Reads the configuration from environment variables only.
    ///
    /// # Errors
    ///
    /// Fails when a variable holds a value of the wrong type.
    pub fn from_env() -> Result<Self, clap::Error> {
        Self::try_parse_from(["predictor-serve"])
    }

    #[must_use]
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.http_port,
            rpc_port: self.rpc_port,
            metrics_port: self.metrics_port,
            cors_origins: self.cors_origins.clone(),
            request_timeout: Duration::from_millis(self.call_timeout_ms.saturating_add(1000)),
            max_request_bytes: self.max_request_bytes,
            rpc_max_connections: self.rpc_max_connections,
            ..NetworkConfig::default()
        }
    }

    #[must_use]
    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            default_operation_timeout_ms: self.call_timeout_ms,
            max_concurrent_operations: self.max_concurrent_operations,
            include_metrics_in_response: self.include_metrics_in_response,
            predictive_unit_id: self.predictive_unit_id.clone(),
            predictive_unit_image: self.predictive_unit_image.clone(),
            model_name: self.model_name.clone(),
        }
    }

    /// Labels stamped on every exposed metric series.
    #[must_use]
    pub fn deployment(&self) -> DeploymentLabels {
        DeploymentLabels::new(
            &self.deployment_name,
            &self.predictor_name,
            &self.model_name,
            &self.predictive_unit_image,
        )
    }
}
