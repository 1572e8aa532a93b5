/// Configuration of the operation pipeline and response assembly.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-call timeout in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Maximum number of concurrent operations before load shedding.
    pub max_concurrent_operations: u32,
    /// Echo recorded metrics into the response's `meta.metrics`.
    pub include_metrics_in_response: bool,
    /// Id of this serving unit; keys `meta.requestPath` and selects the
    /// feedback routing entry.
    pub predictive_unit_id: String,
    /// Image of this serving unit, recorded in `meta.requestPath`.
    pub predictive_unit_image: String,
    /// Default `name` of the metadata document.
    pub model_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            include_metrics_in_response: true,
            predictive_unit_id: "0".to_string(),
            predictive_unit_image: String::new(),
            model_name: String::new(),
        }
    }
}
