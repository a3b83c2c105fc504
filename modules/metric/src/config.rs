use serde::Deserialize;

/// Configuration for the metric module
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    /// Calls at least this slow are logged and counted as slow.
    #[serde(default = "default_slow_call_ms")]
    pub slow_call_ms: u64,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            slow_call_ms: default_slow_call_ms(),
        }
    }
}

fn default_slow_call_ms() -> u64 {
    3_000
}
