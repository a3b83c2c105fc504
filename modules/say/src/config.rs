use serde::Deserialize;

/// Configuration for the say module
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SayConfig {
    /// How long `say::slow` sleeps before answering.
    #[serde(default = "default_slow_delay_ms")]
    pub slow_delay_ms: u64,
    /// Optional cron spec for a heartbeat log line.
    #[serde(default)]
    pub heartbeat_cron: Option<String>,
}

impl Default for SayConfig {
    fn default() -> Self {
        Self {
            slow_delay_ms: default_slow_delay_ms(),
            heartbeat_cron: None,
        }
    }
}

fn default_slow_delay_ms() -> u64 {
    4_000
}
