use serde::{Deserialize, Serialize};

/// Settings for the primary gateway session.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_version")]
    pub version: u8,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Ask the server to zlib-compress large payloads.
    #[serde(default = "default_true")]
    pub compress: bool,
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,
    #[serde(default)]
    pub intents: u64,
    /// `[shard_id, shard_count]`, sent as the identify shard key.
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
    /// Treat a missed heartbeat ack as a zombie connection.
    #[serde(default = "default_true")]
    pub check_heartbeat_acks: bool,
    /// `None` keeps reconnecting forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: default_gateway_version(),
            encoding: default_encoding(),
            compress: true,
            large_threshold: default_large_threshold(),
            intents: 0,
            shard: None,
            check_heartbeat_acks: true,
            max_reconnect_attempts: None,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Reconnect delay policy for unplanned disconnects.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_secs")]
    pub initial_secs: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_cap_secs")]
    pub cap_secs: f64,
    #[serde(default = "default_jitter_secs")]
    pub jitter_secs: f64,
    /// Reset falloff once a connection has stayed active this long.
    /// `None` never resets.
    #[serde(default)]
    pub reset_after_stable_secs: Option<f64>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: default_initial_secs(),
            multiplier: default_multiplier(),
            cap_secs: default_cap_secs(),
            jitter_secs: default_jitter_secs(),
            reset_after_stable_secs: None,
        }
    }
}

fn default_gateway_version() -> u8 {
    crate::gateway::constants::GATEWAY_VERSION
}

fn default_encoding() -> String {
    "json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_large_threshold() -> u32 {
    100
}

fn default_initial_secs() -> f64 {
    1.0
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_cap_secs() -> f64 {
    120.0
}

fn default_jitter_secs() -> f64 {
    10.0
}
