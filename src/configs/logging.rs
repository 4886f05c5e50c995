use serde::{Deserialize, Serialize};

/// `[logging]` section, consumed by `common::logger`.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    /// Base level, `info` when unset.
    pub level: Option<String>,
    /// Extra `EnvFilter` directives appended after the level.
    pub filters: Option<String>,
}
