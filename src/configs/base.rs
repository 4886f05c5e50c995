use serde::{Deserialize, Serialize};

use crate::{common::types::AnyResult, configs::*};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        tracing::info!("Loading configuration from: {}", config_path);

        let config_str = std::fs::read_to_string(config_path)?;
        if config_str.is_empty() {
            return Err(format!("{} is empty", config_path).into());
        }

        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(s: &str) -> AnyResult<Self> {
        let config: Config = toml::from_str(s)?;
        config.voice.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::EncryptionMode;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.gateway.version, 9);
        assert!(config.gateway.check_heartbeat_acks);
        assert_eq!(config.gateway.max_reconnect_attempts, None);
        assert_eq!(config.gateway.backoff.cap_secs, 120.0);
        assert_eq!(config.voice.short_read_tolerance, 1);
        assert!(config.logging.is_none());
    }

    #[test]
    fn partial_sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [gateway]
            intents = 513
            shard = [1, 4]
            max_reconnect_attempts = 12

            [gateway.backoff]
            reset_after_stable_secs = 300.0

            [voice]
            encryption_modes = ["lite", "xsalsa20_poly1305", "suffix"]
            discovery_timeout_ms = 2500

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.intents, 513);
        assert_eq!(config.gateway.shard, Some([1, 4]));
        assert_eq!(config.gateway.max_reconnect_attempts, Some(12));
        assert_eq!(config.gateway.backoff.reset_after_stable_secs, Some(300.0));
        assert_eq!(config.gateway.backoff.multiplier, 1.5);
        assert_eq!(
            config.voice.encryption_modes,
            vec![
                EncryptionMode::Lite,
                EncryptionMode::Standard,
                EncryptionMode::Suffix
            ]
        );
        assert_eq!(config.voice.discovery_timeout_ms, Some(2500));
        assert_eq!(config.logging.unwrap().level.as_deref(), Some("debug"));
    }

    #[test]
    fn empty_mode_list_is_rejected() {
        let err = Config::from_toml_str("[voice]\nencryption_modes = []\n").unwrap_err();
        assert!(err.to_string().contains("encryption"));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Config::from_toml_str("[voice]\nencryption_modes = [\"plain\"]\n").is_err());
    }
}
