use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{common::types::AnyResult, voice::EncryptionMode};

/// Settings for voice connections.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_voice_version")]
    pub version: u8,
    /// Client preference order; the first entry the server also offers wins.
    #[serde(default = "default_encryption_modes")]
    pub encryption_modes: Vec<EncryptionMode>,
    /// `None` or `0` waits for the discovery reply forever.
    #[serde(default = "default_handshake_timeout_ms")]
    pub discovery_timeout_ms: Option<u64>,
    /// Bound on waiting for READY and SESSION_DESCRIPTION.
    #[serde(default = "default_handshake_timeout_ms")]
    pub ready_timeout_ms: Option<u64>,
    /// Consecutive short reads tolerated before treating the source as ended.
    #[serde(default = "default_short_read_tolerance")]
    pub short_read_tolerance: u32,
    #[serde(default = "default_silence_frames")]
    pub silence_frames_on_stop: u32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            version: default_voice_version(),
            encryption_modes: default_encryption_modes(),
            discovery_timeout_ms: default_handshake_timeout_ms(),
            ready_timeout_ms: default_handshake_timeout_ms(),
            short_read_tolerance: default_short_read_tolerance(),
            silence_frames_on_stop: default_silence_frames(),
        }
    }
}

impl VoiceConfig {
    pub fn validate(&self) -> AnyResult<()> {
        if self.encryption_modes.is_empty() {
            return Err("voice.encryption_modes must list at least one encryption mode".into());
        }
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.discovery_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.ready_timeout_ms)
    }
}

fn non_zero_millis(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|&ms| ms > 0).map(Duration::from_millis)
}

fn default_voice_version() -> u8 {
    crate::voice::constants::VOICE_GATEWAY_VERSION
}

fn default_encryption_modes() -> Vec<EncryptionMode> {
    vec![
        EncryptionMode::Lite,
        EncryptionMode::Suffix,
        EncryptionMode::Standard,
    ]
}

fn default_handshake_timeout_ms() -> Option<u64> {
    Some(10_000)
}

fn default_short_read_tolerance() -> u32 {
    1
}

fn default_silence_frames() -> u32 {
    5
}
