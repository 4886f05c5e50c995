use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::warn;

use crate::{
    common::{
        errors::{VoiceError, VoiceResult},
        socket::SocketSender,
        types::{GuildId, SessionId, UserId, unix_millis},
    },
    heartbeat::{HeartbeatScheduler, HeartbeatTarget},
    voice::{
        constants::LEGACY_PORT_SUFFIX,
        crypto::{EncryptionMode, KEY_LEN},
        opcodes::VoiceOpCode,
    },
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VoicePayload {
    pub op: u64,
    #[serde(default)]
    pub d: Value,
}

impl VoicePayload {
    pub fn new(op: VoiceOpCode, d: Value) -> Self {
        Self {
            op: u64::from(op.as_u8()),
            d,
        }
    }

    pub fn opcode(&self) -> Option<VoiceOpCode> {
        u8::try_from(self.op).ok().and_then(VoiceOpCode::from_u8)
    }
}

/// What the main gateway hands over for a voice connection: the
/// VOICE_SERVER_UPDATE endpoint and token plus our voice session id.
#[derive(Clone)]
pub struct VoiceServerInfo {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
    pub endpoint: String,
}

impl std::fmt::Debug for VoiceServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceServerInfo")
            .field("guild_id", &self.guild_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// `wss://{endpoint}/?v={version}`, dropping a trailing `:80`.
pub fn voice_url(endpoint: &str, version: u8) -> String {
    let host = endpoint
        .strip_suffix(LEGACY_PORT_SUFFIX)
        .unwrap_or(endpoint);
    if host.starts_with("ws://") || host.starts_with("wss://") {
        format!("{}/?v={}", host.trim_end_matches('/'), version)
    } else {
        format!("wss://{}/?v={}", host, version)
    }
}

pub fn identify(info: &VoiceServerInfo) -> VoicePayload {
    VoicePayload::new(
        VoiceOpCode::Identify,
        json!({
            "server_id": info.guild_id.to_string(),
            "user_id": info.user_id.to_string(),
            "session_id": info.session_id,
            "token": info.token,
        }),
    )
}

pub fn select_protocol(address: &str, port: u16, mode: EncryptionMode) -> VoicePayload {
    VoicePayload::new(
        VoiceOpCode::SelectProtocol,
        json!({
            "protocol": "udp",
            "data": {
                "address": address,
                "port": port,
                "mode": mode.wire_name(),
            }
        }),
    )
}

/// Millisecond timestamp as the nonce.
pub fn heartbeat() -> VoicePayload {
    VoicePayload::new(VoiceOpCode::Heartbeat, json!(unix_millis()))
}

pub fn speaking(speaking: bool, ssrc: u32) -> VoicePayload {
    VoicePayload::new(
        VoiceOpCode::Speaking,
        json!({
            "speaking": speaking,
            "delay": 0,
            "ssrc": ssrc,
        }),
    )
}

/// Parsed op 2 body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

/// Parsed op 4 body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub mode: EncryptionMode,
    pub secret_key: [u8; KEY_LEN],
}

impl SessionDescription {
    pub fn parse(d: &Value) -> VoiceResult<Self> {
        let mode_name = d["mode"].as_str().unwrap_or_default();
        let mode = EncryptionMode::from_name(mode_name)
            .ok_or_else(|| VoiceError::UnsupportedMode(mode_name.to_string()))?;

        let key: Vec<u8> = serde_json::from_value(d["secret_key"].clone())?;
        let secret_key: [u8; KEY_LEN] = key.as_slice().try_into().map_err(|_| {
            VoiceError::EncryptionUnavailable(format!(
                "secret key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            ))
        })?;
        Ok(Self { mode, secret_key })
    }
}

/// Write handle for the control socket.
#[derive(Clone)]
pub(crate) struct ControlSender(SocketSender);

impl ControlSender {
    pub(crate) fn new(sender: SocketSender) -> Self {
        Self(sender)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.0.is_open()
    }

    pub(crate) fn send(&self, payload: &VoicePayload) -> VoiceResult<()> {
        if !self.0.is_open() {
            return Err(VoiceError::NotConnected);
        }
        if self.0.send_text(serde_json::to_string(payload)?) {
            Ok(())
        } else {
            Err(VoiceError::NotConnected)
        }
    }

    pub(crate) fn close(&self) {
        self.0.close(CloseCode::Normal);
    }

    pub(crate) fn mark_closed(&self) {
        self.0.mark_closed();
    }
}

/// Control-channel state shared with the heartbeat loop.
pub(crate) struct VoiceControl {
    pub(crate) label: String,
    pub(crate) sender: ControlSender,
    pub(crate) heartbeat: HeartbeatScheduler,
}

impl HeartbeatTarget for VoiceControl {
    type Error = VoiceError;

    fn is_suspended(&self) -> bool {
        !self.sender.is_open()
    }

    fn send_heartbeat(&self) -> VoiceResult<()> {
        self.sender.send(&heartbeat())
    }

    fn on_zombie(&self) {
        // Voice beats are sent without ack checks, so this is never reached.
        warn!("[{}] Unexpected zombie report on voice heartbeat", self.label);
    }
}
