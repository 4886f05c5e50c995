//! Wire envelope and the frames the client sends.

use std::{io::Read, time::Duration};

use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    common::{
        errors::{GatewayError, GatewayResult},
        types::{ChannelId, GuildId, SessionId},
    },
    configs::GatewayConfig,
    gateway::{identity::Credentials, opcodes::OpCode},
};

/// `{op, d, s, t}`; `s` and `t` only appear on dispatches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayPayload {
    /// Raw code; out-of-range values still decode.
    pub op: u64,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op.code(),
            d,
            s: None,
            t: None,
        }
    }

    /// `None` for opcodes this client does not know.
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_code(self.op)
    }

    pub fn from_text(text: &str) -> GatewayResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decodes a zlib-compressed binary frame.
    pub fn from_compressed(bytes: &[u8]) -> GatewayResult<Self> {
        let mut inflated = Vec::with_capacity(bytes.len() * 4);
        ZlibDecoder::new(bytes)
            .read_to_end(&mut inflated)
            .map_err(GatewayError::Inflate)?;
        Ok(serde_json::from_slice(&inflated)?)
    }

    pub fn to_json(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Heartbeat interval carried by HELLO, converted from milliseconds.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.d["heartbeat_interval"]
            .as_u64()
            .map(Duration::from_millis)
    }
}

impl std::fmt::Display for GatewayPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "op={:?} ({})", op, self.op)?,
            None => write!(f, "op=unknown ({})", self.op)?,
        }
        if let Some(t) = &self.t {
            write!(f, ", t={t}")?;
        }
        if let Some(s) = self.s {
            write!(f, ", s={s}")?;
        }
        Ok(())
    }
}

pub fn heartbeat(sequence: u64) -> GatewayPayload {
    GatewayPayload::new(OpCode::Heartbeat, json!(sequence))
}

pub fn identify(credentials: &Credentials, config: &GatewayConfig) -> GatewayPayload {
    let mut d = json!({
        "token": credentials.token,
        "properties": credentials.properties,
        "compress": config.compress,
        "large_threshold": config.large_threshold,
        "intents": config.intents,
    });
    if let Some(shard) = config.shard {
        d["shard"] = json!(shard);
    }
    GatewayPayload::new(OpCode::Identify, d)
}

pub fn resume(credentials: &Credentials, session_id: &SessionId, sequence: u64) -> GatewayPayload {
    GatewayPayload::new(
        OpCode::Resume,
        json!({
            "token": credentials.token,
            "session_id": session_id,
            "seq": sequence,
        }),
    )
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Dnd,
    Idle,
    Invisible,
    Offline,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
}

impl Activity {
    pub fn playing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// Unix millis since the client went idle.
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: Status,
    pub afk: bool,
}

pub fn presence_update(presence: &PresenceUpdate) -> GatewayPayload {
    GatewayPayload::new(OpCode::PresenceUpdate, json!(presence))
}

/// `channel_id = None` leaves the voice channel.
pub fn voice_state_update(
    guild_id: GuildId,
    channel_id: Option<ChannelId>,
    self_mute: bool,
    self_deaf: bool,
) -> GatewayPayload {
    GatewayPayload::new(
        OpCode::VoiceStateUpdate,
        json!({
            "guild_id": guild_id.to_string(),
            "channel_id": channel_id.map(|c| c.to_string()),
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        }),
    )
}

pub fn request_guild_members(guild_id: GuildId, query: &str, limit: u32) -> GatewayPayload {
    GatewayPayload::new(
        OpCode::RequestGuildMembers,
        json!({
            "guild_id": guild_id.to_string(),
            "query": query,
            "limit": limit,
        }),
    )
}
