use std::time::Duration;

/// Voice gateway version requested in the WebSocket URL.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Duration of one Opus frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Samples per channel in one frame at 48 kHz; the RTP timestamp step.
pub const FRAME_SAMPLES: u32 = 960;

/// RTP version 2, no padding, no extension, no CSRCs.
pub const RTP_VERSION_BYTE: u8 = 0x80;

/// Dynamic payload type used for Opus.
pub const RTP_OPUS_PAYLOAD_TYPE: u8 = 0x78;

pub const RTP_HEADER_LEN: usize = 12;

/// Length of every discovery datagram, request and reply.
///
/// The older 70-byte request (bare SSRC plus zero padding) is not sent:
/// the typed format is a 4-byte header whose length field counts the
/// 70 bytes after it, so the datagram itself is 74 bytes.
pub const DISCOVERY_PACKET_SIZE: usize = 74;

/// Body length declared in the discovery header (everything after it).
pub const DISCOVERY_BODY_LEN: u16 = 70;

pub const DISCOVERY_REQUEST_TYPE: u16 = 1;

/// Opus encoding of 20 ms of silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Port suffix some endpoints carry that must not reach the URL.
pub const LEGACY_PORT_SUFFIX: &str = ":80";
