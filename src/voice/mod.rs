//! Voice transport: control socket negotiation, encrypted RTP over UDP and
//! real-time audio pacing.

pub mod connection;
pub mod constants;
pub mod control;
pub mod crypto;
pub mod opcodes;
pub mod player;
pub mod udp;

pub use connection::VoiceConnection;
pub use control::{VoiceServerInfo, voice_url};
pub use crypto::{EncryptionMode, PacketNonce, PacketSealer, select_mode};
pub use player::{
    AudioSource, ChannelSource, FrameSink, IterSource, PacingOptions, Playback, PlaybackEnd,
};
pub use udp::{RtpState, VoiceUdp, discover_ip};
