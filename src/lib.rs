//! Resumable gateway sessions and encrypted voice transport.
//!
//! [`gateway::Gateway`] keeps one logical session alive across socket
//! drops, resuming where possible. [`voice::VoiceConnection`] negotiates a
//! voice channel and streams paced, encrypted audio frames.

pub mod common;
pub mod configs;
pub mod gateway;
pub mod heartbeat;
pub mod voice;

pub use common::errors::{GatewayError, GatewayResult, VoiceError, VoiceResult};
pub use configs::Config;
pub use gateway::{ConnectionState, Gateway};
pub use voice::VoiceConnection;
