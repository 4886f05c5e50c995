use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors surfaced by the gateway session and its transport.
///
/// Transport-level failures are normally absorbed by the reconnect loop;
/// only the variants documented as terminal ever reach the caller of
/// [`Gateway::run`](crate::gateway::Gateway::run).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("failed to decode gateway payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to inflate compressed frame: {0}")]
    Inflate(#[source] std::io::Error),

    /// A send was attempted while no handshaked socket was open.
    #[error("gateway connection is not open")]
    NotConnected,

    #[error("failed to resolve gateway endpoint: {0}")]
    Resolve(String),

    /// Terminal: the server closed with a code that forbids reconnecting.
    #[error("gateway closed with fatal code {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    /// Terminal: the configured reconnect budget was used up.
    #[error("gave up after {0} reconnect attempts")]
    ReconnectsExhausted(u32),

    /// Terminal: the session task was aborted by `kill()`.
    #[error("gateway task was killed")]
    Killed,
}

/// Errors surfaced by the voice control channel and datagram transport.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("voice websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("failed to decode voice payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("voice udp error: {0}")]
    Io(#[from] std::io::Error),

    /// A handshake step did not complete within its configured bound.
    #[error("voice handshake timed out waiting for {0}")]
    HandshakeTimeout(&'static str),

    #[error("server offered no mode from the client preference list (offered: {offered:?})")]
    NoCommonMode { offered: Vec<String> },

    #[error("unsupported encryption mode '{0}'")]
    UnsupportedMode(String),

    /// No usable encryption mode was configured; plaintext is never allowed.
    #[error("voice encryption unavailable: {0}")]
    EncryptionUnavailable(String),

    #[error("failed to encrypt voice packet")]
    Encrypt,

    #[error("malformed voice payload: {0}")]
    Malformed(&'static str),

    #[error("malformed ip discovery response ({0} bytes)")]
    MalformedDiscovery(usize),

    #[error("voice connection is not open")]
    NotConnected,

    #[error("voice connection closed before it was ready: {0}")]
    Closed(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
pub type VoiceResult<T> = std::result::Result<T, VoiceError>;
