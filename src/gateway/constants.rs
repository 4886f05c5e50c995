/// Gateway protocol version requested in the connection URL.
pub const GATEWAY_VERSION: u8 = 9;

/// Close code sent when we drop a socket but want the session kept alive
/// for a resume (any non-1000/1001 code works).
pub const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// Close code sent on a user-requested stop.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Library name reported in identify properties.
pub const LIBRARY_NAME: &str = "rustacord";

/// Dispatch type that establishes a new session.
pub const READY_EVENT: &str = "READY";

/// Dispatch type that confirms a resume.
pub const RESUMED_EVENT: &str = "RESUMED";

/// Close codes after which reconnecting cannot help.
///
/// - `4003`: Not authenticated
/// - `4004`: Authentication failed
/// - `4010`: Invalid shard
/// - `4011`: Sharding required
/// - `4012`: Invalid API version
/// - `4013`: Invalid intents
/// - `4014`: Disallowed intents
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4003 | 4004 | 4010..=4014)
}

/// Close codes that kill the session but allow a fresh IDENTIFY.
///
/// - `4007`: Invalid sequence on resume
/// - `4009`: Session timed out
pub fn is_reidentify_close(code: u16) -> bool {
    matches!(code, 4007 | 4009)
}
