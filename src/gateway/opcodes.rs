//! Gateway operation codes.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Event dispatch; the only op carrying `s` and `t`.
    Dispatch = 0,
    /// Sent by both sides; from the server it asks for an immediate beat.
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    /// Drop the socket and resume on a new one.
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    /// First frame on every socket, carries the heartbeat interval.
    Hello = 10,
    HeartbeatAck = 11,
}

impl OpCode {
    /// Any integer is accepted; codes this client does not know map to `None`.
    #[must_use]
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Ops only the client sends. Receiving one is a server bug.
    #[must_use]
    pub const fn is_client_only(self) -> bool {
        matches!(
            self,
            Self::Identify
                | Self::PresenceUpdate
                | Self::VoiceStateUpdate
                | Self::Resume
                | Self::RequestGuildMembers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_both_ways() {
        for code in [0, 1, 2, 3, 4, 6, 7, 8, 9, 10, 11] {
            assert_eq!(OpCode::from_code(code).map(OpCode::code), Some(code));
        }
    }

    #[test]
    fn gaps_and_large_codes_are_unknown() {
        assert_eq!(OpCode::from_code(5), None);
        assert_eq!(OpCode::from_code(12), None);
        assert_eq!(OpCode::from_code(300), None);
        assert_eq!(OpCode::from_code(u64::MAX), None);
    }

    #[test]
    fn heartbeat_is_not_client_only() {
        assert!(OpCode::Resume.is_client_only());
        assert!(!OpCode::Heartbeat.is_client_only());
        assert!(!OpCode::Hello.is_client_only());
    }
}
