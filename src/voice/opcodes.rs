//! Voice control channel operation codes.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VoiceOpCode {
    Identify = 0,
    SelectProtocol = 1,
    /// Carries SSRC, UDP endpoint and offered modes.
    Ready = 2,
    Heartbeat = 3,
    /// Carries the selected mode and the secret key.
    SessionDescription = 4,
    Speaking = 5,
    HeartbeatAck = 6,
    Hello = 8,
}

impl VoiceOpCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Identify),
            1 => Some(Self::SelectProtocol),
            2 => Some(Self::Ready),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::SessionDescription),
            5 => Some(Self::Speaking),
            6 => Some(Self::HeartbeatAck),
            8 => Some(Self::Hello),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}
