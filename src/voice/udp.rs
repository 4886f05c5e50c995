use std::{net::SocketAddr, sync::Arc, time::Duration};

use byteorder::{BigEndian, ByteOrder};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::{
    common::errors::{VoiceError, VoiceResult},
    voice::{
        constants::{
            DISCOVERY_BODY_LEN, DISCOVERY_PACKET_SIZE, DISCOVERY_REQUEST_TYPE, FRAME_SAMPLES,
            RTP_HEADER_LEN, RTP_OPUS_PAYLOAD_TYPE, RTP_VERSION_BYTE,
        },
        crypto::PacketSealer,
    },
};

/// Type, declared length, SSRC, then zero padding.
pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    BigEndian::write_u16(&mut packet[0..2], DISCOVERY_REQUEST_TYPE);
    BigEndian::write_u16(&mut packet[2..4], DISCOVERY_BODY_LEN);
    BigEndian::write_u32(&mut packet[4..8], ssrc);
    packet
}

/// Extracts our external address and port from a discovery reply.
pub fn parse_discovery_response(buf: &[u8]) -> VoiceResult<(String, u16)> {
    if buf.len() < DISCOVERY_PACKET_SIZE {
        return Err(VoiceError::MalformedDiscovery(buf.len()));
    }
    let address = std::str::from_utf8(&buf[8..72])
        .map_err(|_| VoiceError::MalformedDiscovery(buf.len()))?
        .trim_end_matches('\0')
        .to_string();
    if address.is_empty() {
        return Err(VoiceError::MalformedDiscovery(buf.len()));
    }
    let port = BigEndian::read_u16(&buf[72..74]);
    Ok((address, port))
}

/// Sends the discovery request and waits for the reply.
///
/// `timeout = None` waits forever.
pub async fn discover_ip(
    socket: &UdpSocket,
    server: SocketAddr,
    ssrc: u32,
    timeout: Option<Duration>,
) -> VoiceResult<(String, u16)> {
    socket.send_to(&discovery_request(ssrc), server).await?;

    let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
    let n = match timeout {
        Some(limit) => tokio::time::timeout(limit, socket.recv(&mut buf))
            .await
            .map_err(|_| VoiceError::HandshakeTimeout("ip discovery"))??,
        None => socket.recv(&mut buf).await?,
    };
    let (address, port) = parse_discovery_response(&buf[..n])?;
    debug!("IP discovery: {}:{} (ssrc {})", address, port, ssrc);
    Ok((address, port))
}

/// RTP sequence and timestamp for one SSRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpState {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpState {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn header(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION_BYTE;
        header[1] = RTP_OPUS_PAYLOAD_TYPE;
        BigEndian::write_u16(&mut header[2..4], self.sequence);
        BigEndian::write_u32(&mut header[4..8], self.timestamp);
        BigEndian::write_u32(&mut header[8..12], self.ssrc);
        header
    }

    /// Moves to the next packet. Both counters reset to 0 a little before
    /// their type's maximum instead of overflowing.
    pub fn advance(&mut self) {
        if u32::from(self.sequence) + 10 < u32::from(u16::MAX) {
            self.sequence += 1;
        } else {
            self.sequence = 0;
        }

        let step = u64::from(FRAME_SAMPLES);
        if u64::from(self.timestamp) + step * 10 < u64::from(u32::MAX) {
            self.timestamp += FRAME_SAMPLES;
        } else {
            self.timestamp = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn with_counters(ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence,
            timestamp,
        }
    }
}

/// Frames, seals and sends audio datagrams.
pub struct VoiceUdp {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    rtp: RtpState,
    sealer: PacketSealer,
    /// Reused for every packet.
    packet_buf: Vec<u8>,
}

impl VoiceUdp {
    pub fn new(socket: Arc<UdpSocket>, server: SocketAddr, ssrc: u32, sealer: PacketSealer) -> Self {
        Self {
            socket,
            server,
            rtp: RtpState::new(ssrc),
            sealer,
            packet_buf: Vec::with_capacity(1500),
        }
    }

    pub fn rtp(&self) -> &RtpState {
        &self.rtp
    }

    pub async fn send_frame(&mut self, frame: &[u8]) -> VoiceResult<()> {
        let header = self.rtp.header();
        self.sealer.seal(&header, frame, &mut self.packet_buf)?;
        self.socket.send_to(&self.packet_buf, self.server).await?;
        self.rtp.advance();
        Ok(())
    }
}
