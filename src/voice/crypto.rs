//! Secretbox packet sealing for the three xsalsa20-poly1305 voice modes.
//!
//! Every mode uses the same cipher and differs only in where the 24-byte
//! nonce comes from and how much of it travels after the ciphertext.

use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use xsalsa20poly1305::{
    XSalsa20Poly1305,
    aead::{AeadInPlace, KeyInit},
};

use crate::{
    common::errors::{VoiceError, VoiceResult},
    voice::constants::RTP_HEADER_LEN,
};

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Bytes of the lite-mode counter carried after the ciphertext.
const LITE_TRAILER_LEN: usize = 4;

/// Negotiated packet encryption mode.
///
/// Serialized with the wire names; configuration may also use the short
/// aliases `lite`, `suffix` and `standard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionMode {
    /// 4-byte incrementing counter nonce.
    #[serde(rename = "xsalsa20_poly1305_lite", alias = "lite")]
    Lite,
    /// 24 random bytes, sent in full.
    #[serde(rename = "xsalsa20_poly1305_suffix", alias = "suffix")]
    Suffix,
    /// The RTP header doubles as the nonce.
    #[serde(rename = "xsalsa20_poly1305", alias = "standard")]
    Standard,
}

impl EncryptionMode {
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Lite => "xsalsa20_poly1305_lite",
            Self::Suffix => "xsalsa20_poly1305_suffix",
            Self::Standard => "xsalsa20_poly1305",
        }
    }

    /// Accepts both the wire name and the short alias.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "xsalsa20_poly1305_lite" | "lite" => Some(Self::Lite),
            "xsalsa20_poly1305_suffix" | "suffix" => Some(Self::Suffix),
            "xsalsa20_poly1305" | "standard" => Some(Self::Standard),
            _ => None,
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Picks the first client-preferred mode the server also offers.
pub fn select_mode(preferred: &[EncryptionMode], offered: &[String]) -> VoiceResult<EncryptionMode> {
    let offered_modes: Vec<EncryptionMode> = offered
        .iter()
        .filter_map(|name| EncryptionMode::from_name(name))
        .collect();

    preferred
        .iter()
        .copied()
        .find(|mode| offered_modes.contains(mode))
        .ok_or_else(|| VoiceError::NoCommonMode {
            offered: offered.to_vec(),
        })
}

/// A packet nonce and the part of it appended after the ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNonce {
    bytes: [u8; NONCE_LEN],
    trailer_len: usize,
}

impl PacketNonce {
    /// Header right-padded with zeros; nothing is appended.
    pub fn standard(header: &[u8; RTP_HEADER_LEN]) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[..RTP_HEADER_LEN].copy_from_slice(header);
        Self {
            bytes,
            trailer_len: 0,
        }
    }

    /// Big-endian counter right-padded with zeros; the counter is appended.
    pub fn lite(counter: u32) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[..LITE_TRAILER_LEN].copy_from_slice(&counter.to_be_bytes());
        Self {
            bytes,
            trailer_len: LITE_TRAILER_LEN,
        }
    }

    /// Random bytes from `rng`; appended in full.
    pub fn suffix<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut bytes);
        Self {
            bytes,
            trailer_len: NONCE_LEN,
        }
    }

    pub fn bytes(&self) -> &[u8; NONCE_LEN] {
        &self.bytes
    }

    pub fn trailer(&self) -> &[u8] {
        &self.bytes[..self.trailer_len]
    }
}

/// Cipher plus the per-connection nonce state of the negotiated mode.
pub struct PacketSealer {
    mode: EncryptionMode,
    cipher: XSalsa20Poly1305,
    lite_counter: u32,
}

impl PacketSealer {
    pub fn new(mode: EncryptionMode, secret_key: &[u8]) -> VoiceResult<Self> {
        let cipher = XSalsa20Poly1305::new_from_slice(secret_key).map_err(|_| {
            VoiceError::EncryptionUnavailable(format!(
                "secret key must be {} bytes, got {}",
                KEY_LEN,
                secret_key.len()
            ))
        })?;
        Ok(Self {
            mode,
            cipher,
            lite_counter: 0,
        })
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Nonce for the next packet. Advances the lite counter (wrapping).
    pub fn next_nonce(&mut self, header: &[u8; RTP_HEADER_LEN]) -> PacketNonce {
        match self.mode {
            EncryptionMode::Standard => PacketNonce::standard(header),
            EncryptionMode::Suffix => PacketNonce::suffix(&mut OsRng),
            EncryptionMode::Lite => {
                let nonce = PacketNonce::lite(self.lite_counter);
                self.lite_counter = self.lite_counter.wrapping_add(1);
                nonce
            }
        }
    }

    /// Writes `header | tag | ciphertext | trailer` into `out`.
    pub fn seal(
        &mut self,
        header: &[u8; RTP_HEADER_LEN],
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> VoiceResult<()> {
        let nonce = self.next_nonce(header);

        out.clear();
        out.extend_from_slice(header);
        out.extend_from_slice(&[0u8; TAG_LEN]);
        out.extend_from_slice(payload);

        let body_start = RTP_HEADER_LEN + TAG_LEN;
        let tag = self
            .cipher
            .encrypt_in_place_detached(&(*nonce.bytes()).into(), b"", &mut out[body_start..])
            .map_err(|_| VoiceError::Encrypt)?;
        out[RTP_HEADER_LEN..body_start].copy_from_slice(&tag);
        out.extend_from_slice(nonce.trailer());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_lite_counter(&mut self, counter: u32) {
        self.lite_counter = counter;
    }
}
