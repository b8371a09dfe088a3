//! Fixed-width handshake records exchanged once per connection.
//!
//! ```text
//! peer → host (48 bytes):   size u32_be | banner[12] | key[32]
//! host → peer (272 bytes):  size u32_be | banner[12] = "OHOS HDC" | key[256]
//! ```
//!
//! `size` counts the bytes that follow it. Short fields are NUL-padded;
//! over-long values are truncated to the field width.

use crate::codec::{decode_be32, encode_be32, word_at};
use crate::error::{BridgeError, Result};

/// Banner the host writes back.
pub const HANDSHAKE_BANNER: &str = "OHOS HDC";

pub const BANNER_WIDTH: usize = 12;
pub const PEER_KEY_WIDTH: usize = 32;
pub const HOST_KEY_WIDTH: usize = 256;

/// The record announced by the bridge when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    pub size: u32,
    pub banner: String,
    pub key: String,
}

impl PeerHandshake {
    /// Encoded size on the wire.
    pub const SIZE: usize = 4 + BANNER_WIDTH + PEER_KEY_WIDTH;

    pub fn new(banner: &str, key: &str) -> Self {
        Self {
            size: (BANNER_WIDTH + PEER_KEY_WIDTH) as u32,
            banner: banner.to_string(),
            key: key.to_string(),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&encode_be32(self.size));
        put_padded(&mut buf[4..4 + BANNER_WIDTH], &self.banner);
        put_padded(&mut buf[4 + BANNER_WIDTH..], &self.key);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(BridgeError::ProtocolViolation(format!(
                "handshake too short: {} < {}",
                data.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            size: decode_be32(word_at(data, 0)),
            banner: take_padded(&data[4..4 + BANNER_WIDTH]),
            key: take_padded(&data[4 + BANNER_WIDTH..Self::SIZE]),
        })
    }

    /// Whether the banner matches the one this client speaks.
    pub fn is_expected_banner(&self) -> bool {
        self.banner.starts_with(HANDSHAKE_BANNER)
    }
}

/// The record the host sends back, carrying the connect key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostHandshake {
    pub key: String,
}

impl HostHandshake {
    pub const SIZE: usize = 4 + BANNER_WIDTH + HOST_KEY_WIDTH;

    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&encode_be32((BANNER_WIDTH + HOST_KEY_WIDTH) as u32));
        put_padded(&mut buf[4..4 + BANNER_WIDTH], HANDSHAKE_BANNER);
        put_padded(&mut buf[4 + BANNER_WIDTH..], &self.key);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(BridgeError::ProtocolViolation(format!(
                "host handshake too short: {} < {}",
                data.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            key: take_padded(&data[4 + BANNER_WIDTH..Self::SIZE]),
        })
    }
}

fn put_padded(field: &mut [u8], value: &str) {
    let raw = value.as_bytes();
    let n = raw.len().min(field.len());
    field[..n].copy_from_slice(&raw[..n]);
}

fn take_padded(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
