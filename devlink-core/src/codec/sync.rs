//! Sync sub-protocol framing.
//!
//! ```text
//! header:  tag[4] (ascii) | length u32 (least-significant byte first)
//! STAT reply:  "STAT" | mode u32 | size u32 | mtime u32   (all LSB first)
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    REMOTE_PATH_MAX_LENGTH, SPECIAL_FILE_MODE, decode_sync_le32, encode_sync_le32, word_at,
};
use crate::error::{BridgeError, Result};

// ── SyncTag ──────────────────────────────────────────────────────

/// All 4-byte command tags of the sync sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTag {
    Stat,
    Send,
    Recv,
    Data,
    Done,
    List,
    Dent,
    Okay,
    Fail,
}

impl SyncTag {
    /// The exact ASCII bytes sent on the wire.
    pub fn as_bytes(&self) -> &'static [u8; 4] {
        match self {
            SyncTag::Stat => b"STAT",
            SyncTag::Send => b"SEND",
            SyncTag::Recv => b"RECV",
            SyncTag::Data => b"DATA",
            SyncTag::Done => b"DONE",
            SyncTag::List => b"LIST",
            SyncTag::Dent => b"DENT",
            SyncTag::Okay => b"OKAY",
            SyncTag::Fail => b"FAIL",
        }
    }
}

impl TryFrom<[u8; 4]> for SyncTag {
    type Error = BridgeError;

    fn try_from(value: [u8; 4]) -> Result<Self> {
        match &value {
            b"STAT" => Ok(SyncTag::Stat),
            b"SEND" => Ok(SyncTag::Send),
            b"RECV" => Ok(SyncTag::Recv),
            b"DATA" => Ok(SyncTag::Data),
            b"DONE" => Ok(SyncTag::Done),
            b"LIST" => Ok(SyncTag::List),
            b"DENT" => Ok(SyncTag::Dent),
            b"OKAY" => Ok(SyncTag::Okay),
            b"FAIL" => Ok(SyncTag::Fail),
            _ => Err(BridgeError::sync("unknown sync tag", value.to_vec())),
        }
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

// ── SyncHeader ───────────────────────────────────────────────────

/// Tag plus length, the 8-byte prefix of every sync frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncHeader {
    pub tag: SyncTag,
    pub length: u32,
}

impl SyncHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 8;

    pub fn new(tag: SyncTag, length: u32) -> Self {
        Self { tag, length }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(self.tag.as_bytes());
        buf[4..8].copy_from_slice(&encode_sync_le32(self.length));
        buf
    }

    /// Decode a header; unknown tags carry the raw bytes as diagnostic.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(BridgeError::sync(
                format!("sync header too short: {} < {}", data.len(), Self::SIZE),
                data.to_vec(),
            ));
        }
        let tag = SyncTag::try_from(word_at(data, 0))
            .map_err(|_| BridgeError::sync("unknown sync tag", data[..Self::SIZE].to_vec()))?;
        Ok(Self {
            tag,
            length: decode_sync_le32(word_at(data, 4)),
        })
    }
}

/// Build a sync request (`STAT`, `SEND`, `RECV`, `LIST`) carrying a path.
///
/// Fails before anything is sent when the encoded path exceeds
/// [`REMOTE_PATH_MAX_LENGTH`].
pub fn encode_path_request(tag: SyncTag, path: &str) -> Result<Bytes> {
    let raw = path.as_bytes();
    if raw.len() > REMOTE_PATH_MAX_LENGTH {
        return Err(BridgeError::RemotePathTooLong {
            len: raw.len(),
            max: REMOTE_PATH_MAX_LENGTH,
        });
    }
    let mut buf = BytesMut::with_capacity(SyncHeader::SIZE + raw.len());
    buf.put_slice(&SyncHeader::new(tag, raw.len() as u32).encode());
    buf.put_slice(raw);
    Ok(buf.freeze())
}

/// Build a `DATA` frame for one chunk.
pub fn encode_data_frame(chunk: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SyncHeader::SIZE + chunk.len());
    buf.put_slice(&SyncHeader::new(SyncTag::Data, chunk.len() as u32).encode());
    buf.put_slice(chunk);
    buf.freeze()
}

// ── STAT ─────────────────────────────────────────────────────────

/// The fixed-size reply to a `STAT` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatReply {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl StatReply {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(SyncTag::Stat.as_bytes());
        buf[4..8].copy_from_slice(&encode_sync_le32(self.mode));
        buf[8..12].copy_from_slice(&encode_sync_le32(self.size));
        buf[12..16].copy_from_slice(&encode_sync_le32(self.mtime));
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(BridgeError::sync(
                format!("STAT reply too short: {} < {}", data.len(), Self::SIZE),
                data.to_vec(),
            ));
        }
        if &data[0..4] != SyncTag::Stat.as_bytes() {
            return Err(BridgeError::sync(
                "expected STAT reply",
                data[..Self::SIZE].to_vec(),
            ));
        }
        Ok(Self {
            mode: decode_sync_le32(word_at(data, 4)),
            size: decode_sync_le32(word_at(data, 8)),
            mtime: decode_sync_le32(word_at(data, 12)),
        })
    }
}

// ── ModeValue ────────────────────────────────────────────────────

/// What a STAT mode says about a remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeValue {
    /// Mode 0: the path does not exist.
    Missing,
    /// Decimal rendering starts with `168` (e.g. 16877 = 0o40755).
    Directory(u32),
    /// Device node, socket, fifo or link; skipped by transfers.
    Special,
    /// Anything else is transferred as a regular file.
    Regular(u32),
}

impl ModeValue {
    /// Classify a raw mode.
    ///
    /// The directory test is a decimal prefix match, not a bitmask test.
    pub fn classify(mode: u32) -> Self {
        if mode == 0 {
            ModeValue::Missing
        } else if mode == SPECIAL_FILE_MODE {
            ModeValue::Special
        } else if mode.to_string().starts_with("168") {
            ModeValue::Directory(mode)
        } else {
            ModeValue::Regular(mode)
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, ModeValue::Directory(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_uses_lsb_first_length() {
        let header = SyncHeader::new(SyncTag::Data, 0x0001_0000);
        assert_eq!(header.encode(), *b"DATA\x00\x00\x01\x00");
        assert_eq!(SyncHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn unknown_tag_keeps_raw_bytes() {
        let err = SyncHeader::decode(b"QUIT\x01\x00\x00\x00").unwrap_err();
        match err {
            BridgeError::SyncProtocol { diagnostic, .. } => {
                assert_eq!(diagnostic, b"QUIT\x01\x00\x00\x00".to_vec());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn path_request_layout() {
        let frame = encode_path_request(SyncTag::Recv, "/data/a.txt").unwrap();
        assert_eq!(&frame[0..4], b"RECV");
        assert_eq!(&frame[4..8], &[11, 0, 0, 0]);
        assert_eq!(&frame[8..], b"/data/a.txt");
    }

    #[test]
    fn path_request_limit() {
        let ok = "a".repeat(REMOTE_PATH_MAX_LENGTH);
        assert!(encode_path_request(SyncTag::Stat, &ok).is_ok());

        let long = "a".repeat(REMOTE_PATH_MAX_LENGTH + 1);
        let err = encode_path_request(SyncTag::Stat, &long).unwrap_err();
        assert!(matches!(err, BridgeError::RemotePathTooLong { len: 1025, max: 1024 }));
    }

    #[test]
    fn stat_reply_decodes_mode() {
        let reply = StatReply {
            mode: 33188,
            size: 12,
            mtime: 1_700_000_000,
        };
        assert_eq!(StatReply::decode(&reply.encode()).unwrap(), reply);
        assert!(StatReply::decode(b"FAIL\0\0\0\0\0\0\0\0\0\0\0\0").is_err());
    }

    #[test]
    fn mode_classification() {
        assert_eq!(ModeValue::classify(0), ModeValue::Missing);
        assert_eq!(ModeValue::classify(16877), ModeValue::Directory(16877));
        assert_eq!(ModeValue::classify(16832), ModeValue::Directory(16832));
        assert_eq!(ModeValue::classify(SPECIAL_FILE_MODE), ModeValue::Special);
        assert_eq!(ModeValue::classify(33188), ModeValue::Regular(33188));
        assert!(ModeValue::classify(1688).is_directory());
    }
}
