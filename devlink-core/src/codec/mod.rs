//! Wire encodings for the bridge protocol.
//!
//! Two length encodings coexist and must not be confused:
//!
//! ```text
//! control frame:  u32 big-endian length | ascii payload (NUL-terminated)
//! sync frame:     4-byte ascii tag | u32 length, least-significant byte first | payload
//! ```
//!
//! The helpers below keep each byte order behind its own name so the
//! asymmetry stays visible at every call site.

pub mod control;
pub mod sync;

pub use control::{Response, ResponseStatus, encode_control_frame};
pub use sync::{ModeValue, StatReply, SyncHeader, SyncTag};

/// Largest payload carried by a single sync `DATA` frame.
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Largest encoded remote path accepted by sync requests.
pub const REMOTE_PATH_MAX_LENGTH: usize = 1024;

/// Mode value reported for device nodes, sockets, fifos and links.
pub const SPECIAL_FILE_MODE: u32 = 41471;

/// Largest control-frame payload accepted from the bridge.
pub const CONTROL_PAYLOAD_MAX: usize = 16 * 1024 * 1024;

/// Largest `FAIL` diagnostic accepted inside a sync exchange.
pub const SYNC_DIAGNOSTIC_MAX: usize = 64 * 1024;

// ── Control byte order (big-endian) ──────────────────────────────

/// Encode a control-frame length field.
pub fn encode_be32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Decode a control-frame length field.
pub fn decode_be32(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

// ── Sync byte order (explicit swap) ──────────────────────────────

/// Encode a sync length field, least-significant byte first.
///
/// Written as an explicit swap so the result does not depend on the
/// host's native order.
pub fn encode_sync_le32(value: u32) -> [u8; 4] {
    [
        (value & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        ((value >> 16) & 0xFF) as u8,
        ((value >> 24) & 0xFF) as u8,
    ]
}

/// Decode a sync length field, least-significant byte first.
pub fn decode_sync_le32(bytes: [u8; 4]) -> u32 {
    u32::from(bytes[0])
        | (u32::from(bytes[1]) << 8)
        | (u32::from(bytes[2]) << 16)
        | (u32::from(bytes[3]) << 24)
}

/// Copy four bytes out of `buf` starting at `offset`.
///
/// Callers validate lengths beforehand; a short slice yields zero padding.
pub(crate) fn word_at(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut word = [0u8; 4];
    if let Some(src) = buf.get(offset..offset + 4) {
        word.copy_from_slice(src);
    }
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_orders_differ() {
        assert_eq!(encode_be32(0x0102_0304), [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(encode_sync_le32(0x0102_0304), [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn sync_length_matches_little_endian() {
        for value in [0u32, 1, 255, 256, 65_536, u32::MAX] {
            assert_eq!(encode_sync_le32(value), value.to_le_bytes());
            assert_eq!(decode_sync_le32(value.to_le_bytes()), value);
        }
    }

    #[test]
    fn control_length_decodes() {
        assert_eq!(decode_be32([0, 0, 0x01, 0x00]), 256);
    }

    #[test]
    fn word_at_pads_short_input() {
        assert_eq!(word_at(b"OK", 0), [0, 0, 0, 0]);
        assert_eq!(word_at(b"xxOKAY", 2), *b"OKAY");
    }
}
