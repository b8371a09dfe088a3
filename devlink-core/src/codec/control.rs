//! Control-frame and response encoding.
//!
//! ```text
//! request:   u32_be length | payload bytes (trailing NUL included in length)
//! response:  "OKAY"
//!          | "FAIL" | 4 ascii hex digits (length) | diagnostic text
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::{CONTROL_PAYLOAD_MAX, decode_be32, encode_be32, word_at};
use crate::error::{BridgeError, Result};

/// Size of the control-frame length prefix.
pub const CONTROL_HEADER_SIZE: usize = 4;

/// Size of the response status tag.
pub const STATUS_SIZE: usize = 4;

/// Size of the hex length that follows a FAIL tag.
pub const DIAGNOSTIC_LENGTH_SIZE: usize = 4;

/// Encode `text` as a control frame.
///
/// A NUL terminator is appended when the text does not already end with
/// one; the length field always equals the number of payload bytes sent.
pub fn encode_control_frame(text: &str) -> Bytes {
    let raw = text.as_bytes();
    let needs_nul = raw.last() != Some(&0);
    let payload_len = raw.len() + usize::from(needs_nul);

    let mut buf = BytesMut::with_capacity(CONTROL_HEADER_SIZE + payload_len);
    buf.put_slice(&encode_be32(payload_len as u32));
    buf.put_slice(raw);
    if needs_nul {
        buf.put_u8(0);
    }
    buf.freeze()
}

/// Decode a complete control frame (length prefix plus payload).
///
/// The buffer must hold exactly the advertised number of payload bytes.
/// Trailing NULs are stripped from the returned text.
pub fn decode_control_frame(frame: &[u8]) -> Result<String> {
    if frame.len() < CONTROL_HEADER_SIZE {
        return Err(BridgeError::ProtocolViolation(format!(
            "control frame too short: {} bytes",
            frame.len()
        )));
    }
    let declared = decode_be32(word_at(frame, 0)) as usize;
    let actual = frame.len() - CONTROL_HEADER_SIZE;
    if declared != actual {
        return Err(BridgeError::ProtocolViolation(format!(
            "control frame length mismatch: declared {declared}, got {actual}"
        )));
    }
    Ok(decode_text(&frame[CONTROL_HEADER_SIZE..]))
}

/// Lossy text decoding used for streamed output and diagnostics.
pub fn decode_text(payload: &[u8]) -> String {
    let trimmed = match payload.iter().rposition(|&b| b != 0) {
        Some(end) => &payload[..=end],
        None => &[],
    };
    String::from_utf8_lossy(trimmed).into_owned()
}

// ── Response ─────────────────────────────────────────────────────

/// The status tag at the head of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Okay,
    Fail,
}

impl ResponseStatus {
    pub const OKAY: &'static [u8; 4] = b"OKAY";
    pub const FAIL: &'static [u8; 4] = b"FAIL";

    /// Parse the 4-byte status tag.
    pub fn parse(tag: &[u8]) -> Result<Self> {
        match tag {
            t if t == Self::OKAY => Ok(Self::Okay),
            t if t == Self::FAIL => Ok(Self::Fail),
            other => Err(BridgeError::ProtocolViolation(format!(
                "unexpected response tag {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Parsed answer to a control request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// `true` for OKAY.
    pub okay: bool,
    /// Diagnostic text (empty unless the peer sent one).
    pub message: String,
}

impl Response {
    pub fn okay() -> Self {
        Self {
            okay: true,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            okay: false,
            message: message.into(),
        }
    }

    /// Turn a FAIL response into `CommandRejected`.
    pub fn into_result(self) -> Result<Self> {
        if self.okay {
            Ok(self)
        } else {
            Err(BridgeError::CommandRejected(self.message))
        }
    }
}

/// Reject a control-frame length the bridge could not legitimately send,
/// before anything is allocated for it.
pub fn check_frame_length(len: usize) -> Result<usize> {
    if len > CONTROL_PAYLOAD_MAX {
        return Err(BridgeError::ProtocolViolation(format!(
            "control frame of {len} bytes exceeds {CONTROL_PAYLOAD_MAX}"
        )));
    }
    Ok(len)
}

/// Parse the 4 ASCII hex digits that announce a diagnostic's length.
pub fn parse_hex_length(digits: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| BridgeError::ProtocolViolation("non-ascii diagnostic length".into()))?;
    if text.len() != DIAGNOSTIC_LENGTH_SIZE {
        return Err(BridgeError::ProtocolViolation(format!(
            "diagnostic length must be {DIAGNOSTIC_LENGTH_SIZE} hex digits, got {text:?}"
        )));
    }
    usize::from_str_radix(text, 16)
        .map_err(|_| BridgeError::ProtocolViolation(format!("invalid diagnostic length {text:?}")))
}

/// Encode a diagnostic length as 4 lowercase hex digits.
pub fn encode_hex_length(len: usize) -> [u8; 4] {
    let text = format!("{:04x}", len.min(0xFFFF));
    let mut out = [b'0'; 4];
    out.copy_from_slice(text.as_bytes());
    out
}
