//! Control protocol: handshake, device selection, request/response.
//!
//! # Wire Protocol
//!
//! ```text
//! Bridge ──[48-byte handshake]────────────────► Host
//! Host   ──[272-byte handshake + connect key]─► Bridge
//!
//! Host   ──[u32_be len | "host:transport:<serial>\0"]──► Bridge
//! Bridge ──["OKAY"] or ["FAIL" | hex4 len | text]──────► Host
//!
//! Host   ──[u32_be len | "<command>\0"]────────────────► Bridge
//! Bridge ──[response, then command-specific frames]────► Host
//! ```

use std::io;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::codec::control::{
    CONTROL_HEADER_SIZE, DIAGNOSTIC_LENGTH_SIZE, STATUS_SIZE, check_frame_length, decode_text,
    parse_hex_length,
};
use crate::codec::{Response, ResponseStatus, decode_be32, encode_control_frame, word_at};
use crate::error::{BridgeError, Result};
use crate::handshake::{HostHandshake, PeerHandshake};
use crate::network::{ConnectionInfo, Transport};

/// Prefix of the device selection request.
pub const SELECT_DEVICE_PREFIX: &str = "host:transport:";

/// Read the bridge's banner and answer with `connect_key`.
///
/// A short banner read surfaces as a transport error.
pub fn handshake(transport: &mut Transport, connect_key: &str, timeout: Duration) -> Result<()> {
    let banner = transport.read(PeerHandshake::SIZE, timeout)?;
    if banner.len() < PeerHandshake::SIZE {
        return Err(BridgeError::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "handshake read {} of {} bytes",
                banner.len(),
                PeerHandshake::SIZE
            ),
        )));
    }
    let peer = PeerHandshake::decode(&banner)?;
    if !peer.is_expected_banner() {
        warn!(banner = %peer.banner, "unexpected handshake banner");
    }
    debug!(peer_key = %peer.key, "handshake received");

    transport.write_all(&HostHandshake::new(connect_key).encode(), timeout)
}

/// Route the rest of this connection to the device `serial`.
pub fn select_device(transport: &mut Transport, serial: &str, timeout: Duration) -> Result<()> {
    send_request(transport, &format!("{SELECT_DEVICE_PREFIX}{serial}"), timeout)?;
    read_response(transport, false, timeout)?.into_result()?;
    debug!(serial, "device selected");
    Ok(())
}

/// Send `text` as one control frame.
pub fn send_request(transport: &mut Transport, text: &str, timeout: Duration) -> Result<()> {
    trace!(request = text, "control request");
    transport.write_all(&encode_control_frame(text), timeout)
}

/// Read an OKAY/FAIL response.
///
/// A FAIL always carries a diagnostic. With `expect_diagnostic`, one is
/// read after OKAY as well.
pub fn read_response(
    transport: &mut Transport,
    expect_diagnostic: bool,
    timeout: Duration,
) -> Result<Response> {
    let tag = transport.read_exact(STATUS_SIZE, timeout, "response status")?;
    let status = ResponseStatus::parse(&tag)?;

    let message = if status == ResponseStatus::Fail || expect_diagnostic {
        read_diagnostic(transport, timeout)?
    } else {
        String::new()
    };

    Ok(Response {
        okay: status == ResponseStatus::Okay,
        message,
    })
}

fn read_diagnostic(transport: &mut Transport, timeout: Duration) -> Result<String> {
    let digits = transport.read_exact(DIAGNOSTIC_LENGTH_SIZE, timeout, "diagnostic length")?;
    let len = parse_hex_length(&digits)?;
    let text = transport.read_exact(len, timeout, "diagnostic text")?;
    Ok(decode_text(&text))
}

/// Read one length-prefixed control frame.
///
/// Returns `Ok(None)` if the peer closed before sending a header. A header
/// or payload cut short, or a length over [`CONTROL_PAYLOAD_MAX`], is a
/// protocol violation.
///
/// [`CONTROL_PAYLOAD_MAX`]: crate::codec::CONTROL_PAYLOAD_MAX
pub fn read_frame(transport: &mut Transport, timeout: Duration) -> Result<Option<Vec<u8>>> {
    let header = transport.read(CONTROL_HEADER_SIZE, timeout)?;
    if header.is_empty() && transport.is_peer_closed() {
        return Ok(None);
    }
    if header.len() != CONTROL_HEADER_SIZE {
        return Err(BridgeError::ProtocolViolation(format!(
            "short frame header: {} bytes",
            header.len()
        )));
    }
    let len = check_frame_length(decode_be32(word_at(&header, 0)) as usize)?;
    transport.read_exact(len, timeout, "frame payload").map(Some)
}

/// Open a transport, handshake with `connect_key` and select `serial`.
///
/// The transport is dropped (and closed) on any failure.
pub fn connect_device(
    info: &ConnectionInfo,
    serial: &str,
    connect_key: &str,
    timeout: Duration,
) -> Result<Transport> {
    let mut transport = Transport::open(info, Some(timeout))?;
    handshake(&mut transport, connect_key, timeout)?;
    select_device(&mut transport, serial, timeout)?;
    Ok(transport)
}
