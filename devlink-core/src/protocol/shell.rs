//! Shell execution with streamed output.
//!
//! # Wire Protocol
//!
//! ```text
//! Host   ──[handshake, host:transport:<serial>]──► Bridge
//! Host   ──[u32_be len | "shell <command>\0"]────► Bridge
//! Bridge ──["OKAY"]──────────────────────────────► Host
//! Bridge ──[u32_be len | output bytes]───────────► Host   (repeated)
//! Bridge ──[close]───────────────────────────────► Host
//! ```
//!
//! Output is decoded per frame and handed to a [`Receiver`] as it arrives.
//! The stream ends when the bridge closes, an end mark shows up, the soft
//! read timeout passes, or the caller cancels.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::codec::Response;
use crate::codec::control::{CONTROL_HEADER_SIZE, check_frame_length, decode_text};
use crate::codec::{decode_be32, word_at};
use crate::error::{BridgeError, Result};
use crate::network::{ConnectionInfo, Transport};
use crate::protocol::control;
use crate::task::CancellationToken;

/// Default hard timeout for shell commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(40_000);

/// Longest single blocking read inside the stream loop; bounds how late a
/// cancellation is noticed.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

// ── Receiver ──────────────────────────────────────────────────────

/// Consumer of streamed shell output.
pub trait Receiver {
    /// A decoded chunk of output.
    fn on_data(&mut self, text: &str);

    /// Called exactly once when the session ends, however it ends.
    fn on_done(&mut self);

    /// Called before `on_done` when the session fails.
    fn on_error(&mut self, _message: &str) {}
}

/// A receiver that keeps everything it is given.
#[derive(Debug, Default, Clone)]
pub struct CollectingReceiver {
    output: String,
    done: bool,
    error: Option<String>,
}

impl CollectingReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn into_output(self) -> String {
        self.output
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl Receiver for CollectingReceiver {
    fn on_data(&mut self, text: &str) {
        self.output.push_str(text);
    }

    fn on_done(&mut self) {
        self.done = true;
    }

    fn on_error(&mut self, message: &str) {
        self.error = Some(message.to_string());
    }
}

/// Calls `on_done` when dropped, so every exit path reports completion.
struct DoneGuard<'a> {
    receiver: &'a mut dyn Receiver,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.receiver.on_done();
    }
}

// ── ShellRequest ──────────────────────────────────────────────────

/// Parameters of one shell execution.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    /// Command line run on the device.
    pub command: String,

    /// Hard timeout: silence this long with no output at all is an error.
    pub timeout: Duration,

    /// Soft limit on the whole stream; reaching it ends the session
    /// normally.
    pub read_timeout: Option<Duration>,

    /// Text that ends the session once seen in the output.
    pub end_mark: Option<String>,

    /// Cooperative cancellation, checked once per read iteration.
    pub cancel: Option<CancellationToken>,
}

impl ShellRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            read_timeout: None,
            end_mark: None,
            cancel: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    pub fn with_end_mark(mut self, mark: impl Into<String>) -> Self {
        self.end_mark = Some(mark.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The control request sent to the bridge.
    pub fn request_text(&self) -> String {
        format!("shell {}", self.command)
    }
}

// ── Phases ────────────────────────────────────────────────────────

/// Lifecycle of one shell session.
///
/// ```text
///  Idle ──► Handshaking ──► Selecting ──► Requesting ──► Streaming ──► Done
///                │               │             │              │
///                └───────────────┴─────────────┴──────────────┴──► Failed | TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellPhase {
    #[default]
    Idle,
    Handshaking,
    Selecting,
    Requesting,
    Streaming,
    Done,
    Failed,
    TimedOut,
}

impl ShellPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::TimedOut)
    }

    /// Move to `next`, rejecting edges the diagram does not have.
    pub fn advance(&mut self, next: ShellPhase) -> Result<()> {
        use ShellPhase::*;
        let allowed = match (*self, next) {
            (Idle, Handshaking)
            | (Handshaking, Selecting)
            | (Selecting, Requesting)
            | (Requesting, Streaming)
            | (Streaming, Done) => true,
            (from, Failed) | (from, TimedOut) => !from.is_terminal() && from != Idle,
            _ => false,
        };
        if !allowed {
            return Err(BridgeError::ProtocolViolation(format!(
                "invalid shell transition {self:?} -> {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }
}

// ── Outcome ───────────────────────────────────────────────────────

/// Why the output stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The bridge closed the stream.
    PeerClosed,
    /// The configured end mark appeared.
    EndMark,
    /// The soft read timeout elapsed.
    ReadTimeout,
    /// Output went quiet for longer than the hard timeout after some
    /// output had already been seen.
    Silence,
}

/// Result of a completed shell execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutcome {
    /// The bridge's answer to the shell request.
    pub response: Response,
    pub end: StreamEnd,
    /// Payload bytes streamed to the receiver.
    pub bytes_received: usize,
}

// ── ShellSession ──────────────────────────────────────────────────

/// One shell execution over its own connection.
#[derive(Debug)]
pub struct ShellSession {
    info: ConnectionInfo,
    serial: String,
    connect_key: String,
    phase: ShellPhase,
}

impl ShellSession {
    /// A session for `serial` behind the bridge at `info`. The serial is
    /// also used as the handshake connect key.
    pub fn new(info: ConnectionInfo, serial: impl Into<String>) -> Self {
        let serial = serial.into();
        Self {
            info,
            connect_key: serial.clone(),
            serial,
            phase: ShellPhase::Idle,
        }
    }

    pub fn with_connect_key(mut self, key: impl Into<String>) -> Self {
        self.connect_key = key.into();
        self
    }

    pub fn phase(&self) -> ShellPhase {
        self.phase
    }

    /// Run `request`, streaming output into `receiver`.
    ///
    /// `receiver.on_done()` runs exactly once whatever the result; on
    /// failure `on_error` runs first. A session can run any number of
    /// requests, one at a time.
    pub fn execute(&mut self, request: &ShellRequest, receiver: &mut dyn Receiver) -> Result<ShellOutcome> {
        self.phase = ShellPhase::Idle;
        let mut guard = DoneGuard { receiver };
        let mut transport = None;

        let result = self.run(request, &mut guard, &mut transport);
        if let Some(mut t) = transport {
            t.close();
        }

        match &result {
            Ok(outcome) => {
                debug!(command = %request.command, end = ?outcome.end, bytes = outcome.bytes_received, "shell finished");
            }
            Err(e) => {
                let next = if matches!(e, BridgeError::ShellUnresponsive { .. }) {
                    ShellPhase::TimedOut
                } else {
                    ShellPhase::Failed
                };
                if self.phase.advance(next).is_err() {
                    self.phase = ShellPhase::Failed;
                }
                warn!(command = %request.command, error = %e, "shell failed");
                guard.receiver.on_error(&e.to_string());
            }
        }
        result
    }

    fn run(
        &mut self,
        request: &ShellRequest,
        guard: &mut DoneGuard<'_>,
        slot: &mut Option<Transport>,
    ) -> Result<ShellOutcome> {
        self.phase.advance(ShellPhase::Handshaking)?;
        let transport = slot.insert(Transport::open(&self.info, Some(request.timeout))?);
        control::handshake(transport, &self.connect_key, request.timeout)?;

        self.phase.advance(ShellPhase::Selecting)?;
        control::select_device(transport, &self.serial, request.timeout)?;

        self.phase.advance(ShellPhase::Requesting)?;
        control::send_request(transport, &request.request_text(), request.timeout)?;
        let response = control::read_response(transport, false, request.timeout)?.into_result()?;

        self.phase.advance(ShellPhase::Streaming)?;
        let (end, bytes_received) = stream_output(transport, request, &mut *guard.receiver)?;

        self.phase.advance(ShellPhase::Done)?;
        Ok(ShellOutcome {
            response,
            end,
            bytes_received,
        })
    }
}

/// Run `request` against `serial` on a fresh connection.
pub fn execute(
    info: &ConnectionInfo,
    serial: &str,
    request: &ShellRequest,
    receiver: &mut dyn Receiver,
) -> Result<ShellOutcome> {
    ShellSession::new(info.clone(), serial).execute(request, receiver)
}

fn stream_output(
    transport: &mut Transport,
    request: &ShellRequest,
    receiver: &mut dyn Receiver,
) -> Result<(StreamEnd, usize)> {
    let started = Instant::now();
    let mut last_data = started;
    let mut seen_output = false;
    let mut bytes = 0usize;
    let mut header: Vec<u8> = Vec::with_capacity(CONTROL_HEADER_SIZE);
    let mut tail = String::new();

    loop {
        if request.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            info!(command = %request.command, "shell cancelled by caller");
            return Err(BridgeError::ExecutionTerminated);
        }

        let mut slice = POLL_INTERVAL;
        if let Some(limit) = request.read_timeout {
            let left = limit.saturating_sub(started.elapsed());
            if left.is_zero() {
                return Ok((StreamEnd::ReadTimeout, bytes));
            }
            slice = slice.min(left);
        }

        let quiet = last_data.elapsed();
        if quiet >= request.timeout {
            if !seen_output {
                return Err(BridgeError::ShellUnresponsive {
                    command: request.command.clone(),
                    timeout: request.timeout,
                });
            }
            warn!(command = %request.command, ?quiet, "shell output went quiet, ending stream");
            return Ok((StreamEnd::Silence, bytes));
        }
        slice = slice.min(request.timeout - quiet);

        let got = transport.read(CONTROL_HEADER_SIZE - header.len(), slice)?;
        header.extend_from_slice(&got);
        if header.len() < CONTROL_HEADER_SIZE {
            if transport.is_peer_closed() {
                if header.is_empty() {
                    return Ok((StreamEnd::PeerClosed, bytes));
                }
                return Err(BridgeError::ProtocolViolation(format!(
                    "stream closed inside a frame header ({} bytes)",
                    header.len()
                )));
            }
            continue;
        }

        let len = check_frame_length(decode_be32(word_at(&header, 0)) as usize)?;
        header.clear();
        if len == 0 {
            return Ok((StreamEnd::PeerClosed, bytes));
        }
        let payload = transport.read_exact(len, request.timeout, "shell output")?;
        seen_output = true;
        last_data = Instant::now();
        bytes += len;

        let text = decode_text(&payload);
        receiver.on_data(&text);

        if let Some(mark) = request.end_mark.as_deref().filter(|m| !m.is_empty()) {
            tail.push_str(&text);
            if tail.contains(mark) {
                return Ok((StreamEnd::EndMark, bytes));
            }
            let keep = mark.len().saturating_sub(1);
            if tail.len() > keep {
                let mut cut = tail.len() - keep;
                while !tail.is_char_boundary(cut) {
                    cut += 1;
                }
                tail.drain(..cut);
            }
        }
    }
}
