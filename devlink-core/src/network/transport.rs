//! Byte-exact blocking socket I/O with wall-clock timeouts.
//!
//! `write` paces partial sends and gives up once its timeout elapses,
//! returning how much went out. The truncation is silent: callers learn
//! about it from the peer's protocol-level answer, not from `write`.
//!
//! `read` accumulates until it has `length` bytes, the timeout elapses, or
//! the peer closes. A short buffer is a normal return value; callers that
//! need an exact length use [`Transport::read_exact`].

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::ConnectionInfo;
use crate::error::{BridgeError, Result};

/// Pause between partial sends.
pub const DEFAULT_WRITE_PACING: Duration = Duration::from_millis(5);

/// How many connection resets `read` absorbs before giving up.
pub const MAX_RESET_RETRIES: u32 = 3;

/// Back-off after a connection reset.
pub const DEFAULT_RESET_BACKOFF: Duration = Duration::from_secs(1);

/// Largest step the read buffer grows by; the full requested length is
/// never allocated up front.
const READ_CHUNK: usize = 64 * 1024;

/// Socket timeouts must be non-zero.
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

/// One TCP connection to a bridge, owned by exactly one component.
#[derive(Debug)]
pub struct Transport {
    info: ConnectionInfo,
    stream: Option<TcpStream>,
    read_timeout: Duration,
    pacing: Duration,
    reset_backoff: Duration,
    peer_closed: bool,
}

impl Transport {
    /// Connect to `info`. With `timeout`, each resolved address gets that
    /// long to accept; the value also becomes the default read timeout.
    pub fn open(info: &ConnectionInfo, timeout: Option<Duration>) -> Result<Self> {
        let stream = match timeout {
            Some(limit) => connect_with_timeout(info, limit)?,
            None => TcpStream::connect((info.host(), info.port()))?,
        };
        stream.set_nodelay(true)?;
        debug!(peer = %info, "transport opened");

        Ok(Self {
            info: info.clone(),
            stream: Some(stream),
            read_timeout: timeout.unwrap_or(Duration::from_secs(40)),
            pacing: info.pacing(),
            reset_backoff: info.reset_backoff(),
            peer_closed: false,
        })
    }

    /// Override the pause between partial sends.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Override the back-off applied after a connection reset.
    pub fn with_reset_backoff(mut self, backoff: Duration) -> Self {
        self.reset_backoff = backoff;
        self
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Default timeout used by callers that do not pass their own.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// `true` once a read observed end-of-stream.
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// A second handle on the socket, used to unblock a read from another
    /// thread by shutting the socket down.
    pub fn shutdown_handle(&self) -> Result<TcpStream> {
        Ok(self.stream()?.try_clone()?)
    }

    /// Send `bytes`, pacing partial writes. Returns the number of bytes
    /// written, which is less than `bytes.len()` if `timeout` elapsed.
    pub fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize> {
        let pacing = self.pacing;
        let stream = self.stream_mut()?;
        let started = Instant::now();
        let mut sent = 0;

        while sent < bytes.len() {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(sent, total = bytes.len(), "write timed out, payload truncated");
                break;
            }
            stream.set_write_timeout(Some(remaining.max(MIN_SOCKET_TIMEOUT)))?;
            match stream.write(&bytes[sent..]) {
                Ok(0) => break,
                Ok(n) => {
                    sent += n;
                    if sent < bytes.len() {
                        thread::sleep(pacing);
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        trace!(sent, "transport write");
        Ok(sent)
    }

    /// Read up to `length` bytes within `timeout`.
    ///
    /// Returns early with a short buffer on timeout or end-of-stream.
    /// Connection resets are retried [`MAX_RESET_RETRIES`] times.
    pub fn read(&mut self, length: usize, timeout: Duration) -> Result<Vec<u8>> {
        let backoff = self.reset_backoff;
        let stream = self.stream_mut()?;
        let (buf, eof) = read_timed(stream, length, timeout, backoff)?;
        if eof {
            self.peer_closed = true;
        }
        trace!(requested = length, got = buf.len(), "transport read");
        Ok(buf)
    }

    /// Read exactly `length` bytes or fail with a protocol violation
    /// naming `what` was being read.
    pub fn read_exact(&mut self, length: usize, timeout: Duration, what: &str) -> Result<Vec<u8>> {
        let buf = self.read(length, timeout)?;
        if buf.len() != length {
            return Err(BridgeError::ProtocolViolation(format!(
                "short read of {what}: expected {length} bytes, got {}",
                buf.len()
            )));
        }
        Ok(buf)
    }

    /// Write all of `bytes`, turning a truncated send into an error.
    ///
    /// Used where a partial frame would desynchronise the stream before the
    /// peer could answer.
    pub fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let sent = self.write(bytes, timeout)?;
        if sent != bytes.len() {
            return Err(BridgeError::Transport(io::Error::new(
                ErrorKind::TimedOut,
                format!("sent {sent} of {} bytes before timeout", bytes.len()),
            )));
        }
        Ok(())
    }

    /// Close the socket. Safe to call more than once; only the first call
    /// has an effect.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(peer = %self.info, "transport closed");
        }
    }

    fn stream(&self) -> Result<&TcpStream> {
        self.stream.as_ref().ok_or_else(not_connected)
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Timed reads ──────────────────────────────────────────────────

/// A byte source whose blocking reads can be bounded.
trait TimedRead: Read {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl TimedRead for TcpStream {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))
    }
}

/// Accumulate up to `length` bytes before `timeout`. The flag is `true`
/// when the source reached end-of-stream.
fn read_timed<R: TimedRead>(
    source: &mut R,
    length: usize,
    timeout: Duration,
    backoff: Duration,
) -> io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::with_capacity(length.min(READ_CHUNK));
    let mut scratch = vec![0u8; length.clamp(1, READ_CHUNK)];
    let mut resets = 0;
    let deadline = Instant::now() + timeout;

    while buf.len() < length {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        source.set_timeout((deadline - now).max(MIN_SOCKET_TIMEOUT))?;
        let want = (length - buf.len()).min(scratch.len());
        match source.read(&mut scratch[..want]) {
            Ok(0) => return Ok((buf, true)),
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::ConnectionReset && resets < MAX_RESET_RETRIES => {
                resets += 1;
                warn!(attempt = resets, "connection reset during read, retrying");
                thread::sleep(backoff);
            }
            Err(e) => return Err(e),
        }
    }
    Ok((buf, false))
}

fn not_connected() -> BridgeError {
    BridgeError::Transport(io::Error::new(ErrorKind::NotConnected, "transport is closed"))
}

fn connect_with_timeout(info: &ConnectionInfo, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in (info.host(), info.port()).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout.max(MIN_SOCKET_TIMEOUT)) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, format!("no address for {info}")))
        .into())
}
