//! Domain-specific error types for the bridge client.
//!
//! All fallible operations return `Result<T, BridgeError>`. Variants are
//! grouped so upstream retry policies can tell "device unreachable" (retry
//! may help) from "protocol violation" (it will not) from "peer rejected"
//! (configuration or permission problem). See [`BridgeError::class`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// The canonical error type for the bridge client.
#[derive(Debug, Error)]
pub enum BridgeError {
    // ── Transport Errors ─────────────────────────────────────────
    /// Socket-level failure: connect refused, reset, generic I/O.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A frame was malformed, truncated, or carried an unexpected tag.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The sync sub-protocol exchange went wrong. `diagnostic` holds the
    /// raw bytes the peer sent (FAIL text or the offending header).
    #[error("sync protocol error: {message}")]
    SyncProtocol { message: String, diagnostic: Vec<u8> },

    /// A remote path does not fit the sync path limit.
    #[error("remote path too long: {len} bytes (max {max})")]
    RemotePathTooLong { len: usize, max: usize },

    // ── Peer Rejections ──────────────────────────────────────────
    /// The bridge answered FAIL to a handshake, select or command request.
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// STAT reported mode 0 for the remote path.
    #[error("remote path not found: {0}")]
    RemoteNotFound(String),

    // ── Shell Errors ─────────────────────────────────────────────
    /// The hard timeout elapsed before the command produced any output.
    #[error("shell command `{command}` unresponsive after {timeout:?}")]
    ShellUnresponsive { command: String, timeout: Duration },

    /// The caller's cancellation token fired mid-stream.
    #[error("execution terminated by caller")]
    ExecutionTerminated,

    // ── Monitor Errors ───────────────────────────────────────────
    /// The device monitor exhausted its reconnect attempts.
    #[error("bridge at {host} unreachable after {attempts} attempts")]
    MonitorUnreachable { host: String, attempts: u32 },

    // ── Local Errors ─────────────────────────────────────────────
    /// A local filesystem operation failed during a transfer.
    #[error("local file {path}: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

// ── ErrorClass ───────────────────────────────────────────────────

/// Coarse classification consumed by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Device or bridge could not be reached. Retrying may help.
    Unreachable,
    /// The byte stream did not follow the protocol. Retrying will not help.
    Protocol,
    /// The peer understood and refused the request.
    Rejected,
    /// The caller cancelled the operation.
    Cancelled,
    /// The local side failed (filesystem, configuration).
    Local,
}

impl BridgeError {
    /// Classify this error for upstream retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(_) | Self::ShellUnresponsive { .. } | Self::MonitorUnreachable { .. } => {
                ErrorClass::Unreachable
            }
            Self::ProtocolViolation(_) | Self::SyncProtocol { .. } | Self::RemotePathTooLong { .. } => {
                ErrorClass::Protocol
            }
            Self::CommandRejected(_) | Self::RemoteNotFound(_) => ErrorClass::Rejected,
            Self::ExecutionTerminated => ErrorClass::Cancelled,
            Self::LocalFile { .. } | Self::Config(_) => ErrorClass::Local,
        }
    }

    /// Returns `true` if retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Unreachable
    }

    pub(crate) fn sync(message: impl Into<String>, diagnostic: impl Into<Vec<u8>>) -> Self {
        Self::SyncProtocol {
            message: message.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub(crate) fn local(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalFile {
            path: path.into(),
            source,
        }
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(e: toml::de::Error) -> Self {
        BridgeError::Config(e.to_string())
    }
}
