//! # devlink-core
//!
//! Host-side client for a device-bridge wire protocol.
//!
//! This crate contains:
//! - **Codec**: control frames (big-endian length) and sync frames (tag plus
//!   swapped little-endian length), kept as separate named helpers
//! - **Handshake**: the fixed-width banner/key exchange
//! - **Network**: `Transport`, blocking TCP with paced writes and partial reads
//! - **Protocol**: device selection, streamed shell execution, file sync
//! - **State**: device records and the background `DeviceMonitor`
//! - **Task**: `CancellationToken` for cooperative cancellation
//! - **Client**: `BridgeClient`, the entry points built on all of the above
//! - **Error**: `BridgeError`, typed, `thiserror`-based error hierarchy

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod network;
pub mod protocol;
pub mod state;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client::BridgeClient;
pub use codec::{
    ModeValue, REMOTE_PATH_MAX_LENGTH, Response, SPECIAL_FILE_MODE, SYNC_DATA_MAX, SyncTag,
};
pub use config::BridgeConfig;
pub use error::{BridgeError, ErrorClass, Result};
pub use network::{ConnectionInfo, Transport};
pub use protocol::{
    CollectingReceiver, Receiver, ShellOutcome, ShellPhase, ShellRequest, ShellSession,
    StreamEnd, SyncChannel, TransferPlan,
};
pub use state::{
    DeviceKind, DeviceMonitor, DeviceRecord, DeviceState, MonitorListener, MonitorPhase,
    MonitorRegistry, MonitorSettings, Sleeper,
};
pub use task::CancellationToken;
