//! Conversations with the bridge built on top of [`Transport`].
//!
//! - [`control`]: handshake, device selection, request/response frames.
//! - [`shell`]: one shell command per connection, output streamed.
//! - [`sync`]: file transfer sub-protocol.
//!
//! [`Transport`]: crate::network::Transport

pub mod control;
pub mod shell;
pub mod sync;

pub use shell::{
    CollectingReceiver, Receiver, ShellOutcome, ShellPhase, ShellRequest, ShellSession, StreamEnd,
};
pub use sync::{RemoteEntry, SyncChannel, TransferPlan};
