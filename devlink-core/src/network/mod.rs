//! Blocking TCP plumbing.

pub mod transport;

pub use transport::Transport;

use std::fmt;
use std::time::Duration;

use transport::{DEFAULT_RESET_BACKOFF, DEFAULT_WRITE_PACING};

/// Address of a bridge endpoint, plus the socket tunables every
/// [`Transport`] opened against it inherits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
    pacing: Duration,
    reset_backoff: Duration,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            pacing: DEFAULT_WRITE_PACING,
            reset_backoff: DEFAULT_RESET_BACKOFF,
        }
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_reset_backoff(mut self, backoff: Duration) -> Self {
        self.reset_backoff = backoff;
        self
    }

    pub fn pacing(&self) -> Duration {
        self.pacing
    }

    pub fn reset_backoff(&self) -> Duration {
        self.reset_backoff
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
