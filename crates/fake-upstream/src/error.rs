//! Errors returned while standing up a fake upstream.
//!
//! Everything after startup is either a test assertion (panic) or a state
//! change observed through a wait, so this type only covers construction.

use std::io;

/// Failure to configure or start a [`FakeUpstream`](crate::FakeUpstream).
#[derive(Debug)]
pub enum UpstreamError {
    /// Generic I/O failure (thread spawn, runtime creation).
    Io(io::Error),
    /// The listener could not be bound.
    Bind {
        /// Address the listener tried to bind.
        address: String,
        /// Underlying error.
        source: io::Error,
    },
    /// The configuration document could not be parsed.
    Config(serde_json::Error),
    /// The configuration parsed but is unusable.
    InvalidConfig(&'static str),
    /// The event-loop thread exited before reporting readiness.
    Startup,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "fake upstream I/O error: {e}"),
            Self::Bind { address, source } => {
                write!(f, "fake upstream failed to bind {address}: {source}")
            }
            Self::Config(e) => write!(f, "invalid fake upstream config: {e}"),
            Self::InvalidConfig(msg) => write!(f, "invalid fake upstream config: {msg}"),
            Self::Startup => write!(f, "fake upstream event loop exited during startup"),
        }
    }
}

impl std::error::Error for UpstreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::Bind { source: e, .. } => Some(e),
            Self::Config(e) => Some(e),
            Self::InvalidConfig(_) | Self::Startup => None,
        }
    }
}

impl From<io::Error> for UpstreamError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UpstreamError>;
