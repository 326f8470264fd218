//! Session error types.

use std::io;
use thiserror::Error;

/// Errors surfaced by sessions, either returned from a call or delivered
/// to listeners through `exception_caught`.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation not allowed in the current lifecycle state
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Invalid argument for this session
    #[error("illegal argument: {0}")]
    IllegalArgument(&'static str),

    /// Operation not supported by this kind of session
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Transport failure
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS engine failure
    #[cfg(feature = "tls")]
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// A message recognizer failed; the session stays open
    #[error("recognizer failed: {0}")]
    Recognizer(#[source] anyhow::Error),

    /// Read buffer reached its capacity limit without yielding a message
    #[error("read buffer reached its capacity limit ({buffered} >= {limit} bytes), closing session")]
    ResourceExhausted {
        /// Bytes buffered when the limit was hit
        buffered: usize,
        /// Configured limit
        limit: usize,
    },

    /// A session listener failed while handling an event
    #[error("listener failed: {0}")]
    Listener(#[source] anyhow::Error),

    /// Invalid configuration values
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl SessionError {
    /// Whether this is the capacity-limit error.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, SessionError::ResourceExhausted { .. })
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
