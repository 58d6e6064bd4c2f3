//! Error types for the data plane.

use thiserror::Error;

/// Main error type for network and CPS operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration. Fatal at startup, never recovered.
    #[error("configuration error: {0}")]
    Config(String),

    /// A device operation failed.
    #[error("port {port}: {msg}")]
    Port { port: String, msg: String },

    /// The device does not support a requested feature.
    #[error("{0} is not supported by the device")]
    Unsupported(&'static str),

    /// A bounded resource (pool, mailbox, headroom) is exhausted.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    /// Queue allocation failed for an interface.
    #[error("queue allocation failed on interface {0}")]
    QueueExhausted(String),

    /// A packet failed basic header validation.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Link did not come up within the bounded startup wait.
    #[error("link on port {0} did not come up")]
    LinkDown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Nix(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
