//! QEMU Machine Protocol (QMP) client for the vmctl control plane.
//!
//! QMP is newline-delimited UTF-8 JSON over a byte stream. The server
//! greets every new connection with a banner, then refuses all commands
//! until the client has negotiated capabilities with `qmp_capabilities`.
//!
//! The [`Client`] wraps one loopback TCP connection and walks the
//! `Disconnected → Connecting → Handshaking → Ready` state machine in a
//! background task, retrying while the hypervisor is still opening its
//! listening socket.

mod client;
mod codec;
mod message;

pub use client::{Client, ConnState, ConnectPolicy};
pub use codec::{MAX_LINE, parse_lenient, recv, send};
pub use message::{
    Command, Greeting, GreetingBody, GreetingVersion, QemuVersion, commands, error_of, is_event,
};

/// Alias for `Result<T, vmctl_qmp::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by QMP operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A command was issued before the connection reached [`ConnState::Ready`].
    #[error("control connection is not ready")]
    NotConnected,

    /// The server answered a command with an `error` object.
    #[error("{class}: {desc}")]
    Command {
        /// QMP error class (e.g. `GenericError`, `CommandNotFound`).
        class: String,
        /// Human-readable description supplied by the server.
        desc: String,
    },

    /// No reply arrived within the configured window.
    #[error("timed out waiting for the control socket")]
    Timeout,

    /// Socket I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A command could not be encoded, or a user-supplied command was malformed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
