//! Error taxonomy for the broker core.
//!
//! Errors fall into five classes:
//!
//! - **Transport-fatal** ([`TransportError`], [`DispatchError`], [`WireError`]):
//!   the connection is unusable and the owning manager must be torn down.
//! - **Protocol-domain failure** ([`Error::Failed`], [`Error::Cancelled`]):
//!   the peer answered, and the answer was "no".
//! - **Timeout** ([`Error::Timeout`]): no answer before the deadline.
//! - **Backpressure**: never an error; a full queue blocks the producer.
//!   Only the loss of the worker is reported ([`ActorError::Stopped`]).
//! - **Subscriber delivery failure**: confined to the subscriber, never
//!   surfaced here.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias for broker operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Malformed or unrepresentable wire data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than a header or argument needs.
    #[error("truncated message: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },
    /// Header size field disagrees with the frame length.
    #[error("message length mismatch: header declares {declared} bytes, frame has {actual}")]
    LengthMismatch {
        /// Size declared in the header.
        declared: usize,
        /// Bytes actually supplied.
        actual: usize,
    },
    /// Header size below 8 or not a multiple of 4.
    #[error("invalid message size {0}")]
    InvalidSize(usize),
    /// String argument is not NUL-terminated UTF-8.
    #[error("invalid string argument")]
    InvalidString,
    /// String to encode contains a NUL byte.
    #[error("string argument contains an interior NUL")]
    InteriorNul,
    /// Encoded message would not fit the 16-bit size field.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// `XDG_RUNTIME_DIR` is unset and no absolute address was given.
    #[error("XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,
    /// The socket could not be reached.
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        /// Resolved socket path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// Peer closed the socket.
    #[error("connection closed by peer")]
    Closed,
    /// Socket I/O failed.
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
    /// Frame could not be decoded.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Failures while routing an inbound event to its handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No object is registered under the sender id.
    #[error("event for unknown object {0}")]
    SenderNotFound(u32),
    /// The object exists but accepts no events.
    #[error("object {object_id} ({interface}) cannot dispatch events")]
    SenderUnsupported {
        /// Sender id.
        object_id: u32,
        /// Interface of the inert object.
        interface: &'static str,
    },
    /// Reading the next message failed.
    #[error("unable to read message: {0}")]
    Read(#[from] TransportError),
    /// A handler's reply request could not be sent.
    #[error("unable to send request: {0}")]
    Write(#[source] TransportError),
    /// Event arguments did not match the interface.
    #[error("malformed event: {0}")]
    Malformed(#[from] WireError),
    /// Peer sent `wl_display.error`.
    #[error("protocol error on object {object_id} (code {code}): {message}")]
    Protocol {
        /// Object the error refers to.
        object_id: u32,
        /// Interface-specific error code.
        code: u32,
        /// Human-readable description.
        message: String,
    },
    /// A peer-allocated id collided with a live object.
    #[error("object id {0} is already in use")]
    IdInUse(u32),
}

/// Outcome of a `post` that did not run to completion.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ActorError {
    /// The actor stopped before (or while) the task was queued.
    #[error("actor stopped")]
    Stopped,
    /// The task panicked; the worker survived.
    #[error("task panicked")]
    Panicked,
}

/// Top-level broker error.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Dispatch failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Actor hand-off failure.
    #[error(transparent)]
    Actor(#[from] ActorError),
    /// No acknowledgement before the deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Peer rejected the request.
    #[error("request failed: {0}")]
    Failed(String),
    /// Peer cancelled the request.
    #[error("request cancelled by compositor")]
    Cancelled,
    /// Required global is not advertised.
    #[error("compositor does not advertise {0}")]
    MissingGlobal(&'static str),
    /// The peer tore down the subsystem object.
    #[error("{0} finished")]
    Finished(&'static str),
    /// The connection failed while serving a request; the request's
    /// caller received the underlying error.
    #[error("connection lost during request: {0}")]
    ConnectionLost(String),
    /// A thread could not be spawned or similar local I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Dispatch(_)
                | Self::MissingGlobal(_)
                | Self::Finished(_)
                | Self::ConnectionLost(_)
                | Self::Io(_)
        )
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Self::Transport(TransportError::Wire(err))
    }
}
