//! Error types for wirecall.
//!
//! Two layers of errors exist:
//!
//! - [`Error`] - the crate-level error returned by runtime entry points
//!   (framing, codecs, transports, client/service state machines).
//! - [`CallError`] - the serializable error that travels inside a
//!   [`CallResult`] on the wire and reaches call continuations.

use thiserror::Error;

/// Main error type for all wirecall operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invocation attempted before the session was opened, or after it died.
    #[error("not connected to a service")]
    NotConnected,

    /// `open` called on a session that is already open.
    #[error("already connected")]
    AlreadyConnected,

    /// The per-function call queue is full (`max_calls_in_progress` reached).
    #[error("call queue limit exceeded for {0}")]
    QueueOverflow(String),

    /// Protocol violation (zero-length frame, unknown function, missing closure).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Encoded message does not fit behind a 4-byte length prefix.
    #[error("message too long for frame header")]
    MessageTooLong,

    /// I/O error from the transport layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    /// Misuse of the runtime API (duplicate registration, bad configuration).
    #[error("logic error: {0}")]
    Logic(String),
}

/// Result type alias using wirecall's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes used by the runtime when it synthesizes a [`CallError`]
/// itself (as opposed to carrying an OS error code from the transport).
///
/// The values are the POSIX errno numbers of the Linux network stack. They
/// are kept stable across platforms so that the wire format does not depend
/// on where a service runs.
pub mod codes {
    /// A call with the same name is already pending on this session.
    pub const OPERATION_IN_PROGRESS: i32 = 115;
    /// The session was closed locally while calls were outstanding.
    pub const CANCELED: i32 = 125;
    /// The connection was lost and no OS error code was available.
    pub const CONNECTION_LOST: i32 = 104;
    /// No session to the service.
    pub const NOT_CONNECTED: i32 = 107;
    /// The session was already open.
    pub const ALREADY_CONNECTED: i32 = 106;
    /// The peer violated the wire protocol.
    pub const PROTOCOL_ERROR: i32 = 71;
    /// A message failed to encode or decode.
    pub const BAD_MESSAGE: i32 = 74;
    /// An encoded message exceeded the frame size limit.
    pub const MESSAGE_TOO_LONG: i32 = 90;
    /// The call queue was full.
    pub const QUEUE_OVERFLOW: i32 = 11;
    /// The runtime API was misused.
    pub const LOGIC_ERROR: i32 = 22;
}

/// The error half of a [`CallResult`], as it appears on the wire:
/// an integer code and a human-readable message. Code `0` means success
/// and never appears inside a `CallResult::Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    code: i32,
    message: String,
}

impl CallError {
    /// Create an error from a code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The well-known error returned when a service rejects a second
    /// concurrent call with the same name on the same session.
    pub fn operation_in_progress() -> Self {
        Self::new(
            codes::OPERATION_IN_PROGRESS,
            "a call with this name is already in progress",
        )
    }

    /// The error used when a client closes its session with calls
    /// still outstanding.
    pub fn canceled() -> Self {
        Self::new(codes::CANCELED, "session closed with call outstanding")
    }

    /// Numeric error code; never `0`.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Human-readable description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this is the in-progress-rejection error.
    pub fn is_operation_in_progress(&self) -> bool {
        self.code == codes::OPERATION_IN_PROGRESS
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl From<&Error> for CallError {
    /// Map a runtime error to its wire representation. I/O errors carry
    /// their raw OS error code when the platform provides one.
    fn from(e: &Error) -> Self {
        let code = match e {
            Error::NotConnected => codes::NOT_CONNECTED,
            Error::AlreadyConnected => codes::ALREADY_CONNECTED,
            Error::QueueOverflow(_) => codes::QUEUE_OVERFLOW,
            Error::Protocol(_) => codes::PROTOCOL_ERROR,
            Error::MessageTooLong => codes::MESSAGE_TOO_LONG,
            Error::Io(io) => io.raw_os_error().unwrap_or(codes::CONNECTION_LOST),
            Error::Json(_) | Error::MsgpackEncode(_) | Error::MsgpackDecode(_) => {
                codes::BAD_MESSAGE
            }
            Error::Logic(_) => codes::LOGIC_ERROR,
        };
        Self::new(code, e.to_string())
    }
}

/// Result of a remote call, as delivered to a continuation.
///
/// Either the operation's value or a [`CallError`]. For void operations
/// the success value is `()`.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult<T> {
    /// The call succeeded with this value.
    Ok(T),
    /// The call failed; the error travelled back over the wire (or was
    /// synthesized locally by the runtime).
    Err(CallError),
}

impl<T> CallResult<T> {
    /// True when the call succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, CallResult::Ok(_))
    }

    /// True when the call failed.
    pub fn is_err(&self) -> bool {
        matches!(self, CallResult::Err(_))
    }

    /// The value, if the call succeeded.
    pub fn ok(self) -> Option<T> {
        match self {
            CallResult::Ok(v) => Some(v),
            CallResult::Err(_) => None,
        }
    }

    /// The error, if the call failed.
    pub fn err(&self) -> Option<&CallError> {
        match self {
            CallResult::Ok(_) => None,
            CallResult::Err(e) => Some(e),
        }
    }
}
