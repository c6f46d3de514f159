//! Error types for the file RPC transport.

use crate::protocol::Value;
use crate::transport::ConnectionState;

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-related errors.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec errors during serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The peer answered a call with an error report.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Caller-side deadline exceeded.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Channel closed unexpectedly.
    #[error("Channel closed")]
    ChannelClosed,
}

impl Error {
    /// Returns true if the call failed because the connection went away.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection(ConnectionError::Lost(_)))
    }

    /// Returns true if the caller-side deadline was exceeded.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns true if the stream carried bytes that could not be decoded.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::Codec(CodecError::MalformedMessage(_)))
    }

    /// The peer-reported error, if this is one.
    #[must_use]
    pub const fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to establish connection.
    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        /// The endpoint we tried to connect to.
        endpoint: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The connection closed or faulted while the operation was outstanding.
    #[error("Connection lost: {0}")]
    Lost(LossReason),

    /// Too many in-flight requests.
    #[error("Too many in-flight requests: {current}/{max}")]
    TooManyInFlight {
        /// Current number of in-flight requests.
        current: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// The connection is not in a state that accepts writes.
    #[error("Connection is {0}")]
    NotConnected(ConnectionState),
}

/// Why a connection stopped carrying traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// The peer closed the stream.
    Closed,
    /// The local side called `close`.
    ClosedByClient,
    /// The stream failed or carried undecodable data.
    Faulted(String),
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed by peer"),
            Self::ClosedByClient => f.write_str("closed by client"),
            Self::Faulted(cause) => write!(f, "faulted: {cause}"),
        }
    }
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A response or error named a request that is not pending.
    #[error("No pending call for correlation id {0}")]
    UnknownCorrelation(u64),

    /// The correlation id is already held by a pending call.
    #[error("Correlation id {0} is still pending")]
    IdInUse(u64),

    /// The stream ended in the middle of a frame.
    #[error("Stream ended with {buffered} bytes of an incomplete frame")]
    TruncatedStream {
        /// Bytes left in the accumulation buffer.
        buffered: usize,
    },

    /// The frame reader already hit a fatal error.
    #[error("Frame reader is poisoned by an earlier error")]
    ReaderPoisoned,
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bytes did not conform to the envelope schema.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),
}

/// Error report sent by the peer.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("code {code}: {description}")]
pub struct RemoteError {
    /// Peer-defined error code.
    pub code: i32,
    /// Human-readable description.
    pub description: String,
    /// Optional structured details.
    pub details: Option<Value>,
    /// True when the report was not tied to any pending call and was fanned
    /// out to every outstanding request.
    pub unsolicited: bool,
}

impl From<prost::DecodeError> for CodecError {
    fn from(err: prost::DecodeError) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}

impl From<prost::EncodeError> for CodecError {
    fn from(err: prost::EncodeError) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<LossReason> for Error {
    fn from(reason: LossReason) -> Self {
        Self::Connection(ConnectionError::Lost(reason))
    }
}
