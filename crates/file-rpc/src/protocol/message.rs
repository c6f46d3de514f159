//! Envelope schema shared by requests, responses, events and error reports.

use crate::protocol::Value;

/// Outer wire message.
///
/// For a [`Body::Request`] the `id` is the correlation key. Inbound
/// responses and error reports are correlated by the id they carry in their
/// payload (`request_id` / `failed_message_id`); their envelope `id` is the
/// peer's own framing id and is never used to find a pending call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender-assigned id.
    pub id: u64,
    /// Service the message belongs to (for example `"file"`).
    pub service: String,
    /// The message itself.
    pub body: Body,
}

/// Exactly one of the four message kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// A call awaiting a response.
    Request(Request),
    /// Successful answer to a request.
    Response(Response),
    /// Server-pushed notification.
    Event(Event),
    /// Failure report.
    Error(ErrorReport),
}

/// Method invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Method name.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

/// Answer to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Id of the request being answered.
    pub request_id: u64,
    /// Call result.
    pub result: Value,
}

/// Uncorrelated notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event name subscribers register for.
    pub name: String,
    /// Event arguments.
    pub args: Vec<Value>,
}

/// Error report from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Id of the request that failed.
    pub failed_message_id: u64,
    /// Peer-defined error code.
    pub code: i32,
    /// Human-readable description.
    pub description: String,
    /// Optional structured details.
    pub details: Option<Value>,
}

impl Envelope {
    /// Builds a request envelope.
    pub fn request(
        id: u64,
        service: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            id,
            service: service.into(),
            body: Body::Request(Request {
                method: method.into(),
                args,
            }),
        }
    }

    /// Builds a response envelope answering `request_id`.
    pub fn response(id: u64, service: impl Into<String>, request_id: u64, result: Value) -> Self {
        Self {
            id,
            service: service.into(),
            body: Body::Response(Response { request_id, result }),
        }
    }

    /// Builds an event envelope.
    pub fn event(
        id: u64,
        service: impl Into<String>,
        name: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            id,
            service: service.into(),
            body: Body::Event(Event {
                name: name.into(),
                args,
            }),
        }
    }

    /// Builds an error envelope for `failed_message_id`.
    pub fn error(
        id: u64,
        service: impl Into<String>,
        failed_message_id: u64,
        code: i32,
        description: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self {
            id,
            service: service.into(),
            body: Body::Error(ErrorReport {
                failed_message_id,
                code,
                description: description.into(),
                details,
            }),
        }
    }
}

impl Body {
    /// Name of the populated variant, for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
            Self::Error(_) => "error",
        }
    }
}
