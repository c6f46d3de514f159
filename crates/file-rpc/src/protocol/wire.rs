//! Protobuf layout of the envelope.
//!
//! Field numbers are part of the wire contract and must never be reused.
//! The envelope body lives in field 3 as a nested union message, so every
//! message kind shares that single tag.

use crate::error::CodecError;
use crate::protocol::message::{Body, Envelope, ErrorReport, Event, Request, Response};
use crate::protocol::Value;
use crate::protocol::value::MAX_VALUE_DEPTH;

use std::collections::BTreeMap;

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireEnvelope {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub service: String,
    #[prost(message, optional, tag = "3")]
    pub body: Option<WireBody>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireBody {
    #[prost(oneof = "wire_body::Kind", tags = "1, 2, 3, 4")]
    pub kind: Option<wire_body::Kind>,
}

pub(crate) mod wire_body {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Request(super::WireRequest),
        #[prost(message, tag = "2")]
        Response(super::WireResponse),
        #[prost(message, tag = "3")]
        Event(super::WireEvent),
        #[prost(message, tag = "4")]
        Error(super::WireError),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireRequest {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(message, repeated, tag = "2")]
    pub args: Vec<WireValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireResponse {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    #[prost(message, optional, tag = "2")]
    pub result: Option<WireValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireEvent {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub args: Vec<WireValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireError {
    #[prost(uint64, tag = "1")]
    pub failed_message_id: u64,
    #[prost(int32, tag = "2")]
    pub code: i32,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(message, optional, tag = "4")]
    pub details: Option<WireValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireValue {
    #[prost(oneof = "wire_value::Kind", tags = "1, 2, 3, 4, 5, 6")]
    pub kind: Option<wire_value::Kind>,
}

pub(crate) mod wire_value {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(string, tag = "1")]
        String(String),
        #[prost(int32, tag = "2")]
        Int(i32),
        #[prost(bool, tag = "3")]
        Bool(bool),
        #[prost(message, tag = "4")]
        Array(super::WireValueList),
        #[prost(message, tag = "5")]
        Map(super::WireValueMap),
        #[prost(bytes = "bytes", tag = "6")]
        Bytes(::prost::bytes::Bytes),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireValueList {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<WireValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct WireValueMap {
    #[prost(btree_map = "string, message", tag = "1")]
    pub entries: BTreeMap<String, WireValue>,
}

impl From<&Value> for WireValue {
    fn from(value: &Value) -> Self {
        use wire_value::Kind;

        let kind = match value {
            Value::String(s) => Kind::String(s.clone()),
            Value::Int(i) => Kind::Int(*i),
            Value::Bool(b) => Kind::Bool(*b),
            Value::Array(values) => Kind::Array(WireValueList {
                values: values.iter().map(Self::from).collect(),
            }),
            Value::Map(entries) => Kind::Map(WireValueMap {
                entries: entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            }),
            Value::Bytes(bytes) => Kind::Bytes(bytes.clone()),
        };

        Self { kind: Some(kind) }
    }
}

impl TryFrom<WireValue> for Value {
    type Error = CodecError;

    fn try_from(wire: WireValue) -> Result<Self, Self::Error> {
        value_from_wire(wire, 1)
    }
}

fn value_from_wire(wire: WireValue, depth: usize) -> Result<Value, CodecError> {
    use wire_value::Kind;

    if depth > MAX_VALUE_DEPTH {
        return Err(CodecError::MalformedMessage(format!(
            "value nests deeper than {MAX_VALUE_DEPTH} levels"
        )));
    }

    let kind = wire
        .kind
        .ok_or_else(|| CodecError::MalformedMessage("value has no variant set".to_string()))?;

    Ok(match kind {
        Kind::String(s) => Value::String(s),
        Kind::Int(i) => Value::Int(i),
        Kind::Bool(b) => Value::Bool(b),
        Kind::Array(list) => Value::Array(
            list.values
                .into_iter()
                .map(|v| value_from_wire(v, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        Kind::Map(map) => Value::Map(
            map.entries
                .into_iter()
                .map(|(k, v)| value_from_wire(v, depth + 1).map(|v| (k, v)))
                .collect::<Result<_, _>>()?,
        ),
        Kind::Bytes(bytes) => Value::Bytes(bytes),
    })
}

fn values_from_wire(values: Vec<WireValue>) -> Result<Vec<Value>, CodecError> {
    values.into_iter().map(Value::try_from).collect()
}

impl From<&Envelope> for WireEnvelope {
    fn from(envelope: &Envelope) -> Self {
        use wire_body::Kind;

        let kind = match &envelope.body {
            Body::Request(request) => Kind::Request(WireRequest {
                method: request.method.clone(),
                args: request.args.iter().map(WireValue::from).collect(),
            }),
            Body::Response(response) => Kind::Response(WireResponse {
                request_id: response.request_id,
                result: Some(WireValue::from(&response.result)),
            }),
            Body::Event(event) => Kind::Event(WireEvent {
                name: event.name.clone(),
                args: event.args.iter().map(WireValue::from).collect(),
            }),
            Body::Error(report) => Kind::Error(WireError {
                failed_message_id: report.failed_message_id,
                code: report.code,
                description: report.description.clone(),
                details: report.details.as_ref().map(WireValue::from),
            }),
        };

        Self {
            id: envelope.id,
            service: envelope.service.clone(),
            body: Some(WireBody { kind: Some(kind) }),
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = CodecError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        use wire_body::Kind;

        let kind = wire
            .body
            .and_then(|body| body.kind)
            .ok_or_else(|| CodecError::MalformedMessage("envelope has no body".to_string()))?;

        let body = match kind {
            Kind::Request(request) => Body::Request(Request {
                method: request.method,
                args: values_from_wire(request.args)?,
            }),
            Kind::Response(response) => {
                let result = response.result.ok_or_else(|| {
                    CodecError::MalformedMessage(format!(
                        "response to {} has no result",
                        response.request_id
                    ))
                })?;
                Body::Response(Response {
                    request_id: response.request_id,
                    result: Value::try_from(result)?,
                })
            }
            Kind::Event(event) => Body::Event(Event {
                name: event.name,
                args: values_from_wire(event.args)?,
            }),
            Kind::Error(error) => Body::Error(ErrorReport {
                failed_message_id: error.failed_message_id,
                code: error.code,
                description: error.description,
                details: error.details.map(Value::try_from).transpose()?,
            }),
        };

        Ok(Self {
            id: wire.id,
            service: wire.service,
            body,
        })
    }
}
