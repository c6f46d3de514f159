//! Protobuf codec for envelopes.

use crate::error::{CodecError, Result};
use crate::protocol::value::MAX_VALUE_DEPTH;
use crate::protocol::wire::WireEnvelope;
use crate::protocol::{Body, Envelope, Value};

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

/// Encode an envelope into its protobuf payload (without frame header).
///
/// # Errors
///
/// Returns [`CodecError::SerializationFailed`] if a value nests deeper than
/// [`MAX_VALUE_DEPTH`].
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    check_depth(envelope)?;
    let wire = WireEnvelope::from(envelope);
    let mut buf = BytesMut::with_capacity(wire.encoded_len());
    wire.encode(&mut buf).map_err(CodecError::from)?;
    Ok(buf.freeze())
}

/// Encode an envelope directly into `dst`, returning the payload length.
///
/// # Errors
///
/// Returns an error if a value nests too deep or `dst` cannot grow to hold
/// the payload. Nothing is written in either case.
pub fn encode_into(envelope: &Envelope, dst: &mut impl BufMut) -> Result<usize> {
    check_depth(envelope)?;
    let wire = WireEnvelope::from(envelope);
    let len = wire.encoded_len();
    wire.encode(dst).map_err(CodecError::from)?;
    Ok(len)
}

/// Size of the protobuf payload for `envelope`.
#[must_use]
pub fn encoded_len(envelope: &Envelope) -> usize {
    WireEnvelope::from(envelope).encoded_len()
}

/// Check that every value carried by `envelope` fits [`MAX_VALUE_DEPTH`].
///
/// # Errors
///
/// Returns [`CodecError::SerializationFailed`] naming the first offender.
pub fn check_depth(envelope: &Envelope) -> Result<()> {
    let values: &[Value] = match &envelope.body {
        Body::Request(request) => &request.args,
        Body::Response(response) => std::slice::from_ref(&response.result),
        Body::Event(event) => &event.args,
        Body::Error(report) => report.details.as_slice(),
    };

    match values.iter().find(|v| !v.fits_depth(MAX_VALUE_DEPTH)) {
        Some(value) => Err(CodecError::SerializationFailed(format!(
            "{} in envelope {} nests deeper than {} levels",
            value.kind(),
            envelope.id,
            MAX_VALUE_DEPTH
        ))
        .into()),
        None => Ok(()),
    }
}

/// Decode a protobuf payload into an envelope.
///
/// # Errors
///
/// Returns [`CodecError::MalformedMessage`] if the payload is truncated,
/// uses a wire type the schema does not allow, leaves a union unset, or
/// carries a value nested deeper than [`MAX_VALUE_DEPTH`].
pub fn decode(data: &[u8]) -> Result<Envelope> {
    let wire = WireEnvelope::decode(data).map_err(CodecError::from)?;
    Envelope::try_from(wire).map_err(Into::into)
}
