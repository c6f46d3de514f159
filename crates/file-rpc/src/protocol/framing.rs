//! Message framing for the wire protocol.
//!
//! Each frame is `[u32 big-endian payload length][protobuf envelope]`.

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{Envelope, codec};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Maximum frame payload (16 MiB by default).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Codec for encoding/decoding length-prefixed envelopes.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// The largest payload this codec accepts.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least header size
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek the length without consuming
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let payload_len = header.get_u32() as usize;

        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            }
            .into());
        }

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();
        trace!("decoded frame of {} bytes", payload_len);

        codec::decode(&payload).map(Some)
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, envelope: Envelope, buf: &mut BytesMut) -> Result<()> {
        codec::check_depth(&envelope)?;
        let payload_len = codec::encoded_len(&envelope);

        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            }
            .into());
        }

        buf.reserve(FRAME_HEADER_SIZE + payload_len);

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload_len as u32);
        codec::encode_into(&envelope, buf)?;

        Ok(())
    }
}

/// Turns an unbounded sequence of byte chunks into envelopes.
///
/// Chunk boundaries are irrelevant: feeding a stream in arbitrary pieces
/// emits the same envelopes, in the same order, as feeding it whole. A frame
/// that fails to decode poisons the reader; everything after it is
/// untrustworthy.
#[derive(Debug, Default)]
pub struct FrameReader {
    codec: FrameCodec,
    buffer: BytesMut,
    poisoned: bool,
}

impl FrameReader {
    /// Create a reader with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_codec(FrameCodec::new())
    }

    /// Create a reader around a configured codec.
    #[must_use]
    pub fn with_codec(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: BytesMut::new(),
            poisoned: false,
        }
    }

    /// Append `bytes` and hand every complete envelope to `emit`, in order.
    ///
    /// Returns how many envelopes were emitted. Envelopes that precede a bad
    /// frame in the same chunk are still emitted before the error returns.
    ///
    /// # Errors
    ///
    /// Returns the decode error for the first malformed or oversized frame,
    /// and [`ProtocolError::ReaderPoisoned`] for every call after that.
    pub fn feed(&mut self, bytes: &[u8], mut emit: impl FnMut(Envelope)) -> Result<usize> {
        if self.poisoned {
            return Err(ProtocolError::ReaderPoisoned.into());
        }

        self.buffer.extend_from_slice(bytes);

        let mut emitted = 0;
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(envelope)) => {
                    emit(envelope);
                    emitted += 1;
                }
                Ok(None) => return Ok(emitted),
                Err(e) => {
                    self.poisoned = true;
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Bytes buffered towards the next, still incomplete, frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True once a fatal decode error was reported.
    #[must_use]
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Check that the stream ended on a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TruncatedStream`] if part of a frame is
    /// still buffered.
    pub fn finish(&self) -> Result<()> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedStream {
                buffered: self.buffer.len(),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;
    use proptest::prelude::*;

    fn frame(envelope: Envelope) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(envelope, &mut buf).unwrap();
        buf
    }

    fn sample_stream() -> (Vec<Envelope>, Vec<u8>) {
        let envelopes = vec![
            Envelope::request(1, "file", "readFile", vec![Value::from("/a.txt")]),
            Envelope::response(2, "file", 1, Value::from(b"contents".to_vec())),
            Envelope::event(3, "file", "fileChange", vec![Value::from("/b.txt"), Value::Int(2)]),
            Envelope::error(4, "file", 7, 404, "not found", None),
            Envelope::response(5, "file", 8, Value::Array(vec![])),
        ];
        let mut bytes = Vec::new();
        for envelope in &envelopes {
            bytes.extend_from_slice(&frame(envelope.clone()));
        }
        (envelopes, bytes)
    }

    fn feed_all(reader: &mut FrameReader, bytes: &[u8]) -> Vec<Envelope> {
        let mut out = Vec::new();
        reader.feed(bytes, |e| out.push(e)).unwrap();
        out
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let envelope = Envelope::request(42, "file", "stat", vec![Value::from("/")]);
        let mut buf = frame(envelope.clone());

        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(payload_len, buf.len() - FRAME_HEADER_SIZE);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        // Header only, payload missing
        buf.put_u32(100);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut codec = FrameCodec::new().with_max_frame_size(8);
        let mut buf = BytesMut::new();
        buf.put_u32(32);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::FrameTooLarge { size: 32, max: 8 })
        ));

        let big = Envelope::request(1, "file", "writeFile", vec![Value::from(vec![0u8; 64])]);
        assert!(codec.encode(big, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_too_deep_envelope_writes_nothing() {
        let deep = (0..crate::protocol::MAX_VALUE_DEPTH)
            .fold(Value::Bool(true), |inner, _| Value::Array(vec![inner]));
        let mut buf = BytesMut::new();

        let err = FrameCodec::new()
            .encode(Envelope::response(1, "file", 1, deep), &mut buf)
            .unwrap_err();
        assert!(err.to_string().contains("nests deeper"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_frame_is_malformed() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(codec.decode(&mut buf).unwrap_err().is_malformed());
    }

    #[test]
    fn test_reader_byte_at_a_time() {
        let (envelopes, bytes) = sample_stream();
        let mut reader = FrameReader::new();
        let mut out = Vec::new();
        for byte in &bytes {
            reader.feed(std::slice::from_ref(byte), |e| out.push(e)).unwrap();
        }
        assert_eq!(out, envelopes);
        assert_eq!(reader.buffered(), 0);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_reader_reports_truncated_tail() {
        let (envelopes, bytes) = sample_stream();
        let mut reader = FrameReader::new();
        let out = feed_all(&mut reader, &bytes[..bytes.len() - 3]);
        assert_eq!(out, envelopes[..envelopes.len() - 1]);
        assert!(reader.buffered() > 0);
        assert!(matches!(
            reader.finish(),
            Err(Error::Protocol(ProtocolError::TruncatedStream { .. }))
        ));
    }

    #[test]
    fn test_reader_emits_good_frames_before_bad_one() {
        let (envelopes, mut bytes) = sample_stream();
        bytes.extend_from_slice(&[0, 0, 0, 3, 0xFF, 0xFF, 0xFF]);
        bytes.extend_from_slice(&frame(envelopes[0].clone()));

        let mut reader = FrameReader::new();
        let mut out = Vec::new();
        let err = reader.feed(&bytes, |e| out.push(e)).unwrap_err();

        assert!(err.is_malformed());
        assert_eq!(out, envelopes);
        assert!(reader.is_poisoned());
        assert!(matches!(
            reader.feed(&frame(envelopes[0].clone()), |_| {}),
            Err(Error::Protocol(ProtocolError::ReaderPoisoned))
        ));
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_output(cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..16)) {
            let (envelopes, bytes) = sample_stream();

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut reader = FrameReader::new();
            let mut out = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(bytes.len())) {
                reader.feed(&bytes[start..point], |e| out.push(e)).unwrap();
                start = point;
            }

            prop_assert_eq!(out, envelopes);
            prop_assert_eq!(reader.buffered(), 0);
        }
    }
}
