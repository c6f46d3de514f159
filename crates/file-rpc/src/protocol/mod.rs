//! Protocol layer for the RPC transport.
//!
//! This module contains the wire-level definitions:
//! - The envelope schema and its untyped [`Value`] payloads
//! - The protobuf codec
//! - Length-prefixed framing and the incremental frame reader

pub mod codec;
pub mod framing;
pub mod message;
pub mod value;

mod wire;

pub use framing::{FRAME_HEADER_SIZE, FrameCodec, FrameReader, MAX_FRAME_SIZE};
pub use message::{Body, Envelope, ErrorReport, Event, Request, Response};
pub use value::{MAX_VALUE_DEPTH, Value};
