//! Client transport for the remote file-access protocol.
//!
//! One long-lived stream socket carries length-prefixed protobuf envelopes
//! that multiplex requests, responses, server-pushed events and error
//! reports. This crate frames and decodes that stream, correlates every
//! response or error with the call that caused it, and fans events out to
//! subscribers.
//!
//! # Features
//!
//! - **Framing**: `[u32 big-endian length][envelope]`, robust to arbitrary
//!   read boundaries
//! - **Correlation**: concurrent calls resolve independently, in any order
//! - **Events**: named subscriptions delivered as a [`futures::Stream`]
//! - **Failure handling**: every call resolves exactly once, by answer,
//!   remote error, timeout or connection loss
//!
//! # Example
//!
//! ```no_run
//! use proven_file_rpc::{RpcClient, Value};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RpcClient::builder()
//!         .tcp("127.0.0.1", 7000)
//!         .connect()
//!         .await?;
//!
//!     let contents = client
//!         .call("file", "readFile", vec![Value::from("/a.txt")])
//!         .await?;
//!
//!     let mut changes = client.subscribe("fileChange");
//!     while let Some(Ok(args)) = changes.recv().await {
//!         println!("changed: {args:?}");
//!     }
//!
//!     println!("{contents:?}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::{
    CodecError, ConnectionError, Error, LossReason, ProtocolError, RemoteError, Result,
};
pub use protocol::{
    Body, Envelope, ErrorReport, Event, FrameCodec, FrameReader, MAX_VALUE_DEPTH, Request, Response,
    Value, codec,
};
pub use transport::{
    client::{ClientBuilder, ClientConfig, RpcClient},
    connection::{Connection, ConnectionConfig, ConnectionState, Endpoint},
    dispatcher::{
        Dispatched, Dispatcher, DispatcherConfig, PendingCall, Subscription,
        UnsolicitedErrorPolicy,
    },
    sequence::SequenceCounter,
};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
