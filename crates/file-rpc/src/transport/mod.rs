//! Transport layer for the RPC transport.
//!
//! This module handles the connection lifecycle, correlation of calls to
//! their answers, and the client façade built on both.

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod sequence;

pub use client::{ClientBuilder, ClientConfig, RpcClient};
pub use connection::{Connection, ConnectionConfig, ConnectionState, Endpoint};
pub use dispatcher::{
    Dispatched, Dispatcher, DispatcherConfig, PendingCall, Subscription, UnsolicitedErrorPolicy,
};
pub use sequence::{MAX_SEQUENCE_ID, SequenceCounter};
