//! RPC between clusters, workers, operators and the dispatcher.
//!
//! HTTP POST with JSON bodies. `transport` owns retry classification,
//! `wire` the paths and request bodies, `client` the reqwest side.

pub mod client;
pub mod transport;
pub mod wire;

pub use client::HttpDispatcherClient;
pub use transport::{CallFailure, CallPolicy, RpcError, call_with_retry};
