//! pipefish is a pipelined client for RESP3 key/value and streaming
//! servers, covering standalone, sentinel-backed, and cluster deployments
//! behind one command surface.
//!
//! A handful of TCP connections carry all traffic: every endpoint gets one
//! shared wire that aggressively pipelines concurrent requests with FIFO
//! reply correlation, plus a small pool of dedicated wires for blocking
//! commands, transactions, and subscriptions. Server-assisted client-side
//! caching (RESP3 tracking) is built in: `do_cache` answers repeated reads
//! locally until the server pushes an invalidation for the key.

mod cache;
mod client;
mod cluster;
mod command;
mod error;
mod metrics;
mod pipeline;
mod pool;
mod sentinel;
mod wire;

pub mod config;
pub mod protocol;
pub mod utils;

pub use client::{CacheReply, Client, DedicatedClient};
pub use command::{Command, CommandBuilder, SubscriptionKind};
pub use config::{ClientOption, SentinelOption};
pub use error::{Error, Result};
pub use pipeline::PubSubMessage;
pub use protocol::{encode_command, RespCodec, RespValue};
