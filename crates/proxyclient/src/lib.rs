//! NFSv4.1 proxy client
//!
//! Multiplexes COMPOUND calls from many tasks over one TCP connection to a
//! backend NFSv4.1 server, and keeps a client id and session alive on that
//! server across reconnects.
//!
//! The pieces:
//! - [`pool`]: fixed set of call contexts, one per session slot
//! - [`framer`]: record marking, RPC call encoding, reply decoding
//! - [`connection`]: connection manager and reply dispatcher
//! - [`client`]: the call executor and the public [`ProxyClient`]
//! - [`session`]: EXCHANGE_ID / CREATE_SESSION / lease renewal task

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod framer;
pub mod pool;
pub mod session;

pub use client::{boot_time, process_credentials, ProxyClient};
pub use config::{ProxyClientConfig, RemoteServerOptions};
pub use connection::{Connection, Connector, LinkState, TcpConnector};
pub use error::{ProxyError, Result};
pub use pool::{CallContext, CallPool, PooledContext};
pub use session::{SessionManager, SessionNeeds, SessionState, SessionStatus};
