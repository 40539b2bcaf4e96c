#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod endpoint;
mod error;
pub mod monitor;
pub mod protocol;
pub mod server;
pub mod worker;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the fabric types at crate root for convenience
pub use crate::client::Client;
pub use crate::endpoint::{Endpoint, EndpointMeta, PROTOCOL_VERSION};
pub use crate::monitor::{Cluster, MemoryMonitor, Monitor, MonitorError};
pub use crate::protocol::{
    Call, Connection, Dispatch, DispatchError, ErrorDetail, Message, ProtocolError, Unhandled,
};
pub use crate::server::Server;
pub use crate::worker::Worker;
