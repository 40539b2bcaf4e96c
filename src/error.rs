use thiserror::Error;

use crate::config::ConfigError;
use crate::monitor::MonitorError;
use crate::protocol::ProtocolError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the capability errors defined
/// next to the code they describe.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Protocol(e) => e.code(),
            Error::Config(e) => e.code(),
            Error::Monitor(_) => "monitor_error",
        }
    }
}
