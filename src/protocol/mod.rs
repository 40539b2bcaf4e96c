//! The message fabric: framed JSON messages, multiplexed calls, connections.
//!
//! Wire protocol: newline-delimited JSON, one object per frame, UTF-8.
//!
//! Request frame:            `{"id": 2, "do": "register", ...params}\n`
//! Intermediate response:    `{"id": 2, ...payload}\n`
//! Terminal response (ok):   `{"id": 2, "finished": true, ...payload}\n`
//! Terminal response (fail): `{"id": 2, "finished": true, "failed": true, "error": ...}\n`

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;

mod call;
mod connection;
mod dispatch;
mod frame;
mod message;

pub use call::Call;
pub use connection::Connection;
pub use dispatch::{Dispatch, DispatchError, ErrorDetail, Unhandled};
pub use frame::{FrameReader, write_frame};
pub use message::Message;

/// Errors of the message fabric itself.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("call timed out")]
    Timeout,

    /// The peer answered with a terminal `failed: true` frame.
    #[error("remote call failed: {error}")]
    Remote { error: Value },

    #[error("another supervisor is already listening on {0}")]
    AlreadyRunning(PathBuf),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Parse(_) => "parse_error",
            ProtocolError::Io(_) => "io_error",
            ProtocolError::ConnectionClosed => "connection_closed",
            ProtocolError::Timeout => "timeout",
            ProtocolError::Remote { .. } => "remote_error",
            ProtocolError::AlreadyRunning(_) => "already_running",
        }
    }

    /// Whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::ConnectionClosed | ProtocolError::Timeout
        )
    }
}

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
