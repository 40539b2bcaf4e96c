use std::backtrace::Backtrace;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Call, Connection, Message, ProtocolError};

/// A dispatch target routes an inbound call to a handler by its operation
/// name. Both ends of a channel can be targets; the mapping from name to
/// handler is an explicit `match`, never built from strings at runtime.
///
/// Contract for implementors: a handler may `push` intermediates and
/// `finish`/`fail` the call itself, or simply return. If it returns `Ok`
/// without closing the call, a synthetic `finished: true` terminal is
/// written exactly once. A returned error becomes a `fail` response carrying
/// an [`ErrorDetail`]. Either way the call is removed from the connection's
/// table on handler exit.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        connection: &Arc<Connection>,
        call: &Arc<Call>,
    ) -> Result<(), DispatchError>;
}

/// A target with no operations. Every inbound call fails with
/// `UnknownOperation`; useful for one-shot control clients.
pub struct Unhandled;

impl Dispatch for Unhandled {
    fn dispatch(&self, _: &Arc<Connection>, call: &Arc<Call>) -> Result<(), DispatchError> {
        let operation = call.message().operation().unwrap_or_default();
        Err(DispatchError::UnknownOperation(operation.to_string()))
    }
}

/// Failure of one dispatched handler. Converted into the terminal `fail`
/// frame of the call that triggered it; never tears down the connection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Internal(String),
}

impl DispatchError {
    pub fn class(&self) -> &'static str {
        match self {
            DispatchError::UnknownOperation(_) => "UnknownOperation",
            DispatchError::InvalidRequest(_) => "InvalidRequest",
            DispatchError::Io(_) => "IoError",
            DispatchError::Protocol(_) => "ProtocolError",
            DispatchError::Internal(_) => "InternalError",
        }
    }
}

/// Error payload of a `fail` response: `{class, message, backtrace}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub class: String,
    pub message: String,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

impl ErrorDetail {
    pub fn new(class: &str, message: String) -> Self {
        let backtrace = Backtrace::force_capture()
            .to_string()
            .lines()
            .map(str::to_string)
            .collect();
        Self {
            class: class.to_string(),
            message,
            backtrace,
        }
    }

    fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::String(self.message.clone()))
    }
}

impl From<&DispatchError> for ErrorDetail {
    fn from(error: &DispatchError) -> Self {
        ErrorDetail::new(error.class(), error.to_string())
    }
}

/// Run one dispatched call to completion on the current thread.
pub(crate) fn run(target: Arc<dyn Dispatch>, connection: Arc<Connection>, call: Arc<Call>) {
    let operation = call.message().operation().unwrap_or_default().to_string();

    let outcome = catch_unwind(AssertUnwindSafe(|| target.dispatch(&connection, &call)));
    match outcome {
        Ok(Ok(())) => {
            if !call.is_closed() {
                call.finish(Message::new());
            }
        }
        Ok(Err(error)) => {
            tracing::error!(%operation, call_id = call.id(), "handler failed: {error}");
            call.fail(Message::new().with("error", ErrorDetail::from(&error).to_value()));
        }
        Err(_) => {
            tracing::error!(%operation, call_id = call.id(), "handler panicked");
            let detail = ErrorDetail::new("InternalError", format!("handler for '{operation}' panicked"));
            call.fail(Message::new().with("error", detail.to_value()));
        }
    }

    connection.remove_call(call.id());
}
