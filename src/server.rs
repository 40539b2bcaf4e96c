//! The supervisor side: accepts worker connections, tracks registrations,
//! forwards operations between peers, and delegates lifecycle events to
//! monitors.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::getpgrp;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::monitor::Monitor;
use crate::protocol::{Call, Connection, Dispatch, DispatchError, Message, ProtocolError, lock};

/// How long the reply to `restart` gets to reach the wire before the
/// process group is signalled.
const RESTART_FLUSH_GRACE: Duration = Duration::from_millis(50);

pub struct Server {
    endpoint: Endpoint,
    monitors: Vec<Arc<dyn Monitor>>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            monitors: Vec::new(),
            connections: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Ask the accept loop to wind down. Observed within ~100 ms.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn connection_ids(&self) -> Vec<String> {
        lock(&self.connections).keys().cloned().collect()
    }

    pub fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        lock(&self.connections).get(connection_id).cloned()
    }

    /// Accept connections until stopped or signalled.
    ///
    /// Each accepted peer gets a server-parity [`Connection`] and a dedicated
    /// reader thread with this server as the dispatch target. Monitors run on
    /// independent threads; a failing monitor cannot block or kill the accept
    /// loop.
    pub fn run(self: Arc<Self>) -> Result<(), ProtocolError> {
        let listener = self.endpoint.bind()?;

        let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, self.shutdown.clone());
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, self.shutdown.clone());

        for monitor in &self.monitors {
            let monitor = Arc::clone(monitor);
            let shutdown = Arc::clone(&self.shutdown);
            std::thread::spawn(move || {
                if catch_unwind(AssertUnwindSafe(|| monitor.run(shutdown))).is_err() {
                    tracing::error!("monitor loop panicked");
                }
            });
        }

        listener.set_nonblocking(true)?;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested");
                break;
            }

            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    let server = Arc::clone(&self);
                    std::thread::spawn(move || server.handle_connection(stream));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    tracing::error!("accept error: {e}");
                }
            }
        }

        let connections: Vec<Arc<Connection>> =
            lock(&self.connections).drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close();
        }
        self.endpoint.cleanup();
        tracing::info!("supervisor stopped");
        Ok(())
    }

    fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let connection = match Connection::server(stream) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!("failed to set up connection: {e}");
                return;
            }
        };

        let target: Arc<dyn Dispatch> = Arc::clone(&self) as Arc<dyn Dispatch>;
        if let Err(e) = connection.run(&target) {
            tracing::warn!("connection failed: {e}");
        }
        connection.close();
        self.remove(&connection);
    }

    /// Deregister a disconnected peer and tell every monitor, each under its
    /// own catch.
    fn remove(&self, connection: &Arc<Connection>) {
        if let Some(connection_id) = connection.connection_id() {
            let mut connections = lock(&self.connections);
            if connections
                .get(&connection_id)
                .is_some_and(|held| Arc::ptr_eq(held, connection))
            {
                connections.remove(&connection_id);
                tracing::info!(%connection_id, "worker disconnected");
            }
        }

        for monitor in &self.monitors {
            if let Err(e) = monitor.remove(connection) {
                tracing::error!("monitor remove failed: {e}");
            }
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    fn handle_register(
        &self,
        connection: &Arc<Connection>,
        call: &Arc<Call>,
    ) -> Result<(), DispatchError> {
        if let Some(Value::Object(state)) = call.message().get("state") {
            connection.merge_state(state);
        }

        let connection_id = Uuid::new_v4().to_string();
        {
            let mut connections = lock(&self.connections);
            // A re-register on the same connection supersedes its old id.
            if let Some(previous) = connection.connection_id()
                && connections
                    .get(&previous)
                    .is_some_and(|held| Arc::ptr_eq(held, connection))
            {
                connections.remove(&previous);
            }
            connection.state_set("connection_id", connection_id.as_str());
            connections.insert(connection_id.clone(), Arc::clone(connection));
        }
        tracing::info!(
            %connection_id,
            process_id = connection.process_id(),
            "worker registered"
        );

        for monitor in &self.monitors {
            if let Err(e) = monitor.register(connection) {
                tracing::error!("monitor register failed: {e}");
            }
        }

        call.finish(Message::new().with("connection_id", connection_id));
        Ok(())
    }

    fn handle_forward(
        &self,
        _connection: &Arc<Connection>,
        call: &Arc<Call>,
    ) -> Result<(), DispatchError> {
        let message = call.message();
        let Some(connection_id) = message.str_field("connection_id") else {
            call.fail(Message::new().with("error", "Missing 'connection_id' parameter"));
            return Ok(());
        };
        let Some(Value::Object(operation)) = message.get("operation") else {
            call.fail(Message::new().with("error", "Missing 'operation' parameter"));
            return Ok(());
        };
        let Some(target) = self.connection(connection_id) else {
            call.fail(
                Message::new()
                    .with("error", "Connection not found")
                    .with("connection_id", connection_id),
            );
            return Ok(());
        };

        call.forward(&target, Message::from_fields(operation.clone()));
        Ok(())
    }

    fn handle_status(
        &self,
        _connection: &Arc<Connection>,
        call: &Arc<Call>,
    ) -> Result<(), DispatchError> {
        let connections: Vec<Value> = lock(&self.connections)
            .iter()
            .map(|(connection_id, connection)| {
                json!({
                    "connection_id": connection_id,
                    "process_id": connection.process_id(),
                    "state": Value::Object(connection.state_snapshot()),
                })
            })
            .collect();

        for monitor in &self.monitors {
            monitor
                .status(call)
                .map_err(|e| DispatchError::Internal(e.to_string()))?;
        }

        call.finish(Message::new().with("connections", connections));
        Ok(())
    }

    fn handle_restart(
        &self,
        _connection: &Arc<Connection>,
        call: &Arc<Call>,
    ) -> Result<(), DispatchError> {
        let signal = match call.message().str_field("signal") {
            None => Signal::SIGINT,
            Some(name) => parse_signal(name)
                .ok_or_else(|| DispatchError::InvalidRequest(format!("unknown signal '{name}'")))?,
        };

        // The reply must complete before the process group goes down; the
        // controller above us respawns the whole group.
        call.finish(Message::new());
        std::thread::sleep(RESTART_FLUSH_GRACE);

        let pgrp = getpgrp();
        tracing::info!(
            signal = signal.as_str(),
            pgrp = pgrp.as_raw(),
            "restart requested, signalling process group"
        );
        if let Err(e) = killpg(pgrp, signal) {
            tracing::error!("failed to signal process group: {e}");
        }
        Ok(())
    }
}

impl Dispatch for Server {
    fn dispatch(
        &self,
        connection: &Arc<Connection>,
        call: &Arc<Call>,
    ) -> Result<(), DispatchError> {
        match call.message().operation() {
            Some("register") => self.handle_register(connection, call),
            Some("forward") => self.handle_forward(connection, call),
            Some("status") => self.handle_status(connection, call),
            Some("restart") => self.handle_restart(connection, call),
            Some(operation) => Err(DispatchError::UnknownOperation(operation.to_string())),
            None => Err(DispatchError::InvalidRequest("missing 'do' field".into())),
        }
    }
}

/// Accept signal names with or without the `SIG` prefix, any case.
fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).ok()
}
