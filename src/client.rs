//! The worker side of the channel: dialing, background reading, and the
//! reconnect loop that keeps a worker continuously attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::protocol::{Connection, Dispatch, ProtocolError, lock};

/// Invoked (on its own thread) each time a connection is established.
pub type ConnectedHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

pub struct Client {
    endpoint: Endpoint,
    connection: Mutex<Option<Arc<Connection>>>,
    stopped: Arc<AtomicBool>,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connection: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        lock(&self.connection).clone()
    }

    /// Dial the endpoint and set up a client-parity connection. The caller
    /// drives (or spawns) the reader.
    pub fn connect(&self) -> Result<Arc<Connection>, ProtocolError> {
        let stream = self.endpoint.connect()?;
        let connection = Connection::client(stream)?;
        *lock(&self.connection) = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Dial and run the reader on a background thread, dispatching inbound
    /// calls to `target`. For one-shot control clients; workers use the
    /// reconnect loop in [`run`](Self::run).
    pub fn connect_background(
        &self,
        target: &Arc<dyn Dispatch>,
    ) -> Result<Arc<Connection>, ProtocolError> {
        let connection = self.connect()?;
        let reader = Arc::clone(&connection);
        let target = Arc::clone(target);
        std::thread::spawn(move || {
            if let Err(e) = reader.run(&target) {
                tracing::warn!("connection failed: {e}");
            }
            reader.close();
        });
        Ok(connection)
    }

    /// Stop the reconnect loop and close the live connection.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(connection) = self.connection() {
            connection.close();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Keep this client attached to the supervisor until [`stop`](Self::stop).
    ///
    /// Each cycle dials the endpoint, fires `connected` on its own thread,
    /// and runs the reader to completion. Any failure is logged and followed
    /// by a random 0..1 s backoff before the next attempt, so a restarting
    /// supervisor is not stampeded.
    ///
    /// The loop is transient in the supervision sense: it does not keep the
    /// host process alive on its own, and it ignores the process's shutdown
    /// signal; only `stop` ends it.
    pub fn run(&self, target: &Arc<dyn Dispatch>, connected: &ConnectedHook) {
        loop {
            if self.is_stopped() {
                break;
            }

            match self.connect() {
                Ok(connection) => {
                    let hook = Arc::clone(connected);
                    let hook_connection = Arc::clone(&connection);
                    std::thread::spawn(move || hook(&hook_connection));

                    let result = connection.run(target);
                    connection.close();
                    lock(&self.connection).take();
                    match result {
                        Ok(()) => tracing::info!("disconnected from supervisor"),
                        Err(e) => tracing::warn!("connection failed: {e}"),
                    }
                }
                Err(e) => {
                    tracing::warn!("connect failed: {e}");
                }
            }

            if self.is_stopped() {
                break;
            }
            std::thread::sleep(Duration::from_secs_f64(rand::random::<f64>()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::Unhandled;

    #[test]
    fn connect_to_missing_socket_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = Client::new(Endpoint::unix(dir.path().join("absent.ipc")));
        assert!(client.connect().is_err());
        assert!(client.connection().is_none());
    }

    #[test]
    fn stopped_run_returns_immediately() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = Client::new(Endpoint::unix(dir.path().join("absent.ipc")));
        client.stop();

        let target: Arc<dyn Dispatch> = Arc::new(Unhandled);
        let hook: ConnectedHook = Arc::new(|_| {});
        client.run(&target, &hook);
        assert!(client.is_stopped());
    }
}
