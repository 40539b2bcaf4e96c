use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use super::{Connection, Message, ProtocolError, lock};

/// One in-flight request/response exchange on one [`Connection`].
///
/// A call is live exactly while it appears in its connection's call table.
/// Its response queue is a channel whose sender end is dropped at most once:
/// for dispatched calls the handler pushes responses and a drain thread
/// writes them to the wire; for originated calls the reader thread pushes
/// incoming responses and the caller pops them.
pub struct Call {
    id: u64,
    message: Message,
    queue_tx: Mutex<Option<Sender<Message>>>,
    queue_rx: Receiver<Message>,
    connection: Weak<Connection>,
}

impl Call {
    pub(crate) fn new(id: u64, message: Message, connection: Weak<Connection>) -> Arc<Self> {
        let (queue_tx, queue_rx) = unbounded();
        Arc::new(Self {
            id,
            message,
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx,
            connection,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The originating request, read-only.
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    /// True once the queue has been closed by finish, fail or close.
    pub fn is_closed(&self) -> bool {
        lock(&self.queue_tx).is_none()
    }

    /// Enqueue a non-terminal response. A no-op once the call is closed.
    pub fn push(&self, response: Message) {
        if let Some(tx) = lock(&self.queue_tx).as_ref() {
            let _ = tx.send(response);
        }
    }

    /// Enqueue the terminal `finished: true` response and close the queue.
    /// A no-op if the call is already closed.
    pub fn finish(&self, mut response: Message) {
        if let Some(tx) = lock(&self.queue_tx).take() {
            response.set("finished", true);
            let _ = tx.send(response);
        }
    }

    /// Terminal failure: `finish` with `failed: true`.
    pub fn fail(&self, mut response: Message) {
        response.set("failed", true);
        self.finish(response);
    }

    /// Close the queue without framing a terminal response. Only used during
    /// connection teardown.
    pub fn close(&self) {
        lock(&self.queue_tx).take();
    }

    /// Next queued response. `Ok(None)` once the queue is closed and drained;
    /// `Err(Timeout)` if `timeout` elapses first.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Option<Message>, ProtocolError> {
        match timeout {
            None => Ok(self.queue_rx.recv().ok()),
            Some(timeout) => match self.queue_rx.recv_timeout(timeout) {
                Ok(message) => Ok(Some(message)),
                Err(RecvTimeoutError::Disconnected) => Ok(None),
                Err(RecvTimeoutError::Timeout) => Err(ProtocolError::Timeout),
            },
        }
    }

    /// Deliver every queued response to `handler` until the queue closes.
    pub fn each(
        &self,
        timeout: Option<Duration>,
        mut handler: impl FnMut(Message),
    ) -> Result<(), ProtocolError> {
        while let Some(response) = self.pop(timeout)? {
            handler(response);
        }
        Ok(())
    }

    /// Proxy this call to `target`: issue `operation` there and pipe every
    /// response it produces into this call's queue, in real time. The piped
    /// terminal frame terminates this call; if the target's stream dies
    /// first, this call fails so the caller never hangs on a silent close.
    pub fn forward(&self, target: &Arc<Connection>, operation: Message) {
        let mut saw_terminal = false;
        let result = target.call_stream(operation, None, |response| {
            if response.is_finished() {
                saw_terminal = true;
            }
            self.push(response);
        });

        if saw_terminal {
            self.close();
        } else {
            if let Err(e) = result {
                tracing::warn!(call_id = self.id, "forwarded call failed: {e}");
            }
            self.fail(Message::new().with("error", "Forwarded connection closed"));
        }
    }
}
