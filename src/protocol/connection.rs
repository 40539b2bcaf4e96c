use std::collections::HashMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{Map, Value};

use super::frame::{FrameReader, write_frame};
use super::{Call, Dispatch, Message, ProtocolError, dispatch, lock};

/// Call-id parity. The two endpoints of a channel draw from disjoint id
/// sequences: the client counts 0, 2, 4, … and the server 1, 3, 5, …
const CLIENT_FIRST_ID: u64 = 0;
const SERVER_FIRST_ID: u64 = 1;

/// A single bidirectional stream plus its call table.
///
/// The same type runs on both ends of the channel; either side may originate
/// calls and either side may be the dispatch target, simultaneously.
pub struct Connection {
    weak_self: Weak<Connection>,
    stream: UnixStream,
    writer: Mutex<Option<UnixStream>>,
    calls: Mutex<HashMap<u64, Arc<Call>>>,
    state: Mutex<Map<String, Value>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    /// Client end: call ids 0, 2, 4, …
    pub fn client(stream: UnixStream) -> Result<Arc<Self>, ProtocolError> {
        Self::new(stream, CLIENT_FIRST_ID)
    }

    /// Server end: call ids 1, 3, 5, …
    pub fn server(stream: UnixStream) -> Result<Arc<Self>, ProtocolError> {
        Self::new(stream, SERVER_FIRST_ID)
    }

    fn new(stream: UnixStream, first_id: u64) -> Result<Arc<Self>, ProtocolError> {
        let writer = stream.try_clone()?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            stream,
            writer: Mutex::new(Some(writer)),
            calls: Mutex::new(HashMap::new()),
            state: Mutex::new(Map::new()),
            next_id: AtomicU64::new(first_id),
            closed: AtomicBool::new(false),
        }))
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Merge fields into this connection's state map.
    pub fn merge_state(&self, fields: &Map<String, Value>) {
        lock(&self.state).extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    pub fn state_get(&self, key: &str) -> Option<Value> {
        lock(&self.state).get(key).cloned()
    }

    pub fn state_set(&self, key: &str, value: impl Into<Value>) {
        lock(&self.state).insert(key.to_string(), value.into());
    }

    pub fn state_snapshot(&self) -> Map<String, Value> {
        lock(&self.state).clone()
    }

    pub fn process_id(&self) -> Option<i32> {
        self.state_get("process_id")
            .as_ref()
            .and_then(Value::as_i64)
            .and_then(|pid| i32::try_from(pid).ok())
    }

    pub fn connection_id(&self) -> Option<String> {
        match self.state_get("connection_id") {
            Some(Value::String(id)) => Some(id),
            _ => None,
        }
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Write one frame. Frame-atomic: concurrent writers interleave frames,
    /// never bytes.
    pub fn write(&self, message: &Message) -> Result<(), ProtocolError> {
        let mut guard = lock(&self.writer);
        match guard.as_mut() {
            Some(writer) => write_frame(writer, message),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    // =========================================================================
    // Originating calls
    // =========================================================================

    fn next_call_id(&self) -> u64 {
        self.next_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Allocate an id, register the call, write the request frame. The call
    /// is deregistered again if the write fails, so it cannot leak.
    fn issue(&self, mut message: Message) -> Result<Arc<Call>, ProtocolError> {
        let id = self.next_call_id();
        message.set("id", id);
        let call = Call::new(id, message.clone(), self.weak_self.clone());
        lock(&self.calls).insert(id, Arc::clone(&call));

        if let Err(e) = self.write(&message) {
            self.remove_call(id);
            call.close();
            return Err(e);
        }
        Ok(call)
    }

    /// Issue a request and wait for its terminal response. Intermediate
    /// responses are discarded; use [`call_stream`](Self::call_stream) to
    /// observe them. `timeout` bounds the wait for each successive response.
    ///
    /// A `failed: true` terminal surfaces as [`ProtocolError::Remote`]; a
    /// connection close before the terminal as `ConnectionClosed`; a timeout
    /// removes the call so a late reply is ignored by the router.
    pub fn call(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, ProtocolError> {
        let call = self.issue(message)?;
        let result = loop {
            match call.pop(timeout) {
                Ok(Some(response)) => {
                    if response.is_finished() {
                        if response.is_failed() {
                            let error = response.error().cloned().unwrap_or(Value::Null);
                            break Err(ProtocolError::Remote { error });
                        }
                        break Ok(response);
                    }
                }
                Ok(None) => break Err(ProtocolError::ConnectionClosed),
                Err(e) => break Err(e),
            }
        };
        self.remove_call(call.id());
        call.close();
        result
    }

    /// Issue a request and deliver every response frame, terminal included,
    /// to `handler`. Returns once the terminal arrives or the queue closes.
    pub fn call_stream(
        &self,
        message: Message,
        timeout: Option<Duration>,
        mut handler: impl FnMut(Message),
    ) -> Result<(), ProtocolError> {
        let call = self.issue(message)?;
        let result = loop {
            match call.pop(timeout) {
                Ok(Some(response)) => {
                    let finished = response.is_finished();
                    handler(response);
                    if finished {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.remove_call(call.id());
        call.close();
        result
    }

    pub(crate) fn remove_call(&self, id: u64) {
        lock(&self.calls).remove(&id);
    }

    pub fn live_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Read frames until EOF or stream failure, routing each one.
    ///
    /// - known call id: push onto that call's queue (response path); a
    ///   `finished: true` frame also closes and deregisters the call
    /// - fresh id with `do`: register a new call and dispatch it to `target`
    ///   on its own thread, with a second thread draining its queue to the
    ///   wire
    /// - missing id: peer protocol violation, logged at error level, dropped
    /// - unknown id without `do`: a late reply for a call the caller already
    ///   timed out and deleted. Ignored at debug level; never answered.
    pub fn run(&self, target: &Arc<dyn Dispatch>) -> Result<(), ProtocolError> {
        let this = self
            .weak_self
            .upgrade()
            .ok_or(ProtocolError::ConnectionClosed)?;
        let mut reader = FrameReader::new(self.stream.try_clone()?);
        loop {
            let Some(mut message) = reader.read()? else {
                return Ok(());
            };

            let Some(id) = message.take_id() else {
                tracing::error!("dropping frame without id");
                continue;
            };

            let known = lock(&self.calls).get(&id).cloned();
            if let Some(call) = known {
                let finished = message.is_finished();
                call.push(message);
                if finished {
                    call.close();
                    self.remove_call(id);
                }
            } else if message.operation().is_some() {
                let call = Call::new(id, message, self.weak_self.clone());
                lock(&self.calls).insert(id, Arc::clone(&call));

                let drain_connection = Arc::clone(&this);
                let drain_call = Arc::clone(&call);
                std::thread::spawn(move || drain_connection.drain_responses(drain_call));

                let dispatch_connection = Arc::clone(&this);
                let dispatch_target = Arc::clone(target);
                std::thread::spawn(move || {
                    dispatch::run(dispatch_target, dispatch_connection, call)
                });
            } else {
                tracing::debug!(call_id = id, "ignoring response for unknown call");
            }
        }
    }

    /// Write a dispatched call's responses as they are pushed, reattaching
    /// the call id. Write failures mean the peer is gone and are swallowed.
    fn drain_responses(&self, call: Arc<Call>) {
        while let Ok(Some(mut response)) = call.pop(None) {
            response.set("id", call.id());
            if self.write(&response).is_err() {
                break;
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Idempotent. Unblocks the reader, closes the stream, closes every live
    /// call's queue without framing a terminal, and clears the call table.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        lock(&self.writer).take();

        let calls: Vec<Arc<Call>> = lock(&self.calls).drain().map(|(_, call)| call).collect();
        for call in calls {
            call.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        (
            Connection::client(a).expect("client connection"),
            Connection::server(b).expect("server connection"),
        )
    }

    #[test]
    fn id_parity_is_disjoint() {
        let (client, server) = pair();
        let client_ids: Vec<u64> = (0..3).map(|_| client.next_call_id()).collect();
        let server_ids: Vec<u64> = (0..3).map(|_| server.next_call_id()).collect();
        assert_eq!(client_ids, vec![0, 2, 4]);
        assert_eq!(server_ids, vec![1, 3, 5]);
    }

    #[test]
    fn write_after_close_fails() {
        let (client, _server) = pair();
        client.close();
        let err = client.write(&Message::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[test]
    fn close_is_idempotent_and_closes_live_calls() {
        let (client, _server) = pair();
        let call = client.issue(Message::request("noop")).expect("issue");
        assert_eq!(client.live_calls(), 1);

        client.close();
        client.close();
        assert_eq!(client.live_calls(), 0);
        assert!(call.is_closed());
        assert_eq!(call.pop(None).unwrap(), None);
    }

    #[test]
    fn issue_failure_does_not_leak_the_call() {
        let (client, server) = pair();
        drop(server);
        client.close();
        assert!(client.issue(Message::request("noop")).is_err());
        assert_eq!(client.live_calls(), 0);
    }

    #[test]
    fn state_merge_and_accessors() {
        let (client, _server) = pair();
        let mut fields = Map::new();
        fields.insert("process_id".into(), 4242.into());
        client.merge_state(&fields);
        client.state_set("connection_id", "abc");

        assert_eq!(client.process_id(), Some(4242));
        assert_eq!(client.connection_id(), Some("abc".into()));
        assert_eq!(client.state_snapshot().len(), 2);
    }
}
