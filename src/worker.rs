//! A supervised worker: keeps itself registered with the supervisor and
//! hosts the diagnostic operations the supervisor (or a peer, via `forward`)
//! may invoke on it.

use std::fs;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::client::{Client, ConnectedHook};
use crate::diagnostics::{self, MemoryProfile};
use crate::endpoint::Endpoint;
use crate::protocol::{Call, Connection, Dispatch, DispatchError, Message, ProtocolError, lock};

pub struct Worker {
    client: Client,
    state: Map<String, Value>,
    profile: Mutex<Option<MemoryProfile>>,
}

impl Worker {
    /// A worker announcing this process. `state` starts with `process_id`;
    /// add more with [`with_state`](Self::with_state).
    pub fn new(endpoint: Endpoint) -> Self {
        let mut state = Map::new();
        state.insert("process_id".into(), std::process::id().into());
        Self {
            client: Client::new(endpoint),
            state,
            profile: Mutex::new(None),
        }
    }

    pub fn with_state(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.state.insert(key.to_string(), value.into());
        self
    }

    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.client.connection()
    }

    pub fn stop(&self) {
        self.client.stop();
    }

    /// Run the reconnect loop on the current thread until [`stop`](Self::stop).
    /// Registration happens on every reconnect; the supervisor assigns a fresh
    /// connection-id each time.
    pub fn run(self: Arc<Self>) {
        let target: Arc<dyn Dispatch> = Arc::clone(&self) as Arc<dyn Dispatch>;
        let worker = Arc::clone(&self);
        let connected: ConnectedHook = Arc::new(move |connection| worker.announce(connection));
        self.client.run(&target, &connected);
    }

    /// Run the reconnect loop on a background thread.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }

    /// `register` with our state. The response carries the connection-id,
    /// which the worker deliberately ignores; the supervisor's registry is
    /// the authority.
    fn announce(&self, connection: &Arc<Connection>) {
        let request =
            Message::request("register").with("state", Value::Object(self.state.clone()));
        match connection.call(request, None) {
            Ok(_) => tracing::debug!("registered with supervisor"),
            Err(e) => tracing::debug!("registration did not complete: {e}"),
        }
    }

    // =========================================================================
    // Diagnostic handlers
    // =========================================================================

    fn scheduler_dump(&self, call: &Arc<Call>) -> Result<(), DispatchError> {
        let mut report = String::new();
        report.push_str(&format!("endpoint={}\n", self.client.endpoint().path().display()));
        match self.connection() {
            Some(connection) => {
                report.push_str(&format!("connected=true live_calls={}\n", connection.live_calls()));
                let state = serde_json::to_string(&connection.state_snapshot())
                    .unwrap_or_else(|_| "{}".into());
                report.push_str(&format!("state={state}\n"));
            }
            None => report.push_str("connected=false\n"),
        }
        report.push_str(&diagnostics::thread_dump()?);
        respond_with_text(call, report)
    }

    fn memory_dump(&self, call: &Arc<Call>) -> Result<(), DispatchError> {
        // The smaps dump can run to many megabytes; never buffer it.
        let Some(path) = call.message().str_field("path") else {
            return Err(DispatchError::InvalidRequest(
                "'path' is required; memory dumps are not buffered".into(),
            ));
        };
        diagnostics::write_memory_dump(path.as_ref())?;
        call.finish(Message::new().with("path", path));
        Ok(())
    }

    fn memory_sample(&self, call: &Arc<Call>) -> Result<(), DispatchError> {
        let duration = call.message().f64_field("duration").unwrap_or(0.0);
        if duration <= 0.0 {
            return Err(DispatchError::InvalidRequest(
                "'duration' must be positive".into(),
            ));
        }
        let report = diagnostics::sample_memory(Duration::from_secs_f64(duration))?;
        let report = serde_json::to_value(&report).map_err(ProtocolError::from)?;
        respond_with_report(call, report)
    }

    fn thread_dump(&self, call: &Arc<Call>) -> Result<(), DispatchError> {
        respond_with_text(call, diagnostics::thread_dump()?)
    }

    fn garbage_profile_start(&self, call: &Arc<Call>) -> Result<(), DispatchError> {
        let mut profile = lock(&self.profile);
        if profile.is_some() {
            return Err(DispatchError::InvalidRequest(
                "memory profile already running".into(),
            ));
        }
        *profile = Some(MemoryProfile::begin()?);
        call.finish(Message::new().with("started", true));
        Ok(())
    }

    fn garbage_profile_stop(&self, call: &Arc<Call>) -> Result<(), DispatchError> {
        let Some(profile) = lock(&self.profile).take() else {
            return Err(DispatchError::InvalidRequest(
                "no memory profile running".into(),
            ));
        };
        let report = profile.finish()?;
        let report = serde_json::to_value(&report).map_err(ProtocolError::from)?;
        respond_with_report(call, report)
    }
}

impl Dispatch for Worker {
    fn dispatch(&self, _connection: &Arc<Connection>, call: &Arc<Call>) -> Result<(), DispatchError> {
        match call.message().operation() {
            Some("scheduler_dump") => self.scheduler_dump(call),
            Some("memory_dump") => self.memory_dump(call),
            Some("memory_sample") => self.memory_sample(call),
            Some("thread_dump") => self.thread_dump(call),
            Some("garbage_profile_start") => self.garbage_profile_start(call),
            Some("garbage_profile_stop") => self.garbage_profile_stop(call),
            Some(operation) => Err(DispatchError::UnknownOperation(operation.to_string())),
            None => Err(DispatchError::InvalidRequest("missing 'do' field".into())),
        }
    }
}

/// The common dump convention: `path` writes a file and finishes with
/// `{path}`; `log` emits the buffer to the log and finishes empty; neither
/// returns the buffer in the terminal as `{data}`.
fn respond_with_text(call: &Arc<Call>, contents: String) -> Result<(), DispatchError> {
    let message = call.message();
    if let Some(path) = message.str_field("path") {
        fs::write(path, &contents)?;
        call.finish(Message::new().with("path", path));
    } else if let Some(label) = message.str_field("log") {
        tracing::info!(label, "{contents}");
        call.finish(Message::new());
    } else {
        call.finish(Message::new().with("data", contents));
    }
    Ok(())
}

/// Same convention for structured reports; the file form is pretty-printed.
fn respond_with_report(call: &Arc<Call>, report: Value) -> Result<(), DispatchError> {
    let message = call.message();
    if let Some(path) = message.str_field("path") {
        let mut contents = serde_json::to_vec_pretty(&report).map_err(ProtocolError::from)?;
        contents.push(b'\n');
        fs::write(path, contents)?;
        call.finish(Message::new().with("path", path));
    } else if let Some(label) = message.str_field("log") {
        let rendered = serde_json::to_string(&report).unwrap_or_default();
        tracing::info!(label, "{rendered}");
        call.finish(Message::new());
    } else {
        call.finish(Message::new().with("data", report));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Weak;

    use tempfile::TempDir;

    fn worker() -> Arc<Worker> {
        Arc::new(Worker::new(Endpoint::unix("/nonexistent/supervisor.ipc")))
    }

    fn dummy_connection() -> Arc<Connection> {
        let (a, _b) = std::os::unix::net::UnixStream::pair().expect("socketpair");
        Connection::client(a).expect("connection")
    }

    fn inbound_call(message: Message) -> Arc<Call> {
        Call::new(1, message, Weak::new())
    }

    #[test]
    fn state_includes_process_id() {
        let worker = worker();
        assert_eq!(
            worker.state().get("process_id").and_then(Value::as_u64),
            Some(std::process::id() as u64)
        );
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let worker = worker();
        let call = inbound_call(Message::request("bogus"));
        let err = worker.dispatch(&dummy_connection(), &call).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownOperation(_)));
    }

    #[test]
    fn memory_dump_refuses_buffered_mode() {
        let worker = worker();
        let call = inbound_call(Message::request("memory_dump"));
        let err = worker.dispatch(&dummy_connection(), &call).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[test]
    fn memory_dump_writes_to_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.dump");
        let worker = worker();
        let call = inbound_call(
            Message::request("memory_dump").with("path", path.display().to_string()),
        );

        worker.dispatch(&dummy_connection(), &call).unwrap();
        let terminal = call.pop(None).unwrap().unwrap();
        assert!(terminal.is_finished());
        assert!(terminal.str_field("path").is_some());
        assert!(path.exists());
    }

    #[test]
    fn memory_sample_requires_positive_duration() {
        let worker = worker();
        for message in [
            Message::request("memory_sample"),
            Message::request("memory_sample").with("duration", 0.0),
            Message::request("memory_sample").with("duration", -1.0),
        ] {
            let call = inbound_call(message);
            let err = worker.dispatch(&dummy_connection(), &call).unwrap_err();
            assert!(matches!(err, DispatchError::InvalidRequest(_)));
        }
    }

    #[test]
    fn memory_sample_returns_structured_data() {
        let worker = worker();
        let call = inbound_call(Message::request("memory_sample").with("duration", 0.05));

        worker.dispatch(&dummy_connection(), &call).unwrap();
        let terminal = call.pop(None).unwrap().unwrap();
        assert!(terminal.is_finished());
        let data = terminal.get("data").expect("data");
        assert!(data.get("rss_start_bytes").unwrap().as_u64().unwrap() > 0);
    }

    #[test]
    fn scheduler_dump_reports_runtime_state() {
        let worker = worker();
        let call = inbound_call(Message::request("scheduler_dump"));

        worker.dispatch(&dummy_connection(), &call).unwrap();
        let terminal = call.pop(None).unwrap().unwrap();
        let data = terminal.str_field("data").expect("data");
        assert!(data.contains("endpoint="));
        assert!(data.contains("connected=false"));
        assert!(data.contains("tid="));
    }

    #[test]
    fn thread_dump_buffers_by_default() {
        let worker = worker();
        let call = inbound_call(Message::request("thread_dump"));

        worker.dispatch(&dummy_connection(), &call).unwrap();
        let terminal = call.pop(None).unwrap().unwrap();
        assert!(terminal.str_field("data").is_some_and(|d| d.contains("tid=")));
    }

    #[test]
    fn garbage_profile_brackets() {
        let worker = worker();
        let connection = dummy_connection();

        let start = inbound_call(Message::request("garbage_profile_start"));
        worker.dispatch(&connection, &start).unwrap();
        let started = start.pop(None).unwrap().unwrap();
        assert_eq!(started.get("started"), Some(&true.into()));

        // A second start while one is running is an error.
        let again = inbound_call(Message::request("garbage_profile_start"));
        assert!(worker.dispatch(&connection, &again).is_err());

        let stop = inbound_call(Message::request("garbage_profile_stop"));
        worker.dispatch(&connection, &stop).unwrap();
        let terminal = stop.pop(None).unwrap().unwrap();
        assert!(terminal.get("data").is_some());

        // And stopping again without a running profile is too.
        let stop_again = inbound_call(Message::request("garbage_profile_stop"));
        assert!(worker.dispatch(&connection, &stop_again).is_err());
    }
}
