//! End-to-end coverage of the supervision fabric over real Unix sockets:
//! registration, stale-response hardening, malformed-frame recovery, monitor
//! delegation, forwarding, timeouts and worker reconnects.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;

use warden::protocol::{
    Call, Connection, Dispatch, DispatchError, Message, ProtocolError, Unhandled,
};
use warden::{Client, Endpoint, Monitor, MonitorError, Server, Worker};

// =============================================================================
// Fixture
// =============================================================================

struct SupervisorFixture {
    _dir: TempDir,
    server: Arc<Server>,
    handle: JoinHandle<()>,
}

impl SupervisorFixture {
    fn start() -> Self {
        Self::start_with(Vec::new())
    }

    fn start_with(monitors: Vec<Arc<dyn Monitor>>) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut server = Server::new(Endpoint::unix(dir.path().join("supervisor.ipc")));
        for monitor in monitors {
            server = server.with_monitor(monitor);
        }
        let server = Arc::new(server);

        let run_server = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            if let Err(e) = run_server.run() {
                panic!("server failed: {e}");
            }
        });

        let fixture = Self {
            _dir: dir,
            server,
            handle,
        };
        wait_for(Duration::from_secs(5), || {
            fixture.server.endpoint().connect().is_ok()
        });
        fixture
    }

    /// A raw byte-level client, for driving the wire format directly.
    fn raw_stream(&self) -> UnixStream {
        self.server.endpoint().connect().expect("connect")
    }

    /// A full protocol client with a background reader.
    fn control_connection(&self) -> Arc<Connection> {
        let client = Client::new(self.server.endpoint().clone());
        let target: Arc<dyn Dispatch> = Arc::new(Unhandled);
        client.connect_background(&target).expect("connect")
    }

    fn stop(self) {
        self.server.stop();
        self.handle.join().expect("server thread");
    }
}

fn wait_for(timeout: Duration, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within {timeout:?}");
}

fn send_line(stream: &mut UnixStream, line: &str) {
    stream.write_all(line.as_bytes()).expect("write");
    stream.write_all(b"\n").expect("write newline");
    stream.flush().expect("flush");
}

fn read_frame(reader: &mut BufReader<UnixStream>) -> Value {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).expect("read frame");
    assert!(bytes > 0, "unexpected EOF");
    serde_json::from_str(&line).expect("parse frame")
}

// =============================================================================
// Wire-level scenarios
// =============================================================================

#[test]
fn happy_register() {
    let fixture = SupervisorFixture::start();
    let mut stream = fixture.raw_stream();
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));

    send_line(
        &mut stream,
        r#"{"id":1,"do":"register","state":{"process_id":4242}}"#,
    );
    let response = read_frame(&mut reader);
    assert_eq!(response["id"], json!(1));
    assert_eq!(response["finished"], json!(true));
    assert!(response["connection_id"].is_string());

    let ids = fixture.server.connection_ids();
    assert_eq!(ids.len(), 1);
    let connection = fixture.server.connection(&ids[0]).expect("registered");
    assert_eq!(connection.process_id(), Some(4242));
    assert_eq!(connection.connection_id(), Some(ids[0].clone()));

    fixture.stop();
}

#[test]
fn stale_terminal_is_silently_ignored() {
    let fixture = SupervisorFixture::start();
    let mut stream = fixture.raw_stream();
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));

    // No call with id 5 exists; this must produce no reply and no error.
    send_line(&mut stream, r#"{"id":5,"finished":true}"#);
    send_line(
        &mut stream,
        r#"{"id":7,"do":"register","state":{"process_id":1}}"#,
    );

    let response = read_frame(&mut reader);
    assert_eq!(response["id"], json!(7));
    assert_eq!(response["finished"], json!(true));

    // The connection stays quiet afterwards: nothing ever references id 5.
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .expect("set timeout");
    let mut line = String::new();
    assert!(
        reader.read_line(&mut line).is_err(),
        "unexpected frame: {line}"
    );

    fixture.stop();
}

#[test]
fn malformed_frame_is_discarded_and_reading_continues() {
    let fixture = SupervisorFixture::start();
    let mut stream = fixture.raw_stream();
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));

    send_line(&mut stream, "not valid json");
    send_line(
        &mut stream,
        r#"{"id":1,"do":"register","state":{"process_id":1}}"#,
    );

    let response = read_frame(&mut reader);
    assert_eq!(response["id"], json!(1));
    assert_eq!(response["finished"], json!(true));

    fixture.stop();
}

#[test]
fn frame_without_id_is_dropped_but_connection_survives() {
    let fixture = SupervisorFixture::start();
    let mut stream = fixture.raw_stream();
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));

    send_line(&mut stream, r#"{"do":"register"}"#);
    send_line(&mut stream, r#"{"id":3,"do":"status"}"#);

    let response = read_frame(&mut reader);
    assert_eq!(response["id"], json!(3));
    assert_eq!(response["finished"], json!(true));

    fixture.stop();
}

#[test]
fn unknown_operation_fails_with_error_detail() {
    let fixture = SupervisorFixture::start();
    let mut stream = fixture.raw_stream();
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));

    send_line(&mut stream, r#"{"id":1,"do":"bogus"}"#);
    let response = read_frame(&mut reader);
    assert_eq!(response["id"], json!(1));
    assert_eq!(response["finished"], json!(true));
    assert_eq!(response["failed"], json!(true));
    assert_eq!(response["error"]["class"], json!("UnknownOperation"));
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("bogus"));
    assert!(response["error"]["backtrace"].is_array());

    fixture.stop();
}

// =============================================================================
// Monitor delegation
// =============================================================================

struct FailingStatusMonitor;

impl Monitor for FailingStatusMonitor {
    fn status(&self, _call: &Arc<Call>) -> Result<(), MonitorError> {
        Err(MonitorError::failed("Monitor failed to get status!"))
    }
}

#[test]
fn monitor_status_error_fails_the_call_but_not_the_connection() {
    let fixture =
        SupervisorFixture::start_with(vec![Arc::new(FailingStatusMonitor) as Arc<dyn Monitor>]);
    let connection = fixture.control_connection();

    let err = connection
        .call(Message::request("status"), Some(Duration::from_secs(5)))
        .expect_err("status must fail");
    let ProtocolError::Remote { error } = err else {
        panic!("expected remote failure, got {err}");
    };
    assert_eq!(error["message"], json!("Monitor failed to get status!"));
    assert_eq!(error["class"], json!("InternalError"));
    assert!(error["backtrace"].is_array());

    // The connection survives the failed call.
    let response = connection
        .call(
            Message::request("register").with("state", json!({"process_id": 9})),
            Some(Duration::from_secs(5)),
        )
        .expect("register after failed status");
    assert!(response.is_finished());

    fixture.stop();
}

struct RegisterCountingMonitor {
    registered: std::sync::atomic::AtomicUsize,
}

impl Monitor for RegisterCountingMonitor {
    fn register(&self, _connection: &Arc<Connection>) -> Result<(), MonitorError> {
        self.registered
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenRegisterMonitor;

impl Monitor for BrokenRegisterMonitor {
    fn register(&self, _connection: &Arc<Connection>) -> Result<(), MonitorError> {
        Err(MonitorError::failed("register exploded"))
    }
}

#[test]
fn faulty_monitor_cannot_abort_registration_or_poison_others() {
    let counting = Arc::new(RegisterCountingMonitor {
        registered: std::sync::atomic::AtomicUsize::new(0),
    });
    let fixture = SupervisorFixture::start_with(vec![
        Arc::new(BrokenRegisterMonitor) as Arc<dyn Monitor>,
        Arc::clone(&counting) as Arc<dyn Monitor>,
    ]);
    let connection = fixture.control_connection();

    let response = connection
        .call(
            Message::request("register").with("state", json!({"process_id": 11})),
            Some(Duration::from_secs(5)),
        )
        .expect("register succeeds despite broken monitor");
    assert!(response.is_finished());
    assert_eq!(
        counting
            .registered
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    fixture.stop();
}

// =============================================================================
// Forwarding
// =============================================================================

#[test]
fn forward_to_nonexistent_target_fails() {
    let fixture = SupervisorFixture::start();
    let connection = fixture.control_connection();

    let err = connection
        .call(
            Message::request("forward")
                .with("operation", json!({"do": "memory_sample", "duration": 1}))
                .with("connection_id", "no-such"),
            Some(Duration::from_secs(5)),
        )
        .expect_err("forward must fail");
    let ProtocolError::Remote { error } = err else {
        panic!("expected remote failure, got {err}");
    };
    assert_eq!(error, json!("Connection not found"));

    fixture.stop();
}

/// A worker target that streams several intermediates before finishing.
struct StreamingWorker;

impl Dispatch for StreamingWorker {
    fn dispatch(
        &self,
        _connection: &Arc<Connection>,
        call: &Arc<Call>,
    ) -> Result<(), DispatchError> {
        match call.message().operation() {
            Some("memory_sample") => {
                for n in 0..3u64 {
                    call.push(Message::new().with("n", n));
                }
                call.finish(Message::new().with("done", true));
                Ok(())
            }
            Some(operation) => Err(DispatchError::UnknownOperation(operation.to_string())),
            None => Err(DispatchError::InvalidRequest("missing 'do' field".into())),
        }
    }
}

#[test]
fn forward_streams_responses_in_order() {
    let fixture = SupervisorFixture::start();

    // Attach the streaming worker and register it.
    let worker_client = Client::new(fixture.server.endpoint().clone());
    let worker_target: Arc<dyn Dispatch> = Arc::new(StreamingWorker);
    let worker_connection = worker_client
        .connect_background(&worker_target)
        .expect("worker connect");
    let registered = worker_connection
        .call(
            Message::request("register").with("state", json!({"process_id": 4242})),
            Some(Duration::from_secs(5)),
        )
        .expect("register");
    let connection_id = registered.str_field("connection_id").expect("id").to_string();

    // Forward through the supervisor and collect every streamed frame.
    let control = fixture.control_connection();
    let mut frames = Vec::new();
    control
        .call_stream(
            Message::request("forward")
                .with("operation", json!({"do": "memory_sample"}))
                .with("connection_id", connection_id),
            Some(Duration::from_secs(5)),
            |frame| frames.push(frame),
        )
        .expect("forwarded call");

    assert_eq!(frames.len(), 4);
    for (index, frame) in frames[..3].iter().enumerate() {
        assert_eq!(frame.u64_field("n"), Some(index as u64));
        assert!(!frame.is_finished());
    }
    assert!(frames[3].is_finished());
    assert_eq!(frames[3].get("done"), Some(&true.into()));
    assert!(!frames[3].is_failed());

    fixture.stop();
}

#[test]
fn forward_reaches_a_real_worker() {
    let fixture = SupervisorFixture::start();

    let worker = Arc::new(Worker::new(fixture.server.endpoint().clone()));
    let _worker_thread = Arc::clone(&worker).spawn();
    wait_for(Duration::from_secs(5), || {
        fixture.server.connection_ids().len() == 1
    });
    let connection_id = fixture.server.connection_ids().remove(0);

    let control = fixture.control_connection();
    let response = control
        .call(
            Message::request("forward")
                .with("operation", json!({"do": "memory_sample", "duration": 0.05}))
                .with("connection_id", connection_id),
            Some(Duration::from_secs(10)),
        )
        .expect("forwarded diagnostic");
    assert!(response.is_finished());
    let data = response.get("data").expect("report");
    assert!(data["rss_start_bytes"].as_u64().unwrap() > 0);

    worker.stop();
    fixture.stop();
}

// =============================================================================
// Status
// =============================================================================

#[test]
fn status_enumerates_registered_connections() {
    let fixture = SupervisorFixture::start();
    let connection = fixture.control_connection();

    connection
        .call(
            Message::request("register").with("state", json!({"process_id": 77})),
            Some(Duration::from_secs(5)),
        )
        .expect("register");

    let response = connection
        .call(Message::request("status"), Some(Duration::from_secs(5)))
        .expect("status");
    let listed = response.get("connections").unwrap().as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["process_id"], json!(77));
    assert!(listed[0]["connection_id"].is_string());
    assert_eq!(listed[0]["state"]["process_id"], json!(77));

    fixture.stop();
}

// =============================================================================
// Timeouts and late replies (pair harness, no listener needed)
// =============================================================================

struct SlowTarget;

impl Dispatch for SlowTarget {
    fn dispatch(
        &self,
        _connection: &Arc<Connection>,
        call: &Arc<Call>,
    ) -> Result<(), DispatchError> {
        match call.message().operation() {
            Some("hang") => {
                std::thread::sleep(Duration::from_millis(500));
                call.finish(Message::new().with("late", true));
                Ok(())
            }
            // Returns without closing; the dispatcher writes the terminal.
            Some("noop") => Ok(()),
            Some(operation) => Err(DispatchError::UnknownOperation(operation.to_string())),
            None => Err(DispatchError::InvalidRequest("missing 'do' field".into())),
        }
    }
}

fn pair_harness(target: Arc<dyn Dispatch>) -> (Arc<Connection>, Arc<Connection>) {
    let (client_stream, server_stream) = UnixStream::pair().expect("socketpair");
    let client = Connection::client(client_stream).expect("client connection");
    let server = Connection::server(server_stream).expect("server connection");

    let reader = Arc::clone(&server);
    std::thread::spawn(move || {
        let _ = reader.run(&target);
        reader.close();
    });
    let client_reader = Arc::clone(&client);
    let client_target: Arc<dyn Dispatch> = Arc::new(Unhandled);
    std::thread::spawn(move || {
        let _ = client_reader.run(&client_target);
        client_reader.close();
    });

    (client, server)
}

#[test]
fn timed_out_call_is_removed_and_late_reply_ignored() {
    let (client, _server) = pair_harness(Arc::new(SlowTarget));

    let err = client
        .call(Message::request("hang"), Some(Duration::from_millis(100)))
        .expect_err("must time out");
    assert!(matches!(err, ProtocolError::Timeout));
    assert_eq!(client.live_calls(), 0);

    // The late terminal for the abandoned call arrives mid-flight here and
    // must not disturb the next exchange.
    let response = client
        .call(Message::request("noop"), Some(Duration::from_secs(2)))
        .expect("follow-up call");
    assert!(response.is_finished());

    std::thread::sleep(Duration::from_millis(500));
    let response = client
        .call(Message::request("noop"), Some(Duration::from_secs(2)))
        .expect("call after late reply drained");
    assert!(response.is_finished());
}

#[test]
fn handler_return_without_close_writes_exactly_one_terminal() {
    let (client_stream, server_stream) = UnixStream::pair().expect("socketpair");
    let server = Connection::server(server_stream).expect("server connection");
    let target: Arc<dyn Dispatch> = Arc::new(SlowTarget);
    let reader = Arc::clone(&server);
    std::thread::spawn(move || {
        let _ = reader.run(&target);
    });

    let mut stream = client_stream;
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    send_line(&mut stream, r#"{"id":0,"do":"noop"}"#);

    let response = read_frame(&mut reader);
    assert_eq!(response["id"], json!(0));
    assert_eq!(response["finished"], json!(true));

    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .expect("set timeout");
    let mut line = String::new();
    assert!(
        reader.read_line(&mut line).is_err(),
        "second terminal frame: {line}"
    );
}

#[test]
fn concurrent_calls_each_get_their_own_terminal() {
    let (client, _server) = pair_harness(Arc::new(StreamingWorker));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let connection = Arc::clone(&client);
        handles.push(std::thread::spawn(move || {
            let mut frames = Vec::new();
            connection
                .call_stream(
                    Message::request("memory_sample"),
                    Some(Duration::from_secs(5)),
                    |frame| frames.push(frame),
                )
                .expect("stream");
            frames
        }));
    }

    for handle in handles {
        let frames = handle.join().expect("caller thread");
        assert_eq!(frames.len(), 4);
        let terminals = frames.iter().filter(|f| f.is_finished()).count();
        assert_eq!(terminals, 1);
        assert!(frames[3].is_finished());
    }
}

// =============================================================================
// Reconnects
// =============================================================================

#[test]
fn worker_re_registers_after_disconnect() {
    let fixture = SupervisorFixture::start();

    let worker = Arc::new(Worker::new(fixture.server.endpoint().clone()));
    let _worker_thread = Arc::clone(&worker).spawn();
    wait_for(Duration::from_secs(5), || {
        fixture.server.connection_ids().len() == 1
    });
    let first_id = fixture.server.connection_ids().remove(0);

    // Sever the worker's connection from the supervisor side; the worker's
    // reconnect loop must come back with a fresh registration.
    fixture
        .server
        .connection(&first_id)
        .expect("registered connection")
        .close();

    wait_for(Duration::from_secs(10), || {
        let ids = fixture.server.connection_ids();
        ids.len() == 1 && ids[0] != first_id
    });

    worker.stop();
    fixture.stop();
}

// =============================================================================
// Readiness
// =============================================================================

#[test]
fn supervisor_writes_and_removes_readiness_meta() {
    let fixture = SupervisorFixture::start();
    let endpoint = fixture.server.endpoint().clone();

    let meta = endpoint.read_meta().expect("meta while running");
    assert_eq!(meta.pid, std::process::id());
    assert!(meta.started_at_unix_ms > 0);

    fixture.stop();
    assert!(endpoint.read_meta().is_none());
    assert!(!endpoint.path().exists());
}
