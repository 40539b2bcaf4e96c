//! Pluggable fleet observers.
//!
//! A monitor receives register/remove events from the [`Server`], may push
//! its own frames into `status` calls, and runs a periodic loop on its own
//! thread. A faulty monitor is logged and contained; it can neither abort a
//! registration nor poison the other monitors.
//!
//! [`Server`]: crate::server::Server

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::MemoryConfig;
use crate::diagnostics;
use crate::protocol::{Call, Connection, Message, ProtocolError, lock};

pub trait Monitor: Send + Sync + 'static {
    /// A worker completed `register`. Its state already carries
    /// `connection_id` and whatever the worker announced.
    fn register(&self, _connection: &Arc<Connection>) -> Result<(), MonitorError> {
        Ok(())
    }

    /// A registered worker's connection went away.
    fn remove(&self, _connection: &Arc<Connection>) -> Result<(), MonitorError> {
        Ok(())
    }

    /// A `status` call is being assembled; push intermediates onto `call`.
    fn status(&self, _call: &Arc<Call>) -> Result<(), MonitorError> {
        Ok(())
    }

    /// Periodic loop, run on a dedicated thread until `shutdown` is set.
    fn run(&self, _shutdown: Arc<AtomicBool>) {}
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MonitorError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl MonitorError {
    pub fn failed(message: impl Into<String>) -> Self {
        MonitorError::Failed(message.into())
    }
}

// =============================================================================
// Cluster - external per-process memory tracker
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    pub limit_bytes: Option<u64>,
}

/// Boundary to the per-process memory tracker. The monitor serializes every
/// access under its own mutex, so implementations need no locking.
pub trait Cluster: Send + 'static {
    fn add(&mut self, pid: i32, options: &ClusterOptions);
    fn remove(&mut self, pid: i32);
    /// Invoke `offender` for each process found over its limit. A `true`
    /// return confirms the offender was dealt with and may be forgotten.
    fn check(&mut self, offender: &mut dyn FnMut(i32) -> bool);
    fn snapshot(&self) -> Value;
}

/// Default tracker: resident set size from the proc filesystem against a
/// per-process limit.
pub struct ProcessMemoryCluster {
    default_limit_bytes: Option<u64>,
    processes: HashMap<i32, ProcessRecord>,
}

#[derive(Debug, Default)]
struct ProcessRecord {
    limit_bytes: Option<u64>,
    last_rss_bytes: Option<u64>,
}

impl ProcessMemoryCluster {
    pub fn new(default_limit_bytes: Option<u64>) -> Self {
        Self {
            default_limit_bytes,
            processes: HashMap::new(),
        }
    }
}

impl Cluster for ProcessMemoryCluster {
    fn add(&mut self, pid: i32, options: &ClusterOptions) {
        self.processes.insert(
            pid,
            ProcessRecord {
                limit_bytes: options.limit_bytes.or(self.default_limit_bytes),
                last_rss_bytes: None,
            },
        );
    }

    fn remove(&mut self, pid: i32) {
        self.processes.remove(&pid);
    }

    fn check(&mut self, offender: &mut dyn FnMut(i32) -> bool) {
        let mut confirmed = Vec::new();
        for (&pid, record) in self.processes.iter_mut() {
            let rss = match diagnostics::rss_bytes(Some(pid)) {
                Ok(rss) => rss,
                Err(e) => {
                    // Process likely exited; its connection teardown will
                    // remove it.
                    tracing::debug!(pid, "memory probe failed: {e}");
                    continue;
                }
            };
            record.last_rss_bytes = Some(rss);
            if let Some(limit) = record.limit_bytes
                && rss > limit
                && offender(pid)
            {
                confirmed.push(pid);
            }
        }
        for pid in confirmed {
            self.processes.remove(&pid);
        }
    }

    fn snapshot(&self) -> Value {
        let entries: serde_json::Map<String, Value> = self
            .processes
            .iter()
            .map(|(pid, record)| {
                (
                    pid.to_string(),
                    json!({
                        "rss_bytes": record.last_rss_bytes,
                        "limit_bytes": record.limit_bytes,
                    }),
                )
            })
            .collect();
        Value::Object(entries)
    }
}

// =============================================================================
// MemoryMonitor
// =============================================================================

#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub duration: Duration,
    pub timeout: Option<Duration>,
}

/// Watches registered workers' memory and interrupts offenders.
///
/// A process may be reached through several connections at once (restart
/// overlap), so connections are held in an identity set per pid. One mutex
/// serializes `register`, `remove` and the periodic check; that ordering is
/// what keeps the cluster and the connection sets consistent.
pub struct MemoryMonitor {
    interval: Duration,
    sample: Option<SampleOptions>,
    inner: Mutex<Inner>,
}

struct Inner {
    cluster: Box<dyn Cluster>,
    // pid -> connections keyed by pointer identity, not structural equality
    processes: HashMap<i32, HashMap<usize, Arc<Connection>>>,
}

impl MemoryMonitor {
    pub fn new(interval: Duration, cluster: Box<dyn Cluster>, sample: Option<SampleOptions>) -> Self {
        Self {
            interval,
            sample,
            inner: Mutex::new(Inner {
                cluster,
                processes: HashMap::new(),
            }),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        let sample = config.sample.as_ref().map(|s| SampleOptions {
            duration: Duration::from_secs_f64(s.duration_secs),
            timeout: s.timeout_secs.map(Duration::from_secs),
        });
        Self::new(
            Duration::from_secs(config.interval_secs),
            Box::new(ProcessMemoryCluster::new(config.limit_bytes)),
            sample,
        )
    }

    /// Number of pids currently tracked.
    pub fn tracked_processes(&self) -> usize {
        lock(&self.inner).processes.len()
    }

    fn check_once(&self) {
        let mut guard = lock(&self.inner);
        let Inner { cluster, processes } = &mut *guard;
        cluster.check(&mut |pid| {
            if let Some(connections) = processes.get(&pid) {
                for connection in connections.values() {
                    if let Some(sample) = &self.sample {
                        probe_memory(pid, connection, sample);
                    }
                }
            }
            interrupt(pid)
        });
    }
}

/// Ask the offending worker for a memory sample and log the report.
fn probe_memory(pid: i32, connection: &Arc<Connection>, sample: &SampleOptions) {
    let request =
        Message::request("memory_sample").with("duration", sample.duration.as_secs_f64());
    match connection.call(request, sample.timeout) {
        Ok(report) => {
            let report = serde_json::to_string(&report).unwrap_or_default();
            tracing::info!(pid, %report, "memory sample of offending process");
        }
        Err(e) => tracing::warn!(pid, "memory sample failed: {e}"),
    }
}

fn interrupt(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), Signal::SIGINT) {
        Ok(()) => {
            tracing::warn!(pid, "memory limit exceeded, interrupting process");
            true
        }
        Err(nix::errno::Errno::ESRCH) => true,
        Err(e) => {
            tracing::error!(pid, "failed to interrupt process: {e}");
            false
        }
    }
}

impl Monitor for MemoryMonitor {
    fn register(&self, connection: &Arc<Connection>) -> Result<(), MonitorError> {
        // A connection that never announced a process id is fine; there is
        // just nothing to track.
        let Some(pid) = connection.process_id() else {
            return Ok(());
        };
        let options = ClusterOptions {
            limit_bytes: connection
                .state_get("memory_limit")
                .as_ref()
                .and_then(Value::as_u64),
        };

        let mut guard = lock(&self.inner);
        let Inner { cluster, processes } = &mut *guard;
        let connections = processes.entry(pid).or_default();
        let was_empty = connections.is_empty();
        connections.insert(Arc::as_ptr(connection) as usize, Arc::clone(connection));
        if was_empty {
            cluster.add(pid, &options);
        }
        Ok(())
    }

    fn remove(&self, connection: &Arc<Connection>) -> Result<(), MonitorError> {
        let Some(pid) = connection.process_id() else {
            return Ok(());
        };

        let mut guard = lock(&self.inner);
        let Inner { cluster, processes } = &mut *guard;
        if let Some(connections) = processes.get_mut(&pid) {
            connections.remove(&(Arc::as_ptr(connection) as usize));
            if connections.is_empty() {
                processes.remove(&pid);
                cluster.remove(pid);
            }
        }
        Ok(())
    }

    fn status(&self, call: &Arc<Call>) -> Result<(), MonitorError> {
        let snapshot = lock(&self.inner).cluster.snapshot();
        call.push(Message::new().with("memory_monitor", snapshot));
        Ok(())
    }

    fn run(&self, shutdown: Arc<AtomicBool>) {
        loop {
            sleep_interruptibly(self.interval, &shutdown);
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            self.check_once();
        }
    }
}

/// Sleep in slices so shutdown is observed within ~100 ms.
fn sleep_interruptibly(duration: Duration, shutdown: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(100);
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(SLICE.min(deadline.saturating_duration_since(Instant::now())));
    }
}
