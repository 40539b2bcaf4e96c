//! Diagnostic payload producers.
//!
//! These are deliberately opaque to the fabric: each one produces bytes (or
//! a structured report) that a worker handler writes to a path or returns in
//! the terminal response. Everything here reads the proc filesystem of the
//! calling process.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Resident set size in bytes, from `/proc/<pid>/status`. `None` means the
/// calling process.
pub fn rss_bytes(pid: Option<i32>) -> io::Result<u64> {
    let path = match pid {
        Some(pid) => format!("/proc/{pid}/status"),
        None => "/proc/self/status".to_string(),
    };
    let contents = fs::read_to_string(path)?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("VmRSS: {e}")))?;
            return Ok(kb * 1024);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no VmRSS line in /proc status",
    ))
}

/// Stream `/proc/self/smaps` to `path`. The output can run to many
/// megabytes, which is why the memory dump operation refuses buffered mode.
pub fn write_memory_dump(path: &Path) -> io::Result<u64> {
    let mut source = fs::File::open("/proc/self/smaps")?;
    let mut sink = BufWriter::new(fs::File::create(path)?);
    let bytes = io::copy(&mut source, &mut sink)?;
    sink.flush()?;
    Ok(bytes)
}

/// One line per thread of the calling process: tid, name, kernel state.
pub fn thread_dump() -> io::Result<String> {
    let mut report = String::new();
    let mut entries: Vec<_> = fs::read_dir("/proc/self/task")?
        .flatten()
        .map(|entry| entry.path())
        .collect();
    entries.sort();

    for task in entries {
        let Some(tid) = task.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let name = fs::read_to_string(task.join("comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "?".to_string());
        let state = fs::read_to_string(task.join("status"))
            .ok()
            .and_then(|status| {
                status
                    .lines()
                    .find_map(|line| line.strip_prefix("State:").map(|s| s.trim().to_string()))
            })
            .unwrap_or_else(|| "?".to_string());
        report.push_str(&format!("tid={tid} name={name} state={state}\n"));
    }
    Ok(report)
}

/// Report of one memory sampling run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySampleReport {
    pub duration_secs: f64,
    pub samples: usize,
    pub rss_start_bytes: u64,
    pub rss_end_bytes: u64,
    pub rss_peak_bytes: u64,
    pub rss_delta_bytes: i64,
}

/// Sample the calling process's RSS for `duration`, roughly every 50 ms.
pub fn sample_memory(duration: Duration) -> io::Result<MemorySampleReport> {
    const STEP: Duration = Duration::from_millis(50);

    let rss_start_bytes = rss_bytes(None)?;
    let mut rss_end_bytes = rss_start_bytes;
    let mut rss_peak_bytes = rss_start_bytes;
    let mut samples = 1;

    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        std::thread::sleep(STEP.min(deadline.saturating_duration_since(Instant::now())));
        rss_end_bytes = rss_bytes(None)?;
        rss_peak_bytes = rss_peak_bytes.max(rss_end_bytes);
        samples += 1;
    }

    Ok(MemorySampleReport {
        duration_secs: duration.as_secs_f64(),
        samples,
        rss_start_bytes,
        rss_end_bytes,
        rss_peak_bytes,
        rss_delta_bytes: rss_end_bytes as i64 - rss_start_bytes as i64,
    })
}

/// An in-progress allocation-pressure profile: RSS and page-fault deltas
/// between `begin` and `finish`.
#[derive(Debug)]
pub struct MemoryProfile {
    started: Instant,
    rss_start_bytes: u64,
    minor_faults_start: u64,
    major_faults_start: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryProfileReport {
    pub elapsed_secs: f64,
    pub rss_start_bytes: u64,
    pub rss_end_bytes: u64,
    pub rss_delta_bytes: i64,
    pub minor_faults: u64,
    pub major_faults: u64,
}

impl MemoryProfile {
    pub fn begin() -> io::Result<Self> {
        let (minor_faults_start, major_faults_start) = page_faults()?;
        Ok(Self {
            started: Instant::now(),
            rss_start_bytes: rss_bytes(None)?,
            minor_faults_start,
            major_faults_start,
        })
    }

    pub fn finish(self) -> io::Result<MemoryProfileReport> {
        let rss_end_bytes = rss_bytes(None)?;
        let (minor_faults, major_faults) = page_faults()?;
        Ok(MemoryProfileReport {
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            rss_start_bytes: self.rss_start_bytes,
            rss_end_bytes,
            rss_delta_bytes: rss_end_bytes as i64 - self.rss_start_bytes as i64,
            minor_faults: minor_faults.saturating_sub(self.minor_faults_start),
            major_faults: major_faults.saturating_sub(self.major_faults_start),
        })
    }
}

/// (minflt, majflt) of the calling process from `/proc/self/stat`. The comm
/// field may contain spaces, so fields are counted from the closing paren.
fn page_faults() -> io::Result<(u64, u64)> {
    let contents = fs::read_to_string("/proc/self/stat")?;
    let after_comm = contents
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/self/stat"))?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let parse = |index: usize| -> io::Result<u64> {
        fields
            .get(index)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short /proc/self/stat"))
    };
    // After the comm field: state ppid pgrp session tty tpgid flags minflt cminflt majflt
    Ok((parse(7)?, parse(9)?))
}
