//! Socket binding and readiness.
//!
//! An endpoint is an address that can `bind` (to accept workers) or
//! `connect` (to dial the supervisor). The reference binding is a Unix-domain
//! socket; trust is filesystem permissions, nothing else.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Default socket path, relative to the service root.
pub const DEFAULT_SOCKET_PATH: &str = "./supervisor.ipc";

#[derive(Debug, Clone)]
pub struct Endpoint {
    path: PathBuf,
}

/// Readiness heartbeat written next to the socket while a supervisor is
/// bound; clients use it to see who is listening without connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointMeta {
    pub version: String,
    pub protocol_version: u32,
    pub pid: u32,
    pub started_at_unix_ms: u64,
}

impl Endpoint {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn meta_path(&self) -> PathBuf {
        self.path.with_extension("meta.json")
    }

    /// Bind the listener.
    ///
    /// An existing socket file is probed first: if something answers, another
    /// supervisor owns the address and binding fails; a dead socket file is
    /// removed. The bound socket and the meta file are both mode 0600.
    pub fn bind(&self) -> Result<UnixListener, ProtocolError> {
        if self.path.exists() {
            if UnixStream::connect(&self.path).is_ok() {
                return Err(ProtocolError::AlreadyRunning(self.path.clone()));
            }
            tracing::info!("removing stale socket {:?}", self.path);
            let _ = fs::remove_file(&self.path);
        }

        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }

        let listener = UnixListener::bind(&self.path)?;
        let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));

        self.write_meta();
        tracing::info!("listening on {:?}", self.path);
        Ok(listener)
    }

    pub fn connect(&self) -> Result<UnixStream, ProtocolError> {
        Ok(UnixStream::connect(&self.path)?)
    }

    fn write_meta(&self) {
        let started_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let meta = EndpointMeta {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            pid: std::process::id(),
            started_at_unix_ms,
        };
        let path = self.meta_path();
        match serde_json::to_vec(&meta) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes) {
                    tracing::warn!("failed to write {:?}: {e}", path);
                } else {
                    let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
                }
            }
            Err(e) => tracing::warn!("failed to encode endpoint meta: {e}"),
        }
    }

    /// Read the readiness meta file, if a supervisor left one.
    pub fn read_meta(&self) -> Option<EndpointMeta> {
        let contents = fs::read_to_string(self.meta_path()).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Remove the socket and meta files. Errors are ignored; cleanup runs on
    /// paths the process may no longer own.
    pub fn cleanup(&self) {
        let _ = fs::remove_file(&self.path);
        let _ = fs::remove_file(self.meta_path());
    }
}
