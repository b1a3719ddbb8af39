/// Session status tokens and the JSON snapshot written on every update.
use crate::sampler::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Human-facing status token, updated on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    NotStarted,
    CredentialRequired,
    AuthenticationFailed,
    Sampling,
    Stopped,
    /// The loop gave up after too many failed cycles in a row.
    SamplingFailed,
}

/// Coarse lifecycle state derived from the status token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Sampling,
    Stopped,
    AuthFailed,
}

impl SessionStatus {
    pub fn state(self) -> SessionState {
        match self {
            SessionStatus::NotStarted | SessionStatus::CredentialRequired => SessionState::Idle,
            SessionStatus::AuthenticationFailed => SessionState::AuthFailed,
            SessionStatus::Sampling => SessionState::Sampling,
            SessionStatus::Stopped | SessionStatus::SamplingFailed => SessionState::Stopped,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SessionStatus::NotStarted => "not started",
            SessionStatus::CredentialRequired => "password required",
            SessionStatus::AuthenticationFailed => "wrong password or no privilege",
            SessionStatus::Sampling => "sampling",
            SessionStatus::Stopped => "stopped",
            SessionStatus::SamplingFailed => "sampling failed repeatedly, stopped",
        };
        f.write_str(text)
    }
}

/// The JSON payload of the status snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub status: SessionStatus,
    pub state: SessionState,
    pub output_file: String,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
    pub session_start: Option<DateTime<Utc>>,
    pub last_sample: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        write_atomic(&self.path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read a snapshot written by a running (or finished) probe.
pub fn read_status(path: &Path) -> Result<StatusData, StatusError> {
    let contents = std::fs::read_to_string(path).map_err(|e| StatusError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&contents).map_err(|e| StatusError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

#[derive(Debug)]
struct Counters {
    status: SessionStatus,
    cycles_ok: u64,
    cycles_failed: u64,
    consecutive_failures: u32,
    session_start: Option<DateTime<Utc>>,
    last_sample: Option<DateTime<Utc>>,
}

/// Shared status between the control task and the sampling worker.
///
/// Every change is mirrored to the snapshot file when one is configured.
/// Failing to write the snapshot is logged and otherwise ignored.
#[derive(Debug)]
pub struct StatusBoard {
    inner: Mutex<Counters>,
    file: Option<PathBuf>,
    output_file: String,
    pid: u32,
}

impl StatusBoard {
    pub fn new(output_file: &Path, status_file: Option<PathBuf>) -> Self {
        let board = Self {
            inner: Mutex::new(Counters {
                status: SessionStatus::NotStarted,
                cycles_ok: 0,
                cycles_failed: 0,
                consecutive_failures: 0,
                session_start: None,
                last_sample: None,
            }),
            file: status_file,
            output_file: output_file.display().to_string(),
            pid: std::process::id(),
        };
        board.publish(&board.lock());
        board
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    /// Move to `status`. Entering `Sampling` starts a fresh set of counters.
    pub fn set(&self, status: SessionStatus) {
        let mut guard = self.lock();
        if status == SessionStatus::Sampling {
            guard.cycles_ok = 0;
            guard.cycles_failed = 0;
            guard.consecutive_failures = 0;
            guard.session_start = Some(Utc::now());
        }
        let previous = guard.status;
        guard.status = status;
        tracing::info!(from = ?previous, to = ?status, "session status changed");
        self.publish(&guard);
    }

    pub fn record_success(&self) {
        let mut guard = self.lock();
        guard.cycles_ok += 1;
        guard.consecutive_failures = 0;
        guard.last_sample = Some(Utc::now());
        self.publish(&guard);
    }

    pub fn record_failure(&self, consecutive: u32) {
        let mut guard = self.lock();
        guard.cycles_failed += 1;
        guard.consecutive_failures = consecutive;
        self.publish(&guard);
    }

    pub fn snapshot(&self) -> StatusData {
        self.data(&self.lock())
    }

    /// Remove the snapshot file, if any.
    pub fn remove_file(&self) {
        if let Some(path) = &self.file {
            StatusFile::new(path.clone()).remove();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn data(&self, counters: &Counters) -> StatusData {
        StatusData {
            pid: self.pid,
            status: counters.status,
            state: counters.status.state(),
            output_file: self.output_file.clone(),
            cycles_ok: counters.cycles_ok,
            cycles_failed: counters.cycles_failed,
            consecutive_failures: counters.consecutive_failures,
            session_start: counters.session_start,
            last_sample: counters.last_sample,
            last_update: Utc::now(),
        }
    }

    fn publish(&self, counters: &Counters) {
        let Some(path) = &self.file else {
            return;
        };
        if let Err(e) = StatusFile::new(path.clone()).write(&self.data(counters)) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(f, "failed to write status file {}: {source}", path.display())
            }
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Parse { path, source } => {
                write!(f, "malformed status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Parse { source, .. } => Some(source),
        }
    }
}
