/// One sampling cycle: run `powermetrics` under the cached sudo grant,
/// capture stdout, and replace the output file with it.
use crate::elevation::Elevation;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Child;

/// File that always holds the latest reading.
pub const OUTPUT_FILE: &str = "/tmp/gpu_power.txt";

/// Pause between the end of one cycle and the start of the next.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

pub const SAMPLE_PROGRAM: &str = "powermetrics";

/// Exactly one sample of the GPU power category.
pub const SAMPLE_ARGS: &[&str] = &["--samplers", "gpu_power", "-n", "1"];

/// How long a timed-out command gets to exit after SIGTERM.
const TERM_GRACE: Duration = Duration::from_secs(1);

/// Result of a successful cycle.
#[derive(Debug)]
pub struct CycleReport {
    /// Bytes written to the output file.
    pub output_bytes: u64,
    /// Wall-clock duration of the invocation.
    pub duration: Duration,
}

/// Why a cycle did not yield a good reading.
#[derive(Debug)]
pub enum CycleError {
    /// The elevation program could not be started.
    Spawn { source: std::io::Error },
    /// The command exited unsuccessfully (None if killed by signal).
    Exited { code: Option<i32> },
    /// The command did not finish in time and was terminated.
    TimedOut { after: Duration },
    /// Failed to collect the child's output.
    Io { source: std::io::Error },
    /// Failed to replace the output file.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleError::Spawn { source } => {
                write!(f, "failed to spawn sampling command: {source}")
            }
            CycleError::Exited { code: Some(code) } => {
                write!(f, "sampling command exited with status {code}")
            }
            CycleError::Exited { code: None } => {
                write!(f, "sampling command killed by signal")
            }
            CycleError::TimedOut { after } => {
                write!(f, "sampling command timed out after {}s", after.as_secs_f32())
            }
            CycleError::Io { source } => {
                write!(f, "I/O error while sampling: {source}")
            }
            CycleError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CycleError::Spawn { source } => Some(source),
            CycleError::Io { source } => Some(source),
            CycleError::Write { source, .. } => Some(source),
            CycleError::Exited { .. } | CycleError::TimedOut { .. } => None,
        }
    }
}

/// Runs the sampling command and owns the output file.
#[derive(Debug, Clone)]
pub struct Sampler {
    elevation: Elevation,
    output: PathBuf,
    timeout: Option<Duration>,
}

impl Sampler {
    pub fn new(elevation: Elevation, output: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            elevation,
            output,
            timeout,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Run one cycle.
    ///
    /// Whatever the command printed replaces the output file once it exits,
    /// successful or not. A non-zero exit is still reported as
    /// `CycleError::Exited`. A timed-out or unspawnable command leaves the file
    /// untouched.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let start = Instant::now();

        let mut child = self
            .elevation
            .non_interactive(SAMPLE_PROGRAM, SAMPLE_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CycleError::Spawn { source: e })?;

        tracing::trace!(pid = child.id().unwrap_or(0), "sampling command started");

        let mut stdout = child.stdout.take().ok_or_else(|| CycleError::Io {
            source: std::io::Error::other("child stdout was not captured"),
        })?;

        let collect = async {
            let mut captured = Vec::new();
            let (status, read) = tokio::join!(child.wait(), stdout.read_to_end(&mut captured));
            read?;
            Ok::<_, std::io::Error>((status?, captured))
        };

        let finished = match self.timeout {
            Some(limit) => {
                let timed = tokio::time::timeout(limit, collect).await;
                match timed {
                    Ok(finished) => finished,
                    Err(_) => {
                        terminate(&mut child).await;
                        return Err(CycleError::TimedOut { after: limit });
                    }
                }
            }
            None => collect.await,
        };
        let (status, captured) = finished.map_err(|e| CycleError::Io { source: e })?;

        write_atomic(&self.output, &captured).map_err(|e| CycleError::Write {
            path: self.output.clone(),
            source: e,
        })?;

        if !status.success() {
            return Err(CycleError::Exited {
                code: status.code(),
            });
        }

        Ok(CycleReport {
            output_bytes: captured.len() as u64,
            duration: start.elapsed(),
        })
    }
}

/// Stop a timed-out invocation.
///
/// sudo relays SIGTERM to the command it runs but cannot relay SIGKILL, so the
/// child gets SIGTERM first and SIGKILL only after `TERM_GRACE`.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                if let Ok(Ok(status)) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
                    tracing::debug!(pid, ?status, "timed-out sampling command terminated");
                    return;
                }
                tracing::warn!(pid, "sampling command ignored SIGTERM, killing");
            }
            Err(e) => tracing::debug!(pid, error = %e, "failed to send SIGTERM"),
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill sampling command");
    }
}

/// Replace `path` with `contents` so readers never see a partial file.
///
/// Writes a temp file in the same directory, then renames it over `path`.
/// The result is world-readable (0644).
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
