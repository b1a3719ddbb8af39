/// Sampler session lifecycle: one elevation check, then a single background
/// worker that samples on a fixed cadence until stopped.
use crate::config::ProbeConfig;
use crate::credential::Credential;
use crate::elevation::{Elevation, StartError};
use crate::sampler::{Sampler, OUTPUT_FILE, SAMPLE_INTERVAL};
use crate::status::{SessionState, SessionStatus, StatusBoard, StatusData};
use crate::watchdog::{FailureMonitor, FailureVerdict};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Everything a session needs besides the elevation mechanism.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub output_file: PathBuf,
    pub interval: Duration,
    pub sample_timeout: Option<Duration>,
    pub max_consecutive_failures: u32,
    pub status_file: Option<PathBuf>,
}

impl SessionSettings {
    /// The fixed output file and interval, plus the configurable knobs.
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            output_file: PathBuf::from(OUTPUT_FILE),
            interval: SAMPLE_INTERVAL,
            sample_timeout: (config.sampler.timeout_secs > 0)
                .then(|| Duration::from_secs(config.sampler.timeout_secs)),
            max_consecutive_failures: config.sampler.max_consecutive_failures,
            status_file: config.status.path().map(Path::to_path_buf),
        }
    }
}

/// What `start` did when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A worker was already running; nothing was invoked.
    AlreadySampling,
}

/// Totals reported by a finished worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub succeeded: u64,
    pub failed: u64,
    /// The failure monitor ended the session.
    pub gave_up: bool,
}

#[derive(Debug)]
struct Shared {
    running: AtomicBool,
    wake: Notify,
    board: StatusBoard,
}

impl Shared {
    fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.board.set(SessionStatus::Stopped);
        self.wake.notify_waiters();
        true
    }
}

/// Cloneable handle that can stop the session from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// See [`SamplerSession::stop`].
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }
}

/// Owns the session state, the running flag and the worker task.
#[derive(Debug)]
pub struct SamplerSession {
    elevation: Elevation,
    sampler: Sampler,
    interval: Duration,
    max_consecutive_failures: u32,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<WorkerSummary>>,
}

impl SamplerSession {
    pub fn new(elevation: Elevation, settings: SessionSettings) -> Self {
        let board = StatusBoard::new(&settings.output_file, settings.status_file);
        let sampler = Sampler::new(
            elevation.clone(),
            settings.output_file,
            settings.sample_timeout,
        );
        Self {
            elevation,
            sampler,
            interval: settings.interval,
            max_consecutive_failures: settings.max_consecutive_failures,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                wake: Notify::new(),
                board,
            }),
            worker: None,
        }
    }

    /// Validate `credential` once and, on success, start the sampling worker.
    ///
    /// Blocks the caller for the duration of the elevation check. The
    /// credential is wiped as soon as the check returns.
    pub async fn start(&mut self, credential: Credential) -> Result<StartOutcome, StartError> {
        if self.shared.running.load(Ordering::Acquire) {
            tracing::debug!("start requested while sampling, ignoring");
            return Ok(StartOutcome::AlreadySampling);
        }

        if credential.is_empty() {
            self.shared.board.set(SessionStatus::CredentialRequired);
            return Err(StartError::EmptyCredential);
        }

        if let Err(e) = self.elevation.validate(credential).await {
            self.shared.board.set(SessionStatus::AuthenticationFailed);
            return Err(e);
        }

        // A previous worker may still be finishing its last cycle.
        self.join_worker().await;

        self.shared.running.store(true, Ordering::Release);
        self.shared.board.set(SessionStatus::Sampling);

        let monitor = FailureMonitor::new(self.max_consecutive_failures);
        self.worker = Some(tokio::spawn(sampling_loop(
            self.sampler.clone(),
            Arc::clone(&self.shared),
            self.interval,
            monitor,
        )));

        tracing::info!(
            output = %self.sampler.output().display(),
            interval_ms = self.interval.as_millis() as u64,
            "sampling started"
        );
        Ok(StartOutcome::Started)
    }

    /// Ask the worker to stop after its in-flight cycle. Returns false (and
    /// changes nothing) when the session was not sampling.
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }

    /// Stop and wait for the worker to finish.
    pub async fn shutdown(&mut self) -> Option<WorkerSummary> {
        self.stop();
        self.join_worker().await
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.board.status()
    }

    pub fn state(&self) -> SessionState {
        self.status().state()
    }

    pub fn snapshot(&self) -> StatusData {
        self.shared.board.snapshot()
    }

    pub fn output_file(&self) -> &Path {
        self.sampler.output()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Remove the status snapshot file.
    pub fn clear_status_file(&self) {
        self.shared.board.remove_file();
    }

    async fn join_worker(&mut self) -> Option<WorkerSummary> {
        let handle = self.worker.take()?;
        match handle.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::error!(error = %e, "sampling worker panicked");
                None
            }
        }
    }
}

impl Drop for SamplerSession {
    fn drop(&mut self) {
        // A detached worker exits at its next iteration boundary.
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_waiters();
    }
}

async fn sampling_loop(
    sampler: Sampler,
    shared: Arc<Shared>,
    interval: Duration,
    mut monitor: FailureMonitor,
) -> WorkerSummary {
    let mut summary = WorkerSummary::default();

    while shared.running.load(Ordering::Acquire) {
        match sampler.run_cycle().await {
            Ok(report) => {
                summary.succeeded += 1;
                monitor.record_success();
                shared.board.record_success();
                tracing::debug!(
                    output_bytes = report.output_bytes,
                    duration_ms = report.duration.as_millis() as u64,
                    "sample written"
                );
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!(error = %e, "sampling cycle failed");
                match monitor.record_failure() {
                    FailureVerdict::Continue { consecutive } => {
                        shared.board.record_failure(consecutive);
                    }
                    FailureVerdict::GiveUp { consecutive } => {
                        shared.board.record_failure(consecutive);
                        if shared
                            .running
                            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            shared.board.set(SessionStatus::SamplingFailed);
                            summary.gave_up = true;
                        }
                        break;
                    }
                }
            }
        }

        // Registered before the flag check so a stop in between still wakes us.
        let woken = shared.wake.notified();
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = woken => {}
        }
    }

    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        gave_up = summary.gave_up,
        "sampling worker finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeSudo, SampleBehavior};
    use std::time::Instant;

    const TICK: Duration = Duration::from_millis(50);

    fn settings(fake: &FakeSudo) -> SessionSettings {
        SessionSettings {
            output_file: fake.output_path(),
            interval: TICK,
            sample_timeout: Some(Duration::from_secs(5)),
            max_consecutive_failures: 0,
            status_file: None,
        }
    }

    fn session(fake: &FakeSudo) -> SamplerSession {
        SamplerSession::new(fake.elevation(), settings(fake))
    }

    #[test]
    fn test_settings_from_default_config() {
        let settings = SessionSettings::from_config(&ProbeConfig::default());
        assert_eq!(settings.output_file, PathBuf::from("/tmp/gpu_power.txt"));
        assert_eq!(settings.interval, Duration::from_secs(2));
        assert_eq!(settings.sample_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.max_consecutive_failures, 30);
    }

    #[test]
    fn test_settings_zero_timeout_means_none() {
        let mut config = ProbeConfig::default();
        config.sampler.timeout_secs = 0;
        config.status.enabled = false;
        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.sample_timeout, None);
        assert_eq!(settings.status_file, None);
    }

    #[tokio::test]
    async fn test_new_session_is_not_started() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let session = session(&fake);
        assert_eq!(session.status(), SessionStatus::NotStarted);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.output_file(), fake.output_path());
    }

    #[tokio::test]
    async fn test_empty_credential_invokes_nothing() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let mut session = session(&fake);

        let err = session.start(Credential::from("")).await.unwrap_err();

        assert!(matches!(err, StartError::EmptyCredential));
        assert_eq!(session.status(), SessionStatus::CredentialRequired);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(fake.validations(), 0);
        assert_eq!(fake.samples(), 0);
    }

    #[tokio::test]
    async fn test_rejected_credential_starts_no_worker() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let mut session = session(&fake);

        let err = session.start(Credential::from("letmein")).await.unwrap_err();
        tokio::time::sleep(TICK * 4).await;

        assert!(matches!(err, StartError::AuthenticationFailed { .. }));
        assert_eq!(session.status(), SessionStatus::AuthenticationFailed);
        assert_eq!(session.state(), SessionState::AuthFailed);
        assert_eq!(fake.validations(), 1);
        assert_eq!(fake.samples(), 0);
        assert!(session.shutdown().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_elevation_program() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let elevation = Elevation::new("nonexistent-sudo-xyz", vec![], Duration::from_secs(5));
        let mut session = SamplerSession::new(elevation, settings(&fake));

        let err = session.start(Credential::from("hunter2")).await.unwrap_err();

        assert!(matches!(err, StartError::ElevationUnavailable { .. }));
        assert_eq!(session.state(), SessionState::AuthFailed);
    }

    #[tokio::test]
    async fn test_start_sample_stop_scenario() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("GPU Power: 42 mW"));
        let mut session = session(&fake);

        let outcome = session.start(Credential::from("hunter2")).await.unwrap();
        assert_eq!(outcome, StartOutcome::Started);
        assert_eq!(session.status(), SessionStatus::Sampling);

        tokio::time::sleep(TICK * 6).await;
        let contents = std::fs::read_to_string(fake.output_path()).unwrap();
        assert_eq!(contents, "GPU Power: 42 mW\n");

        assert!(session.stop());
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert_eq!(session.state(), SessionState::Stopped);

        let summary = session.shutdown().await.unwrap();
        assert!(summary.succeeded >= 2, "{summary:?}");
        assert_eq!(summary.failed, 0);

        let samples = fake.samples();
        let modified = std::fs::metadata(fake.output_path())
            .unwrap()
            .modified()
            .unwrap();
        tokio::time::sleep(TICK * 4).await;
        assert_eq!(fake.samples(), samples);
        assert_eq!(
            std::fs::metadata(fake.output_path())
                .unwrap()
                .modified()
                .unwrap(),
            modified
        );
        assert_eq!(session.snapshot().cycles_ok, summary.succeeded);
    }

    #[tokio::test]
    async fn test_double_start_keeps_one_worker() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let mut session = session(&fake);
        let began = Instant::now();

        session.start(Credential::from("hunter2")).await.unwrap();
        let second = session.start(Credential::from("hunter2")).await.unwrap();
        assert_eq!(second, StartOutcome::AlreadySampling);

        tokio::time::sleep(TICK * 10).await;
        session.shutdown().await.unwrap();
        let elapsed = began.elapsed();

        assert_eq!(fake.validations(), 1);
        // one loop sleeps a full tick between cycles; two loops would double this
        let ceiling = (elapsed.as_millis() / TICK.as_millis()) as usize + 1;
        assert!(
            fake.samples() <= ceiling,
            "{} samples in {elapsed:?}",
            fake.samples()
        );
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let session = session(&fake);

        assert!(!session.stop());
        assert_eq!(session.status(), SessionStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let mut session = session(&fake);
        session.start(Credential::from("hunter2")).await.unwrap();

        assert!(session.stop());
        assert!(!session.stop());
        assert_eq!(session.status(), SessionStatus::Stopped);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_cycles_keep_sampling() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Fail);
        let mut session = session(&fake);

        session.start(Credential::from("hunter2")).await.unwrap();
        tokio::time::sleep(TICK * 6).await;

        assert_eq!(session.status(), SessionStatus::Sampling);
        assert!(fake.samples() >= 2);
        // each finished invocation replaces the file, even with empty stdout
        let contents = std::fs::read_to_string(fake.output_path()).unwrap();
        assert_eq!(contents, "");

        let summary = session.shutdown().await.unwrap();
        assert_eq!(summary.succeeded, 0);
        assert!(summary.failed >= 2);
        assert!(!summary.gave_up);
    }

    #[tokio::test]
    async fn test_gives_up_after_consecutive_failures() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Fail);
        let mut settings = settings(&fake);
        settings.max_consecutive_failures = 3;
        let mut session = SamplerSession::new(fake.elevation(), settings);

        session.start(Credential::from("hunter2")).await.unwrap();
        tokio::time::sleep(TICK * 12).await;

        assert_eq!(session.status(), SessionStatus::SamplingFailed);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(fake.samples(), 3);

        // stop after giving up changes nothing
        assert!(!session.stop());
        let summary = session.shutdown().await.unwrap();
        assert!(summary.gave_up);
        assert_eq!(summary.failed, 3);
        assert_eq!(session.status(), SessionStatus::SamplingFailed);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let mut session = session(&fake);

        session.start(Credential::from("hunter2")).await.unwrap();
        session.stop();
        let outcome = session.start(Credential::from("hunter2")).await.unwrap();

        assert_eq!(outcome, StartOutcome::Started);
        assert_eq!(session.status(), SessionStatus::Sampling);
        assert_eq!(fake.validations(), 2);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_handle_stops_session() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let mut session = session(&fake);
        session.start(Credential::from("hunter2")).await.unwrap();

        let handle = session.stop_handle();
        tokio::spawn(async move { handle.stop() }).await.unwrap();

        assert_eq!(session.status(), SessionStatus::Stopped);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_wakes_sleeping_worker() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let mut settings = settings(&fake);
        settings.interval = Duration::from_secs(30);
        let mut session = SamplerSession::new(fake.elevation(), settings);

        session.start(Credential::from("hunter2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let began = Instant::now();
        let summary = session.shutdown().await.unwrap();
        assert!(began.elapsed() < Duration::from_secs(5));
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_sample_finish() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Slow("GPU Power: 9 mW"));
        let mut session = session(&fake);

        session.start(Credential::from("hunter2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.stop());

        let summary = session.shutdown().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        let contents = std::fs::read_to_string(fake.output_path()).unwrap();
        assert_eq!(contents, "GPU Power: 9 mW\n");
        assert_eq!(fake.samples(), 1);

        tokio::time::sleep(TICK * 6).await;
        assert_eq!(fake.samples(), 1);
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_status_file_follows_session() {
        let fake = FakeSudo::new("hunter2", SampleBehavior::Print("reading"));
        let status_path = fake.dir().join("probe.status");
        let mut settings = settings(&fake);
        settings.status_file = Some(status_path.clone());
        let mut session = SamplerSession::new(fake.elevation(), settings);

        session.start(Credential::from("hunter2")).await.unwrap();
        tokio::time::sleep(TICK * 4).await;
        session.shutdown().await.unwrap();

        let data = crate::status::read_status(&status_path).unwrap();
        assert_eq!(data.status, SessionStatus::Stopped);
        assert!(data.cycles_ok >= 1);
        assert!(data.last_sample.is_some());

        session.clear_status_file();
        assert!(!status_path.exists());
    }
}
