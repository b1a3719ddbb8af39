/// Signal handling for graceful shutdown.
///
/// First SIGINT (Ctrl-C) or SIGTERM: stop sampling, let the in-flight cycle
/// finish, then exit. Second SIGINT within 3s: exit immediately.
use crate::session::StopHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

/// Window in which a second SIGINT forces an immediate exit.
const FORCE_WINDOW: Duration = Duration::from_secs(3);

/// Exit status used for a forced exit.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug)]
struct Flag {
    requested: AtomicBool,
    notify: Notify,
}

/// Shutdown request raised by a signal.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    flag: Arc<Flag>,
}

/// What to do with a SIGINT given when the previous one arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    Graceful,
    Force,
}

pub fn classify_interrupt(previous: Option<Instant>, now: Instant) -> InterruptAction {
    match previous {
        Some(at) if now.duration_since(at) < FORCE_WINDOW => InterruptAction::Force,
        _ => InterruptAction::Graceful,
    }
}

impl SignalHandler {
    /// Install SIGINT/SIGTERM listeners that stop `session` on the first signal.
    pub fn install(session: StopHandle) -> std::io::Result<Self> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let handler = Self::detached();
        let flag = Arc::clone(&handler.flag);

        tokio::spawn(async move {
            let mut last_interrupt: Option<Instant> = None;
            loop {
                tokio::select! {
                    Some(()) = sigint.recv() => {
                        let now = Instant::now();
                        if classify_interrupt(last_interrupt, now) == InterruptAction::Force {
                            tracing::warn!("second interrupt, exiting immediately");
                            std::process::exit(FORCED_EXIT_CODE);
                        }
                        last_interrupt = Some(now);
                        tracing::info!("interrupt received, finishing current cycle (Ctrl-C again to force)");
                    }
                    Some(()) = sigterm.recv() => {
                        tracing::info!("SIGTERM received, finishing current cycle");
                    }
                    else => break,
                }
                session.stop();
                flag.requested.store(true, Ordering::Release);
                flag.notify.notify_waiters();
            }
        });

        Ok(handler)
    }

    /// A handler with no listeners, for callers that raise shutdown themselves.
    pub fn detached() -> Self {
        Self {
            flag: Arc::new(Flag {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.flag.requested.load(Ordering::Acquire)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.flag.notify.notified();
            if self.shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub fn request(&self) {
        self.flag.requested.store(true, Ordering::Release);
        self.flag.notify.notify_waiters();
    }
}
