use tracing::warn;

/// Verdict after recording a failed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Keep sampling (includes the current run of failures).
    Continue { consecutive: u32 },
    /// Too many failures in a row. The session should give up.
    GiveUp { consecutive: u32 },
}

/// Consecutive-failure monitor for the sampling loop.
///
/// A long session can outlive sudo's cached grant, after which every
/// non-interactive invocation fails. This turns that silent degradation into
/// a surfaced stop once `limit` cycles in a row have failed. A limit of 0
/// never gives up.
#[derive(Debug)]
pub struct FailureMonitor {
    limit: u32,
    consecutive: u32,
}

impl FailureMonitor {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_failure(&mut self) -> FailureVerdict {
        self.consecutive = self.consecutive.saturating_add(1);

        if self.limit > 0 && self.consecutive >= self.limit {
            warn!(
                consecutive = self.consecutive,
                limit = self.limit,
                "sampling keeps failing, giving up"
            );
            FailureVerdict::GiveUp {
                consecutive: self.consecutive,
            }
        } else {
            FailureVerdict::Continue {
                consecutive: self.consecutive,
            }
        }
    }

    #[cfg(test)]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
