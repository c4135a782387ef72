//! Tick Health - tracks failing and overrunning ticks per task kind

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Consecutive failures before a task kind counts as failing
const FAILING_AFTER: u32 = 3;

pub struct TickHealth {
    last_success: Option<Instant>,
    stale_after: Duration,
    runs: u64,
    failures: u64,
    timeouts: u64,
    skipped: u64,
    consecutive_failures: u32,
}

impl TickHealth {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            last_success: None,
            stale_after,
            runs: 0,
            failures: 0,
            timeouts: 0,
            skipped: 0,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.runs += 1;
        self.last_success = Some(Instant::now());
        self.consecutive_failures = 0; // Reset on recovery
    }

    pub fn record_failure(&mut self) {
        self.runs += 1;
        self.failures += 1;
        self.consecutive_failures += 1;
    }

    /// Budget overrun; the tick was abandoned
    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.record_failure();
    }

    /// Another holder had the lease
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn is_stale(&self) -> bool {
        match self.last_success {
            Some(t) => t.elapsed() > self.stale_after,
            None => self.runs > 0,
        }
    }

    pub fn check(&self) -> HealthStatus {
        if self.consecutive_failures >= FAILING_AFTER {
            return HealthStatus::Failing {
                consecutive: self.consecutive_failures,
            };
        }
        if self.consecutive_failures > 0 || self.is_stale() {
            return HealthStatus::Degraded {
                consecutive: self.consecutive_failures,
            };
        }
        HealthStatus::Healthy
    }

    pub fn snapshot(&self, kind: &str) -> TickHealthSnapshot {
        TickHealthSnapshot {
            kind: kind.to_string(),
            runs: self.runs,
            failures: self.failures,
            timeouts: self.timeouts,
            skipped: self.skipped,
            consecutive_failures: self.consecutive_failures,
            last_success_secs: self.last_success.map(|t| t.elapsed().as_secs()),
            status: self.check(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded { consecutive: u32 },
    Failing { consecutive: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickHealthSnapshot {
    pub kind: String,
    pub runs: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub skipped: u64,
    pub consecutive_failures: u32,
    /// Seconds since the last successful tick
    pub last_success_secs: Option<u64>,
    pub status: HealthStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_is_healthy() {
        let h = TickHealth::new(Duration::from_secs(60));
        assert_eq!(h.check(), HealthStatus::Healthy);
    }

    #[test]
    fn test_failures_escalate_and_recover() {
        let mut h = TickHealth::new(Duration::from_secs(60));
        h.record_failure();
        assert_eq!(h.check(), HealthStatus::Degraded { consecutive: 1 });
        h.record_timeout();
        h.record_failure();
        assert_eq!(h.check(), HealthStatus::Failing { consecutive: 3 });
        h.record_success();
        assert_eq!(h.check(), HealthStatus::Healthy);

        let snap = h.snapshot("ingest");
        assert_eq!(snap.runs, 4);
        assert_eq!(snap.failures, 3);
        assert_eq!(snap.timeouts, 1);
    }

    #[test]
    fn test_skips_do_not_degrade() {
        let mut h = TickHealth::new(Duration::from_secs(60));
        h.record_skip();
        assert_eq!(h.check(), HealthStatus::Healthy);
        assert_eq!(h.snapshot("evolution").skipped, 1);
    }
}
