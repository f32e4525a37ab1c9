//! Transfer rate, ETA, and report throttling for one running job.
//!
//! Rate counts only bytes moved in this run: bytes_per_sec = (done - base) / elapsed,
//! ETA = (total - done) / rate.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ProgressMeter {
    started: Instant,
    /// Bytes already on disk when the run began.
    base: u64,
    interval: Duration,
    last_report: Option<Instant>,
}

impl ProgressMeter {
    pub fn new(base: u64, interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            base,
            interval,
            last_report: None,
        }
    }

    /// Restart accounting, e.g. after the remote ignored a resume range.
    pub fn rebase(&mut self, base: u64) {
        self.base = base;
        self.started = Instant::now();
    }

    /// True at most once per interval; the first call is always due.
    pub fn due(&mut self) -> bool {
        let now = Instant::now();
        match self.last_report {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_report = Some(now);
                true
            }
        }
    }

    /// Download rate in bytes per second (0 until time has passed).
    pub fn bytes_per_sec(&self, done: u64) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (done.saturating_sub(self.base) as f64 / elapsed) as u64
    }

    /// Estimated milliseconds remaining; `None` while total or rate is unknown.
    pub fn eta_ms(&self, done: u64, total: Option<u64>) -> Option<u64> {
        let remaining = total?.saturating_sub(done);
        if remaining == 0 {
            return Some(0);
        }
        let rate = self.bytes_per_sec(done);
        if rate == 0 {
            return None;
        }
        Some(((remaining as f64 / rate as f64) * 1000.0) as u64)
    }
}
