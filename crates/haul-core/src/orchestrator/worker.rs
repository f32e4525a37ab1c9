//! Per-worker bookkeeping: the record kept in the orchestrator's map and the
//! signal a worker raises once it has stopped.

use std::sync::Arc;

use tokio::sync::watch;

use crate::downloader::InterruptToken;
use crate::job::Job;

/// Raised exactly once when a worker stops. Waiters suspend on it; nobody spins.
#[derive(Debug, Clone)]
pub struct TerminationSignal(Arc<watch::Sender<bool>>);

impl TerminationSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn confirm(&self) {
        self.0.send_replace(true);
    }

    pub fn is_confirmed(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        // Err only if every sender is gone, and we hold one.
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl Default for TerminationSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct WorkerRecord {
    /// Distinguishes this run from a later run of the same job id.
    pub(crate) seq: u64,
    pub(crate) job: Job,
    pub(crate) interrupt: InterruptToken,
    pub(crate) terminated: TerminationSignal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_returns_after_confirm() {
        let signal = TerminationSignal::new();
        assert!(!signal.is_confirmed());
        let remote = signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.confirm();
        });
        tokio::time::timeout(Duration::from_secs(5), signal.wait())
            .await
            .unwrap();
        assert!(signal.is_confirmed());
        // Already confirmed: returns immediately.
        signal.wait().await;
    }
}
