//! The processor task and its single pass over the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::choose::dispatch_order;
use crate::downloader::DownloadDelegate;
use crate::error::{HaulError, Result};
use crate::job::{JobId, Status};
use crate::lifecycle::WriteGate;
use crate::orchestrator::{Orchestrator, StartOutcome};
use crate::store::JobStore;

struct Inner<S: JobStore> {
    store: S,
    gate: WriteGate,
    orchestrator: Arc<Orchestrator>,
    delegate: Arc<dyn DownloadDelegate>,
    wake: Arc<Notify>,
    poll: Duration,
    paused: AtomicBool,
}

pub struct QueueProcessor<S: JobStore> {
    inner: Arc<Inner<S>>,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: JobStore> QueueProcessor<S> {
    pub(crate) fn new(
        store: S,
        gate: WriteGate,
        orchestrator: Arc<Orchestrator>,
        delegate: Arc<dyn DownloadDelegate>,
        wake: Arc<Notify>,
        poll: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                gate,
                orchestrator,
                delegate,
                wake,
                poll: poll.max(Duration::from_millis(10)),
                paused: AtomicBool::new(false),
            }),
            runtime,
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns the processor task unless it is already running.
    pub fn start(&self) {
        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(self.runtime.spawn(inner.run()));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task().take() {
            task.abort();
            tracing::debug!("queue processor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Keeps the task alive but claims nothing until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.notify();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Asks for a pass as soon as possible.
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }

    /// Runs one pass now. Returns how many jobs were started.
    pub async fn tick(&self) -> Result<usize> {
        self.inner.tick().await
    }
}

impl<S: JobStore> Inner<S> {
    async fn run(self: Arc<Self>) {
        tracing::debug!(poll_ms = self.poll.as_millis() as u64, "queue processor started");
        loop {
            match self.tick().await {
                Ok(_) => {}
                Err(HaulError::OrchestratorClosed(_)) => break,
                Err(e) => tracing::warn!(error = %e, "queue pass failed"),
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn tick(&self) -> Result<usize> {
        if self.is_paused() {
            return Ok(0);
        }
        let _gate = self.gate.lock().await;
        // A pause may have landed while we waited for the gate.
        if self.is_paused() || !self.orchestrator.can_accommodate_new_download()? {
            return Ok(0);
        }
        let mut queued = self.store.get_by_status(Status::Queued).await?;
        queued.sort_by(dispatch_order);

        let mut started = 0;
        for job in queued {
            if !self.orchestrator.can_accommodate_new_download()? {
                break;
            }
            if self.orchestrator.contains(job.id)? {
                continue;
            }
            let claimed = self
                .store
                .modify(job.id, |j| {
                    if j.status != Status::Queued {
                        return false;
                    }
                    j.status = Status::Downloading;
                    j.error = None;
                    true
                })
                .await?;
            let Some(claimed) = claimed else {
                continue;
            };
            match self.orchestrator.try_start(&claimed, Arc::clone(&self.delegate))? {
                StartOutcome::Started => {
                    started += 1;
                    tracing::debug!(job_id = claimed.id, "dispatched");
                }
                StartOutcome::AlreadyRunning | StartOutcome::AtCapacity => {
                    self.unclaim(claimed.id).await?;
                }
                StartOutcome::Unresolvable(cause) => {
                    tracing::debug!(job_id = claimed.id, %cause, "not dispatched");
                }
            }
        }
        Ok(started)
    }

    async fn unclaim(&self, id: JobId) -> Result<()> {
        self.store
            .modify(id, |j| {
                if j.status != Status::Downloading {
                    return false;
                }
                j.status = Status::Queued;
                true
            })
            .await?;
        Ok(())
    }
}
