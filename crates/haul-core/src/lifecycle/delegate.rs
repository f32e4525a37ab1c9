//! Worker delegate that persists outcomes and forwards them to listeners.
//!
//! Callbacks arrive on worker threads. Each one takes the write gate, applies
//! an atomic edit to the stored record, and only then emits. An edit is
//! skipped when the record has already left the state the worker was started
//! from, so a paused or cancelled job is never resurrected by a late report.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Notify;

use super::listener::{ListenerEvent, ListenerRegistry};
use super::WriteGate;
use crate::downloader::DownloadDelegate;
use crate::job::{accepts_worker_outcome, ErrorCause, Job, JobId, Status};
use crate::store::JobStore;

pub(crate) struct StoreDelegate<S: JobStore> {
    store: S,
    gate: WriteGate,
    listeners: ListenerRegistry,
    wake: Arc<Notify>,
    runtime: Handle,
}

impl<S: JobStore> StoreDelegate<S> {
    pub(crate) fn new(
        store: S,
        gate: WriteGate,
        listeners: ListenerRegistry,
        wake: Arc<Notify>,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            gate,
            listeners,
            wake,
            runtime,
        }
    }

    fn apply<F>(&self, id: JobId, accept: fn(Status) -> bool, edit: F) -> Option<Job>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let result = self.runtime.block_on(async {
            let _gate = self.gate.lock().await;
            self.store
                .modify(id, |job| {
                    if !accept(job.status) {
                        return false;
                    }
                    edit(job);
                    true
                })
                .await
        });
        match result {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(job_id = id, error = %e, "recording worker report failed");
                None
            }
        }
    }
}

fn is_downloading(status: Status) -> bool {
    status == Status::Downloading
}

impl<S: JobStore> DownloadDelegate for StoreDelegate<S> {
    fn on_started(&self, job: &Job, downloaded: u64, total: Option<u64>) {
        let updated = self.apply(job.id, is_downloading, |j| {
            j.record_progress(downloaded, total);
            j.error = None;
        });
        if let Some(job) = updated {
            self.listeners.emit(ListenerEvent::Started {
                job,
                downloaded,
                total,
            });
        }
    }

    fn on_progress(&self, job: &Job, eta_ms: Option<u64>, bytes_per_sec: u64) {
        let (downloaded, total) = (job.downloaded, job.total);
        if let Some(job) = self.apply(job.id, is_downloading, |j| j.record_progress(downloaded, total)) {
            self.listeners.emit(ListenerEvent::Progress {
                job,
                eta_ms,
                bytes_per_sec,
            });
        }
    }

    fn on_complete(&self, job: &Job) {
        let downloaded = job.downloaded;
        let total = job.total.unwrap_or(downloaded);
        let updated = self.apply(job.id, accepts_worker_outcome, |j| {
            j.record_progress(downloaded, Some(total));
            j.status = Status::Completed;
            j.error = None;
        });
        if let Some(job) = updated {
            tracing::info!(job_id = job.id, file = %job.file.display(), "download complete");
            self.listeners.emit(ListenerEvent::Complete(job));
        }
        self.wake.notify_one();
    }

    fn on_error(&self, job: &Job, cause: ErrorCause) {
        let (downloaded, total) = (job.downloaded, job.total);
        let updated = self.apply(job.id, accepts_worker_outcome, |j| {
            j.record_progress(downloaded, total);
            j.status = Status::Failed;
            j.error = Some(cause);
        });
        if let Some(job) = updated {
            tracing::info!(job_id = job.id, %cause, "download failed");
            self.listeners.emit(ListenerEvent::Error(job, cause));
        }
        self.wake.notify_one();
    }
}
