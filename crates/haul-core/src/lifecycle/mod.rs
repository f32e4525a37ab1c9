//! Job lifecycle manager: the public façade over store, orchestrator and queue.
//!
//! Every mutating operation follows the same order:
//! 1. select candidates from the store and keep those the transition allows;
//! 2. cancel their workers (without holding the write gate, since a worker's
//!    delegate needs the gate before it can terminate);
//! 3. under the gate, re-read the records, apply the transition and write the
//!    batch;
//! 4. cancel any worker that started in between.
//!
//! A failed batch write is logged and reported as an empty result. Reads that
//! fail are returned as errors.

mod delegate;
mod files;
mod listener;
mod policy;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::HaulConfig;
use crate::downloader::{DownloadDelegate, TransferSettings};
use crate::error::{HaulError, Result};
use crate::job::{
    can_cancel, can_pause, can_resume, can_retry, Job, JobId, JobRequest, RequestInfo, Status,
};
use crate::namespace::{NamespaceLease, NamespaceRegistry};
use crate::orchestrator::{Orchestrator, OrchestratorClosed, Strategies};
use crate::scheduler::QueueProcessor;
use crate::store::JobStore;

use delegate::StoreDelegate;
use listener::{ListenerEvent, ListenerRegistry};
pub use listener::{DownloadListener, ListenerId};
pub use policy::{incremented_path, Candidate, EnqueueOption, EnqueuePolicy};

/// Serializes every store write made by the manager, the queue processor and
/// worker delegates.
pub(crate) type WriteGate = Arc<tokio::sync::Mutex<()>>;

/// Which records a bulk operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Selection {
    Ids(Vec<JobId>),
    Group(i64),
    All,
    Status(Status),
    GroupStatus(i64, Status),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Pause,
    Resume,
    Retry,
    Cancel,
}

impl Transition {
    fn allows(self, status: Status) -> bool {
        match self {
            Transition::Pause => can_pause(status),
            Transition::Resume => can_resume(status),
            Transition::Retry => can_retry(status),
            Transition::Cancel => can_cancel(status),
        }
    }

    fn stops_worker(self) -> bool {
        matches!(self, Transition::Pause | Transition::Cancel)
    }

    fn apply(self, job: &mut Job) {
        match self {
            Transition::Pause => job.status = Status::Paused,
            Transition::Resume => job.status = Status::Queued,
            Transition::Retry => {
                job.status = Status::Queued;
                job.error = None;
            }
            Transition::Cancel => {
                job.status = Status::Cancelled;
                job.error = None;
            }
        }
    }
}

pub struct DownloadManager<S: JobStore> {
    namespace: String,
    store: S,
    gate: WriteGate,
    orchestrator: Arc<Orchestrator>,
    policy: EnqueuePolicy,
    listeners: ListenerRegistry,
    notifier: JoinHandle<()>,
    processor: QueueProcessor<S>,
    lease: Mutex<Option<NamespaceLease>>,
    closed: AtomicBool,
}

impl<S: JobStore> DownloadManager<S> {
    /// Claims `config.namespace`, repairs records left by an unclean
    /// shutdown and, with `auto_start`, starts processing the queue.
    ///
    /// Must be called from within a tokio runtime; workers report back through it.
    pub async fn open(
        store: S,
        config: &HaulConfig,
        registry: &NamespaceRegistry,
        strategies: Strategies,
    ) -> Result<Self> {
        let lease = registry.claim(&config.namespace)?;
        let repaired = store.sanitize(true).await?;
        if repaired > 0 {
            tracing::info!(namespace = %config.namespace, repaired, "sanitized job records");
        }

        let runtime = Handle::current();
        let orchestrator = Arc::new(Orchestrator::new(
            config.concurrency_limit,
            strategies,
            TransferSettings::from_config(config),
        )?);
        let gate = WriteGate::default();
        let wake = Arc::new(Notify::new());
        let (listeners, notifier) = ListenerRegistry::spawn(&runtime);
        let delegate: Arc<dyn DownloadDelegate> = Arc::new(StoreDelegate::new(
            store.clone(),
            gate.clone(),
            listeners.clone(),
            Arc::clone(&wake),
            runtime.clone(),
        ));
        let processor = QueueProcessor::new(
            store.clone(),
            gate.clone(),
            Arc::clone(&orchestrator),
            delegate,
            wake,
            config.queue_poll(),
            runtime,
        );
        if config.auto_start {
            processor.start();
        }
        tracing::info!(
            namespace = %config.namespace,
            limit = config.concurrency_limit,
            "download manager open"
        );
        Ok(Self {
            namespace: config.namespace.clone(),
            store,
            gate,
            orchestrator,
            policy: EnqueuePolicy::new(config.enqueue_options.iter().copied()),
            listeners,
            notifier,
            processor,
            lease: Mutex::new(Some(lease)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn queue(&self) -> &QueueProcessor<S> {
        &self.processor
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorClosed.into());
        }
        Ok(())
    }

    async fn select(&self, selection: &Selection) -> Result<Vec<Job>> {
        let jobs = match selection {
            Selection::Ids(ids) => self.store.get_many(ids).await?.into_iter().flatten().collect(),
            Selection::Group(group) => self.store.get_by_group(*group).await?,
            Selection::All => self.store.get_all().await?,
            Selection::Status(status) => self.store.get_by_status(*status).await?,
            Selection::GroupStatus(group, status) => {
                self.store.get_by_group_and_status(*group, *status).await?
            }
        };
        Ok(jobs)
    }

    /// Cancels each listed job's worker if it has one.
    async fn stop_workers<'a>(&self, jobs: impl IntoIterator<Item = &'a Job>) -> Result<()> {
        for job in jobs {
            self.orchestrator.cancel(job.id).await?;
        }
        Ok(())
    }

    fn announce(&self, jobs: &[Job]) {
        for job in jobs {
            self.listeners.emit(ListenerEvent::StatusChanged(job.clone()));
        }
    }

    async fn transition(&self, transition: Transition, selection: Selection) -> Result<Vec<Job>> {
        self.ensure_open()?;
        let candidates: Vec<Job> = self
            .select(&selection)
            .await?
            .into_iter()
            .filter(|j| transition.allows(j.status))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        if transition.stops_worker() {
            self.stop_workers(&candidates).await?;
        }

        let ids: Vec<JobId> = candidates.iter().map(|j| j.id).collect();
        let updated = {
            let _gate = self.gate.lock().await;
            let mut batch = Vec::with_capacity(ids.len());
            for mut job in self.store.get_many(&ids).await?.into_iter().flatten() {
                if !transition.allows(job.status) {
                    continue;
                }
                if transition == Transition::Resume && self.orchestrator.contains(job.id)? {
                    continue;
                }
                transition.apply(&mut job);
                batch.push(job);
            }
            if let Err(e) = self.store.update_batch(&batch).await {
                tracing::warn!(?transition, error = %e, "batch update failed; nothing reported");
                return Ok(Vec::new());
            }
            batch
        };

        if transition.stops_worker() {
            self.stop_workers(&updated).await?;
        } else {
            self.processor.notify();
        }
        tracing::debug!(?transition, count = updated.len(), "jobs updated");
        self.announce(&updated);
        Ok(updated)
    }

    /// Cancels, deletes the records and discards partial data. With
    /// `delete_files` the destination files go too.
    async fn discard(&self, selection: Selection, delete_files: bool) -> Result<Vec<Job>> {
        self.ensure_open()?;
        let candidates = self.select(&selection).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        self.stop_workers(&candidates).await?;

        let ids: Vec<JobId> = candidates.iter().map(|j| j.id).collect();
        let mut removed = {
            let _gate = self.gate.lock().await;
            let fresh: Vec<Job> = self.store.get_many(&ids).await?.into_iter().flatten().collect();
            if let Err(e) = self.store.delete_batch(&fresh).await {
                tracing::warn!(error = %e, "batch delete failed; nothing reported");
                return Ok(Vec::new());
            }
            fresh
        };
        self.stop_workers(&removed).await?;

        let marker = if delete_files {
            Status::Deleted
        } else {
            Status::Removed
        };
        for job in &mut removed {
            files::discard_partials(&self.orchestrator.segment_dir(job)).await;
            if delete_files {
                files::delete_destination(&job.file).await;
            }
            job.status = marker;
        }
        tracing::debug!(count = removed.len(), delete_files, "jobs discarded");
        self.announce(&removed);
        Ok(removed)
    }

    async fn resolve(&self, request: JobRequest) -> Result<Job> {
        let policy = &self.policy;
        let mut candidate = Candidate::new(request, &self.namespace);
        if policy.matches_by_id() {
            let existing = self.store.get(candidate.job.id).await?;
            candidate = policy.resolve_id_collision(candidate, existing);
        }
        if policy.matches_by_file() {
            let existing = self.store.get_by_file(&candidate.job.file).await?;
            candidate = policy.resolve_file_collision(candidate, existing);
        }
        candidate = policy.carry_forward(candidate);
        candidate = policy.auto_increment(candidate, Path::exists);

        if !candidate.discard.is_empty() {
            let ids = candidate.discard.iter().map(|j| j.id).collect();
            self.discard(Selection::Ids(ids), false).await?;
        }
        if let Some(path) = &candidate.reserve {
            files::reserve(path).await;
        }
        Ok(candidate.job)
    }

    /// Adds one job. Fails with [`HaulError::AlreadyEnqueued`] if its id is
    /// taken and no policy replaced the existing record.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Job> {
        self.ensure_open()?;
        let job = self.resolve(request).await?;
        let inserted = {
            let _gate = self.gate.lock().await;
            self.store.insert(&job).await?
        };
        if !inserted {
            return Err(HaulError::AlreadyEnqueued(job.id));
        }
        tracing::info!(job_id = job.id, url = %job.url, file = %job.file.display(), "enqueued");
        self.announce(std::slice::from_ref(&job));
        self.processor.notify();
        Ok(job)
    }

    /// Adds many jobs. Returns each stored record with whether it was inserted.
    pub async fn enqueue_batch(&self, requests: Vec<JobRequest>) -> Result<Vec<(Job, bool)>> {
        self.ensure_open()?;
        let requests = self.policy.dedupe(requests);
        let mut jobs = Vec::with_capacity(requests.len());
        for request in requests {
            jobs.push(self.resolve(request).await?);
        }
        let results = {
            let _gate = self.gate.lock().await;
            match self.store.insert_batch(&jobs).await {
                Ok(results) => results,
                Err(e) => {
                    tracing::warn!(error = %e, "batch insert failed; nothing reported");
                    return Ok(Vec::new());
                }
            }
        };
        let inserted: Vec<Job> = results
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(j, _)| j.clone())
            .collect();
        tracing::info!(requested = results.len(), inserted = inserted.len(), "batch enqueued");
        self.announce(&inserted);
        self.processor.notify();
        Ok(results)
    }

    pub async fn pause(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.pause_ids(&[id]).await?.into_iter().next())
    }

    pub async fn pause_ids(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        self.transition(Transition::Pause, Selection::Ids(ids.to_vec())).await
    }

    pub async fn pause_group(&self, group: i64) -> Result<Vec<Job>> {
        self.transition(Transition::Pause, Selection::Group(group)).await
    }

    pub async fn pause_all(&self) -> Result<Vec<Job>> {
        self.transition(Transition::Pause, Selection::All).await
    }

    pub async fn resume(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.resume_ids(&[id]).await?.into_iter().next())
    }

    pub async fn resume_ids(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        self.transition(Transition::Resume, Selection::Ids(ids.to_vec())).await
    }

    pub async fn resume_group(&self, group: i64) -> Result<Vec<Job>> {
        self.transition(Transition::Resume, Selection::Group(group)).await
    }

    pub async fn resume_all(&self) -> Result<Vec<Job>> {
        self.transition(Transition::Resume, Selection::All).await
    }

    pub async fn retry(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.retry_ids(&[id]).await?.into_iter().next())
    }

    pub async fn retry_ids(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        self.transition(Transition::Retry, Selection::Ids(ids.to_vec())).await
    }

    pub async fn retry_group(&self, group: i64) -> Result<Vec<Job>> {
        self.transition(Transition::Retry, Selection::Group(group)).await
    }

    pub async fn retry_all(&self) -> Result<Vec<Job>> {
        self.transition(Transition::Retry, Selection::All).await
    }

    pub async fn cancel(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.cancel_ids(&[id]).await?.into_iter().next())
    }

    pub async fn cancel_ids(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        self.transition(Transition::Cancel, Selection::Ids(ids.to_vec())).await
    }

    pub async fn cancel_group(&self, group: i64) -> Result<Vec<Job>> {
        self.transition(Transition::Cancel, Selection::Group(group)).await
    }

    pub async fn cancel_all(&self) -> Result<Vec<Job>> {
        self.transition(Transition::Cancel, Selection::All).await
    }

    /// Removes the record and partial data; the destination file stays.
    pub async fn remove(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.remove_ids(&[id]).await?.into_iter().next())
    }

    pub async fn remove_ids(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        self.discard(Selection::Ids(ids.to_vec()), false).await
    }

    pub async fn remove_group(&self, group: i64) -> Result<Vec<Job>> {
        self.discard(Selection::Group(group), false).await
    }

    pub async fn remove_all(&self) -> Result<Vec<Job>> {
        self.discard(Selection::All, false).await
    }

    pub async fn remove_all_with_status(&self, status: Status) -> Result<Vec<Job>> {
        self.discard(Selection::Status(status), false).await
    }

    pub async fn remove_all_in_group_with_status(&self, group: i64, status: Status) -> Result<Vec<Job>> {
        self.discard(Selection::GroupStatus(group, status), false).await
    }

    /// Like [`remove`](Self::remove), and also deletes the destination file.
    pub async fn delete(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.delete_ids(&[id]).await?.into_iter().next())
    }

    pub async fn delete_ids(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        self.discard(Selection::Ids(ids.to_vec()), true).await
    }

    pub async fn delete_group(&self, group: i64) -> Result<Vec<Job>> {
        self.discard(Selection::Group(group), true).await
    }

    pub async fn delete_all(&self) -> Result<Vec<Job>> {
        self.discard(Selection::All, true).await
    }

    pub async fn delete_all_with_status(&self, status: Status) -> Result<Vec<Job>> {
        self.discard(Selection::Status(status), true).await
    }

    pub async fn delete_all_in_group_with_status(&self, group: i64, status: Status) -> Result<Vec<Job>> {
        self.discard(Selection::GroupStatus(group, status), true).await
    }

    /// Rewrites the mutable request fields. A running job is stopped and queued again.
    pub async fn update_request(&self, id: JobId, info: RequestInfo) -> Result<Option<Job>> {
        self.ensure_open()?;
        let was_running = self.orchestrator.cancel(id).await?;
        let updated = {
            let _gate = self.gate.lock().await;
            self.store
                .modify(id, |job| {
                    job.group = info.group;
                    job.priority = info.priority;
                    job.headers = info.headers;
                    job.network_type = info.network_type;
                    if job.status == Status::Downloading {
                        job.status = Status::Queued;
                    }
                    true
                })
                .await?
        };
        if let Some(job) = &updated {
            if was_running || job.status == Status::Queued {
                self.processor.notify();
            }
            self.announce(std::slice::from_ref(job));
        }
        Ok(updated)
    }

    /// Stops dispatching and every running worker; running jobs go back to QUEUED.
    pub async fn freeze(&self) -> Result<()> {
        self.ensure_open()?;
        self.processor.pause();
        // Let an in-flight queue pass finish before collecting workers.
        drop(self.gate.lock().await);
        let stopped = self.orchestrator.cancel_all().await?;
        let _gate = self.gate.lock().await;
        self.store.sanitize(true).await?;
        tracing::info!(stopped = stopped.len(), "frozen");
        Ok(())
    }

    pub async fn unfreeze(&self) -> Result<()> {
        self.ensure_open()?;
        {
            let _gate = self.gate.lock().await;
            self.store.sanitize(true).await?;
        }
        self.processor.resume();
        tracing::info!("unfrozen");
        Ok(())
    }

    pub async fn get_download(&self, id: JobId) -> Result<Option<Job>> {
        self.ensure_open()?;
        Ok(self.store.get(id).await?)
    }

    pub async fn get_downloads(&self) -> Result<Vec<Job>> {
        self.ensure_open()?;
        Ok(self.store.get_all().await?)
    }

    pub async fn get_downloads_by_ids(&self, ids: &[JobId]) -> Result<Vec<Option<Job>>> {
        self.ensure_open()?;
        Ok(self.store.get_many(ids).await?)
    }

    pub async fn get_downloads_in_group(&self, group: i64) -> Result<Vec<Job>> {
        self.ensure_open()?;
        Ok(self.store.get_by_group(group).await?)
    }

    pub async fn get_downloads_with_status(&self, status: Status) -> Result<Vec<Job>> {
        self.ensure_open()?;
        Ok(self.store.get_by_status(status).await?)
    }

    pub async fn get_downloads_in_group_with_status(&self, group: i64, status: Status) -> Result<Vec<Job>> {
        self.ensure_open()?;
        Ok(self.store.get_by_group_and_status(group, status).await?)
    }

    /// Whether a worker is currently running `id`.
    pub fn is_downloading(&self, id: JobId) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.orchestrator.contains(id)?)
    }

    pub fn active_download_count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.orchestrator.active_download_count()?)
    }

    pub fn add_listener(&self, listener: Arc<dyn DownloadListener>) -> Result<ListenerId> {
        self.ensure_open()?;
        Ok(self.listeners.add(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent. Running workers are terminated without waiting; their
    /// records stay DOWNLOADING until the next `open` sanitizes them.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listeners.clear();
        self.processor.stop();
        self.orchestrator.close();
        self.notifier.abort();
        self.lease.lock().unwrap_or_else(|e| e.into_inner()).take();
        tracing::info!(namespace = %self.namespace, "download manager closed");
    }
}

impl<S: JobStore> Drop for DownloadManager<S> {
    fn drop(&mut self) {
        self.close();
    }
}
