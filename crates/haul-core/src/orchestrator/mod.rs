//! Bounded download orchestrator.
//!
//! Maps job id to the worker running it, enforces the concurrency limit and
//! dispatches workers on a fixed thread pool. Every operation checks the
//! closed flag first; after [`Orchestrator::close`] all of them fail with
//! [`OrchestratorClosed`].
//!
//! Cancellation is cooperative: the worker's interrupt token is raised and
//! the caller awaits the worker's [`TerminationSignal`].

mod pool;
mod worker;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::config::HaulConfig;
use crate::downloader::{
    job_segment_dir, CurlDownloader, DownloadDelegate, Downloader, FileDownloader,
    FileServerDownloader, InterruptToken, ParallelFileDownloader, SequentialFileDownloader,
    TransferMode, TransferRequest, TransferSettings, WorkerContext,
};
use crate::fileserver::is_file_server_url;
use crate::job::{ErrorCause, Job, JobId};

use pool::WorkerPool;
pub use worker::TerminationSignal;
use worker::WorkerRecord;

/// An operation ran after [`Orchestrator::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("orchestrator is closed")]
pub struct OrchestratorClosed;

/// The strategies a job can be resolved to.
#[derive(Clone)]
pub struct Strategies {
    pub general: Arc<dyn Downloader>,
    /// Handles `haulfs://` URLs. Without it those jobs fail with `StrategyUnavailable`.
    pub file_server: Option<Arc<dyn Downloader>>,
}

impl Strategies {
    pub fn new(general: Arc<dyn Downloader>) -> Self {
        Self {
            general,
            file_server: None,
        }
    }

    pub fn with_file_server(mut self, file_server: Arc<dyn Downloader>) -> Self {
        self.file_server = Some(file_server);
        self
    }

    /// curl for everything, plus the file-server strategy when enabled.
    pub fn from_config(cfg: &HaulConfig) -> Self {
        let general = Arc::new(CurlDownloader::new(cfg.http.clone(), cfg.segments));
        let strategies = Self::new(general);
        if cfg.file_server.enabled {
            strategies.with_file_server(Arc::new(FileServerDownloader::new(
                cfg.file_server.clone(),
                cfg.buffer_size,
            )))
        } else {
            strategies
        }
    }

    fn resolve(&self, url: &str) -> Option<&Arc<dyn Downloader>> {
        if is_file_server_url(url) {
            self.file_server.as_ref()
        } else {
            Some(&self.general)
        }
    }

    /// Best effort; failures are logged.
    fn close_all(&self) {
        let all = std::iter::once(&self.general).chain(self.file_server.as_ref());
        for downloader in all {
            if let Err(e) = downloader.close() {
                tracing::warn!(error = %e, "closing transfer strategy failed");
            }
        }
    }
}

/// What [`Orchestrator::try_start`] did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    AtCapacity,
    /// No strategy handles the URL. The delegate receives `on_error` with this cause.
    Unresolvable(ErrorCause),
}

#[derive(Default)]
struct State {
    workers: HashMap<JobId, WorkerRecord>,
    active: usize,
    closed: bool,
    next_seq: u64,
}

impl State {
    /// Removes the worker only if it is still the run identified by `seq`.
    fn deregister(&mut self, id: JobId, seq: u64) -> bool {
        if self.workers.get(&id).map(|w| w.seq) == Some(seq) {
            self.workers.remove(&id);
            self.active = self.active.saturating_sub(1);
            true
        } else {
            false
        }
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Deregisters a finished worker and raises its termination signal, even if it panicked.
struct WorkerExit {
    shared: Arc<Shared>,
    id: JobId,
    seq: u64,
    terminated: TerminationSignal,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        self.shared.lock().deregister(self.id, self.seq);
        self.terminated.confirm();
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    pool: WorkerPool,
    limit: usize,
    strategies: Strategies,
    settings: TransferSettings,
}

impl Orchestrator {
    /// Spawns `concurrency_limit` worker threads.
    pub fn new(
        concurrency_limit: usize,
        strategies: Strategies,
        settings: TransferSettings,
    ) -> std::io::Result<Self> {
        let limit = concurrency_limit.max(1);
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
            }),
            pool: WorkerPool::new(limit, "haul-worker")?,
            limit,
            strategies,
            settings,
        })
    }

    fn open_state(&self) -> Result<MutexGuard<'_, State>, OrchestratorClosed> {
        let state = self.shared.lock();
        if state.closed {
            return Err(OrchestratorClosed);
        }
        Ok(state)
    }

    pub fn concurrency_limit(&self) -> usize {
        self.limit
    }

    /// Starts `job` unless it is already running or the limit is reached.
    pub fn start(
        &self,
        job: &Job,
        delegate: Arc<dyn DownloadDelegate>,
    ) -> Result<bool, OrchestratorClosed> {
        Ok(self.try_start(job, delegate)? == StartOutcome::Started)
    }

    /// Like [`start`](Self::start) but says why a job was not started.
    pub fn try_start(
        &self,
        job: &Job,
        delegate: Arc<dyn DownloadDelegate>,
    ) -> Result<StartOutcome, OrchestratorClosed> {
        let mut state = self.open_state()?;
        if state.workers.contains_key(&job.id) {
            tracing::debug!(job_id = job.id, "already running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        if state.active >= self.limit {
            tracing::debug!(job_id = job.id, active = state.active, "queue full");
            return Ok(StartOutcome::AtCapacity);
        }
        let Some(downloader) = self.strategies.resolve(&job.url) else {
            drop(state);
            let cause = ErrorCause::StrategyUnavailable;
            tracing::warn!(job_id = job.id, url = %job.url, "no transfer strategy for url");
            // Callers may hold locks the delegate needs; report from elsewhere.
            let job = job.clone();
            thread::spawn(move || delegate.on_error(&job, cause));
            return Ok(StartOutcome::Unresolvable(cause));
        };
        let mut file_downloader = self.file_downloader(job.clone(), Arc::clone(downloader));

        let seq = state.next_seq;
        state.next_seq += 1;
        let interrupt = InterruptToken::new();
        let terminated = TerminationSignal::new();
        state.workers.insert(
            job.id,
            WorkerRecord {
                seq,
                job: job.clone(),
                interrupt: interrupt.clone(),
                terminated: terminated.clone(),
            },
        );
        state.active += 1;

        let shared = Arc::clone(&self.shared);
        let id = job.id;
        let ctx = WorkerContext {
            interrupt,
            delegate,
        };
        // The exit guard is built inside the task so an undelivered task never touches the lock.
        let task = Box::new(move || {
            let _exit = WorkerExit {
                shared,
                id,
                seq,
                terminated,
            };
            let run = panic::catch_unwind(AssertUnwindSafe(|| file_downloader.run(&ctx)));
            if run.is_err() {
                let job = file_downloader.job();
                tracing::warn!(job_id = job.id, "worker panicked");
                if !ctx.interrupt.is_interrupted() {
                    ctx.delegate.on_error(job, ErrorCause::Unknown);
                }
            }
        });
        if let Err(e) = self.pool.execute(task) {
            state.deregister(job.id, seq);
            return Err(e);
        }
        tracing::debug!(job_id = job.id, active = state.active, "worker dispatched");
        Ok(StartOutcome::Started)
    }

    fn file_downloader(&self, job: Job, downloader: Arc<dyn Downloader>) -> Box<dyn FileDownloader> {
        let request = TransferRequest::from(&job);
        match downloader.transfer_mode(&request) {
            TransferMode::Sequential => Box::new(SequentialFileDownloader::new(
                job,
                downloader,
                self.settings.clone(),
            )),
            TransferMode::Chunked => {
                let root = downloader
                    .segment_dir(&request)
                    .unwrap_or_else(|| self.settings.segment_root.clone());
                Box::new(ParallelFileDownloader::new(
                    job,
                    downloader,
                    self.settings.clone(),
                    root,
                ))
            }
        }
    }

    /// Where `job`'s partial segments would live.
    pub(crate) fn segment_dir(&self, job: &Job) -> PathBuf {
        let request = TransferRequest::from(job);
        let root = self
            .strategies
            .resolve(&job.url)
            .and_then(|d| d.segment_dir(&request))
            .unwrap_or_else(|| self.settings.segment_root.clone());
        job_segment_dir(&root, job.id)
    }

    /// Interrupts `id` and waits for its worker to stop. `Ok(false)` if it was not running.
    pub async fn cancel(&self, id: JobId) -> Result<bool, OrchestratorClosed> {
        let (seq, terminated) = {
            let state = self.open_state()?;
            let Some(worker) = state.workers.get(&id) else {
                return Ok(false);
            };
            worker.interrupt.interrupt();
            (worker.seq, worker.terminated.clone())
        };
        terminated.wait().await;
        self.shared.lock().deregister(id, seq);
        tracing::debug!(job_id = id, "worker cancelled");
        Ok(true)
    }

    /// Cancels every running worker. Returns the ids that were running.
    pub async fn cancel_all(&self) -> Result<Vec<JobId>, OrchestratorClosed> {
        let running: Vec<(JobId, u64, TerminationSignal)> = {
            let state = self.open_state()?;
            state
                .workers
                .iter()
                .map(|(id, w)| {
                    w.interrupt.interrupt();
                    (*id, w.seq, w.terminated.clone())
                })
                .collect()
        };
        for (_, _, terminated) in &running {
            terminated.wait().await;
        }
        let mut state = self.shared.lock();
        for (id, seq, _) in &running {
            state.deregister(*id, *seq);
        }
        Ok(running.into_iter().map(|(id, _, _)| id).collect())
    }

    /// Drops every worker without waiting and releases the strategies' network resources.
    pub fn terminate_all_downloads(&self) -> Result<(), OrchestratorClosed> {
        drop(self.open_state()?);
        self.terminate_workers();
        Ok(())
    }

    fn terminate_workers(&self) {
        let drained: Vec<WorkerRecord> = {
            let mut state = self.shared.lock();
            state.active = 0;
            state.workers.drain().map(|(_, w)| w).collect()
        };
        for worker in &drained {
            worker.interrupt.interrupt();
            worker.terminated.confirm();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "terminated running downloads");
        }
        self.strategies.close_all();
    }

    /// Idempotent. Terminates all workers and stops the pool.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.terminate_workers();
        self.pool.shutdown();
        tracing::debug!("orchestrator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn contains(&self, id: JobId) -> Result<bool, OrchestratorClosed> {
        Ok(self.open_state()?.workers.contains_key(&id))
    }

    pub fn active_download_count(&self) -> Result<usize, OrchestratorClosed> {
        Ok(self.open_state()?.active)
    }

    pub fn can_accommodate_new_download(&self) -> Result<bool, OrchestratorClosed> {
        Ok(self.open_state()?.active < self.limit)
    }

    /// Snapshots of the jobs as they were when their workers started.
    pub fn downloads(&self) -> Result<Vec<Job>, OrchestratorClosed> {
        let state = self.open_state()?;
        let mut jobs: Vec<Job> = state.workers.values().map(|w| w.job.clone()).collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{Event, MemoryDownloader, RecordingDelegate};
    use crate::job::JobRequest;
    use std::time::{Duration, Instant};

    fn slow_strategy(len: usize) -> Strategies {
        let mut d = MemoryDownloader::new(vec![1u8; len]);
        d.chunk = 64;
        d.delay = Duration::from_millis(10);
        Strategies::new(Arc::new(d))
    }

    fn settings(dir: &std::path::Path) -> TransferSettings {
        TransferSettings {
            buffer_size: 1024,
            progress_interval: Duration::from_millis(20),
            segments: 1,
            segment_root: dir.join("segments"),
        }
    }

    fn job(dir: &std::path::Path, name: &str) -> Job {
        Job::from_request(
            JobRequest::new(format!("https://example.test/{name}"), dir.join(name)),
            "test",
        )
    }

    fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        f()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(2, slow_strategy(64 * 1024), settings(dir.path())).unwrap();
        let delegate = Arc::new(RecordingDelegate::default());
        let j = job(dir.path(), "a.bin");

        assert!(orch.start(&j, delegate.clone()).unwrap());
        assert_eq!(
            orch.try_start(&j, delegate.clone()).unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert_eq!(orch.active_download_count().unwrap(), 1);
        assert_eq!(orch.downloads().unwrap().len(), 1);

        assert!(orch.cancel(j.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(1, slow_strategy(64 * 1024), settings(dir.path())).unwrap();
        let delegate = Arc::new(RecordingDelegate::default());
        let a = job(dir.path(), "a.bin");
        let b = job(dir.path(), "b.bin");

        assert!(orch.start(&a, delegate.clone()).unwrap());
        assert!(!orch.can_accommodate_new_download().unwrap());
        assert_eq!(orch.try_start(&b, delegate.clone()).unwrap(), StartOutcome::AtCapacity);
        assert!(!orch.contains(b.id).unwrap());

        orch.cancel_all().await.unwrap();
        assert_eq!(orch.active_download_count().unwrap(), 0);
        assert!(orch.start(&b, delegate.clone()).unwrap());
        orch.cancel(b.id).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_waits_for_termination() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(1, slow_strategy(256 * 1024), settings(dir.path())).unwrap();
        let delegate = Arc::new(RecordingDelegate::default());
        let j = job(dir.path(), "a.bin");

        assert!(orch.start(&j, delegate.clone()).unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orch.cancel(j.id).await.unwrap());

        assert!(!orch.contains(j.id).unwrap());
        assert_eq!(orch.active_download_count().unwrap(), 0);
        let events = delegate.events();
        assert!(!events.iter().any(|e| matches!(e, Event::Complete(_) | Event::Error(_))));
        assert!(matches!(delegate.last(), Some(Event::Progress(_))));

        assert!(!orch.cancel(j.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finished_worker_deregisters_itself() {
        let dir = tempfile::tempdir().unwrap();
        let strategies = Strategies::new(Arc::new(MemoryDownloader::new(b"hello".to_vec())));
        let orch = Orchestrator::new(1, strategies, settings(dir.path())).unwrap();
        let delegate = Arc::new(RecordingDelegate::default());
        let j = job(dir.path(), "a.bin");

        assert!(orch.start(&j, delegate.clone()).unwrap());
        assert!(wait_until(Duration::from_secs(5), || !orch.contains(j.id).unwrap()));
        assert_eq!(delegate.last(), Some(Event::Complete(5)));
        assert_eq!(std::fs::read(&j.file).unwrap(), b"hello");
        assert_eq!(orch.active_download_count().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_server_url_without_strategy_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(1, slow_strategy(16), settings(dir.path())).unwrap();
        let delegate = Arc::new(RecordingDelegate::default());
        let j = Job::from_request(
            JobRequest::new("haulfs://127.0.0.1:9/42", dir.path().join("x.bin")),
            "test",
        );

        assert_eq!(
            orch.try_start(&j, delegate.clone()).unwrap(),
            StartOutcome::Unresolvable(ErrorCause::StrategyUnavailable)
        );
        assert!(!orch.contains(j.id).unwrap());
        assert!(wait_until(Duration::from_secs(5), || {
            delegate.last() == Some(Event::Error(ErrorCause::StrategyUnavailable))
        }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn everything_fails_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(1, slow_strategy(64 * 1024), settings(dir.path())).unwrap();
        let delegate = Arc::new(RecordingDelegate::default());
        let j = job(dir.path(), "a.bin");
        orch.start(&j, delegate.clone()).unwrap();

        orch.close();
        orch.close();
        assert!(orch.is_closed());
        assert_eq!(orch.start(&j, delegate.clone()), Err(OrchestratorClosed));
        assert_eq!(orch.cancel(j.id).await, Err(OrchestratorClosed));
        assert!(orch.cancel_all().await.is_err());
        assert!(orch.terminate_all_downloads().is_err());
        assert!(orch.contains(j.id).is_err());
        assert!(orch.active_download_count().is_err());
        assert!(orch.can_accommodate_new_download().is_err());
        assert!(orch.downloads().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminate_all_clears_workers_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(2, slow_strategy(256 * 1024), settings(dir.path())).unwrap();
        let delegate = Arc::new(RecordingDelegate::default());
        let a = job(dir.path(), "a.bin");
        let b = job(dir.path(), "b.bin");
        orch.start(&a, delegate.clone()).unwrap();
        orch.start(&b, delegate.clone()).unwrap();

        orch.terminate_all_downloads().unwrap();
        assert_eq!(orch.active_download_count().unwrap(), 0);
        assert!(orch.downloads().unwrap().is_empty());
    }
}
