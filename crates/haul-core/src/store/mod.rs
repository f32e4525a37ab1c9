//! Persistence collaborator: a CRUD store of job records keyed by id.
//!
//! The store is the single source of truth for job state. Two
//! implementations ship: [`MemoryStore`] and the SQLite-backed [`SqliteStore`].

mod memory;
mod sqlite;

use std::future::Future;
use std::path::Path;

use crate::job::{Job, JobId, Status};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Job persistence used by the lifecycle manager, the queue processor, and
/// the worker delegate. Implementations are cheap to clone and share one
/// underlying store.
pub trait JobStore: Clone + Send + Sync + 'static {
    /// Inserts a new record; `Ok(false)` if the id already exists.
    fn insert(&self, job: &Job) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Inserts each record, reporting per-record success.
    fn insert_batch(&self, jobs: &[Job]) -> impl Future<Output = StoreResult<Vec<(Job, bool)>>> + Send;

    fn get(&self, id: JobId) -> impl Future<Output = StoreResult<Option<Job>>> + Send;

    /// One slot per requested id, in request order.
    fn get_many(&self, ids: &[JobId]) -> impl Future<Output = StoreResult<Vec<Option<Job>>>> + Send;

    fn get_all(&self) -> impl Future<Output = StoreResult<Vec<Job>>> + Send;

    fn get_by_file(&self, file: &Path) -> impl Future<Output = StoreResult<Option<Job>>> + Send;

    fn get_by_group(&self, group: i64) -> impl Future<Output = StoreResult<Vec<Job>>> + Send;

    fn get_by_status(&self, status: Status) -> impl Future<Output = StoreResult<Vec<Job>>> + Send;

    fn get_by_group_and_status(
        &self,
        group: i64,
        status: Status,
    ) -> impl Future<Output = StoreResult<Vec<Job>>> + Send;

    fn update(&self, job: &Job) -> impl Future<Output = StoreResult<()>> + Send;

    /// Writes every record or none.
    fn update_batch(&self, jobs: &[Job]) -> impl Future<Output = StoreResult<()>> + Send;

    fn delete(&self, job: &Job) -> impl Future<Output = StoreResult<()>> + Send;

    /// Deletes every record or none.
    fn delete_batch(&self, jobs: &[Job]) -> impl Future<Output = StoreResult<()>> + Send;

    fn delete_all(&self) -> impl Future<Output = StoreResult<()>> + Send;

    /// Atomically reads record `id`, lets `f` edit it, and writes it back when
    /// `f` returns true. Returns the written record, or `None` if the record is
    /// absent or `f` declined.
    fn modify<F>(&self, id: JobId, f: F) -> impl Future<Output = StoreResult<Option<Job>>> + Send
    where
        F: FnOnce(&mut Job) -> bool + Send;

    /// Reconciles records left inconsistent by an unclean shutdown. With
    /// `initializing`, DOWNLOADING records go back to QUEUED. Returns the
    /// number of records touched.
    fn sanitize(&self, initializing: bool) -> impl Future<Output = StoreResult<u64>> + Send;
}

/// The repair `sanitize` applies to one record; shared by both stores.
pub(crate) fn sanitize_record(job: &mut Job, initializing: bool) -> bool {
    let mut touched = false;
    if initializing && job.status == Status::Downloading {
        job.status = Status::Queued;
        touched = true;
    }
    if job.status == Status::Completed && job.total.is_none() && job.downloaded > 0 {
        job.total = Some(job.downloaded);
        touched = true;
    }
    touched
}
