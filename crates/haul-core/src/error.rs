//! Errors surfaced by the public façade.

use crate::job::JobId;
use crate::orchestrator::OrchestratorClosed;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum HaulError {
    /// An orchestrator operation ran after `close`.
    #[error(transparent)]
    OrchestratorClosed(#[from] OrchestratorClosed),
    /// Another live manager already owns this namespace.
    #[error("namespace `{0}` already has an active manager")]
    NamespaceInUse(String),
    /// A single enqueue collided with an existing id and no policy replaced it.
    #[error("job {0} is already enqueued")]
    AlreadyEnqueued(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Spawning worker threads or touching the segment directory failed.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = HaulError> = std::result::Result<T, E>;
