pub mod config;
pub mod logging;

pub mod checksum;
pub mod downloader;
pub mod error;
pub mod fileserver;
pub mod job;
pub mod lifecycle;
pub mod namespace;
pub mod orchestrator;
pub mod protocol;
pub mod scheduler;
pub mod store;

pub use error::{HaulError, Result};
pub use job::{ErrorCause, Job, JobId, JobRequest, Priority, RequestInfo, Status};
pub use lifecycle::{DownloadListener, DownloadManager, EnqueueOption};
pub use namespace::NamespaceRegistry;
pub use orchestrator::{Orchestrator, OrchestratorClosed, Strategies};
