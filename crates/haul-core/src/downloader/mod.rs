//! Transfer strategies and the per-job file downloaders that drive them.
//!
//! A [`Downloader`] moves bytes for one URL scheme; a [`FileDownloader`] runs
//! one job to completion against a downloader, writing the destination file
//! and reporting through a [`DownloadDelegate`]. The orchestrator picks both.

mod error;
pub mod fileserver;
pub mod http;
mod parallel;
mod progress;
mod sequential;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::HaulConfig;
use crate::job::{ErrorCause, Job, JobId};

pub use error::TransferError;
pub use fileserver::{CatalogListing, FileServerDownloader};
pub use http::CurlDownloader;
pub use parallel::{plan_segments, ParallelFileDownloader, Segment};
pub use progress::ProgressMeter;
pub use sequential::SequentialFileDownloader;

/// How a job's bytes are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Sequential,
    /// Several ranged fetches into segment files, merged at the end.
    Chunked,
}

/// What a strategy needs to know about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub job_id: JobId,
    pub url: String,
    pub file: PathBuf,
    pub headers: Vec<(String, String)>,
}

impl TransferRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl From<&Job> for TransferRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            url: job.url.clone(),
            file: job.file.clone(),
            headers: job.headers.clone(),
        }
    }
}

/// Byte range `[start, end)`; `end: None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// True for the whole resource.
    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }
}

/// Remote metadata gathered before a chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteInfo {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
}

/// Receives the bytes of one fetch.
pub trait TransferSink {
    /// Called once before any body bytes. `range_honored` is false when the
    /// remote ignored the requested range and sends the resource from byte 0.
    /// Returning false aborts the fetch.
    fn begin(&mut self, content_length: Option<u64>, range_honored: bool) -> bool;

    /// Returning false aborts the fetch.
    fn write(&mut self, bytes: &[u8]) -> bool;

    /// Polled between reads so a stalled fetch still notices interruption.
    fn should_abort(&self) -> bool;
}

/// A transfer strategy. Implementations are shared by every worker.
pub trait Downloader: Send + Sync {
    /// Cheap, local decision; never touches the network.
    fn transfer_mode(&self, request: &TransferRequest) -> TransferMode;

    /// Working directory for this request's segments, when the strategy has its own.
    fn segment_dir(&self, _request: &TransferRequest) -> Option<PathBuf> {
        None
    }

    fn inspect(&self, request: &TransferRequest) -> Result<RemoteInfo, TransferError>;

    /// Streams `range` of the resource into `sink`. Returns the number of body bytes delivered.
    fn fetch(
        &self,
        request: &TransferRequest,
        range: ByteRange,
        sink: &mut dyn TransferSink,
    ) -> Result<u64, TransferError>;

    /// Releases network resources held by in-flight fetches and makes later fetches fail.
    fn close(&self) -> Result<(), TransferError>;
}

/// Worker callbacks. Called on the worker's thread, in order, before the
/// worker terminates.
pub trait DownloadDelegate: Send + Sync {
    fn on_started(&self, job: &Job, downloaded: u64, total: Option<u64>);
    fn on_progress(&self, job: &Job, eta_ms: Option<u64>, bytes_per_sec: u64);
    fn on_complete(&self, job: &Job);
    fn on_error(&self, job: &Job, cause: ErrorCause);
}

/// Cooperative interruption flag shared between a worker and the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken(Arc<AtomicBool>);

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handed to a file downloader when it runs.
#[derive(Clone)]
pub struct WorkerContext {
    pub interrupt: InterruptToken,
    pub delegate: Arc<dyn DownloadDelegate>,
}

/// Runs one job's transfer.
pub trait FileDownloader: Send {
    fn job(&self) -> &Job;

    /// Runs to completion, failure, or interruption. Reports through
    /// `ctx.delegate`; an interrupted run reports a final progress and neither
    /// completes nor errors.
    fn run(&mut self, ctx: &WorkerContext);
}

/// Knobs shared by the file downloaders.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub buffer_size: usize,
    pub progress_interval: Duration,
    pub segments: usize,
    /// Default working directory for partial segments.
    pub segment_root: PathBuf,
}

impl TransferSettings {
    pub fn from_config(cfg: &HaulConfig) -> Self {
        Self {
            buffer_size: cfg.buffer_size.max(1024),
            progress_interval: cfg.progress_interval(),
            segments: cfg.segments.max(1),
            segment_root: cfg.segment_root(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from_config(&HaulConfig::default())
    }
}

/// Segment files of one job live in `<root>/<job id>/`.
pub fn job_segment_dir(root: &std::path::Path, job_id: JobId) -> PathBuf {
    root.join(job_id.to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process strategy and delegate used by unit tests.

    use super::*;
    use std::sync::Mutex;

    /// Serves `body` from memory; optionally ignores ranges or pauses between chunks.
    pub struct MemoryDownloader {
        pub body: Vec<u8>,
        pub honor_ranges: bool,
        pub chunk: usize,
        pub delay: Duration,
        pub mode: TransferMode,
        pub fail_with: Option<u32>,
    }

    impl MemoryDownloader {
        pub fn new(body: Vec<u8>) -> Self {
            Self {
                body,
                honor_ranges: true,
                chunk: 1024,
                delay: Duration::ZERO,
                mode: TransferMode::Sequential,
                fail_with: None,
            }
        }
    }

    impl Downloader for MemoryDownloader {
        fn transfer_mode(&self, _request: &TransferRequest) -> TransferMode {
            self.mode
        }

        fn inspect(&self, _request: &TransferRequest) -> Result<RemoteInfo, TransferError> {
            Ok(RemoteInfo {
                content_length: Some(self.body.len() as u64),
                accept_ranges: self.honor_ranges,
            })
        }

        fn fetch(
            &self,
            _request: &TransferRequest,
            range: ByteRange,
            sink: &mut dyn TransferSink,
        ) -> Result<u64, TransferError> {
            if let Some(code) = self.fail_with {
                return Err(TransferError::Http(code));
            }
            let len = self.body.len() as u64;
            let (start, end) = if self.honor_ranges {
                (range.start.min(len), range.end.unwrap_or(len).min(len))
            } else {
                (0, len)
            };
            let honored = self.honor_ranges || range.is_full();
            if !sink.begin(Some(end - start), honored) {
                return Err(TransferError::Interrupted);
            }
            let mut sent = 0u64;
            for piece in self.body[start as usize..end as usize].chunks(self.chunk.max(1)) {
                if sink.should_abort() || !sink.write(piece) {
                    return Err(TransferError::Interrupted);
                }
                sent += piece.len() as u64;
                if !self.delay.is_zero() {
                    std::thread::sleep(self.delay);
                }
            }
            Ok(sent)
        }

        fn close(&self) -> Result<(), TransferError> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum Event {
        Started(u64, Option<u64>),
        Progress(u64),
        Complete(u64),
        Error(ErrorCause),
    }

    #[derive(Default)]
    pub struct RecordingDelegate {
        pub events: Mutex<Vec<Event>>,
    }

    impl RecordingDelegate {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn last(&self) -> Option<Event> {
            self.events.lock().unwrap().last().cloned()
        }
    }

    impl DownloadDelegate for RecordingDelegate {
        fn on_started(&self, _job: &Job, downloaded: u64, total: Option<u64>) {
            self.events.lock().unwrap().push(Event::Started(downloaded, total));
        }

        fn on_progress(&self, job: &Job, _eta_ms: Option<u64>, _bytes_per_sec: u64) {
            if let Some(t) = job.total {
                assert!(job.downloaded <= t, "progress past total");
            }
            self.events.lock().unwrap().push(Event::Progress(job.downloaded));
        }

        fn on_complete(&self, job: &Job) {
            self.events.lock().unwrap().push(Event::Complete(job.downloaded));
        }

        fn on_error(&self, _job: &Job, cause: ErrorCause) {
            self.events.lock().unwrap().push(Event::Error(cause));
        }
    }

    pub fn context(delegate: Arc<RecordingDelegate>) -> WorkerContext {
        WorkerContext {
            interrupt: InterruptToken::new(),
            delegate,
        }
    }
}
