//! Chunked transfer: N ranged fetches into segment files, merged on success.
//!
//! Segment `i` of job `id` lives at `<segment dir>/<id>/<i>.seg`. A segment
//! file's length is its progress, so an interrupted job resumes each segment
//! where it stopped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::progress::ProgressMeter;
use super::sequential::SequentialFileDownloader;
use super::{
    job_segment_dir, ByteRange, Downloader, FileDownloader, InterruptToken, TransferError,
    TransferRequest, TransferSettings, TransferSink, WorkerContext,
};
use crate::job::{ErrorCause, Job};

/// A single segment: byte range [start, end) (half-open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `total_size` into `segment_count` near-equal segments; earlier
/// segments take the remainder. Empty if either argument is 0.
pub fn plan_segments(total_size: u64, segment_count: usize) -> Vec<Segment> {
    if total_size == 0 || segment_count == 0 {
        return Vec::new();
    }
    let segment_count = (segment_count as u64).min(total_size);
    let base = total_size / segment_count;
    let remainder = total_size % segment_count;

    let mut out = Vec::with_capacity(segment_count as usize);
    let mut offset = 0u64;
    for i in 0..segment_count {
        let len = base + u64::from(i < remainder);
        out.push(Segment {
            start: offset,
            end: offset + len,
        });
        offset += len;
    }
    out
}

const POLL: Duration = Duration::from_millis(50);

pub struct ParallelFileDownloader {
    job: Job,
    downloader: Arc<dyn Downloader>,
    settings: TransferSettings,
    segment_root: PathBuf,
}

impl ParallelFileDownloader {
    /// `segment_root` is the shared working directory; this job's segments go in a subdirectory.
    pub fn new(
        job: Job,
        downloader: Arc<dyn Downloader>,
        settings: TransferSettings,
        segment_root: PathBuf,
    ) -> Self {
        Self {
            job,
            downloader,
            settings,
            segment_root,
        }
    }

    fn fall_back(&mut self, ctx: &WorkerContext) {
        let mut sequential = SequentialFileDownloader::new(
            self.job.clone(),
            Arc::clone(&self.downloader),
            self.settings.clone(),
        );
        sequential.run(ctx);
    }

    fn report_progress(&mut self, ctx: &WorkerContext, meter: &ProgressMeter, done: u64) {
        let total = self.job.total;
        self.job.record_progress(done, total);
        ctx.delegate
            .on_progress(&self.job, meter.eta_ms(done, total), meter.bytes_per_sec(done));
    }
}

struct SegmentSink<'a> {
    file: BufWriter<File>,
    remaining: u64,
    counter: &'a AtomicU64,
    interrupt: &'a InterruptToken,
    io_error: Option<io::Error>,
    range_ignored: bool,
}

impl TransferSink for SegmentSink<'_> {
    fn begin(&mut self, _content_length: Option<u64>, range_honored: bool) -> bool {
        if !range_honored {
            self.range_ignored = true;
            return false;
        }
        !self.interrupt.is_interrupted()
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        let take = (bytes.len() as u64).min(self.remaining) as usize;
        if let Err(e) = self.file.write_all(&bytes[..take]) {
            self.io_error = Some(e);
            return false;
        }
        self.remaining -= take as u64;
        self.counter.fetch_add(take as u64, Ordering::Relaxed);
        take == bytes.len() && !self.interrupt.is_interrupted()
    }

    fn should_abort(&self) -> bool {
        self.interrupt.is_interrupted()
    }
}

fn segment_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{index}.seg"))
}

/// Bytes of `segment` already on disk at `path`, trimming any overshoot.
fn segment_progress(path: &Path, segment: &Segment) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(m) if m.len() > segment.len() => {
            OpenOptions::new().write(true).open(path)?.set_len(segment.len())?;
            Ok(segment.len())
        }
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

fn fetch_segment(
    downloader: &dyn Downloader,
    request: &TransferRequest,
    path: &Path,
    segment: Segment,
    have: u64,
    buffer_size: usize,
    counter: &AtomicU64,
    interrupt: &InterruptToken,
) -> Result<(), TransferError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut sink = SegmentSink {
        file: BufWriter::with_capacity(buffer_size, file),
        remaining: segment.len() - have,
        counter,
        interrupt,
        io_error: None,
        range_ignored: false,
    };
    let range = ByteRange::bounded(segment.start + have, segment.end);
    let result = downloader.fetch(request, range, &mut sink);
    sink.file.flush()?;
    if let Some(e) = sink.io_error.take() {
        return Err(e.into());
    }
    if sink.range_ignored {
        return Err(TransferError::RangeIgnored);
    }
    result?;
    if sink.remaining > 0 {
        return Err(TransferError::Incomplete {
            expected: segment.len(),
            received: segment.len() - sink.remaining,
        });
    }
    Ok(())
}

fn merge_segments(dir: &Path, count: usize, dest: &Path) -> io::Result<u64> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut out = BufWriter::new(File::create(dest)?);
    let mut written = 0u64;
    for i in 0..count {
        let mut part = File::open(segment_path(dir, i))?;
        written += io::copy(&mut part, &mut out)?;
    }
    out.flush()?;
    Ok(written)
}

impl FileDownloader for ParallelFileDownloader {
    fn job(&self) -> &Job {
        &self.job
    }

    fn run(&mut self, ctx: &WorkerContext) {
        let request = TransferRequest::from(&self.job);
        let info = match self.downloader.inspect(&request) {
            Ok(p) => p,
            Err(e) => {
                if ctx.interrupt.is_interrupted() {
                    ctx.delegate.on_progress(&self.job, None, 0);
                } else {
                    tracing::warn!(job_id = self.job.id, url = %self.job.url, "length lookup failed: {}", e);
                    ctx.delegate.on_error(&self.job, e.cause());
                }
                return;
            }
        };
        let total = match info.content_length {
            Some(len) if len > 0 && info.accept_ranges && self.settings.segments > 1 => len,
            _ => {
                tracing::debug!(job_id = self.job.id, "no usable ranges; sequential transfer");
                return self.fall_back(ctx);
            }
        };

        let dir = job_segment_dir(&self.segment_root, self.job.id);
        let plan = plan_segments(total, self.settings.segments);
        let prepared: io::Result<Vec<u64>> = fs::create_dir_all(&dir).and_then(|_| {
            plan.iter()
                .enumerate()
                .map(|(i, s)| segment_progress(&segment_path(&dir, i), s))
                .collect()
        });
        let have = match prepared {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(job_id = self.job.id, dir = %dir.display(), "segment dir: {}", e);
                ctx.delegate.on_error(&self.job, ErrorCause::Storage);
                return;
            }
        };
        let resumed: u64 = have.iter().sum();
        self.job.record_progress(resumed, Some(total));
        ctx.delegate.on_started(&self.job, resumed, Some(total));

        let counter = AtomicU64::new(resumed);
        let mut meter = ProgressMeter::new(resumed, self.settings.progress_interval);
        let downloader = Arc::clone(&self.downloader);
        let buffer_size = self.settings.buffer_size;

        let results: Vec<Result<(), TransferError>> = thread::scope(|scope| {
            let handles: Vec<_> = plan
                .iter()
                .zip(&have)
                .enumerate()
                .filter(|(_, (s, h))| **h < s.len())
                .map(|(i, (segment, h))| {
                    let path = segment_path(&dir, i);
                    let (downloader, request, counter) = (&downloader, &request, &counter);
                    let interrupt = &ctx.interrupt;
                    let (segment, h) = (*segment, *h);
                    scope.spawn(move || {
                        fetch_segment(
                            downloader.as_ref(),
                            request,
                            &path,
                            segment,
                            h,
                            buffer_size,
                            counter,
                            interrupt,
                        )
                    })
                })
                .collect();

            while !handles.iter().all(|h| h.is_finished()) {
                thread::sleep(POLL.min(self.settings.progress_interval.max(Duration::from_millis(1))));
                if meter.due() {
                    self.report_progress(ctx, &meter, counter.load(Ordering::Relaxed));
                }
            }
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(TransferError::Io(io::Error::other("segment thread panicked"))))
                })
                .collect()
        });

        let done = counter.load(Ordering::Relaxed);
        if ctx.interrupt.is_interrupted() {
            self.report_progress(ctx, &meter, done);
            return;
        }
        if let Some(err) = results.into_iter().find_map(Result::err) {
            tracing::warn!(job_id = self.job.id, url = %self.job.url, "segment failed: {}", err);
            self.job.record_progress(done, Some(total));
            ctx.delegate.on_error(&self.job, err.cause());
            return;
        }

        match merge_segments(&dir, plan.len(), &self.job.file) {
            Ok(merged) if merged == total => {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    tracing::warn!(dir = %dir.display(), "remove segment dir: {}", e);
                }
                self.job.record_progress(total, Some(total));
                ctx.delegate.on_complete(&self.job);
            }
            Ok(merged) => {
                let err = TransferError::Incomplete {
                    expected: total,
                    received: merged,
                };
                tracing::warn!(job_id = self.job.id, "{}", err);
                ctx.delegate.on_error(&self.job, err.cause());
            }
            Err(e) => {
                tracing::warn!(job_id = self.job.id, file = %self.job.file.display(), "merge segments: {}", e);
                ctx.delegate.on_error(&self.job, ErrorCause::Storage);
            }
        }
    }
}
