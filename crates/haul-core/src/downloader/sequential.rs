//! One fetch straight into the destination file, resuming where the job left off.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::sync::Arc;

use super::progress::ProgressMeter;
use super::{
    ByteRange, Downloader, FileDownloader, TransferError, TransferRequest, TransferSettings,
    TransferSink, WorkerContext,
};
use crate::job::{ErrorCause, Job};

pub struct SequentialFileDownloader {
    job: Job,
    downloader: Arc<dyn Downloader>,
    settings: TransferSettings,
}

impl SequentialFileDownloader {
    pub fn new(job: Job, downloader: Arc<dyn Downloader>, settings: TransferSettings) -> Self {
        Self {
            job,
            downloader,
            settings,
        }
    }

    /// Bytes already in place: the recorded progress, if the file really holds it.
    fn resume_offset(&self) -> u64 {
        let on_disk = std::fs::metadata(&self.job.file).map(|m| m.len()).unwrap_or(0);
        if self.job.downloaded > 0 && on_disk >= self.job.downloaded {
            self.job.downloaded
        } else {
            0
        }
    }

    fn open_destination(&self, offset: u64) -> io::Result<File> {
        if let Some(parent) = self.job.file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.job.file)?;
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file)
    }
}

struct FileSink<'a> {
    file: BufWriter<File>,
    job: &'a mut Job,
    ctx: &'a WorkerContext,
    meter: ProgressMeter,
    written: u64,
    requested_from: u64,
    io_error: Option<io::Error>,
}

impl FileSink<'_> {
    fn report_progress(&mut self) {
        let total = self.job.total;
        self.job.record_progress(self.written, total);
        let eta = self.meter.eta_ms(self.written, total);
        let rate = self.meter.bytes_per_sec(self.written);
        self.ctx.delegate.on_progress(self.job, eta, rate);
    }

    fn restart_from_zero(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let f = self.file.get_mut();
        f.set_len(0)?;
        f.seek(SeekFrom::Start(0))?;
        self.written = 0;
        self.meter.rebase(0);
        Ok(())
    }
}

impl TransferSink for FileSink<'_> {
    fn begin(&mut self, content_length: Option<u64>, range_honored: bool) -> bool {
        if !range_honored && self.requested_from > 0 {
            tracing::debug!(job_id = self.job.id, "range ignored; restarting from zero");
            if let Err(e) = self.restart_from_zero() {
                self.io_error = Some(e);
                return false;
            }
        }
        let total = content_length.map(|len| self.written + len);
        self.job.record_progress(self.written, total);
        self.ctx
            .delegate
            .on_started(self.job, self.written, self.job.total);
        !self.ctx.interrupt.is_interrupted()
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        if let Some(total) = self.job.total {
            if self.written + bytes.len() as u64 > total {
                self.io_error = Some(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "remote sent more than announced",
                ));
                return false;
            }
        }
        if let Err(e) = self.file.write_all(bytes) {
            self.io_error = Some(e);
            return false;
        }
        self.written += bytes.len() as u64;
        if self.meter.due() {
            self.report_progress();
        }
        !self.ctx.interrupt.is_interrupted()
    }

    fn should_abort(&self) -> bool {
        self.ctx.interrupt.is_interrupted()
    }
}

impl FileDownloader for SequentialFileDownloader {
    fn job(&self) -> &Job {
        &self.job
    }

    fn run(&mut self, ctx: &WorkerContext) {
        let request = TransferRequest::from(&self.job);
        let offset = self.resume_offset();

        if offset > 0 && self.job.total == Some(offset) {
            ctx.delegate.on_started(&self.job, offset, Some(offset));
            ctx.delegate.on_complete(&self.job);
            return;
        }

        let file = match self.open_destination(offset) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(job_id = self.job.id, file = %self.job.file.display(), "open destination: {}", e);
                ctx.delegate.on_error(&self.job, ErrorCause::Storage);
                return;
            }
        };
        let downloader = Arc::clone(&self.downloader);
        let mut sink = FileSink {
            file: BufWriter::with_capacity(self.settings.buffer_size, file),
            job: &mut self.job,
            ctx,
            meter: ProgressMeter::new(offset, self.settings.progress_interval),
            written: offset,
            requested_from: offset,
            io_error: None,
        };

        let result = downloader.fetch(&request, ByteRange::starting_at(offset), &mut sink);
        let flushed = sink.file.flush();
        let io_error = sink.io_error.take().or(flushed.err());
        let written = sink.written;
        let total = sink.job.total;
        sink.job.record_progress(written, total);

        if ctx.interrupt.is_interrupted() {
            sink.report_progress();
            return;
        }
        drop(sink);
        if let Some(e) = io_error {
            tracing::warn!(job_id = self.job.id, "write destination: {}", e);
            ctx.delegate.on_error(&self.job, ErrorCause::Storage);
            return;
        }
        match result {
            Ok(_) => match total {
                Some(t) if t != written => {
                    let err = TransferError::Incomplete {
                        expected: t,
                        received: written,
                    };
                    tracing::warn!(job_id = self.job.id, "{}", err);
                    ctx.delegate.on_error(&self.job, err.cause());
                }
                _ => {
                    self.job.record_progress(written, Some(written));
                    ctx.delegate.on_complete(&self.job);
                }
            },
            Err(e) => {
                tracing::warn!(job_id = self.job.id, url = %self.job.url, "transfer failed: {}", e);
                ctx.delegate.on_error(&self.job, e.cause());
            }
        }
    }
}
