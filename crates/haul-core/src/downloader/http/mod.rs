//! General strategy: HTTP(S) and anything else libcurl speaks.

mod headers;

use std::cell::RefCell;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use curl::easy::{Easy, List};

use super::{
    ByteRange, Downloader, RemoteInfo, TransferError, TransferMode, TransferRequest, TransferSink,
};
use crate::config::HttpConfig;
use headers::parse_headers;

pub struct CurlDownloader {
    http: HttpConfig,
    segments: usize,
    closed: AtomicBool,
}

impl CurlDownloader {
    /// `segments > 1` makes every job a chunked candidate; the HEAD response decides.
    pub fn new(http: HttpConfig, segments: usize) -> Self {
        Self {
            http,
            segments,
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn easy(&self, request: &TransferRequest) -> Result<Easy, TransferError> {
        let mut easy = Easy::new();
        easy.url(&request.url)
            .map_err(|_| TransferError::InvalidUrl(request.url.clone()))?;
        easy.follow_location(true)?;
        easy.connect_timeout(Duration::from_secs(self.http.connect_timeout_secs))?;
        // Stall detection instead of a wall-clock cap, so large files on slow links survive.
        easy.low_speed_limit(self.http.low_speed_limit_bytes)?;
        easy.low_speed_time(Duration::from_secs(self.http.low_speed_time_secs))?;

        let mut list = List::new();
        for (k, v) in &request.headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))?;
        }
        if !request.headers.is_empty() {
            easy.http_headers(list)?;
        }
        Ok(easy)
    }
}

/// curl range syntax: `start-` or `start-(end-1)`.
fn curl_range(range: ByteRange) -> Option<String> {
    match range.end {
        _ if range.is_full() => None,
        Some(end) => Some(format!("{}-{}", range.start, end.saturating_sub(1))),
        None => Some(format!("{}-", range.start)),
    }
}

fn is_success(code: u32) -> bool {
    (200..300).contains(&code)
}

impl Downloader for CurlDownloader {
    fn transfer_mode(&self, _request: &TransferRequest) -> TransferMode {
        if self.segments > 1 {
            TransferMode::Chunked
        } else {
            TransferMode::Sequential
        }
    }

    /// HEAD request. Servers that refuse HEAD yield "unknown length, no ranges".
    fn inspect(&self, request: &TransferRequest) -> Result<RemoteInfo, TransferError> {
        if self.is_closed() {
            return Err(TransferError::Closed);
        }
        let mut lines: Vec<String> = Vec::new();
        let mut easy = self.easy(request)?;
        easy.nobody(true)?;
        {
            let mut transfer = easy.transfer();
            transfer.header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    lines.push(s.trim_end().to_string());
                }
                true
            })?;
            transfer.perform()?;
        }
        let code = easy.response_code()?;
        if !is_success(code) {
            tracing::debug!(url = %request.url, code, "HEAD refused; assuming no ranges");
            return Ok(RemoteInfo::default());
        }
        let head = parse_headers(&lines);
        Ok(RemoteInfo {
            content_length: head.content_length,
            accept_ranges: head.accept_ranges,
        })
    }

    fn fetch(
        &self,
        request: &TransferRequest,
        range: ByteRange,
        sink: &mut dyn TransferSink,
    ) -> Result<u64, TransferError> {
        if self.is_closed() {
            return Err(TransferError::Closed);
        }
        let mut easy = self.easy(request)?;
        easy.progress(true)?;
        if let Some(r) = curl_range(range) {
            easy.range(&r)?;
        }

        let lines: RefCell<Vec<String>> = RefCell::new(Vec::new());
        let sink = RefCell::new(sink);
        // None until the first body byte (or the end of an empty body).
        let status: RefCell<Option<u32>> = RefCell::new(None);
        let received = RefCell::new(0u64);
        let aborted = RefCell::new(false);

        let start_body = || -> bool {
            let head = parse_headers(&lines.borrow());
            let code = head.status.unwrap_or(200);
            *status.borrow_mut() = Some(code);
            if !is_success(code) {
                return true;
            }
            let honored = range.is_full() || code == 206 || head.range_start == Some(range.start);
            sink.borrow_mut().begin(head.content_length, honored)
        };

        let perform = {
            let mut transfer = easy.transfer();
            transfer.header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    lines.borrow_mut().push(s.trim_end().to_string());
                }
                true
            })?;
            transfer.write_function(|data| {
                if status.borrow().is_none() && !start_body() {
                    *aborted.borrow_mut() = true;
                    return Ok(0);
                }
                if !matches!(*status.borrow(), Some(c) if is_success(c)) {
                    // Error bodies are drained, not written.
                    return Ok(data.len());
                }
                if !sink.borrow_mut().write(data) {
                    *aborted.borrow_mut() = true;
                    return Ok(0);
                }
                *received.borrow_mut() += data.len() as u64;
                Ok(data.len())
            })?;
            transfer.progress_function(|_, _, _, _| {
                !(self.is_closed() || sink.borrow().should_abort())
            })?;
            transfer.perform()
        };

        if *aborted.borrow() {
            return Err(TransferError::Interrupted);
        }
        if let Err(e) = perform {
            if e.is_aborted_by_callback() {
                return Err(if self.is_closed() {
                    TransferError::Closed
                } else {
                    TransferError::Interrupted
                });
            }
            return Err(e.into());
        }
        let code = easy.response_code()?;
        if !is_success(code) {
            return Err(TransferError::Http(code));
        }
        if status.borrow().is_none() && !start_body() {
            return Err(TransferError::Interrupted);
        }
        let received = *received.borrow();
        Ok(received)
    }

    fn close(&self) -> Result<(), TransferError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
