//! Strategy for `haulfs://` URLs: ranged FILE requests over the content-file protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;

use super::{
    ByteRange, Downloader, RemoteInfo, TransferError, TransferMode, TransferRequest, TransferSink,
};
use crate::checksum::StreamHasher;
use crate::config::FileServerConfig;
use crate::fileserver::{parse_file_server_url, FileServerAddress};
use crate::protocol::{ContentFileRequest, ContentTransporter};

/// Job headers copied into every request.
pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const CLIENT_HEADER: &str = "Client";
pub const CUSTOM_DATA_HEADER: &str = "Custom-Data";

pub struct FileServerDownloader {
    config: FileServerConfig,
    buffer_size: usize,
    closed: AtomicBool,
    next_conn: AtomicU64,
    live: Mutex<HashMap<u64, Arc<ContentTransporter>>>,
}

/// Deregisters a live connection and closes it.
struct LiveConnection<'a> {
    owner: &'a FileServerDownloader,
    id: u64,
    transporter: Arc<ContentTransporter>,
}

impl Drop for LiveConnection<'_> {
    fn drop(&mut self) {
        self.transporter.close();
        self.owner
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// One entry of a server's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogListing {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub length: u64,
}

impl FileServerDownloader {
    pub fn new(config: FileServerConfig, buffer_size: usize) -> Self {
        Self {
            config,
            buffer_size: buffer_size.max(1024),
            closed: AtomicBool::new(false),
            next_conn: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn address(request: &TransferRequest) -> Result<FileServerAddress, TransferError> {
        parse_file_server_url(&request.url).ok_or_else(|| TransferError::InvalidUrl(request.url.clone()))
    }

    fn open(&self, authority: &str) -> Result<LiveConnection<'_>, TransferError> {
        if self.is_closed() {
            return Err(TransferError::Closed);
        }
        let transporter = ContentTransporter::new()
            .with_read_timeout(self.config.read_timeout())
            .with_connect_timeout(self.config.stall_timeout().max(Duration::from_secs(1)));
        transporter.connect(authority)?;
        let transporter = Arc::new(transporter);
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&transporter));
        // close() may have run between the check above and registration.
        if self.is_closed() {
            transporter.close();
        }
        Ok(LiveConnection {
            owner: self,
            id,
            transporter,
        })
    }

    fn base_request(request: &TransferRequest, mut wire: ContentFileRequest) -> ContentFileRequest {
        wire.authorization = request.header(AUTHORIZATION_HEADER).unwrap_or_default().to_string();
        wire.client = request.header(CLIENT_HEADER).unwrap_or_default().to_string();
        wire.custom_data = request.header(CUSTOM_DATA_HEADER).unwrap_or_default().to_string();
        wire.persist_connection = false;
        wire
    }

    /// Streams `len` body bytes into `sink`, sitting out read deadlines until the stall timeout.
    fn read_body(
        &self,
        transporter: &ContentTransporter,
        len: u64,
        sink: &mut dyn TransferSink,
        mut on_bytes: impl FnMut(&[u8]),
    ) -> Result<u64, TransferError> {
        let mut buf = vec![0u8; self.buffer_size];
        let mut received = 0u64;
        let mut last_byte = Instant::now();
        while received < len {
            if sink.should_abort() {
                return Err(TransferError::Interrupted);
            }
            let want = (len - received).min(buf.len() as u64) as usize;
            let n = match transporter.read_raw_bytes(&mut buf[..want]) {
                Ok(n) => n,
                Err(e) if e.is_timeout() => {
                    if self.is_closed() {
                        return Err(TransferError::Closed);
                    }
                    let stalled = last_byte.elapsed();
                    if stalled >= self.config.stall_timeout() {
                        return Err(TransferError::Stalled(stalled));
                    }
                    continue;
                }
                Err(e) => {
                    if self.is_closed() {
                        return Err(TransferError::Closed);
                    }
                    return Err(e.into());
                }
            };
            if n == 0 {
                return Err(TransferError::Incomplete {
                    expected: len,
                    received,
                });
            }
            last_byte = Instant::now();
            on_bytes(&buf[..n]);
            if !sink.write(&buf[..n]) {
                return Err(TransferError::Interrupted);
            }
            received += n as u64;
        }
        Ok(received)
    }

    /// Lists everything `authority` (`host:port`) offers.
    pub fn catalog(&self, authority: &str) -> Result<Vec<CatalogListing>, TransferError> {
        self.request_catalog(authority, &ContentFileRequest::catalog(-1, -1))
    }

    fn request_catalog(
        &self,
        authority: &str,
        wire: &ContentFileRequest,
    ) -> Result<Vec<CatalogListing>, TransferError> {
        let conn = self.open(authority)?;
        conn.transporter.send_request(wire)?;
        let keep_waiting = || !self.is_closed();
        let response = conn.transporter.receive_response_with(&keep_waiting)?;
        if !response.is_success() {
            return Err(TransferError::Http(u32::from(response.status)));
        }
        let mut body = BufferSink(Vec::new());
        self.read_body(
            &conn.transporter,
            response.content_length.max(0) as u64,
            &mut body,
            |_| {},
        )?;
        serde_json::from_slice(&body.0)
            .map_err(|e| TransferError::Transport(crate::protocol::ProtocolError::from(e).into()))
    }
}

/// Collects a catalog body in memory.
struct BufferSink(Vec<u8>);

impl TransferSink for BufferSink {
    fn begin(&mut self, _content_length: Option<u64>, _range_honored: bool) -> bool {
        true
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        self.0.extend_from_slice(bytes);
        true
    }

    fn should_abort(&self) -> bool {
        false
    }
}

impl Downloader for FileServerDownloader {
    fn transfer_mode(&self, _request: &TransferRequest) -> TransferMode {
        TransferMode::Sequential
    }

    /// Looks the content id up in the server's catalog.
    fn inspect(&self, request: &TransferRequest) -> Result<RemoteInfo, TransferError> {
        let address = Self::address(request)?;
        let wire = Self::base_request(request, ContentFileRequest::catalog(-1, -1));
        let entry = self
            .request_catalog(&address.authority(), &wire)?
            .into_iter()
            .find(|e| e.id == address.content_id)
            .ok_or(TransferError::Http(404))?;
        Ok(RemoteInfo {
            content_length: Some(entry.length),
            accept_ranges: true,
        })
    }

    fn fetch(
        &self,
        request: &TransferRequest,
        range: ByteRange,
        sink: &mut dyn TransferSink,
    ) -> Result<u64, TransferError> {
        let address = Self::address(request)?;
        let conn = self.open(&address.authority())?;
        let end = range.end.map(|e| e as i64).unwrap_or(-1);
        let wire = Self::base_request(
            request,
            ContentFileRequest::file(address.content_id.clone(), range.start as i64, end),
        );
        conn.transporter.send_request(&wire)?;
        let response = {
            let keep_waiting = || !self.is_closed() && !sink.should_abort();
            conn.transporter.receive_response_with(&keep_waiting)
        };
        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() && sink.should_abort() => return Err(TransferError::Interrupted),
            Err(e) => return Err(e.into()),
        };
        if !response.is_success() {
            return Err(TransferError::Http(u32::from(response.status)));
        }
        let len = response.content_length.max(0) as u64;
        if !sink.begin(Some(len), true) {
            return Err(TransferError::Interrupted);
        }
        let mut hasher = StreamHasher::new();
        let received = self.read_body(&conn.transporter, len, sink, |b| hasher.update(b))?;
        if !response.checksum.is_empty() {
            let actual = hasher.finish_hex();
            if !actual.eq_ignore_ascii_case(&response.checksum) {
                return Err(TransferError::ChecksumMismatch {
                    expected: response.checksum,
                    actual,
                });
            }
        }
        Ok(received)
    }

    fn close(&self) -> Result<(), TransferError> {
        self.closed.store(true, Ordering::Release);
        let live: Vec<_> = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for t in live {
            t.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileserver::{ContentFile, FileServer, FileServerOptions};

    struct VecSink {
        bytes: Vec<u8>,
        began: Option<(Option<u64>, bool)>,
    }

    impl TransferSink for VecSink {
        fn begin(&mut self, content_length: Option<u64>, range_honored: bool) -> bool {
            self.began = Some((content_length, range_honored));
            true
        }

        fn write(&mut self, bytes: &[u8]) -> bool {
            self.bytes.extend_from_slice(bytes);
            true
        }

        fn should_abort(&self) -> bool {
            false
        }
    }

    fn serve(body: &[u8]) -> (FileServer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.bin");
        std::fs::write(&path, body).unwrap();
        let server = FileServer::start("127.0.0.1:0", FileServerOptions::default()).unwrap();
        server.add_content_file(ContentFile::from_path("9", &path).unwrap());
        (server, dir)
    }

    fn request(url: String) -> TransferRequest {
        TransferRequest {
            job_id: 1,
            url,
            file: "/unused".into(),
            headers: vec![("authorization".into(), "t".into())],
        }
    }

    #[test]
    fn inspect_reads_length_from_catalog() {
        let (server, _dir) = serve(&[7u8; 1234]);
        let d = FileServerDownloader::new(FileServerConfig::default(), 4096);
        let info = d.inspect(&request(server.url_for("9"))).unwrap();
        assert_eq!(info.content_length, Some(1234));
        assert!(info.accept_ranges);
        assert!(matches!(d.inspect(&request(server.url_for("10"))), Err(TransferError::Http(404))));
    }

    #[test]
    fn catalog_lists_names_and_lengths() {
        let (server, _dir) = serve(b"abc");
        let d = FileServerDownloader::new(FileServerConfig::default(), 4096);
        let listing = d.catalog(&server.local_addr().to_string()).unwrap();
        assert_eq!(
            listing,
            vec![CatalogListing {
                id: "9".into(),
                name: "c.bin".into(),
                length: 3,
            }]
        );
    }

    #[test]
    fn fetches_range_and_verifies_checksum() {
        let body: Vec<u8> = (0u8..=255).cycle().take(100_000).collect();
        let (server, _dir) = serve(&body);
        let d = FileServerDownloader::new(FileServerConfig::default(), 4096);
        let mut sink = VecSink {
            bytes: Vec::new(),
            began: None,
        };
        let got = d
            .fetch(&request(server.url_for("9")), ByteRange::starting_at(40_000), &mut sink)
            .unwrap();
        assert_eq!(got, 60_000);
        assert_eq!(sink.began, Some((Some(60_000), true)));
        assert_eq!(sink.bytes, &body[40_000..]);
    }

    #[test]
    fn unknown_content_is_http_404() {
        let (server, _dir) = serve(b"x");
        let d = FileServerDownloader::new(FileServerConfig::default(), 4096);
        let mut sink = VecSink {
            bytes: Vec::new(),
            began: None,
        };
        let err = d
            .fetch(&request(server.url_for("nope")), ByteRange::starting_at(0), &mut sink)
            .unwrap_err();
        assert!(matches!(err, TransferError::Http(404)));
        assert!(sink.began.is_none());
    }

    #[test]
    fn closed_strategy_refuses_new_fetches() {
        let (server, _dir) = serve(b"x");
        let d = FileServerDownloader::new(FileServerConfig::default(), 4096);
        d.close().unwrap();
        let mut sink = VecSink {
            bytes: Vec::new(),
            began: None,
        };
        let err = d
            .fetch(&request(server.url_for("9")), ByteRange::starting_at(0), &mut sink)
            .unwrap_err();
        assert!(matches!(err, TransferError::Closed));
    }

    #[test]
    fn malformed_url_is_invalid() {
        let d = FileServerDownloader::new(FileServerConfig::default(), 4096);
        let mut sink = VecSink {
            bytes: Vec::new(),
            began: None,
        };
        let err = d
            .fetch(&request("haulfs://127.0.0.1/9".into()), ByteRange::starting_at(0), &mut sink)
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidUrl(_)));
    }
}
