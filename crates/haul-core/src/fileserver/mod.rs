//! Embedded companion file server.
//!
//! Accepts connections on a background thread and serves each on its own
//! thread with a [`ContentTransporter`]: PING, CATALOG and ranged FILE
//! requests, optionally several per connection.

mod catalog;
mod url;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::checksum::{sha256_range, StreamHasher};
use crate::protocol::{
    Connection, ContentFileRequest, ContentFileResponse, ContentTransporter, RequestType,
    TransportError,
};

pub use catalog::ContentFile;
pub use url::{file_server_url, is_file_server_url, parse_file_server_url, FileServerAddress, SCHEME};

use catalog::Catalog;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// Decides whether a FILE request may be served.
pub trait Authenticator: Send + Sync {
    fn accept(&self, request: &ContentFileRequest, file: &ContentFile) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&ContentFileRequest, &ContentFile) -> bool + Send + Sync,
{
    fn accept(&self, request: &ContentFileRequest, file: &ContentFile) -> bool {
        self(request, file)
    }
}

#[derive(Clone)]
pub struct FileServerOptions {
    /// How often an idle connection checks for shutdown.
    pub read_timeout: Duration,
    pub buffer_size: usize,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl Default for FileServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(250),
            buffer_size: 64 * 1024,
            authenticator: None,
        }
    }
}

struct Shared {
    catalog: RwLock<Catalog>,
    options: FileServerOptions,
    shutdown: AtomicBool,
    forced: AtomicBool,
    next_conn: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<ContentTransporter>>>,
}

pub struct FileServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FileServer {
    /// Binds `bind` and starts accepting connections.
    pub fn start(bind: impl ToSocketAddrs, options: FileServerOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            catalog: RwLock::new(Catalog::default()),
            options,
            shutdown: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            next_conn: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
        });
        let accept_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("haul-fileserver".into())
            .spawn(move || accept_loop(listener, accept_shared))?;
        tracing::info!(%addr, "file server listening");
        Ok(Self {
            addr,
            shared,
            accept_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `haulfs://` URL for a registered content id.
    pub fn url_for(&self, content_id: &str) -> String {
        file_server_url(self.addr, content_id)
    }

    pub fn add_content_file(&self, file: ContentFile) {
        self.catalog_mut().insert(file);
    }

    pub fn add_content_files(&self, files: impl IntoIterator<Item = ContentFile>) {
        let mut catalog = self.catalog_mut();
        for f in files {
            catalog.insert(f);
        }
    }

    pub fn remove_content_file(&self, id: &str) -> Option<ContentFile> {
        self.catalog_mut().remove(id)
    }

    pub fn remove_content_files<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        let mut catalog = self.catalog_mut();
        for id in ids {
            catalog.remove(id);
        }
    }

    pub fn remove_all_content_files(&self) {
        self.catalog_mut().clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.catalog().get(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<ContentFile> {
        self.catalog().get(id).cloned()
    }

    pub fn content_files(&self) -> Vec<ContentFile> {
        self.catalog().all()
    }

    /// The catalog as served to clients.
    pub fn catalog_json(&self, page: i64, size: i64) -> String {
        self.catalog().to_json(page, size)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting. Live connections finish their current exchange unless
    /// `forced`, which closes them immediately.
    pub fn shutdown(&self, forced: bool) {
        if forced {
            self.shared.forced.store(true, Ordering::Release);
        }
        let first = !self.shared.shutdown.swap(true, Ordering::AcqRel);
        if forced {
            let live: Vec<_> = lock(&self.shared.connections).values().cloned().collect();
            for t in live {
                t.close();
            }
        }
        if let Some(handle) = lock(&self.accept_thread).take() {
            if handle.join().is_err() {
                tracing::warn!("file server accept thread panicked");
            }
        }
        if first {
            tracing::info!(addr = %self.addr, forced, "file server shut down");
        }
    }

    fn catalog(&self) -> std::sync::RwLockReadGuard<'_, Catalog> {
        self.shared.catalog.read().unwrap_or_else(|e| e.into_inner())
    }

    fn catalog_mut(&self) -> std::sync::RwLockWriteGuard<'_, Catalog> {
        self.shared.catalog.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::debug!(%peer, "file server: set blocking: {}", e);
                    continue;
                }
                let transporter = match ContentTransporter::new()
                    .with_read_timeout(shared.options.read_timeout)
                    .adopt(stream)
                {
                    Ok(t) => Arc::new(t),
                    Err(e) => {
                        tracing::debug!(%peer, "file server: wrap connection: {}", e);
                        continue;
                    }
                };
                let id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
                lock(&shared.connections).insert(id, Arc::clone(&transporter));
                let conn_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("haul-fileserver-{id}"))
                    .spawn(move || {
                        serve_connection(&conn_shared, &transporter);
                        transporter.close();
                        lock(&conn_shared.connections).remove(&id);
                    });
                if let Err(e) = spawned {
                    tracing::warn!("file server: spawn connection thread: {}", e);
                    if let Some(t) = lock(&shared.connections).remove(&id) {
                        t.close();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::debug!("file server accept: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_connection(shared: &Shared, transporter: &ContentTransporter) {
    let peer = transporter.peer_addr();
    let keep_waiting = || !shared.shutdown.load(Ordering::Acquire);
    loop {
        let request = match transporter.receive_request_with(&keep_waiting) {
            Ok(r) => r,
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                if keep_waiting() {
                    tracing::debug!(?peer, "file server: bad request: {}", e);
                }
                break;
            }
        };
        let connection = if request.persist_connection && keep_waiting() {
            Connection::Open
        } else {
            Connection::Close
        };
        if let Err(e) = respond(shared, transporter, &request, connection) {
            tracing::debug!(?peer, request_type = ?request.request_type, "file server: respond: {}", e);
            break;
        }
        if connection == Connection::Close {
            break;
        }
    }
}

fn respond(
    shared: &Shared,
    transporter: &ContentTransporter,
    request: &ContentFileRequest,
    connection: Connection,
) -> Result<(), TransportError> {
    let reply = |status: u16| ContentFileResponse::new(status, request.request_type, connection);
    match request.request_type {
        RequestType::Ping => transporter.send_response(&reply(200)),
        RequestType::Catalog => {
            let json = shared
                .catalog
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .to_json(request.page, request.size);
            let mut hasher = StreamHasher::new();
            hasher.update(json.as_bytes());
            transporter.send_response(&reply(200).with_content(json.len() as i64, hasher.finish_hex()))?;
            transporter.send_raw_bytes(json.as_bytes())
        }
        RequestType::File => {
            let file = shared
                .catalog
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&request.content_file_id)
                .cloned();
            let Some(file) = file else {
                return transporter.send_response(&reply(404));
            };
            if let Some(auth) = &shared.options.authenticator {
                if !auth.accept(request, &file) {
                    return transporter.send_response(&reply(401));
                }
            }
            send_file(shared, transporter, request, &file, reply)
        }
        RequestType::Invalid => transporter.send_response(&reply(415)),
    }
}

fn send_file(
    shared: &Shared,
    transporter: &ContentTransporter,
    request: &ContentFileRequest,
    file: &ContentFile,
    reply: impl Fn(u16) -> ContentFileResponse,
) -> Result<(), TransportError> {
    let mut handle = match File::open(&file.path) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(path = %file.path.display(), "file server: open: {}", e);
            return transporter.send_response(&reply(404));
        }
    };
    let len = handle.metadata()?.len();
    if request.range_start > 0 && request.range_start as u64 > len {
        return transporter.send_response(&reply(416));
    }
    let (start, end) = request.byte_range(len);
    let count = end - start;
    let checksum = match sha256_range(&file.path, start, count) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %file.path.display(), "file server: checksum: {:#}", e);
            return transporter.send_response(&reply(500));
        }
    };
    let partial = request.range_start > 0 || request.range_end >= 0;
    let status = if partial { 206 } else { 200 };
    transporter.send_response(&reply(status).with_content(count as i64, checksum))?;

    handle.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; shared.options.buffer_size.max(1)];
    let mut remaining = count;
    while remaining > 0 {
        if shared.forced.load(Ordering::Acquire) {
            return Err(TransportError::ClosedConnection);
        }
        let want = remaining.min(buf.len() as u64) as usize;
        let n = handle.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "content file shrank").into());
        }
        transporter.send_raw_bytes(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}
