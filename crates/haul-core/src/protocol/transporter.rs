//! One connection speaking the content-file protocol.
//!
//! Every operation holds the connection lock for its whole duration, so
//! framed exchanges never interleave. Raw bytes after a FILE response are the
//! caller's to sequence.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::codec::{self, ProtocolError, WireMessage};
use super::message::{ContentFileRequest, ContentFileResponse};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection already closed")]
    ClosedConnection,
    #[error("connection not established; call connect first")]
    NotConnected,
    #[error("connection already established")]
    AlreadyConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport I/O: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// A read deadline passed with no data; the connection is still usable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Io(e) if is_timeout(e))
    }
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

enum Link {
    Pending,
    Open {
        reader: BufReader<TcpStream>,
        writer: BufWriter<TcpStream>,
    },
    Closed,
}

/// Reader that sits out read deadlines while `keep_waiting` says so.
struct PatientReader<'a, R> {
    inner: &'a mut R,
    keep_waiting: &'a dyn Fn() -> bool,
}

impl<R: Read> Read for PatientReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if is_timeout(&e) && (self.keep_waiting)() => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

pub struct ContentTransporter {
    link: Mutex<Link>,
    /// Second handle on the socket so `close` can unblock a reader that holds the lock.
    socket: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
    read_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl Default for ContentTransporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentTransporter {
    /// An unconnected transporter; call [`connect`](Self::connect) before use.
    pub fn new() -> Self {
        Self {
            link: Mutex::new(Link::Pending),
            socket: Mutex::new(None),
            closed: AtomicBool::new(false),
            read_timeout: None,
            connect_timeout: None,
        }
    }

    /// Wraps an already-connected stream (e.g. one returned by `accept`).
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        Self::new().adopt(stream)
    }

    /// Like [`from_stream`](Self::from_stream) but keeps the timeouts set on `self`.
    pub fn adopt(self, stream: TcpStream) -> Result<Self, TransportError> {
        self.install(stream)?;
        Ok(self)
    }

    /// Deadline for each socket read. Without one, reads block indefinitely.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn install(&self, stream: TcpStream) -> Result<(), TransportError> {
        stream.set_read_timeout(self.read_timeout)?;
        stream.set_nodelay(true)?;
        let side = stream.try_clone()?;
        let write_half = stream.try_clone()?;
        let mut link = self.lock_link();
        match *link {
            Link::Closed => return Err(TransportError::ClosedConnection),
            Link::Open { .. } => return Err(TransportError::AlreadyConnected),
            Link::Pending => {}
        }
        *link = Link::Open {
            reader: BufReader::new(stream),
            writer: BufWriter::new(write_half),
        };
        *self.socket.lock().unwrap_or_else(|e| e.into_inner()) = Some(side);
        Ok(())
    }

    pub fn connect(&self, addr: impl ToSocketAddrs) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ClosedConnection);
        }
        let stream = match self.connect_timeout {
            Some(timeout) => {
                let mut last = io::Error::new(io::ErrorKind::InvalidInput, "no address resolved");
                let mut connected = None;
                for addr in addr.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(s) => {
                            connected = Some(s);
                            break;
                        }
                        Err(e) => last = e,
                    }
                }
                connected.ok_or(last)?
            }
            None => TcpStream::connect(addr)?,
        };
        self.install(stream)
    }

    /// Runs `op` on the open link, or fails if closed or not yet connected.
    fn with_link<T>(
        &self,
        op: impl FnOnce(&mut BufReader<TcpStream>, &mut BufWriter<TcpStream>) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ClosedConnection);
        }
        let mut link = self.lock_link();
        match &mut *link {
            Link::Closed => Err(TransportError::ClosedConnection),
            Link::Pending => Err(TransportError::NotConnected),
            Link::Open { reader, writer } => op(reader, writer),
        }
    }

    fn send<M: WireMessage>(&self, msg: &M) -> Result<(), TransportError> {
        let frame = codec::encode(msg)?;
        self.with_link(|_, w| Ok(codec::write_frame(w, &frame)?))
    }

    fn receive<M: WireMessage>(&self, keep_waiting: &dyn Fn() -> bool) -> Result<M, TransportError> {
        self.with_link(|r, _| {
            let mut patient = PatientReader { inner: r, keep_waiting };
            let frame = codec::read_frame(&mut patient)?;
            Ok(codec::decode(&frame)?)
        })
    }

    pub fn send_request(&self, request: &ContentFileRequest) -> Result<(), TransportError> {
        self.send(request)
    }

    pub fn send_response(&self, response: &ContentFileResponse) -> Result<(), TransportError> {
        self.send(response)
    }

    /// Blocks for the next request; read deadlines are sat out while `keep_waiting` holds.
    pub fn receive_request_with(
        &self,
        keep_waiting: &dyn Fn() -> bool,
    ) -> Result<ContentFileRequest, TransportError> {
        self.receive(keep_waiting)
    }

    pub fn receive_request(&self) -> Result<ContentFileRequest, TransportError> {
        self.receive(&|| true)
    }

    pub fn receive_response_with(
        &self,
        keep_waiting: &dyn Fn() -> bool,
    ) -> Result<ContentFileResponse, TransportError> {
        self.receive(keep_waiting)
    }

    pub fn receive_response(&self) -> Result<ContentFileResponse, TransportError> {
        self.receive(&|| true)
    }

    /// Writes `bytes` unframed and flushes.
    pub fn send_raw_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.with_link(|_, w| {
            w.write_all(bytes)?;
            w.flush()?;
            Ok(())
        })
    }

    /// One read of unframed bytes; `Ok(0)` at end of stream. A passed read
    /// deadline surfaces as an error for which `is_timeout` is true.
    pub fn read_raw_bytes(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.with_link(|r, _| Ok(r.read(buf)?))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
    }

    /// Releases the stream and socket. Idempotent; release errors are ignored.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(side) = self.socket.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = side.shutdown(Shutdown::Both);
        }
        let mut link = self.lock_link();
        if let Link::Open { writer, .. } = &mut *link {
            let _ = writer.flush();
        }
        *link = Link::Closed;
    }
}

impl Drop for ContentTransporter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Connection, RequestType};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn pair() -> (ContentTransporter, ContentTransporter) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = ContentTransporter::new();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        client.connect(addr).unwrap();
        let server = ContentTransporter::from_stream(accept.join().unwrap()).unwrap();
        (client, server)
    }

    #[test]
    fn request_response_and_raw_bytes() {
        let (client, server) = pair();
        client
            .send_request(&ContentFileRequest::file("3", 0, -1))
            .unwrap();
        let req = server.receive_request().unwrap();
        assert_eq!(req.content_file_id, "3");

        server
            .send_response(
                &ContentFileResponse::new(200, RequestType::File, Connection::Close)
                    .with_content(5, ""),
            )
            .unwrap();
        server.send_raw_bytes(b"hello").unwrap();

        let resp = client.receive_response().unwrap();
        assert_eq!(resp.content_length, 5);
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < 5 {
            got += client.read_raw_bytes(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn operations_before_connect_fail() {
        let t = ContentTransporter::new();
        assert!(matches!(
            t.send_request(&ContentFileRequest::ping()),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(t.read_raw_bytes(&mut [0u8; 4]), Err(TransportError::NotConnected)));
    }

    #[test]
    fn operations_after_close_fail_and_close_is_idempotent() {
        let (client, _server) = pair();
        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.receive_response(),
            Err(TransportError::ClosedConnection)
        ));
        assert!(matches!(
            client.connect("127.0.0.1:1"),
            Err(TransportError::ClosedConnection)
        ));
    }

    #[test]
    fn close_unblocks_a_pending_read() {
        let (client, _server) = pair();
        let client = Arc::new(client);
        let reader = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.receive_response())
        };
        thread::sleep(Duration::from_millis(100));
        client.close();
        assert!(reader.join().unwrap().is_err());
    }

    #[test]
    fn read_deadline_surfaces_as_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = ContentTransporter::new().with_read_timeout(Duration::from_millis(50));
        client.connect(addr).unwrap();
        let _peer = listener.accept().unwrap();
        let err = client.read_raw_bytes(&mut [0u8; 8]).unwrap_err();
        assert!(err.is_timeout());
        let err = client.receive_response_with(&|| false).unwrap_err();
        assert!(err.is_timeout());
    }
}
