//! Transfer failures and how they map onto a job's recorded cause.

use std::io;

use crate::job::ErrorCause;
use crate::protocol::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The sink or the interrupt flag stopped the fetch.
    #[error("transfer interrupted")]
    Interrupted,
    #[error("strategy closed")]
    Closed,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Non-success status from an HTTP server or the file server.
    #[error("remote status {0}")]
    Http(u32),
    #[error(transparent)]
    Curl(#[from] curl::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("local I/O: {0}")]
    Io(#[from] io::Error),
    #[error("expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: u64 },
    #[error("no bytes received for {0:?}")]
    Stalled(std::time::Duration),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    /// A chunked fetch came back without honoring its range.
    #[error("range request ignored by remote")]
    RangeIgnored,
}

impl TransferError {
    /// The cause recorded on a job that failed with this error.
    pub fn cause(&self) -> ErrorCause {
        match self {
            TransferError::Interrupted | TransferError::Closed => ErrorCause::Unknown,
            TransferError::InvalidUrl(_) => ErrorCause::InvalidUrl,
            TransferError::Http(code) => ErrorCause::Http(*code),
            TransferError::Curl(e) => classify_curl_error(e),
            TransferError::Transport(e) => classify_transport_error(e),
            TransferError::Io(_) => ErrorCause::Storage,
            TransferError::Incomplete { .. } => ErrorCause::IncompleteTransfer,
            TransferError::Stalled(_) => ErrorCause::Timeout,
            TransferError::ChecksumMismatch { .. } => ErrorCause::ChecksumMismatch,
            TransferError::RangeIgnored => ErrorCause::Protocol,
        }
    }
}

fn classify_curl_error(e: &curl::Error) -> ErrorCause {
    if e.is_operation_timedout() {
        return ErrorCause::Timeout;
    }
    if e.is_unsupported_protocol() {
        return ErrorCause::InvalidUrl;
    }
    if e.is_write_error() {
        return ErrorCause::Storage;
    }
    if e.is_partial_file() {
        return ErrorCause::IncompleteTransfer;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
    {
        return ErrorCause::Connection;
    }
    ErrorCause::Unknown
}

fn classify_transport_error(e: &TransportError) -> ErrorCause {
    match e {
        TransportError::Protocol(_) => ErrorCause::Protocol,
        _ if e.is_timeout() => ErrorCause::Timeout,
        TransportError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
            ErrorCause::IncompleteTransfer
        }
        _ => ErrorCause::Connection,
    }
}
