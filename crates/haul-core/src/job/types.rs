//! Job records and the value types stored alongside them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::id::derive_job_id;

/// Job identifier, unique within a namespace.
pub type JobId = i64;

/// Lifecycle status of a job, stored as a lowercase string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
    Removed,
    Deleted,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Downloading => "downloading",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
            Status::Failed => "failed",
            Status::Removed => "removed",
            Status::Deleted => "deleted",
        }
    }

    /// Unknown strings map to `Failed` so a corrupt row never looks runnable.
    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => Status::Queued,
            "downloading" => Status::Downloading,
            "paused" => Status::Paused,
            "completed" => Status::Completed,
            "cancelled" => Status::Cancelled,
            "failed" => Status::Failed,
            "removed" => Status::Removed,
            "deleted" => Status::Deleted,
            _ => Status::Failed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    /// The URL addresses the file server but no file-server strategy is configured.
    StrategyUnavailable,
    /// The URL could not be parsed for the strategy that owns it.
    InvalidUrl,
    /// The remote answered with a non-success status.
    Http(u32),
    Connection,
    Timeout,
    /// Local disk I/O failed.
    Storage,
    /// The stream ended before the announced length was received.
    IncompleteTransfer,
    ChecksumMismatch,
    Protocol,
    Unknown,
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::StrategyUnavailable => write!(f, "no transfer strategy for url"),
            ErrorCause::InvalidUrl => write!(f, "invalid url"),
            ErrorCause::Http(code) => write!(f, "remote status {}", code),
            ErrorCause::Connection => write!(f, "connection error"),
            ErrorCause::Timeout => write!(f, "timed out"),
            ErrorCause::Storage => write!(f, "storage error"),
            ErrorCause::IncompleteTransfer => write!(f, "incomplete transfer"),
            ErrorCause::ChecksumMismatch => write!(f, "checksum mismatch"),
            ErrorCause::Protocol => write!(f, "protocol error"),
            ErrorCause::Unknown => write!(f, "unknown error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        match self {
            Priority::Low => -1,
            Priority::Normal => 0,
            Priority::High => 1,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            i64::MIN..=-1 => Priority::Low,
            0 => Priority::Normal,
            _ => Priority::High,
        }
    }
}

/// Network a job is allowed to run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    All,
    Unmetered,
}

impl NetworkType {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkType::All => "all",
            NetworkType::Unmetered => "unmetered",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "unmetered" => NetworkType::Unmetered,
            _ => NetworkType::All,
        }
    }
}

/// What a caller asks to download. The id defaults to one derived from (url, file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub id: JobId,
    pub url: String,
    pub file: PathBuf,
    pub group: i64,
    pub priority: Priority,
    pub headers: Vec<(String, String)>,
    pub network_type: NetworkType,
}

impl JobRequest {
    pub fn new(url: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        let url = url.into();
        let file = file.into();
        Self {
            id: derive_job_id(&url, &file),
            url,
            file,
            group: 0,
            priority: Priority::Normal,
            headers: Vec::new(),
            network_type: NetworkType::All,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_group(mut self, group: i64) -> Self {
        self.group = group;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_network_type(mut self, network_type: NetworkType) -> Self {
        self.network_type = network_type;
        self
    }
}

/// Mutable request fields that `update_request` may rewrite on an existing job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub group: i64,
    pub priority: Priority,
    pub headers: Vec<(String, String)>,
    pub network_type: NetworkType,
}

/// Persisted job record. Copies handed to callers are snapshots; the store is
/// the source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub namespace: String,
    pub url: String,
    pub file: PathBuf,
    pub group: i64,
    pub priority: Priority,
    pub status: Status,
    pub error: Option<ErrorCause>,
    pub downloaded: u64,
    /// `None` until the remote length is known.
    pub total: Option<u64>,
    pub headers: Vec<(String, String)>,
    pub network_type: NetworkType,
    /// Unix milliseconds; orders jobs of equal priority.
    pub created_at: i64,
}

impl Job {
    /// A fresh QUEUED record for `request` in `namespace`.
    pub fn from_request(request: JobRequest, namespace: &str) -> Self {
        Self {
            id: request.id,
            namespace: namespace.to_string(),
            url: request.url,
            file: request.file,
            group: request.group,
            priority: request.priority,
            status: Status::Queued,
            error: None,
            downloaded: 0,
            total: None,
            headers: request.headers,
            network_type: request.network_type,
            created_at: unix_millis(),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file
    }

    /// Records transfer progress keeping `downloaded <= total` when the total is known.
    pub fn record_progress(&mut self, downloaded: u64, total: Option<u64>) {
        self.total = total;
        self.downloaded = match total {
            Some(t) => downloaded.min(t),
            None => downloaded,
        };
    }

    /// Percent complete, or `None` while the total is unknown.
    pub fn progress_percent(&self) -> Option<u8> {
        match self.total {
            Some(0) => Some(100),
            Some(t) => Some(((self.downloaded.min(t) * 100) / t) as u8),
            None => None,
        }
    }

    /// First header value matching `name` case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for s in [
            Status::Queued,
            Status::Downloading,
            Status::Paused,
            Status::Completed,
            Status::Cancelled,
            Status::Failed,
            Status::Removed,
            Status::Deleted,
        ] {
            assert_eq!(Status::parse(s.as_str()), s);
        }
        assert_eq!(Status::parse("bogus"), Status::Failed);
    }

    #[test]
    fn record_progress_never_exceeds_total() {
        let mut job = Job::from_request(JobRequest::new("https://a.example/x", "/tmp/x"), "default");
        job.record_progress(150, Some(100));
        assert_eq!(job.downloaded, 100);
        job.record_progress(150, None);
        assert_eq!(job.downloaded, 150);
        assert_eq!(job.progress_percent(), None);
        job.record_progress(25, Some(100));
        assert_eq!(job.progress_percent(), Some(25));
    }

    #[test]
    fn request_id_defaults_to_derived() {
        let req = JobRequest::new("https://a.example/x", "/tmp/x");
        assert_eq!(req.id, derive_job_id("https://a.example/x", Path::new("/tmp/x")));
        assert_eq!(req.clone().with_id(7).id, 7);
    }

    #[test]
    fn header_lookup_ignores_case() {
        let req = JobRequest::new("haulfs://127.0.0.1:1/1", "/tmp/x").with_header("Authorization", "tok");
        let job = Job::from_request(req, "default");
        assert_eq!(job.header("authorization"), Some("tok"));
        assert_eq!(job.header("client"), None);
    }
}
