//! The two wire messages exchanged with the file server.

use serde::{Deserialize, Deserializer, Serialize};

use crate::job::unix_millis;

/// Content id that addresses the catalog rather than a file.
pub const CATALOG_ID: &str = "-1";

/// Request kind; travels as an integer. Unknown values decode as `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum RequestType {
    Invalid,
    Ping,
    File,
    Catalog,
}

impl From<i32> for RequestType {
    fn from(v: i32) -> Self {
        match v {
            0 => RequestType::Ping,
            1 => RequestType::File,
            2 => RequestType::Catalog,
            _ => RequestType::Invalid,
        }
    }
}

impl From<RequestType> for i32 {
    fn from(t: RequestType) -> Self {
        match t {
            RequestType::Invalid => -1,
            RequestType::Ping => 0,
            RequestType::File => 1,
            RequestType::Catalog => 2,
        }
    }
}

/// Whether the server keeps the connection for another request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Connection {
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContentFileRequest {
    #[serde(rename = "Type")]
    pub request_type: RequestType,
    #[serde(deserialize_with = "string_or_number")]
    pub content_file_id: String,
    pub range_start: i64,
    /// Exclusive end offset; -1 reads to the end of the file.
    pub range_end: i64,
    pub authorization: String,
    pub client: String,
    pub custom_data: String,
    pub page: i64,
    pub size: i64,
    pub persist_connection: bool,
}

impl Default for ContentFileRequest {
    fn default() -> Self {
        Self {
            request_type: RequestType::Invalid,
            content_file_id: CATALOG_ID.to_string(),
            range_start: 0,
            range_end: -1,
            authorization: String::new(),
            client: String::new(),
            custom_data: String::new(),
            page: 0,
            size: 0,
            persist_connection: true,
        }
    }
}

impl ContentFileRequest {
    pub fn ping() -> Self {
        Self {
            request_type: RequestType::Ping,
            ..Self::default()
        }
    }

    pub fn catalog(page: i64, size: i64) -> Self {
        Self {
            request_type: RequestType::Catalog,
            page,
            size,
            ..Self::default()
        }
    }

    pub fn file(content_file_id: impl Into<String>, range_start: i64, range_end: i64) -> Self {
        Self {
            request_type: RequestType::File,
            content_file_id: content_file_id.into(),
            range_start,
            range_end,
            ..Self::default()
        }
    }

    /// Clamps range and paging fields into their legal shapes.
    ///
    /// A negative start, or a start past a bounded end, becomes 0. A negative
    /// end becomes the unbounded sentinel -1. Page and size never go below -1.
    pub fn sanitize(&mut self) {
        if self.range_start < 0 || (self.range_end >= 0 && self.range_start > self.range_end) {
            self.range_start = 0;
        }
        if self.range_end < 0 || self.range_end < self.range_start {
            self.range_end = -1;
        }
        self.page = self.page.max(-1);
        self.size = self.size.max(-1);
    }

    /// Bytes requested from a file of `len` bytes as `[start, end)`, clamped.
    pub fn byte_range(&self, len: u64) -> (u64, u64) {
        let start = (self.range_start.max(0) as u64).min(len);
        let end = if self.range_end < 0 {
            len
        } else {
            (self.range_end as u64).min(len)
        };
        (start, end.max(start))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContentFileResponse {
    /// HTTP-style status code.
    pub status: u16,
    #[serde(rename = "Type")]
    pub request_type: RequestType,
    pub connection: Connection,
    /// Unix milliseconds at which the server answered.
    pub date: i64,
    pub content_length: i64,
    /// SHA-256 (lowercase hex) of the bytes that follow; empty when none do.
    pub checksum: String,
}

impl ContentFileResponse {
    pub fn new(status: u16, request_type: RequestType, connection: Connection) -> Self {
        Self {
            status,
            request_type,
            connection,
            date: unix_millis(),
            content_length: 0,
            checksum: String::new(),
        }
    }

    pub fn with_content(mut self, content_length: i64, checksum: impl Into<String>) -> Self {
        self.content_length = content_length;
        self.checksum = checksum.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Older peers send numeric ids unquoted.
fn string_or_number<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
    }
    Ok(match Id::deserialize(de)? {
        Id::Text(s) => s,
        Id::Int(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitized(start: i64, end: i64) -> (i64, i64) {
        let mut r = ContentFileRequest::file("1", start, end);
        r.sanitize();
        (r.range_start, r.range_end)
    }

    #[test]
    fn sanitize_clamps_ranges() {
        assert_eq!(sanitized(-5, 100), (0, 100));
        assert_eq!(sanitized(50, 10), (0, 10));
        assert_eq!(sanitized(50, -1), (50, -1));
        assert_eq!(sanitized(50, -7), (50, -1));
        assert_eq!(sanitized(-3, -9), (0, -1));
        assert_eq!(sanitized(10, 10), (10, 10));
    }

    #[test]
    fn sanitize_clamps_paging() {
        let mut r = ContentFileRequest::catalog(-4, -2);
        r.sanitize();
        assert_eq!((r.page, r.size), (-1, -1));
        let mut r = ContentFileRequest::catalog(-1, 20);
        r.sanitize();
        assert_eq!((r.page, r.size), (-1, 20));
    }

    #[test]
    fn byte_range_is_clamped_to_file() {
        assert_eq!(ContentFileRequest::file("1", 0, -1).byte_range(100), (0, 100));
        assert_eq!(ContentFileRequest::file("1", 10, 50).byte_range(100), (10, 50));
        assert_eq!(ContentFileRequest::file("1", 10, 500).byte_range(100), (10, 100));
        assert_eq!(ContentFileRequest::file("1", 150, -1).byte_range(100), (100, 100));
    }

    #[test]
    fn request_type_unknown_is_invalid() {
        assert_eq!(RequestType::from(9), RequestType::Invalid);
        assert_eq!(i32::from(RequestType::Catalog), 2);
    }

    #[test]
    fn response_success_range() {
        let ok = ContentFileResponse::new(206, RequestType::File, Connection::Open);
        assert!(ok.is_success());
        assert!(!ContentFileResponse::new(416, RequestType::File, Connection::Close).is_success());
    }
}
