//! `haulfs://host:port/<content id>` addresses.

use std::net::SocketAddr;
use url::Url;

pub const SCHEME: &str = "haulfs";

/// Where a file-server job fetches from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileServerAddress {
    pub host: String,
    pub port: u16,
    pub content_id: String,
}

impl FileServerAddress {
    /// `host:port`, suitable for `ToSocketAddrs`.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub fn is_file_server_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| u.scheme() == SCHEME)
        .unwrap_or(false)
}

/// Parses a file-server URL. `None` unless host, port and content id are all present.
pub fn parse_file_server_url(url: &str) -> Option<FileServerAddress> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != SCHEME {
        return None;
    }
    let host = parsed.host_str()?.trim_matches(|c| c == '[' || c == ']').to_string();
    let port = parsed.port()?;
    let content_id = parsed.path().trim_matches('/').to_string();
    if content_id.is_empty() || content_id.contains('/') {
        return None;
    }
    Some(FileServerAddress {
        host,
        port,
        content_id,
    })
}

pub fn file_server_url(addr: SocketAddr, content_id: &str) -> String {
    format!("{}://{}/{}", SCHEME, addr, content_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_scheme() {
        assert!(is_file_server_url("haulfs://127.0.0.1:6886/12"));
        assert!(!is_file_server_url("https://example.com/12"));
        assert!(!is_file_server_url("not a url"));
    }

    #[test]
    fn parses_host_port_and_id() {
        let a = parse_file_server_url("haulfs://127.0.0.1:6886/12").unwrap();
        assert_eq!(a.host, "127.0.0.1");
        assert_eq!(a.port, 6886);
        assert_eq!(a.content_id, "12");
        assert_eq!(a.authority(), "127.0.0.1:6886");
    }

    #[test]
    fn rejects_missing_parts() {
        assert!(parse_file_server_url("haulfs://127.0.0.1/12").is_none());
        assert!(parse_file_server_url("haulfs://127.0.0.1:6886/").is_none());
        assert!(parse_file_server_url("https://127.0.0.1:6886/12").is_none());
    }

    #[test]
    fn builds_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let url = file_server_url(addr, "abc");
        assert_eq!(parse_file_server_url(&url).unwrap().content_id, "abc");
    }
}
