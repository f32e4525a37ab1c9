//! Parse HTTP response header lines collected by curl.

/// What the last response block in a header stream said.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ResponseHead {
    pub status: Option<u32>,
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    /// Start offset from `Content-Range: bytes start-end/total`.
    pub range_start: Option<u64>,
}

/// Parses header lines; a status line starts a fresh block, so only the
/// final response after redirects counts.
pub(crate) fn parse_headers(lines: &[String]) -> ResponseHead {
    let mut head = ResponseHead::default();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("HTTP/") {
            head = ResponseHead {
                status: line.split_whitespace().nth(1).and_then(|c| c.parse().ok()),
                ..ResponseHead::default()
            };
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                if let Ok(n) = value.parse::<u64>() {
                    head.content_length = Some(n);
                }
            }
            if name.eq_ignore_ascii_case("accept-ranges") {
                head.accept_ranges = value.eq_ignore_ascii_case("bytes");
            }
            if name.eq_ignore_ascii_case("content-range") {
                head.range_start = value
                    .strip_prefix("bytes ")
                    .and_then(|r| r.split_once('-'))
                    .and_then(|(start, _)| start.trim().parse().ok());
            }
        }
    }
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_headers_content_length_and_ranges() {
        let head = parse_headers(&lines(&[
            "HTTP/1.1 200 OK",
            "Content-Length: 12345",
            "Accept-Ranges: bytes",
        ]));
        assert_eq!(head.status, Some(200));
        assert_eq!(head.content_length, Some(12345));
        assert!(head.accept_ranges);
    }

    #[test]
    fn parse_headers_keeps_last_block_only() {
        let head = parse_headers(&lines(&[
            "HTTP/1.1 302 Found",
            "Content-Length: 10",
            "Location: /elsewhere",
            "",
            "HTTP/1.1 206 Partial Content",
            "Content-Length: 500",
            "Content-Range: bytes 100-599/1000",
        ]));
        assert_eq!(head.status, Some(206));
        assert_eq!(head.content_length, Some(500));
        assert_eq!(head.range_start, Some(100));
        assert!(!head.accept_ranges);
    }
}
