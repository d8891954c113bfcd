use crate::http::request::{HttpVersion, Method, Request};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;

/// Upper bound on the request line plus header block.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unknown request method")]
    InvalidMethod,
    #[error("unsupported or malformed HTTP version")]
    InvalidVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("Transfer-Encoding is not supported")]
    UnsupportedTransferEncoding,
    #[error("request headers exceed {} bytes", MAX_HEADER_BYTES)]
    HeadersTooLarge,
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("incomplete request")]
    Incomplete,
}

/// Outcome of feeding bytes to a [`RequestParser`].
#[derive(Debug)]
pub enum ParseStatus {
    /// More bytes are required before a request can be produced
    NeedMore,
    /// A full request was framed
    Complete(Request),
    /// The input can never become a valid request
    Failed(ParseError),
}

/// Incremental request parser.
///
/// Bytes are accumulated in arrival order. The protocol version becomes
/// available as soon as the request line has been received, which lets the
/// caller tag stock responses correctly even when the rest of the request
/// never shows up.
#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: BytesMut,
    version: Option<HttpVersion>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> ParseStatus {
        self.buffer.extend_from_slice(chunk);

        if self.version.is_none() {
            if let Some(line_end) = find_subsequence(&self.buffer, b"\r\n") {
                match parse_request_line(&self.buffer[..line_end]) {
                    Ok((_, _, version)) => self.version = Some(version),
                    Err(e) => return ParseStatus::Failed(e),
                }
            }
        }

        match parse_http_request(&self.buffer) {
            Ok((request, consumed)) => {
                self.buffer.advance(consumed);
                ParseStatus::Complete(request)
            }
            Err(ParseError::Incomplete) => {
                if find_headers_end(&self.buffer).is_none() && self.buffer.len() > MAX_HEADER_BYTES {
                    ParseStatus::Failed(ParseError::HeadersTooLarge)
                } else {
                    ParseStatus::NeedMore
                }
            }
            Err(e) => ParseStatus::Failed(e),
        }
    }

    /// Version from the request line, once it has been seen.
    pub fn http_version(&self) -> Option<HttpVersion> {
        self.version
    }

    /// Number of bytes received but not yet consumed by a completed request.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops all buffered input and forgets the version.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.version = None;
    }
}

/// Parses one complete request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// `ParseError::Incomplete` when more input is needed.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {

    // Look for header/body separator
    let headers_end = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    if headers_end > MAX_HEADER_BYTES {
        return Err(ParseError::HeadersTooLarge);
    }

    let header_bytes = &buf[..headers_end];
    let body_bytes = &buf[headers_end + 4..];

    let headers_str = std::str::from_utf8(header_bytes)
        .map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let (method, path, version) = parse_request_line(request_line.as_bytes())?;

    // Headers
    let mut headers: HashMap<String, String> = HashMap::new();
    let mut content_length: Option<usize> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }

        // Folded continuation lines are obsolete
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::InvalidHeader);
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(ParseError::InvalidHeader)?;

        let key = key.trim_end();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }
        let value = value.trim();

        if key.eq_ignore_ascii_case("Transfer-Encoding") {
            return Err(ParseError::UnsupportedTransferEncoding);
        }

        if key.eq_ignore_ascii_case("Content-Length") {
            let length = value
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength)?;
            if content_length.is_some_and(|previous| previous != length) {
                return Err(ParseError::InvalidContentLength);
            }
            content_length = Some(length);
        }

        // Repeated names fold into one comma-separated value under the first spelling
        let existing = headers.keys().find(|name| name.eq_ignore_ascii_case(key)).cloned();
        match existing {
            // Equal duplicates were checked above
            Some(_) if key.eq_ignore_ascii_case("Content-Length") => {}
            Some(existing) => {
                if let Some(merged) = headers.get_mut(&existing) {
                    merged.push_str(", ");
                    merged.push_str(value);
                }
            }
            None => {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }

    // Body
    let content_length = content_length.unwrap_or(0);

    if body_bytes.len() < content_length {
        return Err(ParseError::Incomplete);
    }

    let body = body_bytes[..content_length].to_vec();

    let request = Request {
        method,
        path: path.to_string(),
        version,
        headers,
        body,
    };

    let total_consumed = headers_end + 4 + content_length;
    Ok((request, total_consumed))

}

fn parse_request_line(line: &[u8]) -> Result<(Method, &str, HttpVersion), ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidRequest)?;
    let mut parts = line.split(' ');

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version_str = parts.next().ok_or(ParseError::InvalidRequest)?;

    if parts.next().is_some() || path.is_empty() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    let version = HttpVersion::parse(version_str).ok_or(ParseError::InvalidVersion)?;
    if version != HttpVersion::HTTP_10 && version != HttpVersion::HTTP_11 {
        return Err(ParseError::InvalidVersion);
    }

    Ok((method, path, version))
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    find_subsequence(buf, b"\r\n\r\n")
}

fn find_subsequence(buf: &[u8], needle: &[u8]) -> Option<usize> {
    buf.windows(needle.len())
        .position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.path, "/");
        assert_eq!(parsed.header("host"), Some("example.com"));
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn version_known_before_headers_finish() {
        let mut parser = RequestParser::new();

        assert!(matches!(parser.feed(b"POST /foo HTTP/1.1\r\nContent-"), ParseStatus::NeedMore));
        assert_eq!(parser.http_version(), Some(HttpVersion::HTTP_11));
    }

    #[test]
    fn bad_request_line_fails_before_headers_finish() {
        let mut parser = RequestParser::new();

        let status = parser.feed(b"POST /foo HTTP/3.0\r\nHost");
        assert!(matches!(status, ParseStatus::Failed(ParseError::InvalidVersion)));
        assert_eq!(parser.http_version(), None);
    }

    #[test]
    fn oversized_header_block_fails() {
        let mut parser = RequestParser::new();
        parser.feed(b"GET / HTTP/1.1\r\n");

        let filler = vec![b'a'; MAX_HEADER_BYTES + 1];
        assert!(matches!(
            parser.feed(&filler),
            ParseStatus::Failed(ParseError::HeadersTooLarge)
        ));
    }

    #[test]
    fn reset_forgets_everything() {
        let mut parser = RequestParser::new();
        parser.feed(b"GET / HTTP/1.0\r\nHost: a\r\n");

        parser.reset();

        assert_eq!(parser.buffered(), 0);
        assert_eq!(parser.http_version(), None);
    }
}
