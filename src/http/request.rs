use std::collections::HashMap;
use std::fmt;

/// HTTP request methods.
///
/// Represents the HTTP method/verb of a request. Which methods are acceptable
/// for a given endpoint is decided by the response creator, not the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Arguments
    ///
    /// * `s` - String representation of the method (case-sensitive, uppercase)
    ///
    /// # Returns
    ///
    /// `Some(Method)` if the string matches a known method, `None` otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// # use control_http::http::request::Method;
    /// assert_eq!(Method::from_str("POST"), Some(Method::POST));
    /// assert_eq!(Method::from_str("post"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }
}

/// Protocol version carried on the request line and echoed on the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_11: HttpVersion = HttpVersion { major: 1, minor: 1 };

    /// Parses the `HTTP/<major>.<minor>` token of a request line.
    ///
    /// ```
    /// # use control_http::http::request::HttpVersion;
    /// assert_eq!(HttpVersion::parse("HTTP/1.0"), Some(HttpVersion::HTTP_10));
    /// assert_eq!(HttpVersion::parse("HTTP/2"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        let numbers = s.strip_prefix("HTTP/")?;
        let (major, minor) = numbers.split_once('.')?;

        if major.len() != 1 || minor.len() != 1 {
            return None;
        }

        Some(HttpVersion {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// Whether connections default to persistent for this version.
    pub fn persistent_by_default(&self) -> bool {
        *self >= HttpVersion::HTTP_11
    }
}

impl Default for HttpVersion {
    /// Stock responses fall back to HTTP/1.0 when the version is unknown.
    fn default() -> Self {
        HttpVersion::HTTP_10
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Represents a parsed HTTP request from a client.
///
/// Contains all information extracted from the HTTP request line and headers.
/// The body holds exactly `Content-Length` bytes.
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request target (e.g., "/config-get")
    pub path: String,
    /// Protocol version from the request line
    pub version: HttpVersion,
    /// Request headers as received, names with original casing
    pub headers: HashMap<String, String>,
    /// Request body
    pub body: Vec<u8>,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Option<HttpVersion>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            path: None,
            version: None,
            headers: HashMap::new(),
            body: Vec::new()
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: HttpVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            path: self.path.ok_or("path missing")?,
            version: self.version.unwrap_or(HttpVersion::HTTP_11),
            headers: self.headers,
            body: self.body,
        })
    }
}

impl Request {
    /// Retrieves a header value by name, ignoring ASCII case.
    ///
    /// # Arguments
    ///
    /// * `key` - Header name to look up
    ///
    /// # Returns
    ///
    /// `Some(&str)` with the header value if present, `None` otherwise.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Media type of the body without parameters, e.g. `application/json`.
    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
            .map(|v| v.split(';').next().unwrap_or("").trim())
    }

    /// Whether the `Connection` header lists `token` (case-insensitive).
    pub fn has_connection_token(&self, token: &str) -> bool {
        self.header("Connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 connections stay open unless the client sends a `close`
    /// token. HTTP/1.0 connections close unless the client sends a
    /// `keep-alive` token.
    pub fn keep_alive(&self) -> bool {
        if self.version.persistent_by_default() {
            !self.has_connection_token("close")
        } else {
            self.has_connection_token("keep-alive")
        }
    }
}
