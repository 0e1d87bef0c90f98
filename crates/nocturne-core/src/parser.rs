// src/parser.rs
//! Resumable HTTP/1.x request parser.
//!
//! The parser consumes whole CRLF-terminated lines from a [`ByteBuffer`] and
//! keeps its position in [`ParseState`] between calls, so a request split
//! across several reads is completed by calling [`HttpRequest::parse`] again
//! once more bytes have arrived.

use crate::auth::Authenticator;
use crate::buffer::ByteBuffer;
use crate::http::Method;
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Bare paths that are served from `<path>.html`.
const DEFAULT_HTML: &[&str] = &["/index", "/register", "/login", "/welcome", "/video", "/picture"];

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// More bytes are needed before the current line or body is complete.
    #[error("incomplete request")]
    Incomplete,
    #[error("malformed request line")]
    InvalidRequestLine,
    #[error("request exceeds the configured size limit")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

#[derive(Debug)]
pub struct HttpRequest {
    state: ParseState,
    method: Method,
    path: String,
    query: Option<String>,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    form: HashMap<String, String>,
    /// Bytes of the current request already taken off the buffer.
    consumed: usize,
    limit: usize,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_REQUEST_BYTES)
    }

    /// Parser that gives up with [`ParseError::TooLarge`] once a request
    /// (consumed lines plus whatever is still buffered) grows past `limit`.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: ParseState::RequestLine,
            method: Method::Unknown,
            path: String::new(),
            query: None,
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            form: HashMap::new(),
            consumed: 0,
            limit,
        }
    }

    /// Forget the previous request. The size limit is kept.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method = Method::Unknown;
        self.path.clear();
        self.query = None;
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.form.clear();
        self.consumed = 0;
    }

    /// Advance the state machine over the bytes in `buf`, consuming exactly
    /// the lines (and body bytes) it recognizes.
    ///
    /// `Ok(())` means a full request is available. [`ParseError::Incomplete`]
    /// leaves the partial state in place for the next call; any other error
    /// resets the parser.
    pub fn parse(
        &mut self,
        buf: &mut ByteBuffer,
        auth: &dyn Authenticator,
    ) -> Result<(), ParseError> {
        if self.state == ParseState::Finish {
            self.reset();
        }

        let res = self.advance(buf, auth);
        if let Err(e) = res {
            if e != ParseError::Incomplete {
                self.reset();
            }
        }
        res
    }

    fn advance(&mut self, buf: &mut ByteBuffer, auth: &dyn Authenticator) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(end) = find_crlf(buf.peek()) else {
                        return Err(self.incomplete(buf));
                    };
                    self.parse_request_line(&buf.peek()[..end])?;
                    buf.retrieve_until(end + 2);
                    self.account(end + 2)?;
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(end) = find_crlf(buf.peek()) else {
                        return Err(self.incomplete(buf));
                    };
                    let matched = end > 0 && self.parse_header(&buf.peek()[..end]);
                    buf.retrieve_until(end + 2);
                    self.account(end + 2)?;
                    if !matched {
                        self.state = ParseState::Body;
                    }
                }
                ParseState::Body => {
                    let take = match self.content_length() {
                        Some(len) if self.consumed.saturating_add(len) > self.limit => {
                            return Err(ParseError::TooLarge);
                        }
                        Some(len) if buf.readable_bytes() < len => return Err(ParseError::Incomplete),
                        Some(len) => len,
                        None => buf.readable_bytes(),
                    };
                    self.account(take)?;
                    self.body.extend_from_slice(&buf.peek()[..take]);
                    buf.retrieve(take);
                    self.parse_post(auth);
                    self.state = ParseState::Finish;
                    tracing::debug!(
                        method = self.method.as_str(),
                        path = %self.path,
                        version = %self.version,
                        "request parsed"
                    );
                }
                ParseState::Finish => return Ok(()),
            }
        }
    }

    fn account(&mut self, len: usize) -> Result<(), ParseError> {
        self.consumed += len;
        if self.consumed > self.limit {
            return Err(ParseError::TooLarge);
        }
        Ok(())
    }

    fn incomplete(&self, buf: &ByteBuffer) -> ParseError {
        if self.consumed + buf.readable_bytes() > self.limit {
            ParseError::TooLarge
        } else {
            ParseError::Incomplete
        }
    }

    // METHOD SP PATH SP HTTP/VERSION
    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidRequestLine)?;
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::InvalidRequestLine);
        };
        let version = proto
            .strip_prefix("HTTP/")
            .ok_or(ParseError::InvalidRequestLine)?;
        if method.is_empty() || target.is_empty() || version.is_empty() {
            return Err(ParseError::InvalidRequestLine);
        }

        self.method = Method::from_bytes(method.as_bytes());
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };
        self.path = normalize_path(path);
        self.query = query;
        self.version = version.to_string();
        Ok(())
    }

    // NAME: VALUE, with at most one space after the colon.
    fn parse_header(&mut self, line: &[u8]) -> bool {
        let Some(colon) = memchr::memchr(b':', line) else {
            return false;
        };
        let name = String::from_utf8_lossy(&line[..colon]).to_ascii_lowercase();
        let raw = &line[colon + 1..];
        let value = raw.strip_prefix(b" ").unwrap_or(raw);
        self.headers
            .insert(name, String::from_utf8_lossy(value).into_owned());
        true
    }

    fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    fn is_form_post(&self) -> bool {
        if self.method != Method::Post {
            return false;
        }
        self.header("content-type")
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|media| media.trim().eq_ignore_ascii_case(FORM_URLENCODED))
    }

    fn parse_post(&mut self, auth: &dyn Authenticator) {
        if !self.is_form_post() {
            return;
        }

        match serde_urlencoded::from_bytes::<Vec<(String, String)>>(&self.body) {
            Ok(pairs) => self.form.extend(pairs),
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path, "undecodable form body");
                return;
            }
        }

        let is_login = match self.path.as_str() {
            "/register.html" => false,
            "/login.html" => true,
            _ => return,
        };

        let username = self.form_value("username").unwrap_or_default();
        let password = self.form_value("password").unwrap_or_default();
        let accepted = auth.verify(username, password, is_login);
        tracing::info!(user = username, is_login, accepted, "credential check");
        self.path = if accepted {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Case-insensitive header lookup. A repeated header keeps its last value.
    pub fn header(&self, name: &str) -> Option<&str> {
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            self.headers
                .get(&name.to_ascii_lowercase())
                .map(String::as_str)
        } else {
            self.headers.get(name).map(String::as_str)
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// Persistent only when the client asks for it on HTTP/1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("connection")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("keep-alive"))
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    memchr::memmem::find(data, b"\r\n")
}

fn normalize_path(path: &str) -> String {
    if path == "/" {
        return "/index.html".to_string();
    }
    if DEFAULT_HTML.contains(&path) {
        return format!("{}.html", path);
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RejectAll;
    use std::sync::Mutex;

    fn parse_all(raw: &[u8]) -> (HttpRequest, Result<(), ParseError>, ByteBuffer) {
        let mut buf = ByteBuffer::new();
        buf.append(raw);
        let mut req = HttpRequest::new();
        let res = req.parse(&mut buf, &RejectAll);
        (req, res, buf)
    }

    #[test]
    fn test_simple_get() {
        let (req, res, buf) = parse_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(res, Ok(()));
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header("Host"), Some("x"));
        assert!(!req.is_keep_alive());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_request_line() {
        let (req, res, _) = parse_all(b"BADLINE\r\n\r\n");
        assert_eq!(res, Err(ParseError::InvalidRequestLine));
        assert_eq!(req.state(), ParseState::RequestLine);

        for line in [
            &b"GET /  HTTP/1.1\r\n\r\n"[..],
            b"GET / FTP/1.1\r\n\r\n",
            b"GET / HTTP/\r\n\r\n",
            b" / HTTP/1.1\r\n\r\n",
        ] {
            assert_eq!(parse_all(line).1, Err(ParseError::InvalidRequestLine));
        }
    }

    #[test]
    fn test_keep_alive_detection() {
        let (req, _, _) = parse_all(b"GET /a.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(req.is_keep_alive());

        let (req, _, _) = parse_all(b"GET /a.txt HTTP/1.1\r\nconnection: Keep-Alive\r\n\r\n");
        assert!(req.is_keep_alive());

        let (req, _, _) = parse_all(b"GET /a.txt HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn test_known_paths_get_html_suffix() {
        for (raw, expected) in [
            ("/login", "/login.html"),
            ("/register", "/register.html"),
            ("/picture", "/picture.html"),
            ("/login.html", "/login.html"),
            ("/other", "/other"),
        ] {
            let line = format!("GET {} HTTP/1.1\r\n\r\n", raw);
            let (req, res, _) = parse_all(line.as_bytes());
            assert_eq!(res, Ok(()));
            assert_eq!(req.path(), expected);
        }
    }

    #[test]
    fn test_query_split() {
        let (req, _, _) = parse_all(b"GET /video?id=3&t=1 HTTP/1.1\r\n\r\n");
        assert_eq!(req.path(), "/video.html");
        assert_eq!(req.query(), Some("id=3&t=1"));
    }

    #[test]
    fn test_duplicate_header_last_wins() {
        let (req, _, _) = parse_all(b"GET / HTTP/1.1\r\nX-Tag: one\r\nx-tag: two\r\n\r\n");
        assert_eq!(req.header("X-Tag"), Some("two"));
    }

    #[test]
    fn test_resumes_across_reads() {
        let raw = b"GET /index HTTP/1.1\r\nHost: example\r\nConnection: keep-alive\r\n\r\n";
        let mut buf = ByteBuffer::new();
        let mut req = HttpRequest::new();

        for (i, byte) in raw.iter().enumerate() {
            buf.append(&[*byte]);
            let res = req.parse(&mut buf, &RejectAll);
            if i + 1 < raw.len() {
                assert_eq!(res, Err(ParseError::Incomplete), "byte {}", i);
            } else {
                assert_eq!(res, Ok(()));
            }
        }
        assert_eq!(req.path(), "/index.html");
        assert!(req.is_keep_alive());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_form_decoding() {
        let raw = b"POST /submit HTTP/1.1\r\n\
            Content-Type: application/x-www-form-urlencoded\r\n\
            Content-Length: 21\r\n\r\n\
            username=a&password=b";
        let (req, res, _) = parse_all(raw);
        assert_eq!(res, Ok(()));
        assert_eq!(req.form_value("username"), Some("a"));
        assert_eq!(req.form_value("password"), Some("b"));
        assert_eq!(req.path(), "/submit");
    }

    #[test]
    fn test_form_percent_and_plus() {
        let body = "username=j+doe&password=p%26ss%3D1";
        let raw = format!(
            "POST /x HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let (req, _, _) = parse_all(raw.as_bytes());
        assert_eq!(req.form_value("username"), Some("j doe"));
        assert_eq!(req.form_value("password"), Some("p&ss=1"));
    }

    #[test]
    fn test_body_waits_for_content_length() {
        let mut buf = ByteBuffer::new();
        let mut req = HttpRequest::new();
        buf.append(b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\n01234");
        assert_eq!(req.parse(&mut buf, &RejectAll), Err(ParseError::Incomplete));
        assert_eq!(req.state(), ParseState::Body);

        buf.append(b"56789");
        assert_eq!(req.parse(&mut buf, &RejectAll), Ok(()));
        assert_eq!(req.body(), b"0123456789");
    }

    #[test]
    fn test_login_and_register_dispatch() {
        let calls = Mutex::new(Vec::new());
        let auth = |user: &str, pwd: &str, is_login: bool| {
            calls.lock().unwrap().push((user.to_string(), is_login));
            pwd == "good"
        };

        let post = |path: &str, body: &str| {
            format!(
                "POST {} HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
                path,
                body.len(),
                body
            )
        };

        let mut buf = ByteBuffer::new();
        let mut req = HttpRequest::new();

        buf.append_str(&post("/login", "username=amy&password=good"));
        assert_eq!(req.parse(&mut buf, &auth), Ok(()));
        assert_eq!(req.path(), "/welcome.html");

        buf.append_str(&post("/register", "username=bob&password=bad"));
        assert_eq!(req.parse(&mut buf, &auth), Ok(()));
        assert_eq!(req.path(), "/error.html");

        assert_eq!(
            *calls.lock().unwrap(),
            vec![("amy".to_string(), true), ("bob".to_string(), false)]
        );
    }

    #[test]
    fn test_too_large() {
        let mut buf = ByteBuffer::new();
        let mut req = HttpRequest::with_limit(32);
        buf.append(b"GET /");
        buf.append(&[b'a'; 64]);
        assert_eq!(req.parse(&mut buf, &RejectAll), Err(ParseError::TooLarge));

        let (_, res, _) = parse_all(b"POST /x HTTP/1.1\r\nContent-Length: 99999999\r\n\r\n");
        assert_eq!(res, Err(ParseError::TooLarge));
    }

    #[test]
    fn test_limit_counts_consumed_header_lines() {
        let mut buf = ByteBuffer::new();
        let mut req = HttpRequest::with_limit(64);
        buf.append(b"GET / HTTP/1.1\r\n");

        let mut fed = 0;
        let res = loop {
            buf.append(format!("X-{}: v\r\n", fed).as_bytes());
            fed += 1;
            match req.parse(&mut buf, &RejectAll) {
                Err(ParseError::Incomplete) if fed < 10_000 => continue,
                other => break other,
            }
        };
        assert_eq!(res, Err(ParseError::TooLarge));
        assert!(fed < 10, "gave up only after {} header lines", fed);
        // The failed request is forgotten.
        assert_eq!(req.header("x-0"), None);
    }

    #[test]
    fn test_limit_counts_head_and_body_together() {
        let mut buf = ByteBuffer::new();
        let mut req = HttpRequest::with_limit(64);
        // 40 bytes of head plus a 30 byte body is over 64.
        buf.append(b"POST /x HTTP/1.1\r\nContent-Length: 30\r\n\r\n");
        buf.append(&[b'a'; 30]);
        assert_eq!(req.parse(&mut buf, &RejectAll), Err(ParseError::TooLarge));

        let mut buf = ByteBuffer::new();
        buf.append(b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
        buf.append(&[b'a'; 10]);
        assert_eq!(req.parse(&mut buf, &RejectAll), Ok(()));
        assert_eq!(req.body().len(), 10);
    }

    #[test]
    fn test_parser_reused_for_next_request() {
        let mut buf = ByteBuffer::new();
        let mut req = HttpRequest::new();
        buf.append(b"GET /a.css HTTP/1.1\r\nX: 1\r\n\r\n");
        assert_eq!(req.parse(&mut buf, &RejectAll), Ok(()));
        assert_eq!(req.path(), "/a.css");

        buf.append(b"GET /b.js HTTP/1.0\r\n\r\n");
        assert_eq!(req.parse(&mut buf, &RejectAll), Ok(()));
        assert_eq!(req.path(), "/b.js");
        assert_eq!(req.version(), "1.0");
        assert_eq!(req.header("x"), None);
    }
}
