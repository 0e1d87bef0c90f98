// src/http.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

/// The status codes this server emits. Anything else is coerced to
/// [`Status::BadRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
}

impl Status {
    pub fn from_code(code: u16) -> Self {
        match code {
            200 => Status::Ok,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            _ => Status::BadRequest,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
        }
    }

    /// Document-root relative page served in place of the requested file.
    pub fn error_page(self) -> Option<&'static str> {
        match self {
            Status::Ok => None,
            Status::BadRequest => Some("/400.html"),
            Status::Forbidden => Some("/403.html"),
            Status::NotFound => Some("/404.html"),
        }
    }

    /// Pre-rendered status line including the trailing CRLF.
    pub(crate) fn status_line(self) -> &'static [u8] {
        match self {
            Status::Ok => b"HTTP/1.1 200 OK\r\n",
            Status::BadRequest => b"HTTP/1.1 400 Bad Request\r\n",
            Status::Forbidden => b"HTTP/1.1 403 Forbidden\r\n",
            Status::NotFound => b"HTTP/1.1 404 Not Found\r\n",
        }
    }
}

static MIME_TYPES: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/nsword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css"),
    (".js", "text/javascript"),
];

/// Content type for a request path, keyed on the suffix after its last `.`.
pub fn mime_type(path: &str) -> &'static str {
    let file = path.rsplit('/').next().unwrap_or(path);
    let Some(dot) = file.rfind('.') else {
        return "text/plain";
    };
    let suffix = &file[dot..];
    MIME_TYPES
        .iter()
        .find(|(ext, _)| ext.eq_ignore_ascii_case(suffix))
        .map(|(_, mime)| *mime)
        .unwrap_or("text/plain")
}
