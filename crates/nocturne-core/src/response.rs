// src/response.rs
use crate::buffer::ByteBuffer;
use crate::http::{Status, mime_type};
use crate::syscalls::MappedFile;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const KEEP_ALIVE_HEADER: &[u8] = b"Connection: keep-alive\r\nKeep-Alive: max=6";
const CLOSE_HEADERS: &[u8] = b"Connection: close\r\n";

/// Response for one request: status decision, header block and an optional
/// read-only mapping of the file being served.
pub struct HttpResponse {
    doc_root: Arc<Path>,
    /// Advertised as `Keep-Alive: timeout=`. `None` when idle eviction is off.
    idle_secs: Option<u64>,
    path: String,
    status: Status,
    keep_alive: bool,
    mapped: Option<MappedFile>,
}

impl HttpResponse {
    /// `idle_timeout` is the server's idle eviction period; keep-alive
    /// responses advertise it rounded down to whole seconds.
    pub fn new(doc_root: Arc<Path>, idle_timeout: Option<Duration>) -> Self {
        Self {
            doc_root,
            idle_secs: idle_timeout.map(|t| t.as_secs()),
            path: String::new(),
            status: Status::Ok,
            keep_alive: false,
            mapped: None,
        }
    }

    /// Prepare for a new request. Releases the mapping of the previous one.
    pub fn init(&mut self, path: &str, keep_alive: bool, code: u16) {
        self.mapped = None;
        self.path.clear();
        self.path.push_str(path);
        self.keep_alive = keep_alive;
        self.status = Status::from_code(code);
    }

    /// Decide the final status and append the status line and headers to
    /// `out`. A served file is kept mapped and exposed through [`file`](Self::file).
    pub fn make_response(&mut self, out: &mut ByteBuffer) {
        self.mapped = None;

        let mut status = self.status;
        let mut target = None;
        if status == Status::Ok {
            match self.resolve(&self.path) {
                Ok(p) => target = Some(p),
                Err(s) => status = s,
            }
        }
        if let Some(page) = status.error_page() {
            self.path.clear();
            self.path.push_str(page);
            target = self.resolve(page).ok();
        }

        let body = target.and_then(|p| match MappedFile::open(&p) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "cannot map file");
                None
            }
        });
        if body.is_none() && status == Status::Ok {
            status = Status::NotFound;
        }
        self.status = status;

        out.append(status.status_line());
        if self.keep_alive {
            out.append(KEEP_ALIVE_HEADER);
            if let Some(secs) = self.idle_secs {
                let mut n = itoa::Buffer::new();
                out.append(b", timeout=");
                out.append(n.format(secs).as_bytes());
            }
            out.append(b"\r\n");
        } else {
            out.append(CLOSE_HEADERS);
        }
        append_header(out, "Date", &httpdate::fmt_http_date(SystemTime::now()));

        match body {
            Some(file) => {
                append_header(out, "Content-Type", mime_type(&self.path));
                let mut len = itoa::Buffer::new();
                append_header(out, "Content-Length", len.format(file.len()));
                out.append(b"\r\n");
                if !file.is_empty() {
                    self.mapped = Some(file);
                }
            }
            None => self.error_content(out, "File Not Found"),
        }

        tracing::debug!(path = %self.path, code = status.code(), "response staged");
    }

    /// Inline HTML error body, used when no page can be mapped.
    pub fn error_content(&self, out: &mut ByteBuffer, message: &str) {
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>nocturne</em></body></html>",
            self.status.code(),
            self.status.reason(),
            message
        );
        append_header(out, "Content-Type", "text/html");
        let mut len = itoa::Buffer::new();
        append_header(out, "Content-Length", len.format(body.len()));
        out.append(b"\r\n");
        out.append_str(&body);
    }

    /// Mapped bytes of the file being served; empty when there is none.
    pub fn file(&self) -> &[u8] {
        self.mapped
            .as_ref()
            .map(MappedFile::as_slice)
            .unwrap_or_default()
    }

    pub fn file_len(&self) -> usize {
        self.mapped.as_ref().map_or(0, |m| m.len())
    }

    pub fn unmap(&mut self) {
        self.mapped = None;
    }

    pub fn code(&self) -> u16 {
        self.status.code()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Map a request path onto the document root and check it can be served.
    fn resolve(&self, path: &str) -> Result<PathBuf, Status> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|seg| seg == "..") {
            return Err(Status::Forbidden);
        }
        let full = self.doc_root.join(relative);
        let meta = fs::metadata(&full).map_err(|_| Status::NotFound)?;
        if meta.is_dir() {
            return Err(Status::NotFound);
        }
        // Other-readable bit.
        if meta.permissions().mode() & 0o004 == 0 {
            return Err(Status::Forbidden);
        }
        Ok(full)
    }
}

fn append_header(out: &mut ByteBuffer, name: &str, value: &str) {
    out.append_str(name);
    out.append(b": ");
    out.append_str(value);
    out.append(b"\r\n");
}
