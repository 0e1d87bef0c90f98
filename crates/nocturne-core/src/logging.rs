// src/logging.rs
//! Tracing subscriber setup for the server.
//!
//! Formatted events go either straight to the sink or through a bounded
//! queue drained by a dedicated writer thread, depending on
//! [`LogConfig::queue_capacity`]. When the queue is full, the logging thread
//! blocks until the writer catches up.
//!
//! With a log directory configured the sink is a [`RollingFile`]: one file per
//! local day, split every [`LogConfig::max_lines`] lines.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from
//! [`LogConfig::level`]:
//!
//! ```bash
//! RUST_LOG=nocturne_core=debug nocturne --port 8080
//! ```

use crate::config::LogConfig;
use crate::error::{NocturneError, NocturneResult};
use chrono::{Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

enum Message {
    Line(Vec<u8>),
    Flush(SyncSender<()>),
    Close,
}

/// Install the global subscriber described by `cfg`.
///
/// Returns `None` when logging is disabled. Keep the guard alive for the
/// lifetime of the process; dropping it flushes and stops the writer thread.
pub fn init_logging(cfg: &LogConfig) -> NocturneResult<Option<LogGuard>> {
    if !cfg.enabled {
        return Ok(None);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let (writer, guard) = build_writer(cfg)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(cfg.directory.is_none())
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| NocturneError::Config(format!("logging already initialized: {}", e)))?;

    Ok(Some(guard))
}

/// Writer for the configured sink, plus the guard owning its writer thread
/// when the sink is queued.
pub fn build_writer(cfg: &LogConfig) -> NocturneResult<(BoxMakeWriter, LogGuard)> {
    let sink = open_sink(cfg)?;

    if cfg.queue_capacity == 0 {
        let guard = LogGuard {
            tx: None,
            handle: None,
        };
        return Ok((BoxMakeWriter::new(Mutex::new(sink)), guard));
    }

    let (tx, rx) = mpsc::sync_channel(cfg.queue_capacity);
    let handle = thread::Builder::new()
        .name("nocturne-log".to_string())
        .spawn(move || writer_loop(rx, sink))?;

    let writer = QueueWriter { tx: tx.clone() };
    let guard = LogGuard {
        tx: Some(tx),
        handle: Some(handle),
    };
    Ok((BoxMakeWriter::new(writer), guard))
}

fn open_sink(cfg: &LogConfig) -> io::Result<Box<dyn Write + Send>> {
    match &cfg.directory {
        Some(dir) => {
            let mut file = RollingFile::open(dir, cfg.max_lines)?;
            // Queued lines are flushed per batch by the writer thread.
            file.autoflush = cfg.queue_capacity == 0;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

/// Name of the `part`-th log file of `day`: `2026_10_17.log`, then
/// `2026_10_17-1.log` and so on.
pub fn log_file_name(day: NaiveDate, part: usize) -> String {
    let day = day.format("%Y_%m_%d");
    if part == 0 {
        format!("{}.log", day)
    } else {
        format!("{}-{}.log", day, part)
    }
}

/// Log file that starts a new file when the local date changes and splits a
/// day's log every `max_lines` lines.
pub struct RollingFile {
    dir: PathBuf,
    max_lines: usize,
    day: NaiveDate,
    part: usize,
    lines: usize,
    file: BufWriter<File>,
    autoflush: bool,
}

impl RollingFile {
    pub fn open(dir: &Path, max_lines: usize) -> io::Result<Self> {
        Self::open_on(dir, max_lines, Local::now().date_naive())
    }

    fn open_on(dir: &Path, max_lines: usize, day: NaiveDate) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = open_append(&dir.join(log_file_name(day, 0)))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_lines,
            day,
            part: 0,
            lines: 0,
            file: BufWriter::new(file),
            autoflush: false,
        })
    }

    /// File currently written to.
    pub fn path(&self) -> PathBuf {
        self.dir.join(log_file_name(self.day, self.part))
    }

    fn write_on(&mut self, buf: &[u8], today: NaiveDate) -> io::Result<()> {
        if today != self.day {
            self.roll(today, 0)?;
        } else if self.max_lines > 0 && self.lines >= self.max_lines {
            self.roll(today, self.part + 1)?;
        }
        self.file.write_all(buf)?;
        self.lines += memchr::memchr_iter(b'\n', buf).count();
        if self.autoflush {
            self.file.flush()?;
        }
        Ok(())
    }

    fn roll(&mut self, day: NaiveDate, part: usize) -> io::Result<()> {
        self.file.flush()?;
        let file = open_append(&self.dir.join(log_file_name(day, part)))?;
        self.file = BufWriter::new(file);
        self.day = day;
        self.part = part;
        self.lines = 0;
        Ok(())
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_on(buf, Local::now().date_naive())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn writer_loop(rx: Receiver<Message>, mut out: Box<dyn Write + Send>) {
    'outer: while let Ok(msg) = rx.recv() {
        let mut next = Some(msg);
        // Write everything already queued before paying for a flush.
        while let Some(msg) = next {
            match msg {
                Message::Line(line) => {
                    let _ = out.write_all(&line);
                }
                Message::Flush(ack) => {
                    let _ = out.flush();
                    let _ = ack.send(());
                }
                Message::Close => break 'outer,
            }
            next = rx.try_recv().ok();
        }
        let _ = out.flush();
    }
    let _ = out.flush();
}

#[derive(Clone)]
struct QueueWriter {
    tx: SyncSender<Message>,
}

impl<'a> MakeWriter<'a> for QueueWriter {
    type Writer = QueuedLine;

    fn make_writer(&'a self) -> Self::Writer {
        QueuedLine {
            buf: Vec::with_capacity(256),
            tx: self.tx.clone(),
        }
    }
}

/// Collects one formatted event and enqueues it when dropped.
struct QueuedLine {
    buf: Vec<u8>,
    tx: SyncSender<Message>,
}

impl Write for QueuedLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for QueuedLine {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            // A closed queue means logging has shut down; the line is dropped.
            let _ = self.tx.send(Message::Line(std::mem::take(&mut self.buf)));
        }
    }
}

/// Owns the asynchronous writer thread, if any.
pub struct LogGuard {
    tx: Option<SyncSender<Message>>,
    handle: Option<JoinHandle<()>>,
}

impl LogGuard {
    /// Block until every line queued so far has reached the sink.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if tx.send(Message::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub fn is_async(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Message::Close);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(dir: &Path, queue_capacity: usize) -> LogConfig {
        LogConfig {
            enabled: true,
            level: "info".to_string(),
            queue_capacity,
            directory: Some(dir.to_path_buf()),
            max_lines: 50_000,
        }
    }

    fn todays_log(dir: &Path) -> String {
        fs::read_to_string(dir.join(log_file_name(Local::now().date_naive(), 0))).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn emit(writer: BoxMakeWriter, count: usize) {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            for i in 0..count {
                tracing::info!(seq = i, "queued line");
            }
        });
    }

    #[test]
    fn test_queued_writer_delivers_every_line() {
        let dir = tempfile::tempdir().unwrap();
        // A queue smaller than the burst exercises the blocking path.
        let (writer, guard) = build_writer(&file_config(dir.path(), 4)).unwrap();
        assert!(guard.is_async());

        emit(writer, 200);
        guard.flush();

        let text = todays_log(dir.path());
        let lines: Vec<_> = text.lines().filter(|l| l.contains("queued line")).collect();
        assert_eq!(lines.len(), 200);
        assert!(lines[0].contains("seq=0"));
        assert!(lines[199].contains("seq=199"));
    }

    #[test]
    fn test_sync_writer() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, guard) = build_writer(&file_config(dir.path(), 0)).unwrap();
        assert!(!guard.is_async());

        emit(writer, 3);
        guard.flush();

        let text = todays_log(dir.path());
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_drop_guard_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, guard) = build_writer(&file_config(dir.path(), 64)).unwrap();
        emit(writer, 10);
        drop(guard);

        let text = todays_log(dir.path());
        assert_eq!(text.lines().count(), 10);
    }

    #[test]
    fn test_disabled_installs_nothing() {
        let cfg = LogConfig {
            enabled: false,
            ..LogConfig::default()
        };
        assert!(init_logging(&cfg).unwrap().is_none());
    }

    #[test]
    fn test_file_name_format() {
        assert_eq!(log_file_name(day(2026, 3, 7), 0), "2026_03_07.log");
        assert_eq!(log_file_name(day(2026, 3, 7), 2), "2026_03_07-2.log");
    }

    #[test]
    fn test_new_day_starts_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = RollingFile::open_on(dir.path(), 0, day(2026, 10, 16)).unwrap();
        file.write_on(b"before midnight\n", day(2026, 10, 16)).unwrap();
        file.write_on(b"after midnight\n", day(2026, 10, 17)).unwrap();
        file.flush().unwrap();

        assert_eq!(file.path(), dir.path().join("2026_10_17.log"));
        let old = fs::read_to_string(dir.path().join("2026_10_16.log")).unwrap();
        let new = fs::read_to_string(dir.path().join("2026_10_17.log")).unwrap();
        assert_eq!(old, "before midnight\n");
        assert_eq!(new, "after midnight\n");
    }

    #[test]
    fn test_day_split_every_max_lines() {
        let dir = tempfile::tempdir().unwrap();
        let today = day(2026, 10, 17);
        let mut file = RollingFile::open_on(dir.path(), 2, today).unwrap();
        for i in 0..5 {
            file.write_on(format!("line {}\n", i).as_bytes(), today).unwrap();
        }
        file.flush().unwrap();

        let read = |name: &str| fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("2026_10_17.log"), "line 0\nline 1\n");
        assert_eq!(read("2026_10_17-1.log"), "line 2\nline 3\n");
        assert_eq!(read("2026_10_17-2.log"), "line 4\n");
    }
}
