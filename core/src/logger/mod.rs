//! Rotating access logger.
//!
//! One line per completed request, serialized behind a single mutex
//! so concurrent connections never interleave partial writes. When
//! the file has grown past its configured size, it's renamed aside
//! with a timestamp suffix and a fresh file opened in its place, in
//! the spirit of the teacher's size-triggered rotation elsewhere in
//! the pack, adapted here to a flat line-oriented log instead of a
//! structured subscriber appender.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::{Local, SecondsFormat, Utc};
use parking_lot::Mutex;
use tracing::warn;

/// action tag recorded against a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allowed,
    Blocked,
    CacheHit,
    AuthFailed,
    Error,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Allowed => "ALLOWED",
            Action::Blocked => "BLOCKED",
            Action::CacheHit => "CACHE_HIT",
            Action::AuthFailed => "AUTH_FAILED",
            Action::Error => "ERROR",
        }
    }
}

/// a single completed request, ready to be formatted into a log line.
pub struct LogEntry {
    pub client_addr: SocketAddr,
    pub dest_host: String,
    pub dest_port: u16,
    pub method: String,
    pub target: String,
    pub action: Action,
    /// upstream status, or `0` when unknown/not applicable.
    pub status: u16,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    pub blocked_rule: Option<String>,
}

impl LogEntry {
    fn format(&self, timestamp: &str) -> String {
        let status = if self.status == 0 {
            "-".to_string()
        } else {
            self.status.to_string()
        };
        let mut line = format!(
            "{} {} -> {}:{} \"{} {} HTTP/1.1\" {} {} {} {}",
            timestamp,
            self.client_addr,
            self.dest_host,
            self.dest_port,
            self.method,
            self.target,
            self.action.as_str(),
            status,
            self.bytes_upstream,
            self.bytes_downstream,
        );
        if let Some(rule) = &self.blocked_rule {
            if !rule.is_empty() {
                line.push_str(&format!(" [BLOCKED: {rule}]"));
            }
        }
        line.push('\n');
        line
    }
}

struct Inner {
    path: PathBuf,
    file: File,
    max_bytes: u64,
    written: u64,
}

/// the shared access logger. One per server; held behind an `Arc` and
/// handed to every connection task.
pub struct Logger {
    inner: Mutex<Inner>,
}

impl Logger {
    pub fn open(path: &Path, max_size_mb: u64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Logger {
            inner: Mutex::new(Inner {
                path: path.to_path_buf(),
                file,
                max_bytes: max_size_mb.saturating_mul(1024 * 1024),
                written,
            }),
        })
    }

    /// append one access log line, rotating first if the file has
    /// already grown past its configured size. Rotation failures are
    /// logged and swallowed; a request is never failed on account of
    /// logging.
    pub fn log(&self, entry: LogEntry) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let line = entry.format(&timestamp);

        let mut inner = self.inner.lock();
        if inner.written >= inner.max_bytes {
            if let Err(e) = rotate(&mut inner) {
                warn!(error = %e, path = %inner.path.display(), "access log rotation failed");
            }
        }
        match inner.file.write_all(line.as_bytes()) {
            Ok(()) => {
                let _ = inner.file.flush();
                inner.written += line.len() as u64;
            }
            Err(e) => warn!(error = %e, "failed to write access log entry"),
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        let _ = inner.file.flush();
    }
}

fn rotate(inner: &mut Inner) -> std::io::Result<()> {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let rotated = rotated_path(&inner.path, &timestamp);
    inner.file.flush()?;
    std::fs::rename(&inner.path, &rotated)?;
    inner.file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&inner.path)?;
    inner.written = 0;
    Ok(())
}

fn rotated_path(path: &Path, timestamp: &str) -> PathBuf {
    let mut rotated = path.as_os_str().to_os_string();
    rotated.push(format!(".{timestamp}"));
    PathBuf::from(rotated)
}
