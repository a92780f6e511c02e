//! Operator-visible engine log.
//!
//! External process output, watchdog switches and metadata failures all land
//! here, tagged with a scope key, so `GET /api/logs` shows one merged
//! timeline. `tracing` stays the developer-facing channel; this file is the
//! one operators read.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub struct LogSink {
    path: PathBuf,
    // Serializes appends; writes are tiny single lines.
    write_lock: Mutex<()>,
}

impl LogSink {
    pub fn new(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path, write_lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `[timestamp] [scope] message` line. Best-effort: a full
    /// disk must not take the engine down with it.
    pub fn line(&self, scope: &str, msg: &str) {
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("-"));
        let entry = format!("[{ts}] [{scope}] {msg}\n");

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let res = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(e) = res {
            tracing::warn!("log sink write failed: {e}");
        }
    }

    /// Full log contents for the API; empty string when nothing was written.
    pub fn read_all(&self) -> String {
        std::fs::read_to_string(&self.path).unwrap_or_default()
    }
}
