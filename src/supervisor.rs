//! External process supervision.
//!
//! Every encoder and the multiplexer run as named OS processes tracked in a
//! key -> handle table owned here. The runtime core only ever holds keys
//! ("svc:FIP:audioenc", "mux:odr-dabmux"), never process handles, so process
//! lifetime has exactly one owner. Output is forwarded line-by-line into the
//! engine log tagged with the key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::{EngineError, Result};
use crate::logging::LogSink;

const STOP_TIMEOUT_MS: u64 = 1500;

struct ProcEntry {
    pid: i32,
    /// Flips to true when the waiter task observes the exit.
    exited: watch::Receiver<bool>,
}

pub struct ProcessSupervisor {
    bin_dir: String,
    sink: Arc<LogSink>,
    // Shared with the per-process waiter tasks, which release keys on exit.
    procs: Arc<Mutex<HashMap<String, ProcEntry>>>,
}

impl ProcessSupervisor {
    pub fn new(bin_dir: String, sink: Arc<LogSink>) -> Self {
        Self { bin_dir, sink, procs: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn resolve_bin(&self, bin: &str) -> PathBuf {
        if self.bin_dir.is_empty() || Path::new(bin).is_absolute() {
            PathBuf::from(bin)
        } else {
            Path::new(&self.bin_dir).join(bin)
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.procs.lock().unwrap().contains_key(key)
    }

    pub fn running_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.procs.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Launch `bin args` under `key`. Stdout/stderr are streamed into the
    /// engine log; a waiter task logs the exit and releases the key.
    pub fn spawn(&self, key: &str, bin: &str, args: &[String], cwd: Option<&Path>) -> Result<()> {
        if self.is_running(key) {
            return Err(EngineError::AlreadyRunning(key.to_string()));
        }

        let resolved = self.resolve_bin(bin);
        self.sink
            .line(key, &format!("spawn: {} {}", resolved.display(), args.join(" ")));

        let mut cmd = Command::new(&resolved);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            self.sink.line(key, &format!("spawn failed: {e}"));
            EngineError::Io(e)
        })?;

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);

        if let Some(stdout) = child.stdout.take() {
            forward_lines(key.to_string(), self.sink.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(key.to_string(), self.sink.clone(), stderr);
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        self.procs
            .lock()
            .unwrap()
            .insert(key.to_string(), ProcEntry { pid, exited: exit_rx });

        // Waiter: owns the child, reaps it, releases the key.
        let sink = self.sink.clone();
        let procs = self.procs.clone();
        let key_owned = key.to_string();
        tokio::spawn(async move {
            let msg = match child.wait().await {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    format!("exit: code={:?} signal={:?}", status.code(), status.signal())
                }
                Err(e) => format!("wait failed: {e}"),
            };
            sink.line(&key_owned, &msg);
            procs.lock().unwrap().remove(&key_owned);
            let _ = exit_tx.send(true);
        });

        Ok(())
    }

    /// SIGTERM, bounded wait, SIGKILL. A key that is not tracked (already
    /// exited, or never started) is a no-op — stop never fails.
    pub async fn stop(&self, key: &str) {
        self.stop_with(key, libc::SIGTERM, STOP_TIMEOUT_MS).await
    }

    pub async fn stop_with(&self, key: &str, signal: i32, timeout_ms: u64) {
        let (pid, mut exited) = {
            let procs = self.procs.lock().unwrap();
            match procs.get(key) {
                Some(entry) => (entry.pid, entry.exited.clone()),
                None => return,
            }
        };

        self.sink.line(key, &format!("stop: sending signal {signal}"));
        send_signal(pid, signal);

        let wait = async {
            while !*exited.borrow_and_update() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(Duration::from_millis(timeout_ms), wait)
            .await
            .is_err()
        {
            self.sink.line(key, "stop: force SIGKILL");
            send_signal(pid, libc::SIGKILL);
        }
    }
}

fn forward_lines<R>(key: String, sink: Arc<LogSink>, stream: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.line(&key, line.trim_end());
        }
    });
}

fn send_signal(pid: i32, signal: i32) {
    if pid <= 0 {
        return;
    }
    // tokio's Child::kill is SIGKILL-only; graceful TERM goes through libc.
    unsafe {
        libc::kill(pid, signal);
    }
}
