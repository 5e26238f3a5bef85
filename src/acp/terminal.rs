//! Delegated terminal subprocesses.
//!
//! The callback bridge tracks one table of live subprocess handles per
//! connection, keyed by an opaque terminal id. Kill and release are
//! idempotent, and every live child is signalled when its session or the
//! connection ends — a terminal must never outlive the protocol connection.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Notify, watch};

use crate::acp::protocol::TerminalCreateParams;
use crate::log;

/// Exit information for a finished terminal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerminalExit {
    /// Process exit code; `None` when the process died to a signal.
    pub exit_code: Option<i32>,
}

/// Snapshot of a terminal's buffered output.
#[derive(Debug, Clone)]
pub struct TerminalSnapshot {
    pub output: String,
    pub truncated: bool,
    pub exit: Option<TerminalExit>,
}

struct OutputBuffer {
    data: String,
    truncated: bool,
    limit: Option<usize>,
}

impl OutputBuffer {
    fn push(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        if let Some(limit) = self.limit {
            if self.data.len() > limit {
                // Keep the tail, respecting char boundaries.
                let mut start = self.data.len() - limit;
                while start < self.data.len() && !self.data.is_char_boundary(start) {
                    start += 1;
                }
                self.data = self.data.split_off(start);
                self.truncated = true;
            }
        }
    }
}

struct TerminalEntry {
    session_id: String,
    output: Arc<Mutex<OutputBuffer>>,
    exit_rx: watch::Receiver<Option<TerminalExit>>,
    kill: Arc<Notify>,
}

/// Per-connection arena of live terminal subprocesses.
pub struct TerminalTable {
    inner: Mutex<TerminalInner>,
}

struct TerminalInner {
    counter: u64,
    entries: HashMap<String, TerminalEntry>,
}

impl TerminalTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TerminalInner {
                counter: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// Spawn a subprocess and register it, returning its opaque id.
    pub fn create(&self, params: &TerminalCreateParams) -> std::io::Result<String> {
        // Run through the shell so pipes, redirects, etc. work.
        let full_command = if params.args.is_empty() {
            params.command.clone()
        } else {
            format!("{} {}", params.command, params.args.join(" "))
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c");
        cmd.arg(&full_command);
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }
        for env_var in &params.env {
            cmd.env(&env_var.name, &env_var.value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        let output = Arc::new(Mutex::new(OutputBuffer {
            data: String::new(),
            truncated: false,
            limit: params.output_byte_limit,
        }));
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());

        if let Some(stdout) = child.stdout.take() {
            spawn_drain(stdout, output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_drain(stderr, output.clone());
        }

        // Monitor task owns the child: it either reaps a natural exit or
        // kills on signal, then publishes the exit exactly once.
        let kill_signal = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit_code = status.ok().and_then(|s| s.code());
            let _ = exit_tx.send(Some(TerminalExit { exit_code }));
        });

        let mut inner = self.inner.lock().unwrap();
        inner.counter += 1;
        let terminal_id = format!("term_{}", inner.counter);
        inner.entries.insert(
            terminal_id.clone(),
            TerminalEntry {
                session_id: params.session_id.clone(),
                output,
                exit_rx,
                kill,
            },
        );
        log::log_event(&format!(
            "terminal {} created for session {}",
            terminal_id, params.session_id
        ));
        Ok(terminal_id)
    }

    /// Current buffered output plus exit state, if the id is known.
    pub fn output(&self, terminal_id: &str) -> Option<TerminalSnapshot> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(terminal_id)?;
        let buf = entry.output.lock().unwrap();
        Some(TerminalSnapshot {
            output: buf.data.clone(),
            truncated: buf.truncated,
            exit: *entry.exit_rx.borrow(),
        })
    }

    /// Wait until the terminal exits. Returns `None` for an unknown id.
    pub async fn wait_for_exit(&self, terminal_id: &str) -> Option<TerminalExit> {
        let mut exit_rx = {
            let inner = self.inner.lock().unwrap();
            inner.entries.get(terminal_id)?.exit_rx.clone()
        };
        match exit_rx.wait_for(|e| e.is_some()).await {
            Ok(exit) => *exit,
            // Monitor task gone without publishing: treat as signalled death.
            Err(_) => Some(TerminalExit { exit_code: None }),
        }
    }

    /// Signal the subprocess. Repeated kills and kills on already-finished
    /// terminals are not errors.
    pub fn kill(&self, terminal_id: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get(terminal_id) {
            entry.kill.notify_one();
        }
    }

    /// Kill and stop tracking. Idempotent.
    pub fn release(&self, terminal_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(terminal_id) {
            entry.kill.notify_one();
        }
    }

    /// Kill and drop every terminal belonging to a session.
    pub fn release_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|id, entry| {
            if entry.session_id == session_id {
                entry.kill.notify_one();
                log::log_event(&format!("terminal {} released with session", id));
                false
            } else {
                true
            }
        });
    }

    /// Signal every live terminal. Called during connection teardown, before
    /// the reader task exits.
    pub fn release_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.entries.values() {
            entry.kill.notify_one();
        }
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn spawn_drain(
    mut stream: impl AsyncReadExt + Send + Unpin + 'static,
    output: Arc<Mutex<OutputBuffer>>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    output.lock().unwrap().push(&chunk);
                }
            }
        }
    });
}
