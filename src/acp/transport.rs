//! Frame transport: line-delimited JSON over an ordered byte stream.
//!
//! The transport either spawns an agent subprocess with piped stdio or wraps
//! an arbitrary reader/writer pair. Outgoing frames are funneled through a
//! single background write task; incoming frames are drained line-by-line by
//! the connection's one reader task via [`FrameSource`].

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::log;

/// Handle for sending frames. Cheap to clone; all clones share the one
/// write task.
#[derive(Clone, Debug)]
pub struct Transport {
    tx: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
}

impl Transport {
    /// Queue one frame for delivery. Fails once the channel is down.
    pub async fn send_line(&self, line: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(line)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Whether the write side has observed channel death.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The inbound side of the channel: a lazy sequence of frames, terminating
/// (not erroring) when the channel closes.
pub struct FrameSource {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSource").finish_non_exhaustive()
    }
}

impl FrameSource {
    /// Next non-empty line, or `None` once the stream is done.
    pub async fn next_line(&mut self) -> Option<String> {
        let mut buf = String::new();
        loop {
            buf.clear();
            match self.reader.read_line(&mut buf).await {
                Ok(0) => return None,
                Ok(_) => {
                    let line = buf.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(line.to_string());
                }
                Err(e) => {
                    log::log_event(&format!("read error on transport: {}", e));
                    return None;
                }
            }
        }
    }
}

/// Spawn an agent subprocess and connect a transport over its stdio.
pub fn spawn(
    command: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> Result<(Transport, FrameSource, Child), TransportError> {
    if command.is_empty() {
        return Err(TransportError::SpawnFailed(
            "agent command must not be empty".to_string(),
        ));
    }

    let mut cmd = Command::new(&command[0]);
    if command.len() > 1 {
        cmd.args(&command[1..]);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .map_err(|e| TransportError::SpawnFailed(e.to_string()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::SpawnFailed("no stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::SpawnFailed("no stdout".to_string()))?;

    let (transport, source) = from_stream(stdout, stdin);
    Ok((transport, source, child))
}

/// Connect a transport over an arbitrary reader/writer pair.
pub fn from_stream<R, W>(reader: R, writer: W) -> (Transport, FrameSource)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(32);
    let closed = Arc::new(AtomicBool::new(false));

    let closed_write = closed.clone();
    let mut writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            log::log_outgoing(&msg);
            if writer.write_all(msg.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = writer.flush().await;
        }
        closed_write.store(true, Ordering::Release);
    });

    let transport = Transport { tx, closed };
    let source = FrameSource {
        reader: Box::new(BufReader::new(reader)),
    };
    (transport, source)
}
