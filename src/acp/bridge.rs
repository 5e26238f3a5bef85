//! Callback bridge: remote-initiated requests to local handlers.
//!
//! Every inbound request produces exactly one well-formed response frame,
//! whatever the handler does. Handlers run with a bounded wait; failures and
//! timeouts become protocol-legal negative responses and are never
//! propagated as local errors. The bridge is invoked off the reader task, so
//! a slow handler cannot stall delivery of unrelated frames.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use crate::acp::protocol::{
    FsReadTextFileParams, FsWriteTextFileParams, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
    PermissionRequestParams, RequestPermissionResponse, TerminalCreateParams, TerminalKillParams,
    TerminalOutputParams, TerminalWaitParams,
};
use crate::acp::terminal::TerminalTable;
use crate::error::HandlerError;
use crate::handlers::{Handlers, PermissionDecision, PermissionRequest};
use crate::log;
use crate::session::state::SessionShared;

pub type SessionMap = Mutex<HashMap<String, Arc<SessionShared>>>;

pub struct CallbackBridge {
    handlers: Handlers,
    handler_timeout: Duration,
}

impl CallbackBridge {
    pub fn new(handlers: Handlers, handler_timeout: Duration) -> Self {
        Self {
            handlers,
            handler_timeout,
        }
    }

    /// Serve one inbound request, returning the response frame to send.
    pub async fn handle_request(
        &self,
        sessions: &SessionMap,
        terminals: &TerminalTable,
        id: u64,
        method: &str,
        params: Option<Value>,
    ) -> Value {
        let params = params.unwrap_or(Value::Null);
        match method {
            "session/request_permission" => {
                self.handle_permission(id, params).await
            }
            "fs/read_text_file" => self.handle_fs_read(sessions, id, params).await,
            "fs/write_text_file" => self.handle_fs_write(sessions, id, params).await,
            "tool/message" => self.handle_tool_message(id, params).await,
            "terminal/create" => handle_terminal_create(sessions, terminals, id, params),
            "terminal/output" => handle_terminal_output(terminals, id, params),
            "terminal/wait_for_exit" => handle_terminal_wait(terminals, id, params).await,
            "terminal/kill" => handle_terminal_kill(terminals, id, params, false),
            "terminal/release" => handle_terminal_kill(terminals, id, params, true),
            other => {
                log::log_event(&format!("unsupported inbound request: {}", other));
                error_frame(id, METHOD_NOT_FOUND, format!("method not supported: {other}"))
            }
        }
    }

    async fn handle_permission(&self, id: u64, params: Value) -> Value {
        let parsed: PermissionRequestParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return error_frame(id, INVALID_PARAMS, format!("invalid params: {e}")),
        };

        let request = PermissionRequest {
            session_id: parsed.session_id,
            tool_call_id: parsed.tool_call.tool_call_id,
            title: parsed.tool_call.title,
            options: parsed.options,
        };

        let decision = match &self.handlers.permission {
            // No policy registered: default deny rather than leaving the
            // agent's request outstanding.
            None => {
                log::log_event("permission request with no handler registered, denying");
                PermissionDecision::Cancelled
            }
            Some(handler) => {
                let handler = handler.clone();
                let bounded = tokio::time::timeout(
                    self.handler_timeout,
                    tokio::spawn(async move { handler.on_permission(request).await }),
                )
                .await;
                match bounded {
                    Ok(Ok(Ok(decision))) => decision,
                    Ok(Ok(Err(e))) => {
                        log::log_event(&format!("permission handler failed: {}", e));
                        PermissionDecision::Cancelled
                    }
                    Ok(Err(join_err)) => {
                        log::log_event(&format!("permission handler panicked: {}", join_err));
                        PermissionDecision::Cancelled
                    }
                    Err(_) => {
                        log::log_event("permission handler timed out, denying");
                        PermissionDecision::Cancelled
                    }
                }
            }
        };

        let response = match decision {
            PermissionDecision::Selected { option_id } => {
                RequestPermissionResponse::selected(option_id)
            }
            PermissionDecision::Cancelled => RequestPermissionResponse::cancelled(),
        };
        match serde_json::to_value(&response) {
            Ok(result) => result_frame(id, result),
            Err(e) => error_frame(id, INTERNAL_ERROR, e.to_string()),
        }
    }

    async fn handle_tool_message(&self, id: u64, params: Value) -> Value {
        let Some(handler) = self.handlers.tool.clone() else {
            return error_frame(id, METHOD_NOT_FOUND, "no tool handler registered".to_string());
        };

        let session_id = params
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let outcome = run_bounded(self.handler_timeout, async move {
            handler.on_tool_message(session_id.as_deref(), params).await
        })
        .await;

        match outcome {
            Ok(result) => result_frame(id, result),
            Err(e) => {
                log::log_event(&format!("tool/message handler error: {}", e));
                error_frame(id, INTERNAL_ERROR, format!("tool handler failed: {e}"))
            }
        }
    }

    async fn handle_fs_read(&self, sessions: &SessionMap, id: u64, params: Value) -> Value {
        let parsed: FsReadTextFileParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return error_frame(id, INVALID_PARAMS, format!("invalid params: {e}")),
        };

        let path = PathBuf::from(&parsed.path);
        if let Some(frame) = check_containment(sessions, &parsed.session_id, &path, id) {
            return frame;
        }
        let Some(handler) = self.handlers.fs.clone() else {
            return error_frame(id, METHOD_NOT_FOUND, "no file handler registered".to_string());
        };

        let (line, limit) = (parsed.line, parsed.limit);
        let outcome = run_bounded(self.handler_timeout, async move {
            handler.read_text_file(&path, line, limit).await
        })
        .await;

        match outcome {
            Ok(content) => result_frame(id, json!({ "content": content })),
            Err(e) => {
                log::log_event(&format!("fs/read_text_file handler error: {}", e));
                error_frame(id, INTERNAL_ERROR, format!("failed to read file: {e}"))
            }
        }
    }

    async fn handle_fs_write(&self, sessions: &SessionMap, id: u64, params: Value) -> Value {
        let parsed: FsWriteTextFileParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return error_frame(id, INVALID_PARAMS, format!("invalid params: {e}")),
        };

        let path = PathBuf::from(&parsed.path);
        if let Some(frame) = check_containment(sessions, &parsed.session_id, &path, id) {
            return frame;
        }
        let Some(handler) = self.handlers.fs.clone() else {
            return error_frame(id, METHOD_NOT_FOUND, "no file handler registered".to_string());
        };

        let content = parsed.content;
        let outcome = run_bounded(self.handler_timeout, async move {
            handler.write_text_file(&path, &content).await
        })
        .await;

        match outcome {
            Ok(()) => result_frame(id, json!({ "success": true })),
            Err(e) => {
                log::log_event(&format!("fs/write_text_file handler error: {}", e));
                error_frame(id, INTERNAL_ERROR, format!("failed to write file: {e}"))
            }
        }
    }
}

/// Run a handler future with the bridge's bounded wait.
async fn run_bounded<T, F>(timeout: Duration, fut: F) -> Result<T, HandlerError>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T, HandlerError>> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::spawn(fut)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(HandlerError::Failed(format!("handler panicked: {join_err}"))),
        Err(_) => Err(HandlerError::Timeout),
    }
}

fn handle_terminal_create(
    sessions: &SessionMap,
    terminals: &TerminalTable,
    id: u64,
    params: Value,
) -> Value {
    let mut parsed: TerminalCreateParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return error_frame(id, INVALID_PARAMS, format!("invalid params: {e}")),
    };

    let Some(session) = lookup_session(sessions, &parsed.session_id) else {
        return error_frame(id, INVALID_PARAMS, format!("unknown session: {}", parsed.session_id));
    };
    if parsed.cwd.is_none() {
        let cwd = session.data.lock().unwrap().cwd.clone();
        parsed.cwd = Some(cwd.to_string_lossy().into_owned());
    }

    match terminals.create(&parsed) {
        Ok(terminal_id) => result_frame(id, json!({ "terminalId": terminal_id })),
        Err(e) => error_frame(id, INTERNAL_ERROR, format!("failed to execute command: {e}")),
    }
}

fn handle_terminal_output(terminals: &TerminalTable, id: u64, params: Value) -> Value {
    let parsed: TerminalOutputParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return error_frame(id, INVALID_PARAMS, format!("invalid params: {e}")),
    };

    match terminals.output(&parsed.terminal_id) {
        Some(snapshot) => result_frame(
            id,
            json!({
                "output": snapshot.output,
                "truncated": snapshot.truncated,
                "exitCode": snapshot.exit.and_then(|e| e.exit_code),
            }),
        ),
        None => error_frame(id, INTERNAL_ERROR, "Terminal not found".to_string()),
    }
}

async fn handle_terminal_wait(terminals: &TerminalTable, id: u64, params: Value) -> Value {
    let parsed: TerminalWaitParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return error_frame(id, INVALID_PARAMS, format!("invalid params: {e}")),
    };

    let wait = terminals.wait_for_exit(&parsed.terminal_id);
    let outcome = match parsed.timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), wait).await {
            Ok(exit) => exit,
            Err(_) => {
                return result_frame(id, json!({ "exitCode": null, "timedOut": true }));
            }
        },
        None => wait.await,
    };

    match outcome {
        Some(exit) => result_frame(id, json!({ "exitCode": exit.exit_code, "timedOut": false })),
        None => error_frame(id, INTERNAL_ERROR, "Terminal not found".to_string()),
    }
}

fn handle_terminal_kill(
    terminals: &TerminalTable,
    id: u64,
    params: Value,
    release: bool,
) -> Value {
    let parsed: TerminalKillParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return error_frame(id, INVALID_PARAMS, format!("invalid params: {e}")),
    };

    if release {
        terminals.release(&parsed.terminal_id);
    } else {
        terminals.kill(&parsed.terminal_id);
    }
    result_frame(id, json!({}))
}

/// Validate path containment before any handler is invoked.
///
/// Returns the rejection frame when the path escapes the session's working
/// directory, or when the session is unknown.
fn check_containment(
    sessions: &SessionMap,
    session_id: &str,
    path: &Path,
    id: u64,
) -> Option<Value> {
    let Some(session) = lookup_session(sessions, session_id) else {
        return Some(error_frame(
            id,
            INVALID_PARAMS,
            format!("unknown session: {session_id}"),
        ));
    };
    let cwd = session.data.lock().unwrap().cwd.clone();
    if !path_within(&cwd, path) {
        log::log_event(&format!(
            "rejected file access outside session cwd: {}",
            path.display()
        ));
        return Some(error_frame(
            id,
            INTERNAL_ERROR,
            format!("path is outside the session working directory: {}", path.display()),
        ));
    }
    None
}

fn lookup_session(sessions: &SessionMap, session_id: &str) -> Option<Arc<SessionShared>> {
    sessions.lock().unwrap().get(session_id).cloned()
}

/// Lexical containment check: `candidate` must be absolute and resolve under
/// `cwd` without any filesystem access (the target may not exist yet).
pub fn path_within(cwd: &Path, candidate: &Path) -> bool {
    if !candidate.is_absolute() {
        return false;
    }
    normalize(candidate).starts_with(normalize(cwd))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn result_frame(id: u64, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_frame(id: u64, code: i64, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
