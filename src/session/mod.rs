//! Session handles and per-session state.
//!
//! A [`Session`] is the caller-facing view of one conversation with the
//! agent: it submits turns, issues cancellation, changes configuration, and
//! exposes the typed event stream plus read-only state snapshots.

pub mod events;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::acp::client::AgentClient;
use crate::acp::protocol::{
    CancelParams, CommandInfo, ConfigOption, ContentBlock, PromptParams, PromptResult,
    SetConfigOptionParams, SetConfigOptionResult, SetModeParams, SetModelParams, StopReason,
    UsageSnapshot,
};
use crate::error::{Result, TetherError};
use crate::log;
use crate::session::events::{SessionEvent, SessionEvents};
use crate::session::state::{SessionShared, ToolCallRecord};

/// One logical conversation with the agent.
pub struct Session {
    id: String,
    client: AgentClient,
    shared: Arc<SessionShared>,
    events: Option<SessionEvents>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: String,
        client: AgentClient,
        shared: Arc<SessionShared>,
        events: SessionEvents,
    ) -> Self {
        Self {
            id,
            client,
            shared,
            events: Some(events),
        }
    }

    /// Opaque session id issued by the agent.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Working directory the session was created with.
    pub fn cwd(&self) -> PathBuf {
        self.shared.data.lock().unwrap().cwd.clone()
    }

    // -- Prompting -----------------------------------------------------------

    /// Submit a text turn and wait for its stop reason.
    ///
    /// Exactly one turn may be in flight per session; a concurrent second
    /// prompt fails fast with `SessionBusy` and does not queue. Streamed
    /// updates arrive on the event stream while this is pending, followed by
    /// a `Done` event carrying the same stop reason.
    pub async fn prompt(&self, text: &str) -> Result<StopReason> {
        self.prompt_blocks(vec![ContentBlock::Text {
            text: text.to_string(),
        }])
        .await
    }

    /// Submit a turn with arbitrary content blocks (text, images, etc.)
    pub async fn prompt_blocks(&self, content: Vec<ContentBlock>) -> Result<StopReason> {
        let TurnReceiver { rx, .. } = self.start_turn(content).await?;
        let outcome = recv_outcome(rx).await;
        finish_turn(&self.shared, outcome)
    }

    /// Submit a turn with a caller-local deadline.
    ///
    /// Deadline elapse is a local failure only: the remote side may still
    /// complete the turn, and its late response is discarded.
    pub async fn prompt_with_timeout(
        &self,
        text: &str,
        timeout_ms: u64,
    ) -> Result<StopReason> {
        let content = vec![ContentBlock::Text {
            text: text.to_string(),
        }];
        let TurnReceiver { id, rx } = self.start_turn(content).await?;
        let wait = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            recv_outcome(rx),
        )
        .await;
        match wait {
            Ok(outcome) => finish_turn(&self.shared, outcome),
            Err(_) => {
                self.client.inner().pending.abandon(id);
                self.shared.data.lock().unwrap().end_turn();
                Err(TetherError::Timeout(timeout_ms))
            }
        }
    }

    /// Submit a turn without waiting: the turn's completion is observed as a
    /// `Done` event on the stream. The returned handle also yields the stop
    /// reason for callers that want both.
    pub async fn send_prompt(&self, text: &str) -> Result<JoinHandle<Result<StopReason>>> {
        let content = vec![ContentBlock::Text {
            text: text.to_string(),
        }];
        let TurnReceiver { rx, .. } = self.start_turn(content).await?;
        let shared = self.shared.clone();
        Ok(tokio::spawn(async move {
            let outcome = recv_outcome(rx).await;
            finish_turn(&shared, outcome)
        }))
    }

    async fn start_turn(&self, content: Vec<ContentBlock>) -> Result<TurnReceiver> {
        self.shared.data.lock().unwrap().begin_turn()?;

        let params = PromptParams {
            session_id: self.id.clone(),
            prompt: content,
        };
        let sent = match serde_json::to_value(params) {
            Ok(value) => {
                self.client
                    .inner()
                    .send_request("session/prompt", Some(value))
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match sent {
            Ok((id, rx)) => Ok(TurnReceiver { id, rx }),
            Err(e) => {
                self.shared.data.lock().unwrap().end_turn();
                Err(e)
            }
        }
    }

    // -- Cancellation --------------------------------------------------------

    /// Advisory interrupt of the in-flight turn.
    ///
    /// A no-op when no turn is in flight. This is one-way: no acknowledgment
    /// is awaited, and a turn that completes normally after a cancel was
    /// sent is authoritative.
    pub async fn cancel(&self) -> Result<()> {
        let should_send = {
            let mut data = self.shared.data.lock().unwrap();
            data.ensure_open()?;
            data.mark_cancel_requested()
        };
        if !should_send {
            return Ok(());
        }
        let params = CancelParams {
            session_id: self.id.clone(),
        };
        self.client
            .inner()
            .notify("session/cancel", Some(serde_json::to_value(params)?))
            .await
    }

    // -- Configuration -------------------------------------------------------

    /// Change one config selector. On success the response's full
    /// config-option sequence replaces the session's entire config state —
    /// changing one option may cascade into others. On failure the prior
    /// snapshot is kept.
    pub async fn set_config_option(
        &self,
        config_id: &str,
        value: &str,
    ) -> Result<Vec<ConfigOption>> {
        self.shared.data.lock().unwrap().ensure_open()?;

        let params = SetConfigOptionParams {
            session_id: self.id.clone(),
            config_id: config_id.to_string(),
            value: value.to_string(),
        };
        let response = self
            .client
            .inner()
            .request_with_timeout(
                "session/set_config_option",
                Some(serde_json::to_value(params)?),
                self.client.inner().request_timeout_ms(),
            )
            .await?;
        let result: SetConfigOptionResult = serde_json::from_value(response)
            .map_err(|e| TetherError::Protocol(format!("bad set_config_option result: {e}")))?;

        self.shared
            .data
            .lock()
            .unwrap()
            .replace_config_options(result.config_options.clone());
        Ok(result.config_options)
    }

    /// Legacy single-selector mode change, kept working as a thin
    /// translation into the config-option model.
    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        self.shared.data.lock().unwrap().ensure_open()?;

        let params = SetModeParams {
            session_id: self.id.clone(),
            mode_id: mode_id.to_string(),
        };
        self.client
            .inner()
            .request_with_timeout(
                "session/set_mode",
                Some(serde_json::to_value(params)?),
                self.client.inner().request_timeout_ms(),
            )
            .await?;

        self.shared.data.lock().unwrap().set_mode_value(mode_id);
        Ok(())
    }

    /// Legacy single-selector model change, translated like
    /// [`Session::set_mode`].
    pub async fn set_model(&self, model_id: &str) -> Result<()> {
        self.shared.data.lock().unwrap().ensure_open()?;

        let params = SetModelParams {
            session_id: self.id.clone(),
            model_id: model_id.to_string(),
        };
        self.client
            .inner()
            .request_with_timeout(
                "session/set_model",
                Some(serde_json::to_value(params)?),
                self.client.inner().request_timeout_ms(),
            )
            .await?;

        self.shared.data.lock().unwrap().set_model_value(model_id);
        Ok(())
    }

    // -- Snapshots -----------------------------------------------------------

    pub fn config_options(&self) -> Vec<ConfigOption> {
        self.shared.data.lock().unwrap().config_options.clone()
    }

    pub fn current_mode(&self) -> Option<String> {
        self.shared.data.lock().unwrap().current_mode()
    }

    pub fn current_model(&self) -> Option<String> {
        self.shared.data.lock().unwrap().current_model()
    }

    pub fn commands(&self) -> Vec<CommandInfo> {
        self.shared.data.lock().unwrap().commands.clone()
    }

    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        self.shared
            .data
            .lock()
            .unwrap()
            .tool_calls
            .values()
            .cloned()
            .collect()
    }

    pub fn usage(&self) -> Option<UsageSnapshot> {
        self.shared.data.lock().unwrap().usage
    }

    pub fn title(&self) -> Option<String> {
        self.shared.data.lock().unwrap().title.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.data.lock().unwrap().is_closed()
    }

    // -- Events --------------------------------------------------------------

    /// Next event on the session's stream.
    ///
    /// Returns `None` once the stream was taken with [`Session::take_events`],
    /// or after the session closed and the stream drained.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        match self.events.as_mut() {
            Some(events) => events.next().await,
            None => None,
        }
    }

    /// Move the event stream out, e.g. to consume it on another task while
    /// this handle keeps issuing operations.
    pub fn take_events(&mut self) -> Option<SessionEvents> {
        self.events.take()
    }

    // -- Lifecycle -----------------------------------------------------------

    /// End the session locally: release its terminals, stop routing its
    /// notifications, and fail subsequent operations with `SessionClosed`.
    pub fn close(&self) {
        self.shared.data.lock().unwrap().mark_closed();
        self.shared.close_events();
        self.client.inner().terminals.release_session(&self.id);
        self.client.inner().sessions.lock().unwrap().remove(&self.id);
        log::log_event(&format!("session {} closed", self.id));
    }
}

struct TurnReceiver {
    id: u64,
    rx: tokio::sync::oneshot::Receiver<crate::acp::pending::RpcOutcome>,
}

async fn recv_outcome(
    rx: tokio::sync::oneshot::Receiver<crate::acp::pending::RpcOutcome>,
) -> Result<serde_json::Value> {
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TetherError::Remote(crate::error::RemoteError {
            code: err.code,
            message: err.message,
            data: err.data,
        })),
        Err(_) => Err(TetherError::ConnectionLost),
    }
}

/// Clear the turn slot and, on success, publish the terminal `Done` event.
fn finish_turn(
    shared: &SessionShared,
    outcome: Result<serde_json::Value>,
) -> Result<StopReason> {
    shared.data.lock().unwrap().end_turn();

    let value = outcome?;
    // Tolerate agents that answer prompts with a bare null.
    let result: PromptResult = serde_json::from_value(value).unwrap_or(PromptResult {
        stop_reason: StopReason::Unknown,
    });
    shared.publish(SessionEvent::Done {
        stop_reason: result.stop_reason,
    });
    Ok(result.stop_reason)
}
