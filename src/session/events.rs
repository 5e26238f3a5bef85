//! Typed per-session event stream.
//!
//! Every notification routed to a session is published here in wire arrival
//! order. The variant set is closed at compile time but carries an explicit
//! `Unknown` arm with the raw kind and payload, so notification kinds this
//! build does not recognize still advance the stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::acp::protocol::{
    CommandInfo, ConfigOption, ContentChunk, PlanEntry, StopReason, UsageSnapshot,
};
use crate::session::state::ToolCallRecord;

/// A streaming event from the agent during a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Incremental agent message content
    MessageChunk { content: ContentChunk },
    /// Incremental agent reasoning content
    ThoughtChunk { content: ContentChunk },
    /// A tool call was first reported; carries the record snapshot
    ToolCall(ToolCallRecord),
    /// An existing tool call changed; carries the merged record snapshot
    ToolCallUpdate(ToolCallRecord),
    /// The agent published or revised its plan
    Plan { entries: Vec<PlanEntry> },
    /// The discoverable command catalog changed
    AvailableCommands { commands: Vec<CommandInfo> },
    /// The session mode changed (remote-driven)
    ModeChanged { mode_id: String },
    /// The full config-option sequence was replaced (remote-driven)
    ConfigOptions { options: Vec<ConfigOption> },
    /// Updated usage accounting
    Usage(UsageSnapshot),
    /// Session metadata changed
    SessionInfo { title: Option<String> },
    /// The in-flight turn finished
    Done { stop_reason: StopReason },
    /// A notification kind this build does not recognize
    Unknown { kind: String, payload: Value },
}

/// Receiving end of a session's event sequence.
///
/// Terminates when the session is closed or the connection dies.
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
