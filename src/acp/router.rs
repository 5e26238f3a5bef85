//! Notification router: session-scoped dispatch of inbound updates.
//!
//! Stateless classification. Recognized kinds mutate the named session's
//! state before the event is published; unrecognized kinds publish an
//! `Unknown` event and are never an error. Envelope failures (missing or
//! unknown session id) drop the one envelope, not the connection.

use crate::acp::protocol::SessionUpdate;
use crate::log;
use crate::session::events::SessionEvent;
use crate::session::state::SessionShared;

/// Apply one `session/update` notification to its session.
///
/// Delivery order per session is the wire arrival order: the single reader
/// task calls this synchronously, so the last physically delivered update
/// for a tool call wins.
pub fn apply_update(shared: &SessionShared, update: SessionUpdate) {
    let event = match update {
        SessionUpdate::AgentMessageChunk { content } => SessionEvent::MessageChunk { content },
        SessionUpdate::AgentThoughtChunk { content } => SessionEvent::ThoughtChunk { content },
        SessionUpdate::ToolCall(fields) => {
            let record = shared.data.lock().unwrap().upsert_tool_call(&fields);
            SessionEvent::ToolCall(record)
        }
        SessionUpdate::ToolCallUpdate(fields) => {
            let record = shared.data.lock().unwrap().upsert_tool_call(&fields);
            SessionEvent::ToolCallUpdate(record)
        }
        SessionUpdate::Plan { entries } => SessionEvent::Plan { entries },
        SessionUpdate::AvailableCommandsUpdate { commands } => {
            shared.data.lock().unwrap().commands = commands.clone();
            SessionEvent::AvailableCommands { commands }
        }
        SessionUpdate::CurrentModeUpdate { current_mode_id } => {
            shared.data.lock().unwrap().set_mode_value(&current_mode_id);
            SessionEvent::ModeChanged {
                mode_id: current_mode_id,
            }
        }
        SessionUpdate::ConfigOptionsUpdate { config_options } => {
            shared
                .data
                .lock()
                .unwrap()
                .replace_config_options(config_options.clone());
            SessionEvent::ConfigOptions {
                options: config_options,
            }
        }
        SessionUpdate::UsageUpdate { usage } => {
            shared.data.lock().unwrap().usage = Some(usage);
            SessionEvent::Usage(usage)
        }
        SessionUpdate::SessionInfoUpdate { title } => {
            shared.data.lock().unwrap().title = title.clone();
            SessionEvent::SessionInfo { title }
        }
        SessionUpdate::Other { raw_kind, payload } => {
            let kind = raw_kind.unwrap_or_default();
            log::log_event(&format!("unrecognized session update kind {:?}", kind));
            SessionEvent::Unknown { kind, payload }
        }
    };

    shared.publish(event);
}
