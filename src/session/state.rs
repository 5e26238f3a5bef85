//! Authoritative per-session state.
//!
//! One [`SessionData`] exists per logical session. It is mutated only by the
//! notification router (remote-driven changes) and by the runtime on
//! successful responses to caller-issued operations; callers read cloned
//! snapshots.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::acp::protocol::{
    CommandInfo, ConfigCategory, ConfigOption, ToolCallFields, ToolContent, UsageSnapshot,
};
use crate::error::TetherError;
use crate::log;
use crate::session::events::{SessionEvent, SessionEvents};

/// Kind of work a tool call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Read,
    Edit,
    Delete,
    Execute,
    Search,
    Think,
    Fetch,
    Other,
}

impl ToolKind {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("read") => ToolKind::Read,
            Some("edit") => ToolKind::Edit,
            Some("delete") => ToolKind::Delete,
            Some("execute") => ToolKind::Execute,
            Some("search") => ToolKind::Search,
            Some("think") => ToolKind::Think,
            Some("fetch") => ToolKind::Fetch,
            _ => ToolKind::Other,
        }
    }
}

/// Tool call lifecycle. Status only ever moves forward; completed and failed
/// are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ToolCallStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ToolCallStatus::Pending),
            "in_progress" => Some(ToolCallStatus::InProgress),
            "completed" => Some(ToolCallStatus::Completed),
            "failed" => Some(ToolCallStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolCallStatus::Completed | ToolCallStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            ToolCallStatus::Pending => 0,
            ToolCallStatus::InProgress => 1,
            ToolCallStatus::Completed | ToolCallStatus::Failed => 2,
        }
    }
}

/// Accumulated view of one tool call, updated in place across notifications.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub id: String,
    pub kind: ToolKind,
    pub status: ToolCallStatus,
    pub title: Option<String>,
    pub content: Vec<ToolContent>,
    pub locations: Vec<PathBuf>,
    pub raw_input: Option<Value>,
    pub raw_output: Option<Value>,
}

impl ToolCallRecord {
    fn from_fields(fields: &ToolCallFields) -> Self {
        let status = fields
            .status
            .as_deref()
            .and_then(ToolCallStatus::parse)
            .unwrap_or(ToolCallStatus::Pending);
        Self {
            id: fields.tool_call_id.clone(),
            kind: ToolKind::parse(fields.kind.as_deref()),
            status,
            title: fields.title.clone(),
            content: fields.content.clone(),
            locations: fields
                .locations
                .iter()
                .map(|l| PathBuf::from(&l.path))
                .collect(),
            raw_input: fields.raw_input.clone(),
            raw_output: fields.raw_output.clone(),
        }
    }

    /// Merge a later notification into this record.
    ///
    /// An update arriving after a terminal status is a protocol anomaly:
    /// it is logged and leaves the record untouched.
    fn apply(&mut self, fields: &ToolCallFields) {
        if self.status.is_terminal() {
            log::log_event(&format!(
                "tool call {} updated after terminal status {:?}, ignoring",
                self.id, self.status
            ));
            return;
        }

        if let Some(raw) = fields.status.as_deref() {
            match ToolCallStatus::parse(raw) {
                Some(next) if next.rank() >= self.status.rank() => self.status = next,
                Some(next) => log::log_event(&format!(
                    "tool call {} status regression {:?} -> {:?}, ignoring",
                    self.id, self.status, next
                )),
                None => log::log_event(&format!(
                    "tool call {} has unrecognized status {:?}, ignoring",
                    self.id, raw
                )),
            }
        }

        if let Some(kind) = fields.kind.as_deref() {
            self.kind = ToolKind::parse(Some(kind));
        }
        if fields.title.is_some() {
            self.title = fields.title.clone();
        }
        self.content.extend(fields.content.iter().cloned());
        for loc in &fields.locations {
            let path = PathBuf::from(&loc.path);
            if !self.locations.contains(&path) {
                self.locations.push(path);
            }
        }
        if fields.raw_input.is_some() {
            self.raw_input = fields.raw_input.clone();
        }
        if fields.raw_output.is_some() {
            self.raw_output = fields.raw_output.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TurnState {
    Idle,
    Prompting { cancel_requested: bool },
}

/// Authoritative state for one session.
#[derive(Debug)]
pub struct SessionData {
    pub id: String,
    pub cwd: PathBuf,
    pub config_options: Vec<ConfigOption>,
    pub commands: Vec<CommandInfo>,
    pub tool_calls: HashMap<String, ToolCallRecord>,
    pub usage: Option<UsageSnapshot>,
    pub title: Option<String>,
    turn: TurnState,
    closed: bool,
}

impl SessionData {
    pub fn new(id: String, cwd: PathBuf, config_options: Vec<ConfigOption>) -> Self {
        Self {
            id,
            cwd,
            config_options,
            commands: vec![],
            tool_calls: HashMap::new(),
            usage: None,
            title: None,
            turn: TurnState::Idle,
            closed: false,
        }
    }

    /// Claim the session's single turn slot.
    pub fn begin_turn(&mut self) -> Result<(), TetherError> {
        if self.closed {
            return Err(TetherError::SessionClosed);
        }
        if matches!(self.turn, TurnState::Prompting { .. }) {
            return Err(TetherError::SessionBusy);
        }
        self.turn = TurnState::Prompting {
            cancel_requested: false,
        };
        Ok(())
    }

    pub fn end_turn(&mut self) {
        self.turn = TurnState::Idle;
    }

    pub fn turn_active(&self) -> bool {
        matches!(self.turn, TurnState::Prompting { .. })
    }

    /// Record that a cancel was issued. Returns false when no turn is in
    /// flight (cancel is then a no-op, not an error).
    pub fn mark_cancel_requested(&mut self) -> bool {
        match self.turn {
            TurnState::Prompting { .. } => {
                self.turn = TurnState::Prompting {
                    cancel_requested: true,
                };
                true
            }
            TurnState::Idle => false,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        matches!(
            self.turn,
            TurnState::Prompting {
                cancel_requested: true
            }
        )
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
        self.turn = TurnState::Idle;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn ensure_open(&self) -> Result<(), TetherError> {
        if self.closed {
            Err(TetherError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Install the full replacement config-option sequence. Changing one
    /// option may invalidate others, so there is never a partial merge.
    pub fn replace_config_options(&mut self, options: Vec<ConfigOption>) {
        self.config_options = options;
    }

    /// Translate a bare legacy selector into the config-option store, so
    /// there is never a second mode/model field alongside it.
    fn set_selector_value(&mut self, id: &str, category: ConfigCategory, value: &str) {
        if let Some(option) = self
            .config_options
            .iter_mut()
            .find(|o| o.id == id || o.category == category)
        {
            option.current_value = value.to_string();
        } else {
            self.config_options.push(ConfigOption {
                id: id.to_string(),
                category,
                label: None,
                current_value: value.to_string(),
                options: vec![],
            });
        }
    }

    /// Both the legacy `session/set_mode` response path and the
    /// `current_mode_update` notification land here.
    pub fn set_mode_value(&mut self, mode_id: &str) {
        self.set_selector_value("mode", ConfigCategory::Mode, mode_id);
    }

    pub fn set_model_value(&mut self, model_id: &str) {
        self.set_selector_value("model", ConfigCategory::Model, model_id);
    }

    /// The current mode id, read from the config-option store.
    pub fn current_mode(&self) -> Option<String> {
        self.config_options
            .iter()
            .find(|o| o.id == "mode" || o.category == ConfigCategory::Mode)
            .map(|o| o.current_value.clone())
    }

    /// The current model id, read from the config-option store.
    pub fn current_model(&self) -> Option<String> {
        self.config_options
            .iter()
            .find(|o| o.id == "model" || o.category == ConfigCategory::Model)
            .map(|o| o.current_value.clone())
    }

    /// Create or merge a tool-call record, returning a snapshot.
    pub fn upsert_tool_call(&mut self, fields: &ToolCallFields) -> ToolCallRecord {
        match self.tool_calls.get_mut(&fields.tool_call_id) {
            Some(record) => {
                record.apply(fields);
                record.clone()
            }
            None => {
                let record = ToolCallRecord::from_fields(fields);
                self.tool_calls
                    .insert(fields.tool_call_id.clone(), record.clone());
                record
            }
        }
    }
}

/// A session's state plus its event channel, shared between the runtime's
/// reader task and caller-side handles.
pub struct SessionShared {
    pub data: Mutex<SessionData>,
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
}

impl SessionShared {
    pub fn new(
        id: String,
        cwd: PathBuf,
        config_options: Vec<ConfigOption>,
    ) -> (Arc<Self>, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            data: Mutex::new(SessionData::new(id, cwd, config_options)),
            events: Mutex::new(Some(tx)),
        });
        (shared, SessionEvents::new(rx))
    }

    /// Publish an event to the session's stream. Silently dropped once the
    /// stream is closed.
    pub fn publish(&self, event: SessionEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// End the event stream; subsequent publishes are dropped.
    pub fn close_events(&self) {
        self.events.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::protocol::ToolLocation;

    fn fields(id: &str, status: Option<&str>) -> ToolCallFields {
        ToolCallFields {
            tool_call_id: id.to_string(),
            kind: Some("execute".to_string()),
            status: status.map(|s| s.to_string()),
            title: None,
            content: vec![],
            locations: vec![],
            raw_input: None,
            raw_output: None,
        }
    }

    fn session() -> SessionData {
        SessionData::new("s1".to_string(), PathBuf::from("/tmp/work"), vec![])
    }

    #[test]
    fn test_tool_call_status_moves_forward() {
        let mut data = session();
        data.upsert_tool_call(&fields("t1", Some("pending")));
        let rec = data.upsert_tool_call(&fields("t1", Some("in_progress")));
        assert_eq!(rec.status, ToolCallStatus::InProgress);
        let rec = data.upsert_tool_call(&fields("t1", Some("completed")));
        assert_eq!(rec.status, ToolCallStatus::Completed);
        assert_eq!(data.tool_calls.len(), 1);
    }

    #[test]
    fn test_tool_call_terminal_status_absorbs() {
        let mut data = session();
        data.upsert_tool_call(&fields("t1", Some("failed")));
        let rec = data.upsert_tool_call(&fields("t1", Some("in_progress")));
        assert_eq!(rec.status, ToolCallStatus::Failed);
    }

    #[test]
    fn test_tool_call_status_regression_ignored() {
        let mut data = session();
        data.upsert_tool_call(&fields("t1", Some("in_progress")));
        let rec = data.upsert_tool_call(&fields("t1", Some("pending")));
        assert_eq!(rec.status, ToolCallStatus::InProgress);
    }

    #[test]
    fn test_tool_call_accumulates_locations() {
        let mut data = session();
        let mut f = fields("t1", Some("pending"));
        f.locations = vec![ToolLocation {
            path: "/tmp/work/a.rs".to_string(),
        }];
        data.upsert_tool_call(&f);

        let mut f2 = fields("t1", Some("in_progress"));
        f2.locations = vec![
            ToolLocation {
                path: "/tmp/work/a.rs".to_string(),
            },
            ToolLocation {
                path: "/tmp/work/b.rs".to_string(),
            },
        ];
        let rec = data.upsert_tool_call(&f2);
        assert_eq!(rec.locations.len(), 2);
    }

    #[test]
    fn test_single_turn_per_session() {
        let mut data = session();
        data.begin_turn().unwrap();
        assert!(matches!(data.begin_turn(), Err(TetherError::SessionBusy)));
        data.end_turn();
        data.begin_turn().unwrap();
    }

    #[test]
    fn test_closed_session_rejects_turns() {
        let mut data = session();
        data.mark_closed();
        assert!(matches!(data.begin_turn(), Err(TetherError::SessionClosed)));
    }

    #[test]
    fn test_cancel_without_turn_is_noop() {
        let mut data = session();
        assert!(!data.mark_cancel_requested());
        data.begin_turn().unwrap();
        assert!(data.mark_cancel_requested());
        assert!(data.cancel_requested());
    }

    #[test]
    fn test_mode_translation_single_store() {
        let mut data = session();
        data.replace_config_options(vec![ConfigOption {
            id: "mode".to_string(),
            category: ConfigCategory::Mode,
            label: None,
            current_value: "code".to_string(),
            options: vec![],
        }]);

        data.set_mode_value("plan");
        assert_eq!(data.current_mode().as_deref(), Some("plan"));
        assert_eq!(data.config_options.len(), 1);
    }

    #[test]
    fn test_mode_translation_creates_missing_option() {
        let mut data = session();
        data.set_mode_value("architect");
        assert_eq!(data.current_mode().as_deref(), Some("architect"));
    }

    #[test]
    fn test_config_replacement_is_total() {
        let mut data = session();
        data.replace_config_options(vec![
            ConfigOption {
                id: "mode".to_string(),
                category: ConfigCategory::Mode,
                label: None,
                current_value: "code".to_string(),
                options: vec![],
            },
            ConfigOption {
                id: "model".to_string(),
                category: ConfigCategory::Model,
                label: None,
                current_value: "sonnet".to_string(),
                options: vec![],
            },
        ]);

        data.replace_config_options(vec![ConfigOption {
            id: "mode".to_string(),
            category: ConfigCategory::Mode,
            label: None,
            current_value: "plan".to_string(),
            options: vec![],
        }]);
        assert_eq!(data.config_options.len(), 1);
        assert_eq!(data.current_mode().as_deref(), Some("plan"));
    }
}
