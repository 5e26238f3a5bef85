//! Wire protocol types
//!
//! JSON-RPC base envelopes plus the request/response/notification payloads
//! the runtime speaks. The notification side is parsed with explicit
//! catch-all arms so message kinds this build does not recognize degrade to
//! `Unknown` instead of failing the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// JSON-RPC base types
// ============================================================================

/// JSON-RPC request
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC notification (no id, no response expected)
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC response
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Error code for an unrecognized or unsupported method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Error code for structurally invalid request params.
pub const INVALID_PARAMS: i64 = -32602;
/// Error code for a handler-side failure while serving a request.
pub const INTERNAL_ERROR: i64 = -32000;

// ============================================================================
// Initialize types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: u32,
    pub client_capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub fs: Option<FsCapabilities>,
    pub terminal: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    pub read_text_file: bool,
    pub write_text_file: bool,
}

#[derive(Debug, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: u32,
    pub agent_capabilities: Option<Value>,
    pub agent_info: Option<AgentInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentInfo {
    pub name: Option<String>,
    pub title: Option<String>,
    pub version: Option<String>,
}

// ============================================================================
// Session types
// ============================================================================

/// Environment variable entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct McpServer {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionParams {
    pub cwd: String,
    pub mcp_servers: Vec<McpServer>,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    pub session_id: String,
    #[serde(default)]
    pub config_options: Vec<ConfigOption>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkSessionParams {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSessionParams {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsResult {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
}

/// One entry in the agent-side session catalog.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    pub session_id: String,
}

// ============================================================================
// Config option types
// ============================================================================

/// A remote-advertised configuration selector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOption {
    pub id: String,
    #[serde(default)]
    pub category: ConfigCategory,
    #[serde(default)]
    pub label: Option<String>,
    pub current_value: String,
    #[serde(default)]
    pub options: Vec<ConfigValue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigCategory {
    Mode,
    Model,
    ThoughtLevel,
    #[serde(other)]
    #[default]
    Other,
}

/// One allowed value for a config option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValue {
    pub value: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConfigOptionParams {
    pub session_id: String,
    pub config_id: String,
    pub value: String,
}

/// Response to `session/set_config_option`: the entire replacement
/// config-option sequence, never a partial merge.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConfigOptionResult {
    #[serde(default)]
    pub config_options: Vec<ConfigOption>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModeParams {
    pub session_id: String,
    pub mode_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelParams {
    pub session_id: String,
    pub model_id: String,
}

// ============================================================================
// Prompt types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParams {
    pub session_id: String,
    pub prompt: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String, // base64 encoded
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub stop_reason: StopReason,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Cancelled,
    Refusal,
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Session update types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateParams {
    pub session_id: String,
    pub update: SessionUpdate,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentChunk {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Plan entry from agent (TODO list item)
#[derive(Debug, Deserialize, Clone)]
pub struct PlanEntry {
    pub content: String,
    pub priority: PlanPriority,
    pub status: PlanStatus,
    #[serde(rename = "_meta", default)]
    pub meta: Option<Value>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanPriority {
    High,
    Medium,
    Low,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    #[serde(other)]
    Unknown,
}

/// A discoverable command advertised by the agent.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CommandInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input: Option<CommandInput>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CommandInput {
    pub hint: String,
}

/// Token/cost accounting reported by the agent.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cached_input_tokens: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

/// Raw fields shared by `tool_call` and `tool_call_update` notifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallFields {
    pub tool_call_id: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub locations: Vec<ToolLocation>,
    #[serde(default)]
    pub raw_input: Option<Value>,
    #[serde(default)]
    pub raw_output: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolLocation {
    pub path: String,
}

/// A content fragment accumulated on a tool-call record.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Content { content: ContentChunk },
    Diff {
        path: String,
        #[serde(default)]
        old_text: Option<String>,
        new_text: String,
    },
    Terminal {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    #[serde(other)]
    Other,
}

/// Session update variants - manually deserialized to handle unknown kinds gracefully
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    AgentMessageChunk { content: ContentChunk },
    AgentThoughtChunk { content: ContentChunk },
    ToolCall(ToolCallFields),
    ToolCallUpdate(ToolCallFields),
    Plan { entries: Vec<PlanEntry> },
    AvailableCommandsUpdate { commands: Vec<CommandInfo> },
    CurrentModeUpdate { current_mode_id: String },
    ConfigOptionsUpdate { config_options: Vec<ConfigOption> },
    UsageUpdate { usage: UsageSnapshot },
    SessionInfoUpdate { title: Option<String> },
    Other { raw_kind: Option<String>, payload: Value },
}

impl<'de> serde::Deserialize<'de> for SessionUpdate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let update_kind = value.get("sessionUpdate").and_then(|v| v.as_str());

        // A structurally broken payload for a recognized kind degrades to
        // Other rather than failing the envelope.
        let fallback = |raw: Option<&str>, payload: &Value| SessionUpdate::Other {
            raw_kind: raw.map(|s| s.to_string()),
            payload: payload.clone(),
        };

        match update_kind {
            Some("agent_message_chunk") => {
                let content = serde_json::from_value(
                    value.get("content").cloned().unwrap_or(Value::Null),
                )
                .unwrap_or(ContentChunk::Other);
                Ok(SessionUpdate::AgentMessageChunk { content })
            }
            Some("agent_thought_chunk") => {
                let content = serde_json::from_value(
                    value.get("content").cloned().unwrap_or(Value::Null),
                )
                .unwrap_or(ContentChunk::Other);
                Ok(SessionUpdate::AgentThoughtChunk { content })
            }
            Some("tool_call") => match serde_json::from_value::<ToolCallFields>(value.clone()) {
                Ok(fields) => Ok(SessionUpdate::ToolCall(fields)),
                Err(_) => Ok(fallback(update_kind, &value)),
            },
            Some("tool_call_update") => {
                match serde_json::from_value::<ToolCallFields>(value.clone()) {
                    Ok(fields) => Ok(SessionUpdate::ToolCallUpdate(fields)),
                    Err(_) => Ok(fallback(update_kind, &value)),
                }
            }
            Some("plan") => {
                let entries = value
                    .get("entries")
                    .and_then(|v| serde_json::from_value::<Vec<PlanEntry>>(v.clone()).ok())
                    .unwrap_or_default();
                Ok(SessionUpdate::Plan { entries })
            }
            Some("available_commands_update") => {
                let commands = value
                    .get("availableCommands")
                    .and_then(|v| serde_json::from_value::<Vec<CommandInfo>>(v.clone()).ok())
                    .unwrap_or_default();
                Ok(SessionUpdate::AvailableCommandsUpdate { commands })
            }
            Some("current_mode_update") => Ok(SessionUpdate::CurrentModeUpdate {
                current_mode_id: value
                    .get("currentModeId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            }),
            Some("config_options_update") => {
                let config_options = value
                    .get("configOptions")
                    .and_then(|v| serde_json::from_value::<Vec<ConfigOption>>(v.clone()).ok())
                    .unwrap_or_default();
                Ok(SessionUpdate::ConfigOptionsUpdate { config_options })
            }
            Some("usage_update") => {
                let usage = value
                    .get("usage")
                    .and_then(|v| serde_json::from_value::<UsageSnapshot>(v.clone()).ok())
                    .unwrap_or_default();
                Ok(SessionUpdate::UsageUpdate { usage })
            }
            Some("session_info_update") => Ok(SessionUpdate::SessionInfoUpdate {
                title: value
                    .get("title")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            }),
            other => Ok(fallback(other, &value)),
        }
    }
}

// ============================================================================
// Permission request parsing (incoming from agent)
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    pub session_id: String,
    pub tool_call: ToolCallRef,
    pub options: Vec<PermissionOptionInfo>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRef {
    pub tool_call_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOptionInfo {
    pub option_id: String,
    pub name: String,
    pub kind: PermissionKind,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
    #[serde(other)]
    Unknown,
}

/// Permission response outcome - internally tagged with "outcome" field
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestPermissionOutcome {
    Cancelled,
    Selected {
        #[serde(rename = "optionId")]
        option_id: String,
    },
}

#[derive(Debug, Serialize)]
pub struct RequestPermissionResponse {
    pub outcome: RequestPermissionOutcome,
}

impl RequestPermissionResponse {
    pub fn selected(option_id: String) -> Self {
        Self {
            outcome: RequestPermissionOutcome::Selected { option_id },
        }
    }

    pub fn cancelled() -> Self {
        Self {
            outcome: RequestPermissionOutcome::Cancelled,
        }
    }
}

// ============================================================================
// File system request params (incoming from agent)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsReadTextFileParams {
    pub session_id: String,
    pub path: String,
    pub line: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsWriteTextFileParams {
    pub session_id: String,
    pub path: String,
    pub content: String,
}

// ============================================================================
// Terminal request params (incoming from agent)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCreateParams {
    pub session_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    pub output_byte_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutputParams {
    pub session_id: String,
    pub terminal_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalWaitParams {
    pub session_id: String,
    pub terminal_id: String,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalKillParams {
    pub session_id: String,
    pub terminal_id: String,
}

// ============================================================================
// Message parsing
// ============================================================================

#[derive(Debug)]
pub enum IncomingMessage {
    Response(JsonRpcResponse),
    Notification { method: String, params: Option<Value> },
    Request { id: u64, method: String, params: Option<Value> },
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;

        let has_id = value.get("id").and_then(|v| v.as_u64()).is_some();
        let method = value.get("method").and_then(|m| m.as_str());

        match (has_id, method) {
            (true, Some(method)) => {
                let id = value.get("id").and_then(|v| v.as_u64()).unwrap();
                let params = value.get("params").cloned();
                Ok(IncomingMessage::Request {
                    id,
                    method: method.to_string(),
                    params,
                })
            }
            (true, None) => {
                let response: JsonRpcResponse = serde_json::from_value(value)?;
                Ok(IncomingMessage::Response(response))
            }
            (false, Some(method)) => {
                let params = value.get("params").cloned();
                Ok(IncomingMessage::Notification {
                    method: method.to_string(),
                    params,
                })
            }
            (false, None) => {
                let response: JsonRpcResponse = serde_json::from_value(value)?;
                Ok(IncomingMessage::Response(response))
            }
        }
    }
}
