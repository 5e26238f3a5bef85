//! Configuration for tether clients.
//!
//! Configuration is loaded from `~/.config/tether/config.toml` with the following precedence:
//! 1. Values set programmatically on [`ClientConfig`] (highest priority)
//! 2. Configuration file
//! 3. Default values (lowest priority)
//!
//! # Example Configuration
//!
//! ```toml
//! # ~/.config/tether/config.toml
//! command = ["claude-code-acp"]
//! request_timeout_ms = 30000
//! handler_timeout_ms = 30000
//!
//! # MCP servers advertised to every new session
//! [[mcp_servers]]
//! name = "filesystem"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "/path/to/dir"]
//!
//! [[mcp_servers]]
//! name = "github"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-github"]
//! env = { GITHUB_TOKEN = "xxx" }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::acp::protocol::{EnvVar, McpServer};

/// Main configuration for an agent connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Shell command to spawn the agent (e.g. `["claude-code-acp"]`)
    pub command: Vec<String>,

    /// Working directory for the spawned agent process
    pub cwd: Option<PathBuf>,

    /// Additional environment variables passed to the agent
    pub env: HashMap<String, String>,

    /// Deadline for lifecycle requests (initialize, session management)
    pub request_timeout_ms: u64,

    /// Bounded wait for externally registered handlers in the callback bridge
    pub handler_timeout_ms: u64,

    /// MCP servers to advertise to agent sessions
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: vec![],
            cwd: None,
            env: HashMap::new(),
            request_timeout_ms: 30_000,
            handler_timeout_ms: 30_000,
            mcp_servers: vec![],
        }
    }
}

/// MCP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    /// Unique name for this MCP server
    pub name: String,

    /// Command to run (for stdio transport)
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables (name -> value)
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl McpServerConfig {
    /// Convert to the wire representation sent in `session/new`.
    pub fn to_wire(&self) -> McpServer {
        let mut env: Vec<EnvVar> = self
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        env.sort_by(|a, b| a.name.cmp(&b.name));
        McpServer {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given agent command.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    /// Load configuration from the default config file path.
    ///
    /// Returns default configuration if file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();

        if !config_path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Get the default configuration file path.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("config.toml")
    }

    /// Override the agent command.
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Override the working directory for the agent process.
    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }
}

/// Options for creating a new session.
///
/// `cwd` is required; everything else is carried as opaque extension
/// metadata in the `session/new` request, alongside external tool-server
/// descriptors.
#[derive(Debug, Clone, Default)]
pub struct NewSessionOptions {
    /// Working directory for the session
    pub cwd: PathBuf,

    /// Custom system instructions prepended to the agent's context
    pub system_prompt: Option<String>,

    /// Model identifier to use
    pub model: Option<String>,

    /// Permission enforcement mode (e.g. "default", "acceptEdits", "plan")
    pub permission_mode: Option<String>,

    /// Maximum number of conversation turns before stopping
    pub max_turns: Option<u32>,

    /// MCP servers for this session (in addition to the client-wide ones)
    pub mcp_servers: Vec<McpServerConfig>,

    /// Extra opaque extension metadata, merged over the fields above
    pub meta: Option<Value>,
}

impl NewSessionOptions {
    /// Create options for the given working directory.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    /// Serialize the non-default fields into the `_meta` payload.
    ///
    /// Returns `None` when there is nothing to send.
    pub fn to_meta(&self) -> Option<Value> {
        let mut meta = Map::new();
        if let Some(ref sp) = self.system_prompt {
            meta.insert("systemPrompt".to_string(), json!(sp));
        }
        if let Some(ref model) = self.model {
            meta.insert("model".to_string(), json!(model));
        }
        if let Some(ref mode) = self.permission_mode {
            meta.insert("permissionMode".to_string(), json!(mode));
        }
        if let Some(max_turns) = self.max_turns {
            meta.insert("maxTurns".to_string(), json!(max_turns));
        }
        if let Some(Value::Object(extra)) = &self.meta {
            for (k, v) in extra {
                meta.insert(k.clone(), v.clone());
            }
        }
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }
}
