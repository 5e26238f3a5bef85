//! tether: a client-side session runtime for agent processes.
//!
//! The runtime spawns (or attaches to) an agent speaking line-delimited
//! JSON-RPC, performs the initialize handshake, and drives sessions through
//! prompt turns with streamed updates, mid-turn cancellation, configuration
//! changes, and remote-initiated tool/file/terminal delegation.
//!
//! ```no_run
//! use tether::{AgentClient, ClientConfig, Handlers, NewSessionOptions, SessionEvent};
//!
//! # async fn run() -> tether::Result<()> {
//! let config = ClientConfig::new(vec!["claude-code-acp".to_string()]);
//! let client = AgentClient::spawn(config, Handlers::default())?;
//! client.initialize().await?;
//!
//! let mut session = client.new_session(NewSessionOptions::new("/tmp/work")).await?;
//! let mut events = session.take_events().unwrap();
//! let consumer = tokio::spawn(async move {
//!     while let Some(event) = events.next().await {
//!         if let SessionEvent::MessageChunk { .. } = event {
//!             // render incremental output
//!         }
//!     }
//! });
//!
//! let stop_reason = session.prompt("Hello!").await?;
//! println!("turn ended: {:?}", stop_reason);
//! # let _ = consumer;
//! # Ok(())
//! # }
//! ```

pub mod acp;
pub mod config;
pub mod error;
pub mod handlers;
pub mod log;
pub mod session;

pub use acp::client::AgentClient;
pub use acp::protocol::{
    AgentInfo, CommandInfo, ConfigCategory, ConfigOption, ConfigValue, ContentBlock,
    ContentChunk, InitializeResult, PermissionKind, PermissionOptionInfo, PlanEntry,
    PlanPriority, PlanStatus, SessionSummary, StopReason, UsageSnapshot,
};
pub use config::{ClientConfig, McpServerConfig, NewSessionOptions};
pub use error::{HandlerError, RemoteError, Result, TetherError, TransportError};
pub use handlers::{
    AllowAll, DenyAll, FsHandler, Handlers, LocalFs, PermissionDecision, PermissionHandler,
    PermissionRequest, ToolHandler,
};
pub use session::events::{SessionEvent, SessionEvents};
pub use session::state::{ToolCallRecord, ToolCallStatus, ToolKind};
pub use session::Session;
