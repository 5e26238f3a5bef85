//! Externally registered handlers for remote-initiated requests.
//!
//! The callback bridge invokes these with a bounded wait and translates
//! every outcome — success, failure, or timeout — into a well-formed
//! response frame. Handlers never see the wire.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::acp::protocol::{PermissionKind, PermissionOptionInfo};
use crate::error::{HandlerError, HandlerResult};

/// The set of handlers registered on a client.
#[derive(Clone, Default)]
pub struct Handlers {
    pub permission: Option<Arc<dyn PermissionHandler>>,
    pub fs: Option<Arc<dyn FsHandler>>,
    pub tool: Option<Arc<dyn ToolHandler>>,
}

impl Handlers {
    pub fn with_permission(mut self, handler: impl PermissionHandler + 'static) -> Self {
        self.permission = Some(Arc::new(handler));
        self
    }

    pub fn with_fs(mut self, handler: impl FsHandler + 'static) -> Self {
        self.fs = Some(Arc::new(handler));
        self
    }

    pub fn with_tool(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.tool = Some(Arc::new(handler));
        self
    }
}

/// A permission check forwarded from the agent.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub session_id: String,
    pub tool_call_id: String,
    pub title: Option<String>,
    pub options: Vec<PermissionOptionInfo>,
}

/// Decision returned by a [`PermissionHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// Pick one of the offered options
    Selected { option_id: String },
    /// Decline to choose; the agent treats this as a denial
    Cancelled,
}

/// Decides whether the agent may perform a tool use.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn on_permission(&self, request: PermissionRequest)
    -> HandlerResult<PermissionDecision>;
}

/// Policy that approves every request by selecting its first allow option.
pub struct AllowAll;

#[async_trait]
impl PermissionHandler for AllowAll {
    async fn on_permission(
        &self,
        request: PermissionRequest,
    ) -> HandlerResult<PermissionDecision> {
        let allow = request.options.iter().find(|o| {
            matches!(
                o.kind,
                PermissionKind::AllowOnce | PermissionKind::AllowAlways
            )
        });
        Ok(match allow.or_else(|| request.options.first()) {
            Some(option) => PermissionDecision::Selected {
                option_id: option.option_id.clone(),
            },
            None => PermissionDecision::Cancelled,
        })
    }
}

/// Policy that denies every request.
pub struct DenyAll;

#[async_trait]
impl PermissionHandler for DenyAll {
    async fn on_permission(
        &self,
        request: PermissionRequest,
    ) -> HandlerResult<PermissionDecision> {
        let reject = request.options.iter().find(|o| {
            matches!(
                o.kind,
                PermissionKind::RejectOnce | PermissionKind::RejectAlways
            )
        });
        Ok(match reject {
            Some(option) => PermissionDecision::Selected {
                option_id: option.option_id.clone(),
            },
            None => PermissionDecision::Cancelled,
        })
    }
}

/// Serves tool invocations the agent delegates back to the client, e.g.
/// messages for client-hosted tool servers. The payload is passed through
/// opaquely; its shape is owned by the tool server protocol.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn on_tool_message(
        &self,
        session_id: Option<&str>,
        message: serde_json::Value,
    ) -> HandlerResult<serde_json::Value>;
}

/// Serves delegated file reads and writes.
///
/// Paths are already validated against the session's working directory by
/// the bridge before a handler runs.
#[async_trait]
pub trait FsHandler: Send + Sync {
    async fn read_text_file(
        &self,
        path: &Path,
        line: Option<u32>,
        limit: Option<u32>,
    ) -> HandlerResult<String>;

    async fn write_text_file(&self, path: &Path, content: &str) -> HandlerResult<()>;
}

/// File handler backed by the local filesystem.
pub struct LocalFs;

#[async_trait]
impl FsHandler for LocalFs {
    async fn read_text_file(
        &self,
        path: &Path,
        line: Option<u32>,
        limit: Option<u32>,
    ) -> HandlerResult<String> {
        let mut content = tokio::fs::read_to_string(path).await?;
        if line.is_some() || limit.is_some() {
            let lines: Vec<&str> = content.lines().collect();
            let start = line.unwrap_or(1).saturating_sub(1) as usize;
            let limit = limit.unwrap_or(u32::MAX) as usize;
            let end = (start + limit).min(lines.len());
            let start = start.min(end);
            content = lines[start..end].join("\n");
        }
        Ok(content)
    }

    async fn write_text_file(&self, path: &Path, content: &str) -> HandlerResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HandlerError::Failed(e.to_string()))?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}
