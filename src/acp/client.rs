//! Session runtime orchestrator.
//!
//! [`AgentClient`] owns the wire connection and multiplexes every logical
//! operation over it: one reader task drains the transport and fans inbound
//! envelopes out to the correlation table (responses), the notification
//! router (session updates), or the callback bridge (remote-initiated
//! requests). Caller-side tasks suspend only on their own correlation slot,
//! never on the shared reader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::oneshot;

use crate::acp::bridge::{CallbackBridge, SessionMap};
use crate::acp::pending::{PendingRequests, RpcOutcome};
use crate::acp::protocol::{
    ClientCapabilities, ClientInfo, ForkSessionParams, FsCapabilities, IncomingMessage,
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest, ListSessionsParams,
    ListSessionsResult, NewSessionParams, NewSessionResult, ResumeSessionParams,
    SessionSummary, SessionUpdateParams,
};
use crate::acp::router;
use crate::acp::terminal::TerminalTable;
use crate::acp::transport::{self, FrameSource, Transport};
use crate::config::{ClientConfig, NewSessionOptions};
use crate::error::{RemoteError, Result, TetherError};
use crate::handlers::Handlers;
use crate::log;
use crate::session::Session;
use crate::session::state::SessionShared;

/// Client connection to an agent process.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    transport: Transport,
    pub(crate) pending: PendingRequests,
    pub(crate) sessions: SessionMap,
    pub(crate) terminals: TerminalTable,
    bridge: CallbackBridge,
    child: tokio::sync::Mutex<Option<Child>>,
    alive: AtomicBool,
    initialized: AtomicBool,
    torn_down: AtomicBool,
    init_result: Mutex<Option<InitializeResult>>,
    config: ClientConfig,
}

impl AgentClient {
    /// Spawn the agent subprocess from the configured command and connect
    /// over its stdio.
    pub fn spawn(config: ClientConfig, handlers: Handlers) -> Result<Self> {
        let (transport, source, child) =
            transport::spawn(&config.command, config.cwd.as_deref(), &config.env)?;
        Ok(Self::start(transport, source, Some(child), config, handlers))
    }

    /// Connect over an already-established byte stream instead of spawning
    /// a subprocess.
    pub fn from_stream<R, W>(
        reader: R,
        writer: W,
        config: ClientConfig,
        handlers: Handlers,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (transport, source) = transport::from_stream(reader, writer);
        Self::start(transport, source, None, config, handlers)
    }

    fn start(
        transport: Transport,
        source: FrameSource,
        child: Option<Child>,
        config: ClientConfig,
        handlers: Handlers,
    ) -> Self {
        let handler_timeout = Duration::from_millis(config.handler_timeout_ms);
        let inner = Arc::new(ClientInner {
            transport,
            pending: PendingRequests::new(),
            sessions: Mutex::new(HashMap::new()),
            terminals: TerminalTable::new(),
            bridge: CallbackBridge::new(handlers, handler_timeout),
            child: tokio::sync::Mutex::new(child),
            alive: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            init_result: Mutex::new(None),
            config,
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            read_loop(reader_inner, source).await;
        });

        Self { inner }
    }

    /// Perform the capability/identity handshake. Must precede all other
    /// operations; failure here is fatal to the whole connection attempt.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: 1,
            client_capabilities: ClientCapabilities {
                fs: Some(FsCapabilities {
                    read_text_file: true,
                    write_text_file: true,
                }),
                terminal: Some(true),
            },
            client_info: ClientInfo {
                name: "tether".to_string(),
                title: "tether".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let outcome = self
            .inner
            .request_with_timeout(
                "initialize",
                Some(serde_json::to_value(params)?),
                self.inner.config.request_timeout_ms,
            )
            .await
            .and_then(|value| {
                serde_json::from_value::<InitializeResult>(value)
                    .map_err(|e| TetherError::Protocol(format!("bad initialize result: {e}")))
            });

        match outcome {
            Ok(result) => {
                *self.inner.init_result.lock().unwrap() = Some(result.clone());
                self.inner.initialized.store(true, Ordering::Release);
                log::log_event("initialize handshake complete");
                Ok(result)
            }
            Err(e) => {
                log::log_event(&format!("initialize failed, closing connection: {}", e));
                self.shutdown().await;
                Err(e)
            }
        }
    }

    /// Capabilities and identity received during the handshake.
    pub fn agent_info(&self) -> Option<InitializeResult> {
        self.inner.init_result.lock().unwrap().clone()
    }

    /// Create a new session.
    pub async fn new_session(&self, options: NewSessionOptions) -> Result<Session> {
        self.ensure_initialized()?;

        let mut mcp_servers: Vec<_> = self
            .inner
            .config
            .mcp_servers
            .iter()
            .map(|s| s.to_wire())
            .collect();
        mcp_servers.extend(options.mcp_servers.iter().map(|s| s.to_wire()));

        let params = NewSessionParams {
            cwd: options.cwd.to_string_lossy().into_owned(),
            mcp_servers,
            meta: options.to_meta(),
        };
        let value = self
            .inner
            .request_with_timeout(
                "session/new",
                Some(serde_json::to_value(params)?),
                self.inner.config.request_timeout_ms,
            )
            .await?;
        let result: NewSessionResult = serde_json::from_value(value)
            .map_err(|e| TetherError::Protocol(format!("bad session/new result: {e}")))?;

        Ok(self.install_session(result, options.cwd))
    }

    /// Branch an existing session into a new one with shared history.
    pub async fn fork_session(&self, session_id: &str, cwd: Option<PathBuf>) -> Result<Session> {
        self.ensure_initialized()?;

        let params = ForkSessionParams {
            session_id: session_id.to_string(),
            cwd: cwd.as_ref().map(|p| p.to_string_lossy().into_owned()),
        };
        let value = self
            .inner
            .request_with_timeout(
                "session/fork",
                Some(serde_json::to_value(params)?),
                self.inner.config.request_timeout_ms,
            )
            .await?;
        let result: NewSessionResult = serde_json::from_value(value)
            .map_err(|e| TetherError::Protocol(format!("bad session/fork result: {e}")))?;

        let cwd = cwd
            .or_else(|| self.session_cwd(session_id))
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(self.install_session(result, cwd))
    }

    /// Reconnect to an agent-side session.
    pub async fn resume_session(&self, session_id: &str, cwd: Option<PathBuf>) -> Result<Session> {
        self.ensure_initialized()?;

        let params = ResumeSessionParams {
            session_id: session_id.to_string(),
            cwd: cwd.as_ref().map(|p| p.to_string_lossy().into_owned()),
        };
        let value = self
            .inner
            .request_with_timeout(
                "session/resume",
                Some(serde_json::to_value(params)?),
                self.inner.config.request_timeout_ms,
            )
            .await?;
        let result: NewSessionResult = serde_json::from_value(value)
            .map_err(|e| TetherError::Protocol(format!("bad session/resume result: {e}")))?;

        let cwd = cwd.unwrap_or_else(|| PathBuf::from("."));
        Ok(self.install_session(result, cwd))
    }

    /// List sessions known to the agent. Returned entries may include
    /// sessions this client has no local state for.
    pub async fn list_sessions(&self, cwd: Option<PathBuf>) -> Result<Vec<SessionSummary>> {
        self.ensure_initialized()?;

        let params = ListSessionsParams {
            cwd: cwd.map(|p| p.to_string_lossy().into_owned()),
        };
        let value = self
            .inner
            .request_with_timeout(
                "session/list",
                Some(serde_json::to_value(params)?),
                self.inner.config.request_timeout_ms,
            )
            .await?;
        let result: ListSessionsResult = serde_json::from_value(value)
            .map_err(|e| TetherError::Protocol(format!("bad session/list result: {e}")))?;
        Ok(result.sessions)
    }

    /// Whether the connection is still up.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Number of requests awaiting responses.
    pub fn outstanding_requests(&self) -> usize {
        self.inner.pending.outstanding()
    }

    /// Tear the connection down: signal live terminals, fail all pending
    /// requests, close session streams, kill the agent subprocess.
    pub async fn shutdown(&self) {
        self.inner.teardown().await;
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.inner.alive.load(Ordering::Acquire) {
            return Err(TetherError::ConnectionLost);
        }
        if !self.inner.initialized.load(Ordering::Acquire) {
            return Err(TetherError::NotInitialized);
        }
        Ok(())
    }

    fn session_cwd(&self, session_id: &str) -> Option<PathBuf> {
        let sessions = self.inner.sessions.lock().unwrap();
        sessions
            .get(session_id)
            .map(|s| s.data.lock().unwrap().cwd.clone())
    }

    fn install_session(&self, result: NewSessionResult, cwd: PathBuf) -> Session {
        let (shared, events) =
            SessionShared::new(result.session_id.clone(), cwd, result.config_options);
        let previous = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .insert(result.session_id.clone(), shared.clone());
        if previous.is_some() {
            // Session ids are unique per connection; a collision means the
            // remote re-issued one and the old state is stale.
            log::log_event(&format!(
                "session id {} re-issued, replacing state",
                result.session_id
            ));
        }
        Session::new(result.session_id, self.clone(), shared, events)
    }

    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }
}

impl ClientInner {
    /// Register a slot and put the request on the wire. Returns the
    /// receiving end for the caller to await.
    pub(crate) async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(u64, oneshot::Receiver<RpcOutcome>)> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(TetherError::ConnectionLost);
        }
        let (id, rx) = self.pending.register();
        let frame = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&frame)?;
        if let Err(e) = self.transport.send_line(json).await {
            self.pending.abandon(id);
            return Err(e.into());
        }
        Ok((id, rx))
    }

    /// Request with a caller-local deadline. Elapse abandons the slot — the
    /// remote side may still complete the operation, and its late response
    /// then resolves against an unknown id (a defined no-op).
    pub(crate) async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: u64,
    ) -> Result<Value> {
        let (id, rx) = self.send_request(method, params).await?;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), await_outcome(rx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.pending.abandon(id);
                Err(TetherError::Timeout(timeout_ms))
            }
        }
    }

    /// Fire a one-way notification.
    pub(crate) async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(TetherError::ConnectionLost);
        }
        let frame = JsonRpcNotification::new(method, params);
        self.transport.send_line(serde_json::to_string(&frame)?).await?;
        Ok(())
    }

    pub(crate) fn request_timeout_ms(&self) -> u64 {
        self.config.request_timeout_ms
    }

    /// One-time connection teardown. Terminal subprocesses are signalled
    /// first; they must not outlive the protocol connection.
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::Release);

        self.terminals.release_all();
        self.pending.fail_all();

        let sessions: Vec<Arc<SessionShared>> = {
            let mut map = self.sessions.lock().unwrap();
            map.drain().map(|(_, shared)| shared).collect()
        };
        for shared in sessions {
            shared.data.lock().unwrap().mark_closed();
            shared.close_events();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        log::log_event("connection closed");
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            "session/update" => {
                let Some(params) = params else {
                    log::log_event("session/update without params, dropping");
                    return;
                };
                let parsed: SessionUpdateParams = match serde_json::from_value(params) {
                    Ok(p) => p,
                    Err(e) => {
                        log::log_event(&format!("unparseable session/update, dropping: {}", e));
                        return;
                    }
                };
                let shared = {
                    let sessions = self.sessions.lock().unwrap();
                    sessions.get(&parsed.session_id).cloned()
                };
                match shared {
                    Some(shared) => router::apply_update(&shared, parsed.update),
                    None => log::log_event(&format!(
                        "update for unknown session {}, dropping",
                        parsed.session_id
                    )),
                }
            }
            other => {
                // Unrecognized notification methods are forward-compatible
                // no-ops at the connection level.
                log::log_event(&format!("unrecognized notification method: {}", other));
            }
        }
    }
}

async fn await_outcome(rx: oneshot::Receiver<RpcOutcome>) -> Result<Value> {
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TetherError::Remote(RemoteError {
            code: err.code,
            message: err.message,
            data: err.data,
        })),
        Err(_) => Err(TetherError::ConnectionLost),
    }
}

/// The connection's single reader task: drains the transport and fans
/// envelopes out. Inbound requests are served on spawned tasks so a slow
/// handler cannot block delivery of unrelated frames.
async fn read_loop(inner: Arc<ClientInner>, mut source: FrameSource) {
    while let Some(line) = source.next_line().await {
        log::log_incoming(&line);

        match IncomingMessage::parse(&line) {
            Ok(IncomingMessage::Response(resp)) => match resp.id {
                Some(id) => {
                    let outcome = match resp.error {
                        Some(err) => Err(err),
                        None => Ok(resp.result.unwrap_or(Value::Null)),
                    };
                    inner.pending.resolve(id, outcome);
                }
                None => log::log_event("response frame without id, dropping"),
            },
            Ok(IncomingMessage::Notification { method, params }) => {
                inner.handle_notification(&method, params);
            }
            Ok(IncomingMessage::Request { id, method, params }) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let frame = inner
                        .bridge
                        .handle_request(&inner.sessions, &inner.terminals, id, &method, params)
                        .await;
                    match serde_json::to_string(&frame) {
                        Ok(json) => {
                            if inner.transport.send_line(json).await.is_err() {
                                log::log_event(&format!(
                                    "dropped response to request {} on dead transport",
                                    id
                                ));
                            }
                        }
                        Err(e) => log::log_event(&format!("unserializable response frame: {}", e)),
                    }
                });
            }
            // A malformed line fails only the one envelope, not the
            // connection; line framing is still intact.
            Err(e) => log::log_event(&format!("failed to parse frame: {}", e)),
        }
    }

    inner.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::protocol::StopReason;
    use crate::session::events::SessionEvent;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    /// Scripted remote side of the connection, driven over an in-memory
    /// duplex stream.
    struct FakeAgent {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeAgent {
        fn connect(handlers: Handlers) -> (AgentClient, FakeAgent) {
            let (client_io, remote_io) = tokio::io::duplex(64 * 1024);
            let (client_read, client_write) = tokio::io::split(client_io);
            let (remote_read, remote_write) = tokio::io::split(remote_io);

            let client = AgentClient::from_stream(
                client_read,
                client_write,
                ClientConfig::default(),
                handlers,
            );
            let agent = FakeAgent {
                lines: BufReader::new(remote_read).lines(),
                writer: remote_write,
            };
            (client, agent)
        }

        async fn recv(&mut self) -> Value {
            let line = self
                .lines
                .next_line()
                .await
                .expect("agent read failed")
                .expect("client closed the stream");
            serde_json::from_str(&line).expect("client sent malformed JSON")
        }

        async fn send(&mut self, frame: Value) {
            let mut line = frame.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn expect_request(&mut self, method: &str) -> (u64, Value) {
            let frame = self.recv().await;
            assert_eq!(frame["method"], method, "unexpected request: {frame}");
            let id = frame["id"].as_u64().expect("request without id");
            (id, frame["params"].clone())
        }

        async fn respond_ok(&mut self, id: u64, result: Value) {
            self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
                .await;
        }

        async fn respond_err(&mut self, id: u64, code: i64, message: &str) {
            self.send(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            }))
            .await;
        }

        async fn notify_update(&mut self, session_id: &str, update: Value) {
            self.send(json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {"sessionId": session_id, "update": update}
            }))
            .await;
        }

        async fn handle_initialize(&mut self) {
            let (id, params) = self.expect_request("initialize").await;
            assert_eq!(params["clientCapabilities"]["terminal"], true);
            self.respond_ok(
                id,
                json!({
                    "protocolVersion": 1,
                    "agentInfo": {"name": "fake-agent", "version": "0.1.0"}
                }),
            )
            .await;
        }

        async fn handle_new_session(&mut self, session_id: &str, config_options: Value) {
            let (id, _params) = self.expect_request("session/new").await;
            self.respond_ok(
                id,
                json!({"sessionId": session_id, "configOptions": config_options}),
            )
            .await;
        }
    }

    async fn ready_session(
        client: &AgentClient,
        agent: &mut FakeAgent,
    ) -> crate::session::Session {
        let (init, _) = tokio::join!(client.initialize(), agent.handle_initialize());
        init.unwrap();

        let (session, _) = tokio::join!(
            client.new_session(NewSessionOptions::new("/tmp/work")),
            agent.handle_new_session(
                "sess_1",
                json!([{"id": "mode", "category": "mode", "currentValue": "code"}])
            )
        );
        session.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());

        let (result, _) = tokio::join!(client.initialize(), agent.handle_initialize());
        let result = result.unwrap();
        assert_eq!(result.protocol_version, 1);
        assert_eq!(
            result.agent_info.as_ref().and_then(|i| i.name.as_deref()),
            Some("fake-agent")
        );
        assert!(client.agent_info().is_some());
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let (client, _agent) = FakeAgent::connect(Handlers::default());
        let err = client
            .new_session(NewSessionOptions::new("/tmp/work"))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::NotInitialized));
    }

    #[tokio::test]
    async fn test_failed_handshake_is_fatal() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());

        let script = async {
            let (id, _) = agent.expect_request("initialize").await;
            agent.respond_err(id, -32600, "unsupported protocol version").await;
        };
        let (result, _) = tokio::join!(client.initialize(), script);
        match result.unwrap_err() {
            TetherError::Remote(remote) => assert_eq!(remote.code, -32600),
            other => panic!("expected Remote, got {:?}", other),
        }
        // No partial connection survives a failed handshake.
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn test_prompt_streams_deltas_then_done() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let mut session = ready_session(&client, &mut agent).await;

        let handle = session.send_prompt("hello").await.unwrap();

        let (prompt_id, params) = agent.expect_request("session/prompt").await;
        assert_eq!(params["sessionId"], "sess_1");
        assert_eq!(params["prompt"][0]["text"], "hello");

        agent
            .notify_update(
                "sess_1",
                json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "Hel"}}),
            )
            .await;
        agent
            .notify_update(
                "sess_1",
                json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "lo"}}),
            )
            .await;
        agent.respond_ok(prompt_id, json!({"stopReason": "end_turn"})).await;

        assert_eq!(handle.await.unwrap().unwrap(), StopReason::EndTurn);

        let mut texts = vec![];
        loop {
            match session.next_event().await.unwrap() {
                SessionEvent::MessageChunk {
                    content: crate::acp::protocol::ContentChunk::Text { text },
                } => texts.push(text),
                SessionEvent::Done { stop_reason } => {
                    assert_eq!(stop_reason, StopReason::EndTurn);
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(texts.join(""), "Hello");
    }

    #[tokio::test]
    async fn test_second_prompt_fails_fast_with_busy() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;

        let handle = session.send_prompt("first").await.unwrap();
        let (prompt_id, _) = agent.expect_request("session/prompt").await;

        // Does not queue: the failure is immediate and local.
        let err = session.prompt("second").await.unwrap_err();
        assert!(matches!(err, TetherError::SessionBusy));

        agent.respond_ok(prompt_id, json!({"stopReason": "end_turn"})).await;
        assert_eq!(handle.await.unwrap().unwrap(), StopReason::EndTurn);

        // The slot is free again afterwards.
        let handle = session.send_prompt("third").await.unwrap();
        let (prompt_id, _) = agent.expect_request("session/prompt").await;
        agent.respond_ok(prompt_id, json!({"stopReason": "end_turn"})).await;
        assert_eq!(handle.await.unwrap().unwrap(), StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_cancel_without_turn_is_noop() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;

        session.cancel().await.unwrap();
        session.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_mid_turn_yields_cancelled_stop() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let mut session = ready_session(&client, &mut agent).await;

        let handle = session.send_prompt("long task").await.unwrap();
        let (prompt_id, _) = agent.expect_request("session/prompt").await;

        session.cancel().await.unwrap();

        // Cancel is a one-way notification, not a request.
        let frame = agent.recv().await;
        assert_eq!(frame["method"], "session/cancel");
        assert!(frame.get("id").is_none());
        assert_eq!(frame["params"]["sessionId"], "sess_1");

        agent.respond_ok(prompt_id, json!({"stopReason": "cancelled"})).await;
        assert_eq!(handle.await.unwrap().unwrap(), StopReason::Cancelled);

        match session.next_event().await.unwrap() {
            SessionEvent::Done { stop_reason } => assert_eq!(stop_reason, StopReason::Cancelled),
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_then_normal_completion_is_authoritative() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;

        let handle = session.send_prompt("quick").await.unwrap();
        let (prompt_id, _) = agent.expect_request("session/prompt").await;
        session.cancel().await.unwrap();
        let _cancel_frame = agent.recv().await;

        // The turn finished anyway; cancel is advisory.
        agent.respond_ok(prompt_id, json!({"stopReason": "end_turn"})).await;
        assert_eq!(handle.await.unwrap().unwrap(), StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_set_config_option_replaces_whole_sequence() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;
        assert_eq!(session.current_mode().as_deref(), Some("code"));

        let script = async {
            let (id, params) = agent.expect_request("session/set_config_option").await;
            assert_eq!(params["configId"], "mode");
            assert_eq!(params["value"], "plan");
            // Changing mode cascaded into a model change too.
            agent
                .respond_ok(
                    id,
                    json!({"configOptions": [
                        {"id": "mode", "category": "mode", "currentValue": "plan"},
                        {"id": "model", "category": "model", "currentValue": "opus"}
                    ]}),
                )
                .await;
        };
        let (options, _) = tokio::join!(session.set_config_option("mode", "plan"), script);
        let options = options.unwrap();
        assert_eq!(options.len(), 2);

        // Round trip: re-read yields the new value for the changed id.
        assert_eq!(session.current_mode().as_deref(), Some("plan"));
        assert_eq!(session.config_options().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_config_change_keeps_prior_snapshot() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;

        let script = async {
            let (id, _) = agent.expect_request("session/set_config_option").await;
            agent.respond_err(id, -32602, "no such option").await;
        };
        let (result, _) = tokio::join!(session.set_config_option("mode", "warp"), script);
        assert!(matches!(result.unwrap_err(), TetherError::Remote(_)));
        assert_eq!(session.current_mode().as_deref(), Some("code"));
    }

    #[tokio::test]
    async fn test_legacy_set_mode_translates_into_config_store() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;

        let script = async {
            let (id, params) = agent.expect_request("session/set_mode").await;
            assert_eq!(params["modeId"], "plan");
            agent.respond_ok(id, json!(null)).await;
        };
        let (result, _) = tokio::join!(session.set_mode("plan"), script);
        result.unwrap();

        assert_eq!(session.current_mode().as_deref(), Some("plan"));
        // One store: no second mode field appeared.
        let modes: Vec<_> = session
            .config_options()
            .into_iter()
            .filter(|o| o.id == "mode")
            .collect();
        assert_eq!(modes.len(), 1);

        // The model selector goes through the same store.
        let script = async {
            let (id, params) = agent.expect_request("session/set_model").await;
            assert_eq!(params["modelId"], "opus");
            agent.respond_ok(id, json!(null)).await;
        };
        let (result, _) = tokio::join!(session.set_model("opus"), script);
        result.unwrap();
        assert_eq!(session.current_model().as_deref(), Some("opus"));
    }

    #[tokio::test]
    async fn test_unknown_notification_kind_advances_stream() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let mut session = ready_session(&client, &mut agent).await;

        agent
            .notify_update("sess_1", json!({"sessionUpdate": "fabricated_kind_xyz", "n": 1}))
            .await;
        agent
            .notify_update(
                "sess_1",
                json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "ok"}}),
            )
            .await;

        match session.next_event().await.unwrap() {
            SessionEvent::Unknown { kind, .. } => assert_eq!(kind, "fabricated_kind_xyz"),
            other => panic!("expected Unknown, got {:?}", other),
        }
        assert!(matches!(
            session.next_event().await.unwrap(),
            SessionEvent::MessageChunk { .. }
        ));
    }

    #[tokio::test]
    async fn test_update_for_unknown_session_drops_envelope_only() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let mut session = ready_session(&client, &mut agent).await;

        agent
            .notify_update(
                "sess_unknown",
                json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "lost"}}),
            )
            .await;
        agent
            .notify_update(
                "sess_1",
                json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "kept"}}),
            )
            .await;

        match session.next_event().await.unwrap() {
            SessionEvent::MessageChunk {
                content: crate::acp::protocol::ContentChunk::Text { text },
            } => assert_eq!(text, "kept"),
            other => panic!("expected MessageChunk, got {:?}", other),
        }
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn test_connection_death_fails_pending_and_closes_sessions() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let mut session = ready_session(&client, &mut agent).await;

        let handle = session.send_prompt("hello").await.unwrap();
        let _ = agent.expect_request("session/prompt").await;
        assert_eq!(client.outstanding_requests(), 1);

        drop(agent);

        // The in-flight turn resolves exactly once, with ConnectionLost.
        match handle.await.unwrap() {
            Err(TetherError::ConnectionLost) => {}
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
        assert_eq!(client.outstanding_requests(), 0);

        // The event stream terminates.
        assert!(session.next_event().await.is_none());

        // Local precondition failures after death never touch the transport.
        assert!(matches!(
            session.prompt("again").await.unwrap_err(),
            TetherError::SessionClosed
        ));
        assert!(matches!(
            client.new_session(NewSessionOptions::new("/tmp")).await.unwrap_err(),
            TetherError::ConnectionLost
        ));
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn test_unknown_inbound_request_is_answered() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let _session = ready_session(&client, &mut agent).await;

        agent
            .send(json!({
                "jsonrpc": "2.0",
                "id": 42,
                "method": "wild/feature",
                "params": {}
            }))
            .await;

        let frame = agent.recv().await;
        assert_eq!(frame["id"], 42);
        assert_eq!(frame["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_fs_delegation_rejected_outside_cwd_end_to_end() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default().with_fs(crate::handlers::LocalFs));
        let _session = ready_session(&client, &mut agent).await;

        agent
            .send(json!({
                "jsonrpc": "2.0",
                "id": 50,
                "method": "fs/read_text_file",
                "params": {"sessionId": "sess_1", "path": "/etc/passwd"}
            }))
            .await;

        let frame = agent.recv().await;
        assert_eq!(frame["id"], 50);
        assert_eq!(frame["error"]["code"], -32000);
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn test_prompt_deadline_is_caller_local() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;

        let err = session.prompt_with_timeout("slow", 30).await.unwrap_err();
        assert!(matches!(err, TetherError::Timeout(30)));

        // The turn slot is free and the connection is still usable.
        let (prompt_id, _) = agent.expect_request("session/prompt").await;
        let handle = session.send_prompt("next").await.unwrap();
        let (next_id, _) = agent.expect_request("session/prompt").await;
        // Late response to the abandoned request is a defined no-op.
        agent.respond_ok(prompt_id, json!({"stopReason": "end_turn"})).await;
        agent.respond_ok(next_id, json!({"stopReason": "end_turn"})).await;
        assert_eq!(handle.await.unwrap().unwrap(), StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_malformed_frame_fails_envelope_not_connection() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let mut session = ready_session(&client, &mut agent).await;

        agent.writer.write_all(b"this is not json\n").await.unwrap();
        agent
            .notify_update(
                "sess_1",
                json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "fine"}}),
            )
            .await;

        assert!(matches!(
            session.next_event().await.unwrap(),
            SessionEvent::MessageChunk { .. }
        ));
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations_locally() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;

        session.close();
        assert!(session.is_closed());

        assert!(matches!(
            session.prompt("hi").await.unwrap_err(),
            TetherError::SessionClosed
        ));
        assert!(matches!(
            session.set_config_option("mode", "plan").await.unwrap_err(),
            TetherError::SessionClosed
        ));
        assert!(matches!(
            session.cancel().await.unwrap_err(),
            TetherError::SessionClosed
        ));

        // The client connection itself is unaffected.
        assert!(client.is_alive());
        let (next, _) = tokio::join!(
            client.new_session(NewSessionOptions::new("/tmp/other")),
            agent.handle_new_session("sess_2", json!([]))
        );
        next.unwrap();
    }

    #[tokio::test]
    async fn test_session_fork_and_list() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;

        let script = async {
            let (id, params) = agent.expect_request("session/fork").await;
            assert_eq!(params["sessionId"], "sess_1");
            agent.respond_ok(id, json!({"sessionId": "sess_fork"})).await;

            let (id, _) = agent.expect_request("session/list").await;
            agent
                .respond_ok(
                    id,
                    json!({"sessions": [
                        {"sessionId": "sess_1", "title": "original"},
                        {"sessionId": "sess_fork"}
                    ]}),
                )
                .await;
        };

        let work = async {
            let forked = client.fork_session(session.id(), None).await.unwrap();
            assert_eq!(forked.id(), "sess_fork");
            // The fork inherits the parent's working directory.
            assert_eq!(forked.cwd(), PathBuf::from("/tmp/work"));

            let sessions = client.list_sessions(None).await.unwrap();
            assert_eq!(sessions.len(), 2);
            assert_eq!(sessions[0].title.as_deref(), Some("original"));
        };
        tokio::join!(work, script);
    }

    #[tokio::test]
    async fn test_remote_error_surfaced_verbatim() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let session = ready_session(&client, &mut agent).await;

        let script = async {
            let (id, _) = agent.expect_request("session/prompt").await;
            agent.respond_err(id, -32050, "model overloaded").await;
        };
        let (result, _) = tokio::join!(session.prompt("hi"), script);
        match result.unwrap_err() {
            TetherError::Remote(remote) => {
                assert_eq!(remote.code, -32050);
                assert_eq!(remote.message, "model overloaded");
            }
            other => panic!("expected Remote, got {:?}", other),
        }

        // A failed turn frees the slot.
        let script = async {
            let (id, _) = agent.expect_request("session/prompt").await;
            agent.respond_ok(id, json!({"stopReason": "end_turn"})).await;
        };
        let (result, _) = tokio::join!(session.prompt("retry"), script);
        assert_eq!(result.unwrap(), StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_once() {
        let (client, mut agent) = FakeAgent::connect(Handlers::default());
        let _session = ready_session(&client, &mut agent).await;

        client.shutdown().await;
        client.shutdown().await;
        assert!(!client.is_alive());

        // Wait a beat so the reader observes the closed stream too.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            client.new_session(NewSessionOptions::new("/tmp")).await.unwrap_err(),
            TetherError::ConnectionLost
        ));
    }
}
