//! Stdio proxy for one backend process.
//!
//! The proxy owns the backend's stdin/stdout/stderr. Outbound requests are
//! newline-delimited JSON-RPC objects with monotonically increasing numeric
//! ids; a reader task splits stdout on newlines and completes the matching
//! pending entry. Replies and timeouts remove entries idempotently, so a
//! late response never resolves a request twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::protocol::{
    self, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolsListResult,
};

/// Default per-request deadline when the backend config does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How much backend stderr is retained for diagnostics.
pub const STDERR_TAIL_BYTES: usize = 500;

/// Errors that can occur while talking to a backend.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("proxy destroyed")]
    Destroyed,

    #[error("{0}")]
    Rpc(JsonRpcError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<ProxyError> for tg_domain::Error {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Timeout => tg_domain::Error::Timeout("tool call timed out".into()),
            ProxyError::Rpc(err) => tg_domain::Error::Remote(err.to_string()),
            ProxyError::Protocol(msg) => tg_domain::Error::Remote(msg),
            ProxyError::Json(err) => tg_domain::Error::Json(err),
            other => tg_domain::Error::Transport(other.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Correlation table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type Reply = Result<JsonRpcResponse, ProxyError>;

/// Pending-request table mapping request id to its completion channel.
///
/// `complete` and `abandon` both *remove* the entry under the lock and act
/// on it outside the lock, so the reply path and the timeout path can race
/// on the same id without double-completion.
pub(crate) struct Correlations {
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
}

impl Correlations {
    pub(crate) fn new() -> Self {
        Self {
            pending: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending request and hand back its completion side.
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        rx
    }

    /// Complete a pending request. Returns `false` when the entry is gone
    /// (already completed, timed out, or never registered).
    pub(crate) fn complete(&self, id: u64, reply: Reply) -> bool {
        let sender = self.pending.lock().remove(&id);
        match sender {
            // Send failures mean the caller stopped waiting; nothing to do.
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry without completing it (timeout path).
    pub(crate) fn abandon(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Fail every pending request with an error produced per entry.
    pub(crate) fn fail_all(&self, mut make_error: impl FnMut() -> ProxyError) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Route one inbound line. Non-JSON lines are ignored (stderr bleed,
    /// interleaved diagnostics); objects without an `id` are notifications
    /// and are dropped; objects carrying an `id` plus `result` or `error`
    /// complete the matching entry.
    pub(crate) fn dispatch_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() || !trimmed.starts_with('{') {
            return;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                tracing::debug!(line = %trimmed, "ignoring non-JSON line from backend stdout");
                return;
            }
        };
        if value.get("id").is_none() {
            tracing::debug!("dropping notification from backend");
            return;
        }
        if value.get("result").is_none() && value.get("error").is_none() {
            tracing::debug!("ignoring inbound object without result or error");
            return;
        }
        match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(resp) => {
                let id = resp.id;
                if !self.complete(id, Ok(resp)) {
                    tracing::debug!(id, "late or unsolicited response ignored");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "ignoring malformed response object");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stderr tail
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ring buffer keeping the last [`STDERR_TAIL_BYTES`] of backend stderr.
pub struct StderrTail {
    buf: parking_lot::Mutex<Vec<u8>>,
}

impl StderrTail {
    fn new() -> Self {
        Self {
            buf: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn push(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock();
        buf.extend_from_slice(bytes);
        if buf.len() > STDERR_TAIL_BYTES {
            let cut = buf.len() - STDERR_TAIL_BYTES;
            buf.drain(..cut);
        }
    }

    /// Lossy snapshot of the retained tail.
    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolProxy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Full-duplex JSON-RPC proxy over one backend's stdio.
pub struct ToolProxy {
    server_id: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    correlations: Arc<Correlations>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    default_timeout: Duration,
    /// Signalled once when stdout reaches EOF (backend gone).
    closed_tx: tokio::sync::watch::Sender<bool>,
    closed_rx: tokio::sync::watch::Receiver<bool>,
    stderr_tail: Arc<StderrTail>,
    stderr_reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ToolProxy {
    /// Wrap a spawned backend's streams and start the reader tasks.
    pub fn new(
        server_id: impl Into<String>,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let (closed_tx, closed_rx) = tokio::sync::watch::channel(false);
        let proxy = Arc::new(Self {
            server_id: server_id.into(),
            stdin: tokio::sync::Mutex::new(stdin),
            correlations: Arc::new(Correlations::new()),
            next_id: AtomicU64::new(1),
            alive: Arc::new(AtomicBool::new(true)),
            default_timeout,
            closed_tx,
            closed_rx,
            stderr_tail: Arc::new(StderrTail::new()),
            stderr_reader: parking_lot::Mutex::new(None),
        });

        // The reader ends on its own at stdout EOF; it is deliberately
        // detached so a destroyed proxy still observes process exit.
        tokio::spawn(Self::read_loop(
            proxy.server_id.clone(),
            stdout,
            Arc::clone(&proxy.correlations),
            Arc::clone(&proxy.alive),
            proxy.closed_tx.clone(),
        ));

        let stderr_reader = tokio::spawn(Self::stderr_loop(
            stderr,
            Arc::clone(&proxy.stderr_tail),
        ));
        *proxy.stderr_reader.lock() = Some(stderr_reader);

        proxy
    }

    async fn read_loop(
        server_id: String,
        stdout: ChildStdout,
        correlations: Arc<Correlations>,
        alive: Arc<AtomicBool>,
        closed_tx: tokio::sync::watch::Sender<bool>,
    ) {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    tracing::debug!(server_id = %server_id, "backend stdout closed");
                    break;
                }
                Ok(_) => correlations.dispatch_line(&line),
                Err(e) => {
                    tracing::warn!(server_id = %server_id, error = %e, "backend stdout read failed");
                    break;
                }
            }
        }
        alive.store(false, Ordering::SeqCst);
        correlations.fail_all(|| ProxyError::ProcessExited);
        let _ = closed_tx.send(true);
    }

    async fn stderr_loop(stderr: ChildStderr, tail: Arc<StderrTail>) {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => tail.push(line.as_bytes()),
            }
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.correlations.len()
    }

    /// Last bytes of backend stderr, for diagnostics.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    /// Resolves once the backend's stdout reaches EOF.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn write_line(&self, json: &str) -> Result<(), ProxyError> {
        if !self.is_alive() {
            return Err(ProxyError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Send a request and await its correlated reply under a deadline.
    ///
    /// On expiry the pending entry is removed; a reply arriving afterwards
    /// is dropped by the reader.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse, ProxyError> {
        if !self.is_alive() {
            return Err(ProxyError::ProcessExited);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.correlations.register(id);

        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;
        tracing::debug!(server_id = %self.server_id, id, method, "sending request");
        if let Err(e) = self.write_line(&json).await {
            self.correlations.abandon(id);
            return Err(e);
        }

        let deadline = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            // Completion side dropped without a reply: the table was torn
            // down between registration and completion.
            Ok(Err(_)) => {
                if self.is_alive() {
                    Err(ProxyError::Destroyed)
                } else {
                    Err(ProxyError::ProcessExited)
                }
            }
            Err(_) => {
                self.correlations.abandon(id);
                tracing::debug!(server_id = %self.server_id, id, method, "request deadline expired");
                Err(ProxyError::Timeout)
            }
        }
    }

    /// Send a notification (no reply expected).
    pub async fn notify(&self, method: &str) -> Result<(), ProxyError> {
        let notif = JsonRpcNotification::new(method);
        let json = serde_json::to_string(&notif)?;
        self.write_line(&json).await
    }

    /// Perform the `initialize` handshake.
    pub async fn initialize(&self) -> Result<(), ProxyError> {
        let params = serde_json::to_value(protocol::initialize_params())?;
        let resp = self.request("initialize", Some(params), None).await?;
        if let Some(err) = resp.error {
            return Err(ProxyError::Rpc(err));
        }
        self.notify("notifications/initialized").await?;
        Ok(())
    }

    /// Discover the backend's tool catalog via `tools/list`.
    ///
    /// A malformed result yields an empty catalog rather than an error so a
    /// misbehaving backend degrades instead of blocking startup.
    pub async fn discover_tools(&self) -> Result<Vec<protocol::ToolDef>, ProxyError> {
        let resp = self.request("tools/list", None, None).await?;
        let result = match resp.into_result() {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(server_id = %self.server_id, error = %err, "tools/list returned error");
                return Ok(Vec::new());
            }
        };
        match serde_json::from_value::<ToolsListResult>(result) {
            Ok(list) => Ok(list.tools),
            Err(e) => {
                tracing::warn!(server_id = %self.server_id, error = %e, "failed to parse tools/list result");
                Ok(Vec::new())
            }
        }
    }

    /// Invoke `tools/call`, returning the backend's `result` verbatim.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ProxyError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let resp = self.request("tools/call", Some(params), timeout).await?;
        resp.into_result().map_err(ProxyError::Rpc)
    }

    /// Tear the proxy down: fail all pending requests, close the backend's
    /// stdin (the polite shutdown signal), and stop the reader tasks.
    pub async fn destroy(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.correlations.fail_all(|| ProxyError::Destroyed);
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(server_id = %self.server_id, error = %e, "error closing backend stdin");
            }
        }
        // Stderr drain is harmless to leave running, but aborting keeps
        // shutdown prompt.
        if let Some(handle) = self.stderr_reader.lock().take() {
            handle.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn response_line(id: u64) -> String {
        format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{{"ok":true}}}}"#)
    }

    #[tokio::test]
    async fn dispatch_completes_registered_entry() {
        let table = Correlations::new();
        let rx = table.register(1);
        table.dispatch_line(&response_line(1));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.id, 1);
        assert_eq!(reply.result.unwrap()["ok"], true);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn late_response_after_abandon_is_ignored() {
        let table = Correlations::new();
        let rx = table.register(7);
        // Timeout path removes the entry first.
        assert!(table.abandon(7));
        drop(rx);
        // The late reply finds nothing to complete.
        table.dispatch_line(&response_line(7));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn double_completion_is_idempotent() {
        let table = Correlations::new();
        let rx = table.register(3);
        assert!(table.complete(
            3,
            Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: 3,
                result: Some(serde_json::json!(1)),
                error: None,
            })
        ));
        // Second completion for the same id is a no-op.
        assert!(!table.complete(
            3,
            Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: 3,
                result: Some(serde_json::json!(2)),
                error: None,
            })
        ));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.result.unwrap(), serde_json::json!(1));
    }

    #[tokio::test]
    async fn dispatch_ignores_noise_and_notifications() {
        let table = Correlations::new();
        let rx = table.register(2);
        table.dispatch_line("backend starting up...");
        table.dispatch_line("");
        table.dispatch_line("{not json");
        table.dispatch_line(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#);
        // A request-shaped echo (id but no result/error) is not a reply.
        table.dispatch_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#);
        assert_eq!(table.len(), 1);
        table.dispatch_line(&response_line(2));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn fail_all_errors_every_pending_entry() {
        let table = Correlations::new();
        let rx1 = table.register(10);
        let rx2 = table.register(11);
        table.fail_all(|| ProxyError::Destroyed);
        assert!(matches!(rx1.await.unwrap(), Err(ProxyError::Destroyed)));
        assert!(matches!(rx2.await.unwrap(), Err(ProxyError::Destroyed)));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn error_responses_complete_entries_too() {
        let table = Correlations::new();
        let rx = table.register(5);
        table.dispatch_line(
            r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601,"message":"Method not found"}}"#,
        );
        let reply = rx.await.unwrap().unwrap();
        assert!(reply.is_error());
    }

    #[test]
    fn stderr_tail_keeps_last_bytes() {
        let tail = StderrTail::new();
        tail.push(&[b'a'; 400]);
        tail.push(&[b'b'; 400]);
        let snap = tail.snapshot();
        assert_eq!(snap.len(), STDERR_TAIL_BYTES);
        assert!(snap.ends_with('b'));
        assert!(snap.starts_with('a'));
    }
}
