//! Backend registry and process supervisor.
//!
//! The registry owns every backend process; the orchestrator only borrows
//! proxies. Entries are fixed at construction in configuration order, which
//! is also the iteration order for tool lookup — the first registered
//! backend advertising a tool name wins, and later duplicates are logged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::oneshot;

use tg_domain::config::ServerConfig;
use tg_domain::{Error, Result};

use crate::protocol::ToolDef;
use crate::proxy::ToolProxy;

/// How long a freshly spawned backend gets to settle before the handshake.
const SETTLE: Duration = Duration::from_millis(100);

/// Grace window for draining and polite shutdown before a forced kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one backend, for `server_status()`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusReport {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub restart_count: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ServerRuntime {
    status: ServerStatus,
    proxy: Option<Arc<ToolProxy>>,
    /// Escalates the observer to a forced kill.
    kill_tx: Option<oneshot::Sender<()>>,
    tools: Vec<ToolDef>,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    restart_count: u32,
    ever_started: bool,
}

struct ServerEntry {
    config: ServerConfig,
    runtime: parking_lot::Mutex<ServerRuntime>,
}

impl ServerEntry {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            runtime: parking_lot::Mutex::new(ServerRuntime {
                status: ServerStatus::Stopped,
                proxy: None,
                kill_tx: None,
                tools: Vec::new(),
                last_error: None,
                started_at: None,
                restart_count: 0,
                ever_started: false,
            }),
        }
    }

    fn set_error(&self, message: String) {
        let mut rt = self.runtime.lock();
        rt.status = ServerStatus::Error;
        rt.last_error = Some(message);
        rt.proxy = None;
        rt.started_at = None;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Supervises the configured backend fleet.
pub struct ServerRegistry {
    entries: Vec<Arc<ServerEntry>>,
}

impl ServerRegistry {
    /// Build a registry from descriptors. Order is preserved and is the
    /// tie-break order for duplicate tool names.
    pub fn new(configs: Vec<ServerConfig>) -> Self {
        Self {
            entries: configs
                .into_iter()
                .map(|c| Arc::new(ServerEntry::new(c)))
                .collect(),
        }
    }

    fn entry(&self, id: &str) -> Result<&Arc<ServerEntry>> {
        self.entries
            .iter()
            .find(|e| e.config.id == id)
            .ok_or_else(|| Error::Config(format!("unknown server: {id}")))
    }

    /// Spawn, settle, handshake, and discover tools for one backend.
    ///
    /// Idempotent while the backend is starting or running. Refuses
    /// disabled backends. Re-starting a previously started backend bumps
    /// its restart counter.
    pub async fn start(&self, id: &str) -> Result<()> {
        let entry = Arc::clone(self.entry(id)?);
        if !entry.config.enabled {
            return Err(Error::Config(format!("server {id} is disabled")));
        }

        {
            let mut rt = entry.runtime.lock();
            if matches!(rt.status, ServerStatus::Running | ServerStatus::Starting) {
                return Ok(());
            }
            if rt.ever_started {
                rt.restart_count += 1;
            }
            rt.ever_started = true;
            rt.status = ServerStatus::Starting;
            rt.last_error = None;
        }

        tracing::info!(
            server_id = %id,
            command = %entry.config.command,
            "starting backend"
        );

        let mut cmd = tokio::process::Command::new(&entry.config.command);
        cmd.args(&entry.config.args)
            // Inherited environment overlaid with the descriptor's map.
            .envs(&entry.config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("spawn failed: {e}");
                entry.set_error(message.clone());
                return Err(Error::Transport(format!("server {id}: {message}")));
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.start_kill();
            let message = "failed to capture child stdio".to_string();
            entry.set_error(message.clone());
            return Err(Error::Transport(format!("server {id}: {message}")));
        };

        let proxy = ToolProxy::new(
            id,
            stdin,
            stdout,
            stderr,
            Duration::from_millis(entry.config.timeout_ms),
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut rt = entry.runtime.lock();
            rt.proxy = Some(Arc::clone(&proxy));
            rt.kill_tx = Some(kill_tx);
            rt.started_at = Some(Utc::now());
        }

        tokio::spawn(Self::observe(Arc::clone(&entry), Arc::clone(&proxy), child, kill_rx));

        // Let the process settle before the handshake; a backend that dies
        // immediately is reported here rather than as a timeout.
        tokio::time::sleep(SETTLE).await;
        if !proxy.is_alive() {
            let tail = proxy.stderr_tail();
            let message = if tail.is_empty() {
                "exited during startup".to_string()
            } else {
                format!("exited during startup: {tail}")
            };
            entry.set_error(message.clone());
            return Err(Error::Transport(format!("server {id}: {message}")));
        }

        if let Err(e) = proxy.initialize().await {
            let message = format!("initialize failed: {e}");
            entry.set_error(message.clone());
            proxy.destroy().await;
            return Err(Error::Transport(format!("server {id}: {message}")));
        }

        let tools = match proxy.discover_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                let message = format!("tool discovery failed: {e}");
                entry.set_error(message.clone());
                proxy.destroy().await;
                return Err(Error::Transport(format!("server {id}: {message}")));
            }
        };
        let tool_count = tools.len();
        self.register_tools(id, tools)?;

        {
            let mut rt = entry.runtime.lock();
            rt.status = ServerStatus::Running;
        }
        tracing::info!(server_id = %id, tool_count, "backend running");
        Ok(())
    }

    /// Start every enabled backend. Individual failures are logged and do
    /// not abort the rest of the fleet.
    pub async fn start_all(&self) {
        for entry in &self.entries {
            if !entry.config.enabled {
                tracing::debug!(server_id = %entry.config.id, "skipping disabled backend");
                continue;
            }
            if let Err(e) = self.start(&entry.config.id).await {
                tracing::warn!(server_id = %entry.config.id, error = %e, "backend failed to start");
            }
        }
    }

    /// Observer task: exclusively owns the child handle, waits for exit,
    /// records the outcome, and escalates to a kill when signalled.
    async fn observe(
        entry: Arc<ServerEntry>,
        proxy: Arc<ToolProxy>,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                tracing::warn!(server_id = %entry.config.id, "forcing backend kill");
                let _ = child.start_kill();
                child.wait().await
            }
        };

        let tail = proxy.stderr_tail();
        let mut rt = entry.runtime.lock();
        rt.kill_tx = None;
        rt.proxy = None;
        rt.started_at = None;
        // An explicit stop() or a failed startup has already finalized the
        // state; only live backends transition here.
        if !matches!(rt.status, ServerStatus::Starting | ServerStatus::Running) {
            return;
        }
        match status {
            Ok(st) if st.success() => {
                tracing::info!(server_id = %entry.config.id, "backend exited cleanly");
                rt.status = ServerStatus::Stopped;
            }
            Ok(st) => {
                let message = match st.code() {
                    Some(code) if tail.is_empty() => format!("exited with code {code}"),
                    Some(code) => format!("exited with code {code}: {tail}"),
                    None if tail.is_empty() => "terminated by signal".to_string(),
                    None => format!("terminated by signal: {tail}"),
                };
                tracing::warn!(server_id = %entry.config.id, error = %message, "backend crashed");
                rt.status = ServerStatus::Error;
                rt.last_error = Some(message);
            }
            Err(e) => {
                rt.status = ServerStatus::Error;
                rt.last_error = Some(format!("wait failed: {e}"));
            }
        }
    }

    /// Gracefully stop one backend: drain in-flight calls up to the grace
    /// window, close stdin, then force kill if it lingers.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let entry = Arc::clone(self.entry(id)?);
        let (proxy, kill_tx) = {
            let mut rt = entry.runtime.lock();
            match rt.proxy.take() {
                Some(proxy) => (proxy, rt.kill_tx.take()),
                None => {
                    rt.status = ServerStatus::Stopped;
                    rt.started_at = None;
                    return Ok(());
                }
            }
        };

        // Drain: give in-flight calls a chance to complete before teardown.
        let drain_deadline = tokio::time::Instant::now() + STOP_GRACE;
        while proxy.pending_count() > 0 && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        proxy.destroy().await;

        if tokio::time::timeout(STOP_GRACE, proxy.closed()).await.is_err() {
            if let Some(tx) = kill_tx {
                let _ = tx.send(());
            }
            let _ = tokio::time::timeout(Duration::from_secs(2), proxy.closed()).await;
        }

        let mut rt = entry.runtime.lock();
        rt.status = ServerStatus::Stopped;
        rt.proxy = None;
        rt.started_at = None;
        tracing::info!(server_id = %id, "backend stopped");
        Ok(())
    }

    /// Stop every backend, concurrently.
    pub async fn stop_all(&self) {
        let stops = self.entries.iter().map(|e| self.stop(&e.config.id));
        for result in futures_util::future::join_all(stops).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "backend stop failed");
            }
        }
    }

    /// Replace one backend's discovered tool set, warning when a name is
    /// already provided by an earlier-registered backend.
    pub fn register_tools(&self, id: &str, tools: Vec<ToolDef>) -> Result<()> {
        for tool in &tools {
            for other in &self.entries {
                if other.config.id == id {
                    break;
                }
                if other.runtime.lock().tools.iter().any(|t| t.name == tool.name) {
                    tracing::warn!(
                        tool = %tool.name,
                        server_id = %id,
                        owner = %other.config.id,
                        "duplicate tool name; first registration wins"
                    );
                }
            }
        }
        let entry = self.entry(id)?;
        entry.runtime.lock().tools = tools;
        Ok(())
    }

    /// First backend (in registration order) advertising the given tool.
    pub fn find_server_for_tool(&self, name: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|e| e.runtime.lock().tools.iter().any(|t| t.name == name))
            .map(|e| e.config.id.clone())
    }

    /// Borrow the live proxy for a running backend.
    pub fn proxy(&self, id: &str) -> Result<Arc<ToolProxy>> {
        let entry = self.entry(id)?;
        let rt = entry.runtime.lock();
        match (&rt.status, &rt.proxy) {
            (ServerStatus::Running, Some(proxy)) => Ok(Arc::clone(proxy)),
            _ => Err(Error::Transport(format!("server {id} is not running"))),
        }
    }

    /// Per-call deadline configured for a backend.
    pub fn timeout_for(&self, id: &str) -> Option<Duration> {
        self.entry(id)
            .ok()
            .map(|e| Duration::from_millis(e.config.timeout_ms))
    }

    /// All discovered tools of running backends, in registration order.
    pub fn tools(&self) -> Vec<(String, ToolDef)> {
        self.entries
            .iter()
            .flat_map(|e| {
                let rt = e.runtime.lock();
                if rt.status == ServerStatus::Running {
                    rt.tools
                        .iter()
                        .map(|t| (e.config.id.clone(), t.clone()))
                        .collect()
                } else {
                    Vec::new()
                }
            })
            .collect()
    }

    /// Status report for every backend.
    pub fn statuses(&self) -> Vec<ServerStatusReport> {
        self.entries
            .iter()
            .map(|e| {
                let rt = e.runtime.lock();
                ServerStatusReport {
                    id: e.config.id.clone(),
                    name: if e.config.name.is_empty() {
                        e.config.id.clone()
                    } else {
                        e.config.name.clone()
                    },
                    status: rt.status,
                    tool_count: rt.tools.len(),
                    uptime_secs: rt
                        .started_at
                        .map(|t| (Utc::now() - t).num_seconds().max(0) as u64),
                    last_error: rt.last_error.clone(),
                    restart_count: rt.restart_count,
                }
            })
            .collect()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.config.id.clone()).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.into(),
            name: String::new(),
            command: "./backend".into(),
            args: vec![],
            env: Default::default(),
            tags: vec![],
            enabled: true,
            timeout_ms: 30_000,
            health_check: false,
        }
    }

    fn tool(name: &str) -> ToolDef {
        ToolDef {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }

    #[test]
    fn find_server_for_tool_is_first_registered_wins() {
        let registry = ServerRegistry::new(vec![server("alpha"), server("beta")]);
        registry
            .register_tools("alpha", vec![tool("read_file"), tool("shared")])
            .unwrap();
        registry
            .register_tools("beta", vec![tool("fetch"), tool("shared")])
            .unwrap();

        assert_eq!(registry.find_server_for_tool("read_file").as_deref(), Some("alpha"));
        assert_eq!(registry.find_server_for_tool("fetch").as_deref(), Some("beta"));
        // Duplicate resolves to the earlier registration.
        assert_eq!(registry.find_server_for_tool("shared").as_deref(), Some("alpha"));
        assert_eq!(registry.find_server_for_tool("missing"), None);
    }

    #[test]
    fn register_tools_replaces_the_set() {
        let registry = ServerRegistry::new(vec![server("alpha")]);
        registry.register_tools("alpha", vec![tool("a"), tool("b")]).unwrap();
        registry.register_tools("alpha", vec![tool("c")]).unwrap();
        assert_eq!(registry.find_server_for_tool("a"), None);
        assert_eq!(registry.find_server_for_tool("c").as_deref(), Some("alpha"));
        assert_eq!(registry.statuses()[0].tool_count, 1);
    }

    #[test]
    fn statuses_report_initial_state() {
        let registry = ServerRegistry::new(vec![server("alpha")]);
        let reports = registry.statuses();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ServerStatus::Stopped);
        assert_eq!(reports[0].restart_count, 0);
        assert!(reports[0].uptime_secs.is_none());
    }

    #[tokio::test]
    async fn start_refuses_disabled_backend() {
        let mut config = server("alpha");
        config.enabled = false;
        let registry = ServerRegistry::new(vec![config]);
        let err = registry.start("alpha").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn start_unknown_backend_errors() {
        let registry = ServerRegistry::new(vec![]);
        assert!(registry.start("ghost").await.is_err());
    }

    #[tokio::test]
    async fn spawn_failure_marks_error_and_counts_restarts() {
        let mut config = server("alpha");
        config.command = "/nonexistent/toolgate-test-backend".into();
        let registry = ServerRegistry::new(vec![config]);

        assert!(registry.start("alpha").await.is_err());
        let report = &registry.statuses()[0];
        assert_eq!(report.status, ServerStatus::Error);
        assert!(report.last_error.as_deref().unwrap_or("").contains("spawn failed"));
        assert_eq!(report.restart_count, 0);

        // Second attempt on a previously started backend bumps the counter.
        assert!(registry.start("alpha").await.is_err());
        assert_eq!(registry.statuses()[0].restart_count, 1);
    }

    #[tokio::test]
    async fn stop_on_never_started_backend_is_ok() {
        let registry = ServerRegistry::new(vec![server("alpha")]);
        registry.stop("alpha").await.unwrap();
        assert_eq!(registry.statuses()[0].status, ServerStatus::Stopped);
    }

    #[test]
    fn proxy_unavailable_when_not_running() {
        let registry = ServerRegistry::new(vec![server("alpha")]);
        assert!(registry.proxy("alpha").is_err());
    }

    #[test]
    fn tools_listing_excludes_non_running_backends() {
        let registry = ServerRegistry::new(vec![server("alpha")]);
        registry.register_tools("alpha", vec![tool("a")]).unwrap();
        // alpha is stopped, so its tools are not advertised.
        assert!(registry.tools().is_empty());
    }
}
