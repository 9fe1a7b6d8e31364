//! Backend connector: spawns child tool-server processes and manages
//! their client-role MCP sessions.
//!
//! Each backend is one child process with an rmcp stdio transport. The
//! connector registers an instance for every backend it brings up,
//! discovers the child's pid asynchronously, probes the tool catalog
//! once at connect time, and transitions registry entries when a
//! transport closes. One backend's failure never aborts the others.

use std::{path::Path, sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::RwLock;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, ClientInfo, LoggingMessageNotificationParam, Tool},
    service::{NotificationContext, RunningService},
    transport::{ConfigureCommandExt, TokioChildProcess},
    ClientHandler, RoleClient, ServiceExt,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::BackendDefinition,
    error::{GatewayError, GatewayResult},
    registry::{
        CapabilitySummary, ConnectionType, ContextInfo, InstanceRegistry, InstanceStatus,
        LaunchSource, NewInstance,
    },
};

/// Binary name guarded against recursive self-invocation.
pub const GATEWAY_BIN: &str = "toolgate";

/// Interval between pid-discovery polls.
const PID_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Total pid-discovery attempts (bounds the poll to roughly ten seconds).
const PID_POLL_MAX_ATTEMPTS: u32 = 20;

/// Type alias for a connected backend client.
pub type BackendClient = RunningService<RoleClient, GatewayClientHandler>;

/// Request to re-probe a backend's tool catalog.
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub backend: String,
}

/// One connected backend: its client session, registry instance, and the
/// cached tool catalog from the last probe.
pub struct BackendHandle {
    pub backend: String,
    pub instance_id: String,
    client: Arc<BackendClient>,
    tools: RwLock<Vec<Tool>>,
}

impl BackendHandle {
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.read().clone()
    }
}

/// Spawns backends and owns their client sessions.
pub struct BackendConnector {
    registry: Arc<InstanceRegistry>,
    clients: DashMap<String, Arc<BackendHandle>>,
    refresh_tx: mpsc::Sender<RefreshRequest>,
    shutdown: CancellationToken,
}

impl BackendConnector {
    pub fn new(registry: Arc<InstanceRegistry>) -> Arc<Self> {
        let (refresh_tx, refresh_rx) = mpsc::channel(32);
        let connector = Arc::new(Self {
            registry,
            clients: DashMap::new(),
            refresh_tx,
            shutdown: CancellationToken::new(),
        });
        Arc::clone(&connector).spawn_refresh_handler(refresh_rx);
        connector
    }

    /// Connect one backend definition. Configuration problems (missing
    /// command, self-reference) and connection failures are returned as
    /// errors for the caller to log and skip; they must not abort other
    /// backends.
    pub async fn connect(
        &self,
        def: &BackendDefinition,
        active_filters: &[String],
    ) -> GatewayResult<String> {
        if def.command.trim().is_empty() {
            return Err(GatewayError::Config(format!(
                "backend '{}' has no command",
                def.name
            )));
        }
        if is_self_reference(&def.command, &def.args) {
            return Err(GatewayError::Config(format!(
                "backend '{}' would launch this gateway recursively",
                def.name
            )));
        }
        if self.clients.contains_key(&def.name) {
            debug!("Backend '{}' already connected, skipping", def.name);
            return Err(GatewayError::Config(format!(
                "backend '{}' already connected",
                def.name
            )));
        }

        // Register before the session is up: the transport does not
        // expose the process id synchronously, so the record starts with
        // pid unknown and a poll task fills it in.
        let instance_id = self.registry.register(NewInstance {
            pid: None,
            backend_name: def.name.clone(),
            launch_source: LaunchSource::Gateway,
            config_snapshot: serde_json::to_value(def)?,
            context: ContextInfo {
                kind: "backend".to_string(),
                filters: active_filters.to_vec(),
                command: def.command.clone(),
                args: def.args.clone(),
            },
            connection_type: ConnectionType::Stdio,
            capabilities: None,
        });

        let pid_slot: Arc<RwLock<Option<u32>>> = Arc::new(RwLock::new(None));
        spawn_pid_poll(
            Arc::clone(&self.registry),
            instance_id.clone(),
            Arc::clone(&pid_slot),
        );

        info!(backend = %def.name, command = %def.command, "Connecting to backend");

        let transport = match TokioChildProcess::new(
            tokio::process::Command::new(&def.command).configure(|cmd| {
                cmd.args(&def.args)
                    .envs(def.env.iter())
                    .stderr(std::process::Stdio::inherit());
            }),
        ) {
            Ok(t) => t,
            Err(e) => {
                self.registry.update_status(&instance_id, InstanceStatus::Error);
                return Err(GatewayError::Transport(format!(
                    "create stdio transport for '{}': {}",
                    def.name, e
                )));
            }
        };
        let child_pid = transport.id();

        let handler = GatewayClientHandler::new(&def.name).with_refresh_channel(self.refresh_tx.clone());
        let cancellation_token = CancellationToken::new();
        let client = match handler.serve_with_ct(transport, cancellation_token.clone()).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                self.registry.update_status(&instance_id, InstanceStatus::Error);
                return Err(GatewayError::ConnectionFailed(format!(
                    "initialize stdio client for '{}': {}",
                    def.name, e
                )));
            }
        };
        *pid_slot.write() = child_pid;

        // Transition the registry entry when the transport goes away.
        {
            let token = cancellation_token.clone();
            let registry = Arc::clone(&self.registry);
            let backend = def.name.clone();
            let gateway_shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                let status = if gateway_shutdown.is_cancelled() {
                    InstanceStatus::Stopped
                } else {
                    InstanceStatus::Error
                };
                registry.mark_backend_closed(&backend, child_pid, status);
            });
        }

        // One-time probe: catches dead-on-arrival backends and fills the
        // capability summary. Failure is logged but non-fatal.
        let tools = match client.peer().list_all_tools().await {
            Ok(tools) => {
                info!(
                    backend = %def.name,
                    count = tools.len(),
                    "Discovered tools from backend"
                );
                self.registry
                    .update_capabilities(&instance_id, capability_summary(&tools));
                tools
            }
            Err(e) => {
                warn!(backend = %def.name, "Initial tool-list probe failed: {}", e);
                Vec::new()
            }
        };

        self.clients.insert(
            def.name.clone(),
            Arc::new(BackendHandle {
                backend: def.name.clone(),
                instance_id: instance_id.clone(),
                client,
                tools: RwLock::new(tools),
            }),
        );

        info!(backend = %def.name, pid = ?child_pid, "Backend connected");
        Ok(instance_id)
    }

    /// Names of currently connected backends.
    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn handle(&self, backend: &str) -> Option<Arc<BackendHandle>> {
        self.clients.get(backend).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of every connected backend's cached tool catalog.
    pub fn catalogs(&self) -> Vec<(String, Vec<Tool>)> {
        let mut catalogs: Vec<(String, Vec<Tool>)> = self
            .clients
            .iter()
            .map(|e| (e.key().clone(), e.value().tools()))
            .collect();
        catalogs.sort_by(|a, b| a.0.cmp(&b.0));
        catalogs
    }

    /// Forward a tool call to a connected backend.
    pub async fn call(
        &self,
        backend: &str,
        tool_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> GatewayResult<CallToolResult> {
        let handle = self
            .handle(backend)
            .ok_or_else(|| GatewayError::BackendNotFound(backend.to_string()))?;

        let request = CallToolRequestParam {
            name: std::borrow::Cow::Owned(tool_name.to_string()),
            arguments,
        };

        handle
            .client
            .call_tool(request)
            .await
            .map_err(|e| GatewayError::ToolExecution(format!("Failed to call tool: {}", e)))
    }

    /// Close every backend session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let backends: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for backend in backends {
            if let Some((_, handle)) = self.clients.remove(&backend) {
                match Arc::try_unwrap(handle) {
                    Ok(handle) => match Arc::try_unwrap(handle.client) {
                        Ok(client) => {
                            if let Err(e) = client.cancel().await {
                                warn!(backend = %backend, "Error closing backend session: {}", e);
                            }
                        }
                        Err(_) => {
                            warn!(backend = %backend, "Backend client still in use at shutdown");
                        }
                    },
                    Err(_) => {
                        warn!(backend = %backend, "Backend handle still in use at shutdown");
                    }
                }
            }
        }
    }

    fn spawn_refresh_handler(self: Arc<Self>, mut rx: mpsc::Receiver<RefreshRequest>) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Catalog refresh handler shutting down");
                        break;
                    }
                    Some(request) = rx.recv() => {
                        self.refresh_catalog(&request.backend).await;
                    }
                }
            }
        });
    }

    async fn refresh_catalog(&self, backend: &str) {
        let Some(handle) = self.handle(backend) else {
            return;
        };
        match handle.client.peer().list_all_tools().await {
            Ok(tools) => {
                info!(backend = %backend, count = tools.len(), "Refreshed tool catalog");
                self.registry
                    .update_capabilities(&handle.instance_id, capability_summary(&tools));
                *handle.tools.write() = tools;
            }
            Err(e) => {
                warn!(backend = %backend, "Failed to refresh tool catalog: {}", e);
            }
        }
    }
}

/// Poll the shared pid slot until the transport's pid becomes known,
/// then record it. Gives up after the bound regardless of outcome.
fn spawn_pid_poll(
    registry: Arc<InstanceRegistry>,
    instance_id: String,
    slot: Arc<RwLock<Option<u32>>>,
) {
    tokio::spawn(async move {
        for _ in 0..PID_POLL_MAX_ATTEMPTS {
            if let Some(pid) = *slot.read() {
                registry.update_pid(&instance_id, pid);
                debug!(instance = %instance_id, pid = pid, "Discovered backend pid");
                return;
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
        debug!(instance = %instance_id, "Pid discovery gave up after bound");
    });
}

/// Guard against a backend definition that would launch this same
/// gateway and recurse forever.
pub fn is_self_reference(command: &str, args: &[String]) -> bool {
    let basename = |s: &str| -> String {
        Path::new(s)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(s)
            .to_string()
    };

    if basename(command) == GATEWAY_BIN {
        return true;
    }
    // Runner-style invocations, e.g. `npx toolgate`.
    args.iter().any(|a| basename(a) == GATEWAY_BIN)
}

fn capability_summary(tools: &[Tool]) -> CapabilitySummary {
    CapabilitySummary {
        tool_count: tools.len(),
        tool_names: tools.iter().map(|t| t.name.to_string()).collect(),
    }
}

/// Client-role handler for backend sessions.
///
/// Logs backend notifications and requests a catalog refresh when a
/// backend announces its tool list changed.
#[derive(Clone)]
pub struct GatewayClientHandler {
    backend: Arc<str>,
    client_info: ClientInfo,
    refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
}

impl GatewayClientHandler {
    pub fn new(backend: impl AsRef<str>) -> Self {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = GATEWAY_BIN.to_string();
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();

        Self {
            backend: Arc::from(backend.as_ref()),
            client_info,
            refresh_tx: None,
        }
    }

    #[must_use]
    pub fn with_refresh_channel(mut self, tx: mpsc::Sender<RefreshRequest>) -> Self {
        self.refresh_tx = Some(tx);
        self
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    fn send_refresh(&self) {
        if let Some(tx) = &self.refresh_tx {
            if let Err(e) = tx.try_send(RefreshRequest {
                backend: self.backend.to_string(),
            }) {
                warn!(backend = %self.backend, "Failed to queue catalog refresh: {}", e);
            }
        }
    }
}

impl ClientHandler for GatewayClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.client_info.clone()
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(backend = %self.backend, "Backend tool list changed");
        self.send_refresh();
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        use rmcp::model::LoggingLevel;

        let logger = params.logger.as_deref().unwrap_or("backend");
        match params.level {
            LoggingLevel::Emergency
            | LoggingLevel::Alert
            | LoggingLevel::Critical
            | LoggingLevel::Error => {
                error!(backend = %self.backend, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Warning => {
                warn!(backend = %self.backend, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Notice | LoggingLevel::Info => {
                info!(backend = %self.backend, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Debug => {
                debug!(backend = %self.backend, logger = %logger, "{}", params.data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> (Arc<InstanceRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InstanceRegistry::open(dir.path().join("instances")).unwrap());
        (registry, dir)
    }

    fn def(name: &str, command: &str, args: &[&str]) -> BackendDefinition {
        BackendDefinition {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_self_reference_guard() {
        assert!(is_self_reference("toolgate", &[]));
        assert!(is_self_reference("/usr/local/bin/toolgate", &[]));
        assert!(is_self_reference(
            "npx",
            &["toolgate".to_string(), "--server".to_string()]
        ));
        assert!(!is_self_reference("search-server", &[]));
        assert!(!is_self_reference("npx", &["some-mcp-server".to_string()]));
        assert!(!is_self_reference("toolgate-helper", &[]));
    }

    #[test]
    fn test_capability_summary() {
        let summary = capability_summary(&[]);
        assert_eq!(summary.tool_count, 0);
        assert!(summary.tool_names.is_empty());
    }

    #[test]
    fn test_handler_client_info() {
        let handler = GatewayClientHandler::new("search");
        assert_eq!(handler.backend(), "search");
        assert_eq!(handler.get_info().client_info.name, GATEWAY_BIN);
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_command() {
        let (registry, _dir) = test_registry();
        let connector = BackendConnector::new(Arc::clone(&registry));

        let result = connector.connect(&def("empty", "", &[]), &[]).await;
        assert!(matches!(result, Err(GatewayError::Config(_))));
        // No instance should linger for a definition that never spawned.
        assert!(registry.get_by_backend("empty").is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_self_reference() {
        let (registry, _dir) = test_registry();
        let connector = BackendConnector::new(Arc::clone(&registry));

        let result = connector.connect(&def("loop", "toolgate", &[]), &[]).await;
        assert!(matches!(result, Err(GatewayError::Config(_))));
        assert!(registry.get_by_backend("loop").is_empty());
    }

    #[tokio::test]
    async fn test_connect_spawn_failure_marks_instance_error() {
        let (registry, _dir) = test_registry();
        let connector = BackendConnector::new(Arc::clone(&registry));

        let result = connector
            .connect(&def("ghost", "/nonexistent/mcp-server", &[]), &[])
            .await;
        assert!(result.is_err());

        let instances = registry.get_by_backend("ghost");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, InstanceStatus::Error);
        assert!(instances[0].pid.is_none());
    }

    #[tokio::test]
    async fn test_pid_poll_records_discovered_pid() {
        let (registry, _dir) = test_registry();
        let id = registry.register(NewInstance {
            pid: None,
            backend_name: "search".to_string(),
            launch_source: LaunchSource::Gateway,
            config_snapshot: serde_json::Value::Null,
            context: ContextInfo::default(),
            connection_type: ConnectionType::Stdio,
            capabilities: None,
        });

        let slot = Arc::new(RwLock::new(Some(4242)));
        spawn_pid_poll(Arc::clone(&registry), id.clone(), slot);

        // The poll checks the slot before its first sleep.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get(&id).unwrap().pid, Some(4242));
    }

    #[tokio::test]
    async fn test_call_unknown_backend() {
        let (registry, _dir) = test_registry();
        let connector = BackendConnector::new(registry);

        let result = connector.call("nope", "run", None).await;
        assert!(matches!(result, Err(GatewayError::BackendNotFound(_))));
    }
}
