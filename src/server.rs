//! Gateway server: top-level orchestration.
//!
//! Resolves filters, brings up backends through the connector, registers
//! a self-instance, exposes the upstream MCP endpoint on stdio, and owns
//! the sequenced graceful shutdown.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListPromptsResult,
        ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    ErrorData, ServerHandler, ServiceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    aggregator::{BuiltinTools, ToolAggregator, UsageTracker},
    config::{ConfigStore, GroupExpander},
    connector::{BackendConnector, GATEWAY_BIN},
    error::GatewayResult,
    registry::{
        sweep::DEFAULT_SWEEP_INTERVAL, ConnectionType, ContextInfo, InstanceRegistry,
        InstanceStatus, LaunchSource, NewInstance,
    },
    settings::SettingsCache,
};

/// How long `stop` waits for in-flight tool calls to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Start-time options, owned by the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct GatewayOptions {
    /// Gateway home directory. Defaults to `~/.toolgate`.
    pub home: Option<PathBuf>,

    /// Backend name filters; each value may be a comma-separated list.
    pub servers: Vec<String>,

    /// Tool name filters (original, un-namespaced names).
    pub tools: Vec<String>,

    /// Group name filters, expanded to backend names at startup.
    pub groups: Vec<String>,

    pub sweep_interval: Option<Duration>,
}

/// On-disk layout under the gateway home directory.
#[derive(Debug, Clone)]
pub struct GatewayPaths {
    pub home: PathBuf,
    pub config_file: PathBuf,
    pub instances_dir: PathBuf,
    pub usage_dir: PathBuf,
}

impl GatewayPaths {
    pub fn resolve(home: Option<PathBuf>) -> Self {
        let home = home.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".toolgate")
        });
        Self {
            config_file: home.join("config.json"),
            instances_dir: home.join("instances"),
            usage_dir: home.join("usage"),
            home,
        }
    }

    pub fn ensure(&self) -> GatewayResult<()> {
        std::fs::create_dir_all(&self.home)?;
        std::fs::create_dir_all(&self.instances_dir)?;
        std::fs::create_dir_all(&self.usage_dir)?;
        Ok(())
    }
}

/// Parsed and group-expanded filter sets.
///
/// `None` means the dimension is unfiltered. An empty set (e.g. a group
/// filter that expanded to nothing) matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pub servers: Option<HashSet<String>>,
    pub tools: Option<HashSet<String>>,
}

impl FilterSet {
    /// Build the effective filter sets: parse single values and
    /// comma-separated lists, expand groups through the injected
    /// expander, and union group members into the server set.
    pub fn resolve(options: &GatewayOptions, expander: &dyn GroupExpander) -> Self {
        let mut servers = parse_filter_values(&options.servers);
        let groups = parse_filter_values(&options.groups);
        let tools = parse_filter_values(&options.tools);

        let server_filtered = !servers.is_empty() || !groups.is_empty();
        for group in &groups {
            for member in expander.expand(group) {
                servers.insert(member);
            }
        }

        Self {
            servers: server_filtered.then_some(servers),
            tools: (!tools.is_empty()).then_some(tools),
        }
    }

    pub fn matches_backend(&self, name: &str) -> bool {
        self.servers.as_ref().map_or(true, |s| s.contains(name))
    }

    /// Human-readable filter tokens for instance display metadata.
    pub fn describe(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        if let Some(servers) = &self.servers {
            let mut names: Vec<_> = servers.iter().cloned().collect();
            names.sort();
            tokens.extend(names.into_iter().map(|n| format!("server:{}", n)));
        }
        if let Some(tools) = &self.tools {
            let mut names: Vec<_> = tools.iter().cloned().collect();
            names.sort();
            tokens.extend(names.into_iter().map(|n| format!("tool:{}", n)));
        }
        tokens
    }
}

fn parse_filter_values(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The running gateway.
pub struct GatewayServer {
    registry: Arc<InstanceRegistry>,
    connector: Arc<BackendConnector>,
    aggregator: Arc<ToolAggregator>,
    settings: Arc<SettingsCache>,
    self_instance_id: String,
}

impl GatewayServer {
    /// Bring the gateway up: directories, stale cleanup, filters,
    /// self-instance, backends, sweeper. Does not open the upstream
    /// endpoint; [`GatewayServer::serve`] does.
    pub async fn start(options: GatewayOptions) -> GatewayResult<Self> {
        let paths = GatewayPaths::resolve(options.home.clone());
        paths.ensure()?;

        let registry = Arc::new(InstanceRegistry::open(&paths.instances_dir)?);
        let removed = registry.cleanup_stale();
        if removed > 0 {
            info!("Startup cleanup removed {} stale instance(s)", removed);
        }

        let store = ConfigStore::new(&paths.config_file);
        let settings = Arc::new(SettingsCache::new(store.clone()));
        let filters = FilterSet::resolve(&options, &store);
        let filter_tokens = filters.describe();

        let usage = Arc::new(UsageTracker::open(&paths.usage_dir)?);
        let connector = BackendConnector::new(Arc::clone(&registry));

        let self_instance_id = registry.register(NewInstance {
            pid: Some(std::process::id()),
            backend_name: GATEWAY_BIN.to_string(),
            launch_source: LaunchSource::Itself,
            config_snapshot: serde_json::Value::Null,
            context: ContextInfo {
                kind: "gateway".to_string(),
                filters: filter_tokens.clone(),
                command: std::env::args().next().unwrap_or_default(),
                args: std::env::args().skip(1).collect(),
            },
            connection_type: ConnectionType::InProcess,
            capabilities: None,
        });

        for def in settings.servers()? {
            if !def.enabled {
                info!(backend = %def.name, "Backend disabled, skipping");
                continue;
            }
            if !filters.matches_backend(&def.name) {
                info!(backend = %def.name, "Backend filtered out, skipping");
                continue;
            }
            // One backend's failure never aborts the others.
            if let Err(e) = connector.connect(&def, &filter_tokens).await {
                warn!(backend = %def.name, "Skipping backend: {}", e);
            }
        }

        let builtins = BuiltinTools::new(Arc::clone(&registry), Arc::clone(&usage));
        let aggregator = Arc::new(ToolAggregator::new(
            Arc::clone(&connector),
            builtins,
            usage,
            filters.tools.clone(),
        ));

        registry.start_sweeper(options.sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL));

        info!(
            backends = connector.backend_ids().len(),
            "Gateway started"
        );

        Ok(Self {
            registry,
            connector,
            aggregator,
            settings,
            self_instance_id,
        })
    }

    pub fn aggregator(&self) -> Arc<ToolAggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn registry(&self) -> Arc<InstanceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn settings(&self) -> Arc<SettingsCache> {
        Arc::clone(&self.settings)
    }

    /// Open the upstream stdio endpoint and run until the session closes
    /// or a termination signal arrives. Returns the process exit code.
    pub async fn serve(self) -> i32 {
        let handler = GatewayService::new(Arc::clone(&self.aggregator));
        let upstream = CancellationToken::new();
        let service = match handler.serve_with_ct(rmcp::transport::stdio(), upstream.clone()).await {
            Ok(service) => service,
            Err(e) => {
                error!("Failed to open upstream stdio session: {}", e);
                let _ = self.stop(None).await;
                return 1;
            }
        };

        info!("Gateway serving MCP on stdio");
        let mut waiting = tokio::spawn(service.waiting());

        tokio::select! {
            _ = &mut waiting => {
                info!("Upstream session closed");
                self.stop(None).await
            }
            _ = shutdown_signal() => {
                info!("Termination signal received");
                let code = self.stop(Some(upstream)).await;
                let _ = waiting.await;
                code
            }
        }
    }

    /// Sequenced shutdown: drain in-flight calls, mark the self-instance
    /// stopped, kill every still-running instance this gateway launched,
    /// close backend sessions, close the upstream session, stop the
    /// sweeper. Returns the exit code.
    pub async fn stop(&self, upstream: Option<CancellationToken>) -> i32 {
        info!("Stopping gateway");

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.aggregator.active_calls() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.aggregator.active_calls() > 0 {
            warn!(
                "Proceeding with shutdown; {} call(s) still in flight",
                self.aggregator.active_calls()
            );
        }

        let mut clean = self
            .registry
            .update_status(&self.self_instance_id, InstanceStatus::Stopped);

        for instance in self.registry.get_all() {
            if instance.launch_source == LaunchSource::Gateway && instance.is_running() {
                clean &= self.registry.kill(&instance.id);
            }
        }

        self.connector.shutdown().await;

        if let Some(token) = upstream {
            token.cancel();
        }

        self.registry.stop_sweeper();

        if clean {
            info!("Gateway stopped");
            0
        } else {
            warn!("Gateway stopped with shutdown failures");
            1
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// The MCP ServerHandler exposed upstream.
///
/// Implements no tools itself; list and call both delegate to the
/// aggregator. Resource- and prompt-listing are capability placeholders
/// that return empty collections.
#[derive(Clone)]
pub struct GatewayService {
    aggregator: Arc<ToolAggregator>,
}

impl GatewayService {
    pub fn new(aggregator: Arc<ToolAggregator>) -> Self {
        Self { aggregator }
    }
}

impl ServerHandler for GatewayService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "toolgate aggregates tools from multiple MCP backends behind one endpoint. \
                 Tool names are prefixed with their backend id."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: self.aggregator.list_tools(),
            next_cursor: None,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        // Faults are structured error results, never protocol errors.
        Ok(self.aggregator.call_tool(&request.name, request.arguments).await)
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        Ok(ListResourcesResult {
            resources: Vec::new(),
            next_cursor: None,
            ..Default::default()
        })
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, ErrorData> {
        Ok(ListResourceTemplatesResult {
            resource_templates: Vec::new(),
            next_cursor: None,
            ..Default::default()
        })
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, ErrorData> {
        Ok(ListPromptsResult {
            prompts: Vec::new(),
            next_cursor: None,
            ..Default::default()
        })
    }
}
