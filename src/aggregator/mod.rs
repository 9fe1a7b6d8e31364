//! Tool aggregation and call routing.
//!
//! Merges the gateway's built-in tools with every connected backend's
//! catalog under a collision-free namespace, and dispatches calls to the
//! owning backend. A backend fault is always translated into a
//! structured error result; it never escapes as a protocol-level crash.

pub mod builtins;
pub mod usage;

use std::{
    borrow::Cow,
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rmcp::model::{CallToolResult, Content, Tool};
use tracing::{debug, warn};

pub use self::builtins::{BuiltinTools, GATEWAY_NAMESPACE};
pub use self::usage::{UsageMetric, UsageTracker};
use crate::connector::BackendConnector;

/// Separator between a backend id and the original tool name.
pub const NAMESPACE_SEPARATOR: char = '_';

/// Build the namespaced form of a backend tool name.
pub fn namespaced(backend: &str, tool: &str) -> String {
    format!("{}{}{}", backend, NAMESPACE_SEPARATOR, tool)
}

/// Resolve a namespaced name against the set of known backend ids.
///
/// Backend ids may themselves contain the separator, so the longest id
/// that prefixes the name wins: with backends `py` and `py_helper`,
/// `py_helper_run` resolves to `("py_helper", "run")`, not
/// `("py", "helper_run")`. For ids without an embedded separator this
/// agrees with a split on the first separator.
pub fn resolve_namespaced(name: &str, backend_ids: &[String]) -> Option<(String, String)> {
    backend_ids
        .iter()
        .filter_map(|id| {
            name.strip_prefix(id.as_str())
                .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
                .filter(|original| !original.is_empty())
                .map(|original| (id.clone(), original.to_string()))
        })
        .max_by_key(|(id, _)| id.len())
}

/// Merge built-in and backend catalogs into the upstream tool list.
///
/// Backend tools are renamed into the namespace and their descriptions
/// annotated with the source backend. The tool filter applies to
/// original (un-namespaced) names.
fn merge_catalogs(
    builtin_tools: Vec<Tool>,
    catalogs: Vec<(String, Vec<Tool>)>,
    tool_filter: Option<&HashSet<String>>,
) -> Vec<Tool> {
    let retain =
        |original: &str| tool_filter.map_or(true, |filter| filter.contains(original));

    let mut tools = Vec::new();
    for tool in builtin_tools {
        if retain(&tool.name) {
            tools.push(namespace_tool(GATEWAY_NAMESPACE, tool, false));
        }
    }
    for (backend, catalog) in catalogs {
        for tool in catalog {
            if retain(&tool.name) {
                tools.push(namespace_tool(&backend, tool, true));
            }
        }
    }
    tools
}

fn namespace_tool(backend: &str, mut tool: Tool, annotate: bool) -> Tool {
    let original = tool.name.to_string();
    tool.name = Cow::Owned(namespaced(backend, &original));
    if annotate {
        tool.description = Some(Cow::Owned(match tool.description.take() {
            Some(desc) => format!("[{}] {}", backend, desc),
            None => format!("[{}] {}", backend, original),
        }));
    }
    tool
}

fn method_not_found(name: &str) -> CallToolResult {
    CallToolResult::error(vec![Content::text(format!(
        "Method not found: no connected backend provides tool '{}'",
        name
    ))])
}

/// Aggregates tool catalogs and routes calls.
pub struct ToolAggregator {
    connector: Arc<BackendConnector>,
    builtins: BuiltinTools,
    usage: Arc<UsageTracker>,
    tool_filter: Option<HashSet<String>>,
    active_calls: Arc<AtomicUsize>,
}

impl ToolAggregator {
    pub fn new(
        connector: Arc<BackendConnector>,
        builtins: BuiltinTools,
        usage: Arc<UsageTracker>,
        tool_filter: Option<HashSet<String>>,
    ) -> Self {
        Self {
            connector,
            builtins,
            usage,
            tool_filter,
            active_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The merged, namespaced, filtered tool list.
    pub fn list_tools(&self) -> Vec<Tool> {
        merge_catalogs(
            self.builtins.tools(),
            self.connector.catalogs(),
            self.tool_filter.as_ref(),
        )
    }

    /// Route one tool call. Always returns a well-formed result: backend
    /// faults and unknown names come back as structured errors.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> CallToolResult {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = scopeguard::guard(Arc::clone(&self.active_calls), |count| {
            count.fetch_sub(1, Ordering::SeqCst);
        });

        // Reserved namespace first: built-ins cannot be shadowed.
        if let Some(original) = name
            .strip_prefix(GATEWAY_NAMESPACE)
            .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
        {
            if let Some(result) = self.builtins.call(original) {
                self.usage.record(name);
                return result;
            }
        }

        let backend_ids = self.connector.backend_ids();
        let Some((backend, original)) = resolve_namespaced(name, &backend_ids) else {
            debug!(tool = %name, "No backend resolves namespaced tool name");
            return method_not_found(name);
        };

        self.usage.record(name);

        match self.connector.call(&backend, &original, arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!(backend = %backend, tool = %original, "Tool call failed: {}", e);
                CallToolResult::error(vec![Content::text(format!(
                    "Tool call failed on backend '{}': {}",
                    backend, e
                ))])
            }
        }
    }

    /// Number of calls currently in flight. Shutdown drains against it.
    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }
}
