//! Built-in gateway tools.
//!
//! Exposed under the reserved `gateway` namespace alongside aggregated
//! backend tools: a status snapshot of tracked instances and the usage
//! metrics view.

use std::{borrow::Cow, sync::Arc};

use rmcp::model::{CallToolResult, Content, Tool};
use serde_json::json;

use super::usage::UsageTracker;
use crate::registry::InstanceRegistry;

/// Reserved namespace for the gateway's own tools. Backend definitions
/// must not claim it.
pub const GATEWAY_NAMESPACE: &str = "gateway";

pub struct BuiltinTools {
    registry: Arc<InstanceRegistry>,
    usage: Arc<UsageTracker>,
}

impl BuiltinTools {
    pub fn new(registry: Arc<InstanceRegistry>, usage: Arc<UsageTracker>) -> Self {
        Self { registry, usage }
    }

    /// Built-in tool descriptors, under their original (un-namespaced)
    /// names.
    pub fn tools(&self) -> Vec<Tool> {
        vec![
            tool(
                "status",
                "Show tracked gateway and backend instances with their health status",
            ),
            tool("usage", "Show per-tool usage metrics recorded by the gateway"),
        ]
    }

    /// Dispatch a built-in by original name. Returns `None` for names
    /// that are not built-ins.
    pub fn call(&self, name: &str) -> Option<CallToolResult> {
        match name {
            "status" => Some(self.status()),
            "usage" => Some(self.usage_metrics()),
            _ => None,
        }
    }

    fn status(&self) -> CallToolResult {
        let mut instances = self.registry.get_all();
        instances.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        let entries: Vec<_> = instances
            .iter()
            .map(|i| {
                json!({
                    "id": i.id,
                    "backend": i.backend_name,
                    "status": i.status,
                    "pid": i.pid,
                    "launch_source": i.launch_source,
                    "started_at": i.started_at,
                    "last_health_check": i.last_health_check,
                    "resource_usage": i.resource_usage,
                    "tool_count": i.capabilities.as_ref().map(|c| c.tool_count),
                })
            })
            .collect();

        let body = json!({
            "instance_count": entries.len(),
            "instances": entries,
        });
        text_result(&body)
    }

    fn usage_metrics(&self) -> CallToolResult {
        let metrics = self.usage.all();
        let entries: Vec<_> = metrics
            .iter()
            .map(|m| {
                json!({
                    "tool": m.tool_name,
                    "count": m.count,
                    "last_used": m.last_used,
                })
            })
            .collect();
        text_result(&json!({ "tools": entries }))
    }
}

fn tool(name: &'static str, description: &'static str) -> Tool {
    let schema = match json!({
        "type": "object",
        "properties": {}
    }) {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    Tool {
        name: Cow::Borrowed(name),
        title: None,
        description: Some(Cow::Borrowed(description)),
        input_schema: Arc::new(schema),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

fn text_result(body: &serde_json::Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());
    CallToolResult::success(vec![Content::text(text)])
}
