//! Per-tool usage metrics.
//!
//! Every tool call is recorded against its namespaced name: a running
//! count, a last-used timestamp, and a bounded event history. One JSON
//! file per tool; disk failures are logged and never fail the call.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GatewayResult;

/// Maximum retained usage events per tool.
pub const USAGE_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMetric {
    pub tool_name: String,
    pub count: u64,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub history: VecDeque<UsageEvent>,
}

/// Tracks and persists tool usage, one JSON file per tool.
pub struct UsageTracker {
    dir: PathBuf,
    metrics: Mutex<HashMap<String, UsageMetric>>,
}

impl UsageTracker {
    /// Open a tracker over the given directory, loading existing metric
    /// files. Corrupt files are skipped per-file.
    pub fn open(dir: impl Into<PathBuf>) -> GatewayResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut metrics = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(crate::error::GatewayError::from)
                .and_then(|c| Ok(serde_json::from_str::<UsageMetric>(&c)?))
            {
                Ok(metric) => {
                    metrics.insert(metric.tool_name.clone(), metric);
                }
                Err(e) => warn!("Skipping corrupt usage record {}: {}", path.display(), e),
            }
        }

        Ok(Self {
            dir,
            metrics: Mutex::new(metrics),
        })
    }

    /// Record one invocation of a tool.
    pub fn record(&self, tool_name: &str) {
        let now = Utc::now();
        let mut metrics = self.metrics.lock();
        let metric = metrics
            .entry(tool_name.to_string())
            .or_insert_with(|| UsageMetric {
                tool_name: tool_name.to_string(),
                count: 0,
                last_used: now,
                history: VecDeque::new(),
            });

        metric.count += 1;
        metric.last_used = now;
        metric.history.push_back(UsageEvent { at: now });
        while metric.history.len() > USAGE_HISTORY_LIMIT {
            metric.history.pop_front();
        }

        let snapshot = metric.clone();
        drop(metrics);
        self.persist(&snapshot);
    }

    pub fn get(&self, tool_name: &str) -> Option<UsageMetric> {
        self.metrics.lock().get(tool_name).cloned()
    }

    pub fn all(&self) -> Vec<UsageMetric> {
        let mut all: Vec<_> = self.metrics.lock().values().cloned().collect();
        all.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        all
    }

    fn persist(&self, metric: &UsageMetric) {
        let path = self.path_for(&metric.tool_name);
        let result = serde_json::to_string_pretty(metric)
            .map_err(crate::error::GatewayError::from)
            .and_then(|content| Ok(std::fs::write(&path, content)?));
        if let Err(e) = result {
            warn!(
                tool = %metric.tool_name,
                "Failed to persist usage metric: {}",
                e
            );
        }
    }

    fn path_for(&self, tool_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(tool_name)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Keep file names portable: anything outside [A-Za-z0-9._-] becomes '_'.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
