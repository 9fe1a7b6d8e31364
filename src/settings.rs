//! Time-bounded cache over config store reads.
//!
//! The gateway consults settings on hot paths (tool filtering, approval
//! checks), so reads go through a small TTL cache instead of hitting the
//! disk every time. Derived views (allowed/approved/favorite tools) are
//! computed from the cached snapshot.

use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    config::{BackendDefinition, ConfigStore, GatewayConfig, WILDCARD},
    error::GatewayResult,
};

/// Default settings cache TTL.
pub const DEFAULT_SETTINGS_TTL: Duration = Duration::from_secs(5);

/// Scope of tools selected by an allow/approve query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolScope {
    /// A wildcard entry short-circuited the query: every tool matches.
    All,
    /// Only the named tools match.
    Named(HashSet<String>),
}

impl ToolScope {
    pub fn contains(&self, tool: &str) -> bool {
        match self {
            ToolScope::All => true,
            ToolScope::Named(names) => names.contains(tool),
        }
    }
}

/// Per-tool settings resolved against backend definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    pub backend: String,
    pub allowed: bool,
    pub approved: bool,
}

struct CachedConfig {
    config: GatewayConfig,
    fetched_at: Instant,
}

/// TTL'd settings cache over a [`ConfigStore`].
///
/// The check-then-refresh sequence holds one lock so concurrent callers
/// cannot interleave a stale check with a fresh write.
pub struct SettingsCache {
    store: ConfigStore,
    ttl: Duration,
    cached: Mutex<Option<CachedConfig>>,
}

impl SettingsCache {
    pub fn new(store: ConfigStore) -> Self {
        Self::with_ttl(store, DEFAULT_SETTINGS_TTL)
    }

    pub fn with_ttl(store: ConfigStore, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Return the cached config if it is younger than the TTL, otherwise
    /// re-read and re-cache.
    pub fn settings(&self) -> GatewayResult<GatewayConfig> {
        let mut cached = self.cached.lock();
        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.config.clone());
            }
        }

        let config = self.store.read()?;
        *cached = Some(CachedConfig {
            config: config.clone(),
            fetched_at: Instant::now(),
        });
        Ok(config)
    }

    /// Write through to the store and reset the cache timestamp.
    pub fn save(&self, config: &GatewayConfig) -> GatewayResult<()> {
        let mut cached = self.cached.lock();
        self.store.write(config)?;
        *cached = Some(CachedConfig {
            config: config.clone(),
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    pub fn servers(&self) -> GatewayResult<Vec<BackendDefinition>> {
        Ok(self.settings()?.backends)
    }

    /// Tools allowed across all enabled backends. A wildcard in any
    /// enabled backend's allow-list opens the gateway to all tools.
    pub fn allowed_tools(&self) -> GatewayResult<ToolScope> {
        Ok(Self::collect_scope(&self.settings()?, |b| &b.allow))
    }

    /// Tools pre-approved across all enabled backends.
    pub fn approved_tools(&self) -> GatewayResult<ToolScope> {
        Ok(Self::collect_scope(&self.settings()?, |b| &b.approve))
    }

    /// Union of explicitly allow-listed tool names across enabled
    /// backends, wildcards excluded. Sorted and deduplicated.
    pub fn favorite_tools(&self) -> GatewayResult<Vec<String>> {
        let config = self.settings()?;
        let mut names: Vec<String> = config
            .backends
            .iter()
            .filter(|b| b.enabled)
            .flat_map(|b| b.allow.iter())
            .filter(|entry| entry.as_str() != WILDCARD)
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Resolve settings for one tool by scanning backends in definition
    /// order. First match wins.
    pub fn tool_settings(&self, tool: &str) -> GatewayResult<Option<ToolSettings>> {
        let config = self.settings()?;
        for backend in config.backends.iter().filter(|b| b.enabled) {
            let allowed = backend
                .allow
                .iter()
                .any(|entry| entry == WILDCARD || entry == tool);
            let approved = backend
                .approve
                .iter()
                .any(|entry| entry == WILDCARD || entry == tool);
            if allowed || approved {
                return Ok(Some(ToolSettings {
                    backend: backend.name.clone(),
                    allowed,
                    approved,
                }));
            }
        }
        Ok(None)
    }

    fn collect_scope<F>(config: &GatewayConfig, list: F) -> ToolScope
    where
        F: Fn(&BackendDefinition) -> &Vec<String>,
    {
        let mut names = HashSet::new();
        for backend in config.backends.iter().filter(|b| b.enabled) {
            for entry in list(backend) {
                if entry == WILDCARD {
                    return ToolScope::All;
                }
                names.insert(entry.clone());
            }
        }
        ToolScope::Named(names)
    }
}
