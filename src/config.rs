//! Gateway configuration types and the on-disk config store.
//!
//! Defines backend definitions, named backend groups, and the JSON-backed
//! store the gateway reads them from.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};

/// Definition of a single tool-serving backend.
///
/// A backend is a child process the gateway spawns and speaks MCP to over
/// stdio. Definitions are an immutable snapshot for the duration of a
/// gateway run.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendDefinition {
    pub name: String,

    /// Launch command. An empty command makes the definition unlaunchable
    /// and the connector skips it.
    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Disabled backends are ignored by the connector and by settings
    /// derivations.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tool allow-list. The wildcard entry `*` allows every tool.
    #[serde(default)]
    pub allow: Vec<String>,

    /// Tools pre-approved for execution without interactive confirmation.
    #[serde(default)]
    pub approve: Vec<String>,
}

impl Default for BackendDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: default_true(),
            allow: Vec::new(),
            approve: Vec::new(),
        }
    }
}

/// Wildcard entry usable in allow/approve lists.
pub const WILDCARD: &str = "*";

/// The full config store document.
///
/// Backends are kept in definition order; first-match-wins scans over
/// them depend on it.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub backends: Vec<BackendDefinition>,

    /// Named groups ("toolboxes"): group name to backend names.
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
}

impl GatewayConfig {
    pub fn backend(&self, name: &str) -> Option<&BackendDefinition> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Expand a group name to its member backend names. Unknown groups
    /// expand to nothing.
    pub fn expand_group(&self, name: &str) -> Vec<String> {
        self.groups.get(name).cloned().unwrap_or_default()
    }
}

/// Resolves a group name to the backend names it contains.
///
/// Injected into filter resolution at construction time so group lookups
/// are not re-resolved per call site.
pub trait GroupExpander: Send + Sync {
    fn expand(&self, name: &str) -> Vec<String>;
}

/// JSON-file-backed config store.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the config document. A missing file yields the default empty
    /// config; a malformed file is an error.
    pub fn read(&self) -> GatewayResult<GatewayConfig> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GatewayConfig::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("{}: {}", self.path.display(), e)))
    }

    /// Write the config document, creating parent directories as needed.
    pub fn write(&self, config: &GatewayConfig) -> GatewayResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn backend(&self, name: &str) -> GatewayResult<Option<BackendDefinition>> {
        Ok(self.read()?.backend(name).cloned())
    }
}

impl GroupExpander for ConfigStore {
    fn expand(&self, name: &str) -> Vec<String> {
        match self.read() {
            Ok(config) => config.expand_group(name),
            Err(e) => {
                warn!("Failed to read config for group expansion: {}", e);
                Vec::new()
            }
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str) -> BackendDefinition {
        BackendDefinition {
            name: name.to_string(),
            command: "mcp-server".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_backend_json() {
        let json = r#"{"name": "search", "command": "search-server"}"#;
        let def: BackendDefinition = serde_json::from_str(json).expect("Failed to parse");

        assert_eq!(def.name, "search");
        assert_eq!(def.command, "search-server");
        assert!(def.enabled); // defaults to true
        assert!(def.args.is_empty());
        assert!(def.allow.is_empty());
    }

    #[test]
    fn test_full_config_json() {
        let json = r#"
{
  "backends": [
    {
      "name": "search",
      "command": "npx",
      "args": ["-y", "@example/search-server"],
      "env": {"API_KEY": "secret"},
      "allow": ["*"],
      "approve": ["web_search"]
    },
    {
      "name": "files",
      "command": "file-server",
      "enabled": false
    }
  ],
  "groups": {
    "research": ["search", "files"]
  }
}
"#;
        let config: GatewayConfig = serde_json::from_str(json).expect("Failed to parse");

        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].args.len(), 2);
        assert_eq!(config.backends[0].env.get("API_KEY").unwrap(), "secret");
        assert_eq!(config.backends[0].allow, vec!["*".to_string()]);
        assert!(!config.backends[1].enabled);
        assert_eq!(
            config.expand_group("research"),
            vec!["search".to_string(), "files".to_string()]
        );
    }

    #[test]
    fn test_backend_lookup() {
        let config = GatewayConfig {
            backends: vec![backend("alpha"), backend("beta")],
            groups: HashMap::new(),
        };

        assert_eq!(config.backend("beta").unwrap().name, "beta");
        assert!(config.backend("gamma").is_none());
    }

    #[test]
    fn test_unknown_group_expands_empty() {
        let config = GatewayConfig::default();
        assert!(config.expand_group("nope").is_empty());
    }

    #[test]
    fn test_store_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        let config = store.read().unwrap();
        assert!(config.backends.is_empty());
        assert!(config.groups.is_empty());
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested/config.json"));

        let mut config = GatewayConfig::default();
        config.backends.push(backend("alpha"));
        config
            .groups
            .insert("g".to_string(), vec!["alpha".to_string()]);

        store.write(&config).unwrap();
        let read_back = store.read().unwrap();
        assert_eq!(read_back, config);
        assert_eq!(store.backend("alpha").unwrap().unwrap().name, "alpha");
    }

    #[test]
    fn test_store_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = ConfigStore::new(path);
        assert!(matches!(store.read(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_group_expander_impl() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        let mut config = GatewayConfig::default();
        config.groups.insert(
            "mlgroup".to_string(),
            vec!["beta".to_string(), "gamma".to_string()],
        );
        store.write(&config).unwrap();

        let expander: &dyn GroupExpander = &store;
        assert_eq!(expander.expand("mlgroup"), vec!["beta", "gamma"]);
        assert!(expander.expand("other").is_empty());
    }
}
