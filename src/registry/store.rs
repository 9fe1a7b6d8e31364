//! On-disk persistence for instance records.
//!
//! One JSON file per instance, named by instance id, under a dedicated
//! directory. Writes are synchronous so a crash right after a mutation
//! leaves the record on disk. A corrupt file only loses that one record.

use std::path::{Path, PathBuf};

use tracing::warn;

use super::types::Instance;
use crate::error::GatewayResult;

pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> GatewayResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Persist one instance record, creating the directory if needed.
    pub fn save(&self, instance: &Instance) -> GatewayResult<()> {
        self.ensure_dir()?;
        let content = serde_json::to_string_pretty(instance)?;
        std::fs::write(self.path_for(&instance.id), content)?;
        Ok(())
    }

    /// Remove one instance record. Missing files are fine.
    pub fn delete(&self, id: &str) -> GatewayResult<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every record in the directory. Files that fail to parse are
    /// skipped with a warning and never poison their siblings.
    pub fn load_all(&self) -> GatewayResult<Vec<Instance>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut instances = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<Instance>(&content) {
                    Ok(instance) => instances.push(instance),
                    Err(e) => {
                        warn!("Skipping corrupt instance record {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read instance record {}: {}", path.display(), e);
                }
            }
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::registry::types::{ConnectionType, ContextInfo, InstanceStatus, LaunchSource};

    fn instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            pid: Some(100),
            backend_name: "search".to_string(),
            launch_source: LaunchSource::Gateway,
            started_at: Utc::now(),
            status: InstanceStatus::Running,
            last_health_check: None,
            resource_usage: None,
            context: ContextInfo::default(),
            connection_type: ConnectionType::Stdio,
            config_snapshot: serde_json::Value::Null,
            capabilities: None,
        }
    }

    #[test]
    fn test_save_and_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("instances"));

        store.save(&instance("a")).unwrap();
        store.save(&instance("b")).unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(loaded[1].id, "b");
    }

    #[test]
    fn test_load_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("nonexistent"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_does_not_poison_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());

        store.save(&instance("good")).unwrap();
        std::fs::write(dir.path().join("bad.json"), "{truncated").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "good");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());

        store.save(&instance("a")).unwrap();
        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_non_json_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());

        store.save(&instance("a")).unwrap();
        std::fs::write(dir.path().join("README.txt"), "not a record").unwrap();

        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
