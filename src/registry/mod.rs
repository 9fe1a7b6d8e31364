//! Crash-resilient instance registry.
//!
//! The authoritative record of every tracked process: backend children
//! and the gateway itself. State lives in memory and is mirrored to one
//! JSON file per instance, so records survive gateway restarts and are
//! reconciled by the stale-instance cleanup on the next run.
//!
//! One registry is constructed per gateway process and injected into the
//! connector, the aggregator, and the sweeper; there is no global
//! accessor.

pub mod store;
pub mod sweep;
pub mod types;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use nix::{
    sys::signal::{kill as send_signal, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub use self::types::{
    CapabilitySummary, ConnectionType, ContextInfo, Instance, InstanceStatus, LaunchSource,
    RegistryEvent, ResourceUsage,
};
use self::{store::InstanceStore, sweep::SweeperHandle};
use crate::error::GatewayResult;

/// Grace window before a running instance with an unknown pid is
/// considered stale.
pub const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(60 * 60);

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Parameters for registering a new instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub pid: Option<u32>,
    pub backend_name: String,
    pub launch_source: LaunchSource,
    pub config_snapshot: serde_json::Value,
    pub context: ContextInfo,
    pub connection_type: ConnectionType,
    pub capabilities: Option<CapabilitySummary>,
}

/// Disk-backed registry of tracked process instances.
pub struct InstanceRegistry {
    instances: DashMap<String, Instance>,
    store: InstanceStore,
    events: broadcast::Sender<RegistryEvent>,
    sweeper: Mutex<Option<SweeperHandle>>,
    stale_grace: Duration,
}

impl InstanceRegistry {
    /// Open a registry over the given instances directory, loading any
    /// records a previous gateway run left behind.
    pub fn open(dir: impl Into<std::path::PathBuf>) -> GatewayResult<Self> {
        let store = InstanceStore::new(dir);
        store.ensure_dir()?;

        let instances = DashMap::new();
        for instance in store.load_all()? {
            instances.insert(instance.id.clone(), instance);
        }
        if !instances.is_empty() {
            info!("Loaded {} instance record(s) from disk", instances.len());
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            instances,
            store,
            events,
            sweeper: Mutex::new(None),
            stale_grace: DEFAULT_STALE_GRACE,
        })
    }

    /// Override the pid-unknown grace window. Intended for tests.
    #[must_use]
    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    /// Subscribe to change notifications. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a new instance with status `running`. Returns its id.
    pub fn register(&self, new: NewInstance) -> String {
        let instance = Instance {
            id: uuid::Uuid::new_v4().to_string(),
            pid: new.pid,
            backend_name: new.backend_name,
            launch_source: new.launch_source,
            started_at: Utc::now(),
            status: InstanceStatus::Running,
            last_health_check: None,
            resource_usage: None,
            context: new.context,
            connection_type: new.connection_type,
            config_snapshot: new.config_snapshot,
            capabilities: new.capabilities,
        };

        let id = instance.id.clone();
        self.persist(&instance);
        self.instances.insert(id.clone(), instance.clone());
        debug!(
            instance = %id,
            backend = %instance.backend_name,
            pid = ?instance.pid,
            "Registered instance"
        );
        self.emit(RegistryEvent::Added(instance));
        self.emit(RegistryEvent::CollectionChanged);
        id
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.instances.get(id).map(|e| e.value().clone())
    }

    pub fn get_all(&self) -> Vec<Instance> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_by_backend(&self, backend_name: &str) -> Vec<Instance> {
        self.instances
            .iter()
            .filter(|e| e.value().backend_name == backend_name)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Record a discovered pid. Returns false if the instance is gone.
    pub fn update_pid(&self, id: &str, pid: u32) -> bool {
        let Some(mut entry) = self.instances.get_mut(id) else {
            return false;
        };
        entry.pid = Some(pid);
        let snapshot = entry.clone();
        drop(entry);

        self.persist(&snapshot);
        self.emit(RegistryEvent::Updated(snapshot));
        true
    }

    /// Transition an instance's status. Returns false if the instance is
    /// gone.
    pub fn update_status(&self, id: &str, status: InstanceStatus) -> bool {
        let Some(mut entry) = self.instances.get_mut(id) else {
            return false;
        };
        if entry.status == status {
            return true;
        }
        entry.status = status;
        let snapshot = entry.clone();
        drop(entry);

        debug!(instance = %id, status = %status, "Instance status changed");
        self.persist(&snapshot);
        self.emit(RegistryEvent::StatusChanged {
            id: id.to_string(),
            status,
        });
        true
    }

    /// Update capability summary after a tool-list probe or refresh.
    pub fn update_capabilities(&self, id: &str, capabilities: CapabilitySummary) -> bool {
        let Some(mut entry) = self.instances.get_mut(id) else {
            return false;
        };
        entry.capabilities = Some(capabilities);
        let snapshot = entry.clone();
        drop(entry);

        self.persist(&snapshot);
        self.emit(RegistryEvent::Updated(snapshot));
        true
    }

    /// Stamp a health check, optionally attaching fresh resource usage.
    pub fn record_health(&self, id: &str, usage: Option<ResourceUsage>) -> bool {
        let Some(mut entry) = self.instances.get_mut(id) else {
            return false;
        };
        entry.last_health_check = Some(Utc::now());
        if usage.is_some() {
            entry.resource_usage = usage;
        }
        let snapshot = entry.clone();
        drop(entry);

        self.persist(&snapshot);
        self.emit(RegistryEvent::Updated(snapshot));
        true
    }

    /// Remove an instance record entirely.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.instances.remove(id).is_some();
        if removed {
            if let Err(e) = self.store.delete(id) {
                warn!(instance = %id, "Failed to delete instance record: {}", e);
            }
            self.emit(RegistryEvent::Removed { id: id.to_string() });
            self.emit(RegistryEvent::CollectionChanged);
        }
        removed
    }

    /// Terminate an instance: SIGTERM when the process is known to be
    /// alive, otherwise just mark it stopped. Returns false if the
    /// instance is unknown.
    pub fn kill(&self, id: &str) -> bool {
        let Some(instance) = self.get(id) else {
            return false;
        };

        if let Some(pid) = instance.pid {
            if sweep::process_alive(pid) {
                info!(instance = %id, pid = pid, "Sending SIGTERM");
                if let Err(e) = send_signal(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(instance = %id, pid = pid, "SIGTERM failed: {}", e);
                }
            }
        }
        self.update_status(id, InstanceStatus::Stopped);
        true
    }

    /// Transition instances of a backend to a terminal status when its
    /// transport closes. Matches on backend name plus the transport's
    /// pid when one is known on both sides.
    pub fn mark_backend_closed(
        &self,
        backend_name: &str,
        pid: Option<u32>,
        status: InstanceStatus,
    ) {
        let matching: Vec<String> = self
            .instances
            .iter()
            .filter(|e| {
                let inst = e.value();
                inst.backend_name == backend_name
                    && inst.is_running()
                    && match (pid, inst.pid) {
                        (Some(a), Some(b)) => a == b,
                        _ => true,
                    }
            })
            .map(|e| e.key().clone())
            .collect();

        for id in matching {
            self.update_status(&id, status);
        }
    }

    /// Remove instances that are finished or verifiably gone: terminal
    /// statuses, running instances whose pid is verified dead, and
    /// running instances whose pid never became known within the grace
    /// window. Idempotent. Returns the number removed.
    pub fn cleanup_stale(&self) -> usize {
        let now = Utc::now();
        let stale: Vec<String> = self
            .instances
            .iter()
            .filter(|e| {
                let inst = e.value();
                match inst.status {
                    InstanceStatus::Stopped | InstanceStatus::Error => true,
                    InstanceStatus::Running => match inst.pid {
                        Some(pid) => !sweep::process_alive(pid),
                        None => {
                            let age = now
                                .signed_duration_since(inst.started_at)
                                .to_std()
                                .unwrap_or_default();
                            age > self.stale_grace
                        }
                    },
                }
            })
            .map(|e| e.key().clone())
            .collect();

        for id in &stale {
            self.remove(id);
        }
        if !stale.is_empty() {
            info!("Cleaned up {} stale instance(s)", stale.len());
        }
        stale.len()
    }

    /// Start the periodic health-check sweep. A second call while a
    /// sweeper is running is a no-op.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        *guard = Some(sweep::spawn_sweeper(Arc::clone(self), interval));
    }

    /// Stop the sweep task deterministically.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.stop();
        }
    }

    fn persist(&self, instance: &Instance) {
        // Disk failures are non-fatal; in-memory state stays
        // authoritative for the running process.
        if let Err(e) = self.store.save(instance) {
            warn!(instance = %instance.id, "Failed to persist instance record: {}", e);
        }
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for InstanceRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.stop();
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

    fn new_instance(backend: &str, pid: Option<u32>) -> NewInstance {
        NewInstance {
            pid,
            backend_name: backend.to_string(),
            launch_source: LaunchSource::Gateway,
            config_snapshot: serde_json::Value::Null,
            context: ContextInfo::default(),
            connection_type: ConnectionType::Stdio,
            capabilities: None,
        }
    }

    fn spawn_sleeper() -> std::process::Child {
        std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep")
    }

    #[test]
    fn test_register_resolves_running_instance() {
        let (registry, _dir) = test_registry();

        let id = registry.register(new_instance("search", Some(std::process::id())));
        let instance = registry.get(&id).expect("instance should resolve");

        assert_eq!(instance.backend_name, "search");
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(registry.get_by_backend("search").len(), 1);
    }

    #[test]
    fn test_remove_forgets_instance() {
        let (registry, _dir) = test_registry();

        let id = registry.register(new_instance("search", None));
        assert!(registry.remove(&id));
        assert!(registry.get(&id).is_none());
        assert!(registry.get_all().is_empty());
        assert!(!registry.remove(&id));
    }

    #[test]
    fn test_update_pid_and_status() {
        let (registry, _dir) = test_registry();

        let id = registry.register(new_instance("search", None));
        assert!(registry.update_pid(&id, 4242));
        assert_eq!(registry.get(&id).unwrap().pid, Some(4242));

        assert!(registry.update_status(&id, InstanceStatus::Error));
        assert_eq!(registry.get(&id).unwrap().status, InstanceStatus::Error);

        assert!(!registry.update_pid("no-such-id", 1));
        assert!(!registry.update_status("no-such-id", InstanceStatus::Stopped));
    }

    #[test]
    fn test_registry_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances");

        let id = {
            let registry = InstanceRegistry::open(&path).unwrap();
            registry.register(new_instance("search", Some(7)))
        };

        let reloaded = InstanceRegistry::open(&path).unwrap();
        let instance = reloaded.get(&id).expect("record should survive restart");
        assert_eq!(instance.backend_name, "search");
        assert_eq!(instance.pid, Some(7));
    }

    #[test]
    fn test_cleanup_removes_terminal_statuses() {
        let (registry, _dir) = test_registry();

        let stopped = registry.register(new_instance("a", None));
        registry.update_status(&stopped, InstanceStatus::Stopped);
        let errored = registry.register(new_instance("b", None));
        registry.update_status(&errored, InstanceStatus::Error);
        let live = registry.register(new_instance("c", Some(std::process::id())));

        assert_eq!(registry.cleanup_stale(), 2);
        assert!(registry.get(&live).is_some());

        // Idempotent: a second pass removes nothing further.
        assert_eq!(registry.cleanup_stale(), 0);
    }

    #[test]
    fn test_cleanup_removes_verified_dead() {
        let (registry, _dir) = test_registry();

        let mut child = spawn_sleeper();
        let pid = child.id();
        let id = registry.register(new_instance("doomed", Some(pid)));

        child.kill().unwrap();
        child.wait().unwrap();

        assert_eq!(registry.cleanup_stale(), 1);
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_cleanup_keeps_pid_unknown_within_grace() {
        let (registry, _dir) = test_registry();
        let id = registry.register(new_instance("pending", None));

        assert_eq!(registry.cleanup_stale(), 0);
        assert!(registry.get(&id).is_some());
    }

    #[test]
    fn test_cleanup_removes_pid_unknown_past_grace() {
        let dir = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::open(dir.path().join("instances"))
            .unwrap()
            .with_stale_grace(Duration::ZERO);

        let id = registry.register(new_instance("pending", None));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(registry.cleanup_stale(), 1);
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_kill_without_pid_marks_stopped() {
        let (registry, _dir) = test_registry();

        let id = registry.register(new_instance("search", None));
        assert!(registry.kill(&id));
        assert_eq!(registry.get(&id).unwrap().status, InstanceStatus::Stopped);
        assert!(!registry.kill("no-such-id"));
    }

    #[test]
    fn test_kill_terminates_live_child() {
        let (registry, _dir) = test_registry();

        let mut child = spawn_sleeper();
        let id = registry.register(new_instance("victim", Some(child.id())));

        assert!(registry.kill(&id));
        assert_eq!(registry.get(&id).unwrap().status, InstanceStatus::Stopped);

        // SIGTERM should take the child down promptly.
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_mark_backend_closed_matches_name_and_pid() {
        let (registry, _dir) = test_registry();

        let a = registry.register(new_instance("svc", Some(1001)));
        let b = registry.register(new_instance("svc", Some(1002)));
        let other = registry.register(new_instance("other", Some(1001)));

        registry.mark_backend_closed("svc", Some(1001), InstanceStatus::Error);

        assert_eq!(registry.get(&a).unwrap().status, InstanceStatus::Error);
        assert_eq!(registry.get(&b).unwrap().status, InstanceStatus::Running);
        assert_eq!(registry.get(&other).unwrap().status, InstanceStatus::Running);
    }

    #[test]
    fn test_events_published_on_mutations() {
        let (registry, _dir) = test_registry();
        let mut rx = registry.subscribe();

        let id = registry.register(new_instance("search", None));
        registry.update_status(&id, InstanceStatus::Stopped);
        registry.remove(&id);

        assert!(matches!(rx.try_recv().unwrap(), RegistryEvent::Added(_)));
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistryEvent::CollectionChanged
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistryEvent::StatusChanged {
                status: InstanceStatus::Stopped,
                ..
            }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistryEvent::Removed { .. }
        ));
    }

    #[test]
    fn test_record_health_stamps_timestamp() {
        let (registry, _dir) = test_registry();

        let id = registry.register(new_instance("search", Some(std::process::id())));
        assert!(registry.get(&id).unwrap().last_health_check.is_none());

        let usage = ResourceUsage {
            memory_bytes: 1024,
            cpu_percent: 1.5,
            uptime_secs: 10,
        };
        assert!(registry.record_health(&id, Some(usage)));

        let instance = registry.get(&id).unwrap();
        assert!(instance.last_health_check.is_some());
        assert_eq!(instance.resource_usage.unwrap().memory_bytes, 1024);
    }
}
