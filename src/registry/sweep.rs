//! Periodic health-check sweep over tracked instances.
//!
//! The sweep runs on its own timer task and never blocks request
//! handling. Each cycle probes liveness of every known pid, flips
//! verified-dead instances to `error`, then issues one batched resource
//! refresh for all live pids and distributes the results. A cycle runs
//! to completion inside its tick, so slow queries delay the next cycle
//! instead of stacking.

use std::{sync::Arc, time::Duration};

use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{types::ResourceUsage, InstanceRegistry, InstanceStatus};

/// Default interval between health-check sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    token: CancellationToken,
}

impl SweeperHandle {
    /// Cancel the sweep task. The task exits at its next select point.
    pub fn stop(self) {
        self.token.cancel();
    }
}

/// Non-invasive existence probe: signal 0 touches nothing but reports
/// whether the pid resolves. EPERM means the process exists but belongs
/// to someone else.
pub(crate) fn process_alive(pid: u32) -> bool {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Spawn the sweep timer task.
pub(super) fn spawn_sweeper(registry: Arc<InstanceRegistry>, interval: Duration) -> SweeperHandle {
    let token = CancellationToken::new();
    let task_token = token.clone();

    tokio::spawn(async move {
        // The System is kept across cycles so cpu_usage has a previous
        // measurement to diff against.
        let mut sys = System::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = task_token.cancelled() => {
                    debug!("Health sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    run_sweep(&registry, &mut sys);
                }
            }
        }
    });

    SweeperHandle { token }
}

/// One sweep cycle.
pub(crate) fn run_sweep(registry: &InstanceRegistry, sys: &mut System) {
    let running: Vec<_> = registry
        .get_all()
        .into_iter()
        .filter(|i| i.is_running())
        .collect();
    if running.is_empty() {
        return;
    }

    let mut alive: Vec<(String, u32)> = Vec::new();
    for instance in &running {
        // Instances whose pid is still unknown are left alone; the
        // stale-instance cleanup owns their grace window.
        let Some(pid) = instance.pid else { continue };

        if process_alive(pid) {
            alive.push((instance.id.clone(), pid));
        } else {
            warn!(
                instance = %instance.id,
                backend = %instance.backend_name,
                pid = pid,
                "Process verified dead, marking error"
            );
            registry.update_status(&instance.id, InstanceStatus::Error);
        }
    }

    if alive.is_empty() {
        return;
    }

    // One batched query for every live pid in this sweep, not one probe
    // per instance.
    let pids: Vec<SysPid> = alive.iter().map(|(_, pid)| SysPid::from_u32(*pid)).collect();
    sys.refresh_processes(ProcessesToUpdate::Some(&pids), true);

    for (id, pid) in alive {
        let usage = sys.process(SysPid::from_u32(pid)).map(|p| ResourceUsage {
            memory_bytes: p.memory(),
            cpu_percent: p.cpu_usage(),
            uptime_secs: p.run_time(),
        });
        registry.record_health(&id, usage);
    }
}
