//! Daemon health report.
//!
//! Folds per-stage statuses into one [`DaemonHealth`]: the daemon is as
//! healthy as its worst enabled stage (Unhealthy > Degraded > Healthy),
//! and the reason string names every stage at that level.

use serde::Serialize;

use flowsentry_core::pipeline::HealthStatus;

/// Snapshot of daemon health, serializable for status output.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Worst status among enabled stages.
    pub status: HealthStatus,
    /// Seconds since the modules were started.
    pub uptime_secs: u64,
    /// One entry per registered stage.
    pub modules: Vec<ModuleHealth>,
}

impl DaemonHealth {
    /// Build a report from `(name, enabled, status)` tuples as returned by
    /// the module registry.
    pub fn from_statuses(statuses: Vec<(String, bool, HealthStatus)>, uptime_secs: u64) -> Self {
        let modules: Vec<ModuleHealth> = statuses
            .into_iter()
            .map(|(name, enabled, status)| ModuleHealth {
                name,
                enabled,
                status,
            })
            .collect();
        Self {
            status: aggregate_status(&modules),
            uptime_secs,
            modules,
        }
    }

    /// Log the report at a level matching the overall status.
    pub fn log(&self) {
        match &self.status {
            HealthStatus::Healthy => {
                tracing::debug!(uptime_secs = self.uptime_secs, "daemon healthy");
            }
            HealthStatus::Degraded(reason) => {
                tracing::warn!(uptime_secs = self.uptime_secs, reason = %reason, "daemon degraded");
            }
            HealthStatus::Unhealthy(reason) => {
                tracing::error!(uptime_secs = self.uptime_secs, reason = %reason, "daemon unhealthy");
            }
        }
    }
}

/// Health of one pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleHealth {
    /// Module name (e.g., "flow-engine", "classifier").
    pub name: String,
    /// Disabled stages do not affect the overall status.
    pub enabled: bool,
    /// Status reported by the stage.
    pub status: HealthStatus,
}

/// Worst status among enabled stages, with `"name: reason"` entries of
/// that level joined by `"; "`.
pub fn aggregate_status(modules: &[ModuleHealth]) -> HealthStatus {
    let mut degraded = Vec::new();
    let mut unhealthy = Vec::new();

    for module in modules.iter().filter(|m| m.enabled) {
        match &module.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                degraded.push(format!("{}: {}", module.name, reason));
            }
            HealthStatus::Unhealthy(reason) => {
                unhealthy.push(format!("{}: {}", module.name, reason));
            }
        }
    }

    if !unhealthy.is_empty() {
        HealthStatus::Unhealthy(unhealthy.join("; "))
    } else if !degraded.is_empty() {
        HealthStatus::Degraded(degraded.join("; "))
    } else {
        HealthStatus::Healthy
    }
}
