//! Pipeline stages as daemon modules.
//!
//! The flow engine, classifier pool and enforcement emitter are each boxed
//! behind [`DynPipeline`] inside a [`ModuleHandle`]; the [`ModuleRegistry`]
//! owns them in wiring order and starts/stops them as a unit.
//!
//! # Wiring
//!
//! ```text
//! flow-engine --FinalizedFlow--> ClassificationQueue --> classifier
//! classifier --EnforcementDecision--> EmitterHandle --> enforcement --> sink
//! ```

pub mod classifier;
pub mod enforcement;
pub mod flow_engine;

use flowsentry_core::pipeline::{DynPipeline, HealthStatus};

/// One pipeline stage owned by the registry.
pub struct ModuleHandle {
    /// Stage name (`flow-engine`, `classifier`, `enforcement`).
    pub name: String,
    /// Disabled stages are skipped by start/stop and reported healthy.
    pub enabled: bool,
    /// Boxed stage implementation.
    pub pipeline: Box<dyn DynPipeline>,
    running: bool,
}

impl ModuleHandle {
    /// Wrap a stage. The handle starts out not running.
    pub fn new(name: impl Into<String>, enabled: bool, pipeline: Box<dyn DynPipeline>) -> Self {
        Self {
            name: name.into(),
            enabled,
            pipeline,
            running: false,
        }
    }

    /// Whether the module was started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stage health; `Healthy` for disabled stages.
    pub async fn health_check(&self) -> HealthStatus {
        if !self.enabled {
            return HealthStatus::Healthy;
        }
        self.pipeline.health_check().await
    }
}

/// Registry of all flowsentry modules.
///
/// Modules are registered consumers first (enforcement, classifier,
/// flow engine) so that every downstream stage is running before the
/// stage feeding it starts, and stopped in reverse so upstream stages
/// flush into still-running consumers.
pub struct ModuleRegistry {
    modules: Vec<ModuleHandle>,
}

impl ModuleRegistry {
    /// Registry with no stages.
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Append a stage; order here is startup order.
    pub fn register(&mut self, handle: ModuleHandle) {
        self.modules.push(handle);
    }

    /// Start enabled stages in registration order, stopping at the first
    /// failure. Stages started before the failure stay running and are
    /// marked so a following `stop_all` stops exactly those.
    pub async fn start_all(&mut self) -> anyhow::Result<()> {
        for handle in &mut self.modules {
            if !handle.enabled {
                tracing::debug!(module = %handle.name, "skipping disabled module");
                continue;
            }

            tracing::info!(module = %handle.name, "starting module");
            handle
                .pipeline
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("failed to start module '{}': {}", handle.name, e))?;
            handle.running = true;
        }
        Ok(())
    }

    /// Stop running stages in reverse registration order.
    ///
    /// A failing stage does not prevent the remaining ones from stopping;
    /// all failures are reported together.
    pub async fn stop_all(&mut self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for handle in self.modules.iter_mut().rev() {
            if !handle.running {
                continue;
            }

            tracing::info!(module = %handle.name, "stopping module");
            handle.running = false;
            if let Err(e) = handle.pipeline.stop().await {
                tracing::error!(module = %handle.name, error = %e, "failed to stop module");
                errors.push(format!("{}: {}", handle.name, e));
            }
        }

        if !errors.is_empty() {
            return Err(anyhow::anyhow!(
                "errors stopping modules: {}",
                errors.join("; ")
            ));
        }
        Ok(())
    }

    /// `(name, enabled, status)` per stage in registration order.
    pub async fn health_statuses(&self) -> Vec<(String, bool, HealthStatus)> {
        let mut statuses = Vec::with_capacity(self.modules.len());
        for handle in &self.modules {
            let status = handle.health_check().await;
            statuses.push((handle.name.clone(), handle.enabled, status));
        }
        statuses
    }

    /// Module names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    /// Registered stages.
    pub fn count(&self) -> usize {
        self.modules.len()
    }

    /// Stages enabled in configuration.
    pub fn enabled_count(&self) -> usize {
        self.modules.iter().filter(|m| m.enabled).count()
    }

    /// Stages started and not yet stopped.
    pub fn running_count(&self) -> usize {
        self.modules.iter().filter(|m| m.running).count()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
