//! Module orchestration -- assembly, wiring, and lifecycle management.
//!
//! The [`Orchestrator`] is the central coordinator of `flowsentry-daemon`.
//! It validates configuration, builds the three pipeline stages, wires
//! them together, manages startup/shutdown ordering, and runs the main
//! event loop.
//!
//! # Startup Order (consumers before producers)
//!
//! 1. Enforcement emitter (delivers decisions to the sink)
//! 2. Classifier (consumes finalized flows, produces decisions)
//! 3. Flow engine (consumes packets, produces finalized flows)
//!
//! # Shutdown Order (reverse - producers first)
//!
//! 1. Flow engine (stop ingest, drain the flow table into the classifier)
//! 2. Classifier (close the queue, finish in-flight classifications)
//! 3. Enforcement emitter (drain pending decisions into the sink)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use flowsentry_core::config::FlowSentryConfig;
use flowsentry_core::pipeline::EnforcementSink;
use flowsentry_flow_engine::IngestHandle;

use crate::health::DaemonHealth;
use crate::metrics_server;
use crate::modules::{self, ModuleRegistry};

/// Interval between health reports in the main loop.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between uptime gauge updates.
const UPTIME_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// The main daemon orchestrator.
///
/// Manages the complete lifecycle of all flowsentry modules:
/// wiring, ordered startup, health monitoring, and graceful shutdown.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: FlowSentryConfig,
    /// Registry of all modules (ordered for start/stop).
    modules: ModuleRegistry,
    /// Packet ingest handle of the flow engine.
    ingest: IngestHandle,
    /// Shutdown broadcast sender (signals all background tasks).
    shutdown_tx: broadcast::Sender<()>,
    /// Background tasks spawned by `start`.
    tasks: Vec<JoinHandle<()>>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
    /// PID file written by `start`, removed by `shutdown`.
    pid_file: Option<PathBuf>,
    started: bool,
}

impl Orchestrator {
    /// Load configuration and build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read or parsed
    /// - Configuration validation fails
    /// - Any module fails to initialize
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = FlowSentryConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    pub async fn build_from_config(config: FlowSentryConfig) -> Result<Self> {
        Self::build_with_enforcement_sink(config, None).await
    }

    /// Build with an explicit enforcement sink instead of `enforcement.sink`.
    ///
    /// Embedders use this to receive decisions in-process.
    pub async fn build_with_enforcement_sink(
        config: FlowSentryConfig,
        sink: Option<Arc<dyn EnforcementSink>>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        // Install metrics recorder before module initialization
        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
            tracing::info!(port = config.metrics.port, "metrics endpoint enabled");
        }

        let mut registry = ModuleRegistry::new();

        let (emitter_module, emitter) = modules::enforcement::init(&config, sink)?;
        registry.register(emitter_module);

        let (classifier_module, queue) = modules::classifier::init(&config, emitter)?;
        registry.register(classifier_module);

        let (engine_module, ingest) = modules::flow_engine::init(&config, queue)?;
        registry.register(engine_module);

        record_daemon_metrics(registry.count());

        tracing::info!(
            modules = ?registry.names(),
            "orchestrator built"
        );

        let (shutdown_tx, _) = broadcast::channel(16);
        Ok(Self {
            config,
            modules: registry,
            ingest,
            shutdown_tx,
            tasks: Vec::new(),
            start_time: Instant::now(),
            pid_file: None,
            started: false,
        })
    }

    /// Packet ingest handle for feeding descriptors from an external capture.
    pub fn ingest(&self) -> IngestHandle {
        self.ingest.clone()
    }

    /// Write the PID file, start all modules, and spawn background tasks.
    ///
    /// On failure every already-started module is stopped again and the
    /// PID file is removed.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(anyhow::anyhow!("orchestrator already started"));
        }

        if !self.config.general.pid_file.is_empty() {
            let path = PathBuf::from(&self.config.general.pid_file);
            write_pid_file(&path)?;
            self.pid_file = Some(path);
        }

        tracing::info!("starting all modules");
        if let Err(e) = self.modules.start_all().await {
            tracing::warn!("startup failed, rolling back already-started modules");
            if let Err(stop_err) = self.modules.stop_all().await {
                tracing::error!(
                    startup_error = %e,
                    rollback_error = %stop_err,
                    "rollback also failed during startup failure cleanup"
                );
            }
            self.cleanup_pid_file();
            return Err(e);
        }

        self.start_time = Instant::now();
        if self.config.metrics.enabled {
            self.tasks.push(spawn_uptime_updater(
                self.start_time,
                self.shutdown_tx.subscribe(),
            ));
        }

        self.started = true;
        tracing::info!(
            running = self.modules.running_count(),
            "all modules started"
        );
        Ok(())
    }

    /// Start all modules and run until a shutdown signal arrives.
    ///
    /// # Shutdown Triggers
    ///
    /// - `SIGTERM` (from systemd, Docker, or `kill`)
    /// - `SIGINT` (Ctrl+C)
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let signal = wait_for_shutdown_signal();
        tokio::pin!(signal);

        let mut health_interval =
            tokio::time::interval_at(tokio::time::Instant::now() + HEALTH_LOG_INTERVAL, HEALTH_LOG_INTERVAL);
        health_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("entering main event loop");
        let outcome = loop {
            tokio::select! {
                result = &mut signal => {
                    if let Ok(name) = &result {
                        tracing::info!(signal = *name, "shutdown signal received");
                    }
                    break result.map(|_| ());
                }
                _ = health_interval.tick() => {
                    self.health().await.log();
                }
            }
        };

        let shutdown = self.shutdown().await;
        outcome.and(shutdown)
    }

    /// Perform graceful shutdown of all modules.
    ///
    /// Stops modules in reverse registration order so each stage drains
    /// into a still-running consumer. Calling this before `start` or twice
    /// is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;

        tracing::info!("broadcasting shutdown signal to all tasks");
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        tracing::info!("stopping all modules");
        let result = self.modules.stop_all().await;
        self.cleanup_pid_file();
        result
    }

    /// Get the current aggregated health status.
    pub async fn health(&self) -> DaemonHealth {
        let statuses = self.modules.health_statuses().await;
        DaemonHealth::from_statuses(statuses, self.start_time.elapsed().as_secs())
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &FlowSentryConfig {
        &self.config
    }

    /// Whether `start` succeeded and `shutdown` has not run yet.
    pub fn is_running(&self) -> bool {
        self.started
    }

    fn cleanup_pid_file(&mut self) {
        if let Some(path) = self.pid_file.take() {
            remove_pid_file(&path);
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
///
/// # Errors
///
/// Returns an error if signal handlers cannot be installed.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Write the current process PID to a file.
///
/// Used to prevent duplicate daemon instances.
///
/// # Security
///
/// - Uses `create_new(true)` to atomically create the file
/// - Verifies the created file is a regular file
/// - Creates the parent directory with restrictive permissions (0o700)
///
/// # Errors
///
/// Returns an error if the PID file exists or cannot be written.
fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700).recursive(true);
            builder.create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing_pid = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_owned());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata()?;
    if !metadata.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{}", pid)?;

    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on daemon shutdown.
///
/// Logs a warning but does not fail if the file cannot be removed.
fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to remove PID file"
        );
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

/// Record daemon-level metrics (build info, modules registered).
fn record_daemon_metrics(module_count: usize) {
    use flowsentry_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!(m::DAEMON_MODULES_REGISTERED).set(module_count as f64);

    tracing::debug!(
        module_count = module_count,
        version = env!("CARGO_PKG_VERSION"),
        "daemon metrics recorded"
    );
}

/// Spawn a background task that periodically updates the uptime metric.
fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    use flowsentry_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(start_time.elapsed().as_secs() as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_write_pid_file_creates_parent_directory() {
        // Given: A path with non-existent parent directory
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("run").join("flowsentry.pid");

        // When
        write_pid_file(&pid_file).unwrap();

        // Then: parent created, file holds our PID
        let content = fs::read_to_string(&pid_file).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_write_pid_file_fails_if_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("flowsentry.pid");
        fs::write(&pid_file, "12345").unwrap();

        let err = write_pid_file(&pid_file).unwrap_err().to_string();
        assert!(err.contains("already exists"), "got: {err}");
        assert!(err.contains("12345"), "got: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_pid_file_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("flowsentry.pid");
        write_pid_file(&pid_file).unwrap();

        let mode = fs::metadata(&pid_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_remove_pid_file_handles_nonexistent_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        remove_pid_file(&dir.path().join("missing.pid"));
    }

    #[tokio::test]
    async fn test_uptime_updater_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = spawn_uptime_updater(Instant::now(), shutdown_rx);

        let _ = shutdown_tx.send(());
        let result = tokio::time::timeout(Duration::from_millis(500), task).await;
        assert!(result.is_ok(), "uptime updater should stop promptly");
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let mut orchestrator = Orchestrator::build_from_config(FlowSentryConfig::default())
            .await
            .unwrap();
        assert!(!orchestrator.is_running());
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_before_start_reports_unhealthy() {
        let orchestrator = Orchestrator::build_from_config(FlowSentryConfig::default())
            .await
            .unwrap();
        let health = orchestrator.health().await;
        assert_eq!(health.modules.len(), 3);
        assert!(health.status.is_unhealthy());
    }
}
