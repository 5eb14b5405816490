//! Flow engine module initialization.
//!
//! Combines `FlowSentryConfig.flow` and `FlowSentryConfig.capture` into a
//! `FlowEngineConfig`, attaches a replay capture when capture is enabled
//! with a replay source, and wraps the `FlowEngine` in a `ModuleHandle`.
//!
//! # Channel Wiring
//!
//! ```text
//! replay file / IngestHandle --PacketDescriptor--> ingest workers
//! lifecycle --FinalizedFlow--> FlowSink (classifier queue)
//! ```

use std::sync::Arc;

use anyhow::Result;

use flowsentry_core::config::FlowSentryConfig;
use flowsentry_core::pipeline::FlowSink;

use flowsentry_flow_engine::{FlowEngine, FlowEngineConfig, IngestHandle, ReplayCapture};

use super::ModuleHandle;

/// Module name used in logs and health reports.
pub const MODULE_NAME: &str = "flow-engine";

/// Initialize the flow engine.
///
/// The returned `IngestHandle` accepts packet descriptors from an external
/// capture; with `capture.enabled` the replay file feeds the same queues.
pub fn init(
    config: &FlowSentryConfig,
    sink: Arc<dyn FlowSink>,
) -> Result<(ModuleHandle, IngestHandle)> {
    let engine_config = FlowEngineConfig::from_core(&config.flow, &config.capture)
        .map_err(|e| anyhow::anyhow!("invalid flow engine configuration: {}", e))?;

    let mut builder = FlowEngine::builder().config(engine_config).sink(sink);

    if config.capture.enabled {
        let replay = ReplayCapture::from_config(&config.capture)
            .map_err(|e| anyhow::anyhow!("invalid capture configuration: {}", e))?;
        match replay {
            Some(replay) => {
                tracing::info!(
                    source = %config.capture.source,
                    path = %replay.path().display(),
                    "attaching replay capture"
                );
                builder = builder.replay(Arc::new(replay));
            }
            None => {
                tracing::info!(source = %config.capture.source, "capture fed externally");
            }
        }
    }

    tracing::info!(
        shards = config.flow.shard_count,
        max_flows = config.flow.max_flows,
        clock = %config.flow.clock,
        "initializing flow engine"
    );

    let (engine, ingest) = builder
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build flow engine: {}", e))?;

    Ok((ModuleHandle::new(MODULE_NAME, true, Box::new(engine)), ingest))
}

#[cfg(test)]
mod tests {
    use flowsentry_core::types::FinalizedFlow;

    use super::*;

    struct Discard;

    impl FlowSink for Discard {
        fn submit(&self, _flow: FinalizedFlow) {}
    }

    #[test]
    fn ingest_handle_matches_worker_count() {
        let mut config = FlowSentryConfig::default();
        config.capture.ingest_workers = 3;
        let (handle, ingest) = init(&config, Arc::new(Discard)).unwrap();
        assert_eq!(handle.name, MODULE_NAME);
        assert_eq!(ingest.queue_count(), 3);
    }

    #[test]
    fn invalid_clock_is_rejected() {
        let mut config = FlowSentryConfig::default();
        config.flow.clock = "monotonic".to_owned();
        assert!(init(&config, Arc::new(Discard)).is_err());
    }
}
