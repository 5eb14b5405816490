//! Classifier module initialization.
//!
//! Converts `FlowSentryConfig.classifier` (plus the rate-limit and TTL
//! values from `enforcement`) into a `ClassifierPipelineConfig` and builds
//! the worker pool that turns finalized flows into decisions.
//!
//! # Channel Wiring
//!
//! ```text
//! flow-engine --FinalizedFlow--> ClassificationQueue --> workers
//! workers --EnforcementDecision--> EmitterHandle
//! ```

use std::sync::Arc;

use anyhow::Result;

use flowsentry_core::config::FlowSentryConfig;

use flowsentry_classifier::{
    ClassificationPipeline, ClassificationQueue, ClassifierPipelineConfig, EmitterHandle,
};

use super::ModuleHandle;

/// Module name used in logs and health reports.
pub const MODULE_NAME: &str = "classifier";

/// Initialize the classification worker pool.
///
/// The returned queue implements `FlowSink` and is handed to the flow engine.
pub fn init(
    config: &FlowSentryConfig,
    emitter: EmitterHandle,
) -> Result<(ModuleHandle, Arc<ClassificationQueue>)> {
    let pipeline_config =
        ClassifierPipelineConfig::from_core(&config.classifier, &config.enforcement)
            .map_err(|e| anyhow::anyhow!("invalid classifier configuration: {}", e))?;

    tracing::info!(
        kind = %config.classifier.kind,
        workers = pipeline_config.workers,
        deadline_ms = pipeline_config.deadline.as_millis() as u64,
        fail_policy = %pipeline_config.fail_policy,
        "initializing classifier"
    );

    let (pipeline, queue) = ClassificationPipeline::builder()
        .config(pipeline_config)
        .emitter(emitter)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build classifier: {}", e))?;

    Ok((ModuleHandle::new(MODULE_NAME, true, Box::new(pipeline)), queue))
}
