//! Enforcement module initialization.
//!
//! Converts `FlowSentryConfig.enforcement` into an `EmitterConfig`,
//! builds the configured enforcement sink (unless one is supplied) and
//! wraps the resulting `EnforcementEmitter` in a `ModuleHandle`.
//!
//! # Channel Wiring
//!
//! ```text
//! classifier --EnforcementDecision--> EmitterHandle --> delivery loop --> sink
//! ```

use std::sync::Arc;

use anyhow::Result;

use flowsentry_core::config::FlowSentryConfig;
use flowsentry_core::pipeline::EnforcementSink;

use flowsentry_classifier::{EmitterConfig, EmitterHandle, EnforcementEmitter, build_sink};

use super::ModuleHandle;

/// Module name used in logs and health reports.
pub const MODULE_NAME: &str = "enforcement";

/// Initialize the enforcement emitter.
///
/// # Arguments
///
/// * `config` - The full flowsentry configuration
/// * `sink` - Optional sink overriding `enforcement.sink`
///
/// # Returns
///
/// The module handle plus the emitter handle the classifier publishes to.
pub fn init(
    config: &FlowSentryConfig,
    sink: Option<Arc<dyn EnforcementSink>>,
) -> Result<(ModuleHandle, EmitterHandle)> {
    let emitter_config = EmitterConfig::from_core(&config.enforcement)
        .map_err(|e| anyhow::anyhow!("invalid enforcement configuration: {}", e))?;

    let sink = match sink {
        Some(sink) => sink,
        None => build_sink(&emitter_config)
            .map_err(|e| anyhow::anyhow!("failed to build enforcement sink: {}", e))?,
    };

    tracing::info!(
        sink = sink.name(),
        max_retries = emitter_config.max_retries,
        "initializing enforcement emitter"
    );

    let (emitter, handle) = EnforcementEmitter::builder()
        .config(emitter_config)
        .sink(sink)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build enforcement emitter: {}", e))?;

    Ok((
        ModuleHandle::new(MODULE_NAME, true, Box::new(emitter)),
        handle,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_log_sink() {
        let config = FlowSentryConfig::default();
        let (handle, emitter) = init(&config, None).unwrap();
        assert_eq!(handle.name, MODULE_NAME);
        assert!(handle.enabled);
        assert!(!emitter.is_closed());
    }

    #[test]
    fn unknown_sink_is_rejected() {
        let mut config = FlowSentryConfig::default();
        config.enforcement.sink = "iptables".to_owned();
        let err = init(&config, None).err().unwrap();
        assert!(err.to_string().contains("enforcement"));
    }
}
