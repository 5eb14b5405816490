//! flowsentry.toml 통합 설정 테스트
//!
//! - flowsentry.toml.example 파싱 테스트
//! - 부분 설정 (일부 섹션만) 로딩 테스트
//! - 환경변수 우선순위 테스트
//! - 파일 로딩 / 잘못된 형식 에러 테스트

use std::io::Write;

use flowsentry_core::config::FlowSentryConfig;
use flowsentry_core::error::{ConfigError, FlowSentryError};
use flowsentry_core::types::FailPolicy;

const EXAMPLE: &str = include_str!("../../../flowsentry.toml.example");

/// 환경변수를 설정하고 클로저 실행 후 원래 값으로 되돌립니다.
fn with_env<T>(key: &str, value: &str, f: impl FnOnce() -> T) -> T {
    let original = std::env::var(key).ok();
    // SAFETY: 테스트는 serial_test로 직렬화되어 환경변수 조작이 안전합니다.
    unsafe {
        std::env::set_var(key, value);
    }

    let result = f();

    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var(key, val),
            None => std::env::remove_var(key),
        }
    }
    result
}

// =============================================================================
// flowsentry.toml.example 파싱 테스트
// =============================================================================

#[test]
fn example_config_parses_successfully() {
    let config = FlowSentryConfig::parse(EXAMPLE).expect("example config should parse");

    assert_eq!(config.general.log_level, "info");
    assert_eq!(config.general.log_format, "json");
    assert_eq!(config.general.pid_file, "/var/run/flowsentry/flowsentry.pid");
}

#[test]
fn example_config_passes_validation() {
    let config = FlowSentryConfig::parse(EXAMPLE).expect("should parse");
    config
        .validate()
        .expect("example config should pass validation");
}

#[test]
fn example_config_has_correct_flow_values() {
    let config = FlowSentryConfig::parse(EXAMPLE).expect("should parse");

    assert_eq!(config.flow.shard_count, 64);
    assert_eq!(config.flow.idle_timeout_secs, 120);
    assert_eq!(config.flow.active_timeout_secs, 1800);
    assert_eq!(config.flow.clock, "wall");
    let networks = config.flow.parsed_protected_networks().expect("valid cidrs");
    assert_eq!(networks.len(), 2);
}

#[test]
fn example_config_matches_code_defaults() {
    let example = FlowSentryConfig::parse(EXAMPLE).expect("should parse");
    let defaults = FlowSentryConfig::default();

    assert_eq!(example.capture.ingest_workers, defaults.capture.ingest_workers);
    assert_eq!(example.flow.max_flows, defaults.flow.max_flows);
    assert_eq!(example.flow.sweep_interval_ms, defaults.flow.sweep_interval_ms);
    assert_eq!(example.classifier.deadline_ms, defaults.classifier.deadline_ms);
    assert_eq!(
        example.classifier.hysteresis_count,
        defaults.classifier.hysteresis_count
    );
    assert_eq!(
        example.classifier.queue_capacity,
        defaults.classifier.queue_capacity
    );
    assert_eq!(example.enforcement.max_retries, defaults.enforcement.max_retries);
    assert_eq!(
        example.enforcement.rate_limit_pps,
        defaults.enforcement.rate_limit_pps
    );
    assert_eq!(example.metrics.port, defaults.metrics.port);
}

// =============================================================================
// 부분 설정 테스트
// =============================================================================

#[test]
fn partial_config_classifier_only() {
    let toml = r#"
[classifier]
kind = "threshold"
fail_policy = "drop"
hysteresis_count = 1
"#;
    let config = FlowSentryConfig::parse(toml).expect("should parse");

    assert_eq!(
        config.classifier.parsed_fail_policy().expect("valid policy"),
        FailPolicy::Drop
    );
    assert_eq!(config.classifier.hysteresis_count, 1);
    // 다른 섹션은 기본값
    assert_eq!(config.flow.shard_count, 64);
    assert_eq!(config.enforcement.sink, "log");
}

#[test]
fn partial_config_two_sections() {
    let toml = r#"
[flow]
clock = "packet"

[enforcement]
sink = "jsonl"
output_path = "/tmp/decisions.jsonl"
"#;
    let config = FlowSentryConfig::parse(toml).expect("should parse");
    config.validate().expect("should be valid");

    assert_eq!(config.flow.clock, "packet");
    assert_eq!(config.enforcement.sink, "jsonl");
}

#[test]
fn jsonl_sink_without_path_fails_validation() {
    let toml = r#"
[enforcement]
sink = "jsonl"
"#;
    let config = FlowSentryConfig::parse(toml).expect("should parse");
    let err = config.validate().unwrap_err();
    assert!(matches!(
        err,
        FlowSentryError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "enforcement.output_path"
    ));
}

#[test]
fn unknown_clock_fails_validation() {
    let toml = r#"
[flow]
clock = "monotonic"
"#;
    let config = FlowSentryConfig::parse(toml).expect("should parse");
    assert!(config.validate().is_err());
}

#[test]
fn wrong_type_fails_parsing() {
    let toml = r#"
[flow]
shard_count = "many"
"#;
    let err = FlowSentryConfig::parse(toml).unwrap_err();
    assert!(matches!(
        err,
        FlowSentryError::Config(ConfigError::ParseFailed { .. })
    ));
}

// =============================================================================
// 환경변수 우선순위 테스트
// =============================================================================

#[test]
#[serial_test::serial]
fn env_override_takes_precedence_over_toml() {
    let toml = r#"
[general]
log_level = "info"
"#;

    let result = with_env("FLOWSENTRY_GENERAL_LOG_LEVEL", "error", || {
        let mut config = FlowSentryConfig::parse(toml).expect("should parse");
        config.apply_env_overrides();
        config.general.log_level
    });

    assert_eq!(result, "error");
}

#[test]
#[serial_test::serial]
fn env_override_fail_policy() {
    let result = with_env("FLOWSENTRY_CLASSIFIER_FAIL_POLICY", "drop", || {
        let mut config = FlowSentryConfig::parse("").expect("should parse");
        config.apply_env_overrides();
        config.classifier.parsed_fail_policy()
    });

    assert_eq!(result.expect("valid policy"), FailPolicy::Drop);
}

#[test]
#[serial_test::serial]
fn env_override_csv_for_protected_networks() {
    let result = with_env(
        "FLOWSENTRY_FLOW_PROTECTED_NETWORKS",
        "10.0.0.0/8, 2001:db8::/32",
        || {
            let mut config = FlowSentryConfig::parse("").expect("should parse");
            config.apply_env_overrides();
            config.flow.protected_networks
        },
    );

    assert_eq!(result, vec!["10.0.0.0/8", "2001:db8::/32"]);
}

#[test]
#[serial_test::serial]
fn env_override_numeric_field() {
    let result = with_env("FLOWSENTRY_FLOW_SHARD_COUNT", "128", || {
        let mut config = FlowSentryConfig::parse("").expect("should parse");
        config.apply_env_overrides();
        config.flow.shard_count
    });

    assert_eq!(result, 128);
}

#[test]
#[serial_test::serial]
fn env_override_float_field() {
    let result = with_env("FLOWSENTRY_CLASSIFIER_CONFIDENCE_THRESHOLD", "0.95", || {
        let mut config = FlowSentryConfig::parse("").expect("should parse");
        config.apply_env_overrides();
        config.classifier.confidence_threshold
    });

    assert!((result - 0.95).abs() < f64::EPSILON);
}

#[test]
#[serial_test::serial]
fn env_override_invalid_number_keeps_toml_value() {
    let toml = r#"
[flow]
shard_count = 16
"#;

    let result = with_env("FLOWSENTRY_FLOW_SHARD_COUNT", "lots", || {
        let mut config = FlowSentryConfig::parse(toml).expect("should parse");
        config.apply_env_overrides();
        config.flow.shard_count
    });

    assert_eq!(result, 16);
}

// =============================================================================
// 파일 로딩 테스트
// =============================================================================

#[tokio::test]
#[serial_test::serial]
async fn load_from_file_applies_validation() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "[flow]\nshard_count = 0").expect("write");

    let err = FlowSentryConfig::load(file.path()).await.unwrap_err();
    assert!(err.to_string().contains("shard_count"));
}

#[tokio::test]
#[serial_test::serial]
async fn load_from_file_succeeds_for_example() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(EXAMPLE.as_bytes()).expect("write");

    let config = FlowSentryConfig::load(file.path()).await.expect("should load");
    assert_eq!(config.classifier.kind, "threshold");
}
