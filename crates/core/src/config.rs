//! 설정 관리 -- flowsentry.toml 파싱 및 런타임 설정
//!
//! [`FlowSentryConfig`]는 모든 모듈의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`FLOWSENTRY_FLOW_SHARD_COUNT=128` 형식)
//! 3. 설정 파일 (`flowsentry.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), flowsentry_core::error::FlowSentryError> {
//! use flowsentry_core::config::FlowSentryConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = FlowSentryConfig::load("flowsentry.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = FlowSentryConfig::parse("[flow]\nshard_count = 128")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, FlowSentryError};
use crate::types::FailPolicy;

/// flowsentry 통합 설정
///
/// `flowsentry.toml` 파일의 최상위 구조를 나타냅니다.
/// 각 모듈은 자기 섹션만 읽어 사용합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSentryConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 패킷 캡처 소스 설정
    #[serde(default)]
    pub capture: CaptureConfig,
    /// 플로우 테이블 / 생명주기 설정
    #[serde(default)]
    pub flow: FlowConfig,
    /// 분류 파이프라인 설정
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// 집행 설정
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    /// 메트릭 노출 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl FlowSentryConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    ///
    /// 설정 로딩 순서:
    /// 1. TOML 파일 파싱
    /// 2. 환경변수 오버라이드 적용
    /// 3. 유효성 검증
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FlowSentryError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowSentryError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FlowSentryError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                FlowSentryError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, FlowSentryError> {
        toml::from_str(toml_str).map_err(|e| {
            FlowSentryError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `FLOWSENTRY_{SECTION}_{FIELD}`
    /// 예: `FLOWSENTRY_CLASSIFIER_FAIL_POLICY=drop`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "FLOWSENTRY_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "FLOWSENTRY_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "FLOWSENTRY_GENERAL_PID_FILE");

        // Capture
        override_bool(&mut self.capture.enabled, "FLOWSENTRY_CAPTURE_ENABLED");
        override_string(&mut self.capture.source, "FLOWSENTRY_CAPTURE_SOURCE");
        override_string(&mut self.capture.replay_path, "FLOWSENTRY_CAPTURE_REPLAY_PATH");
        override_usize(
            &mut self.capture.ingest_workers,
            "FLOWSENTRY_CAPTURE_INGEST_WORKERS",
        );
        override_usize(
            &mut self.capture.channel_capacity,
            "FLOWSENTRY_CAPTURE_CHANNEL_CAPACITY",
        );

        // Flow
        override_usize(&mut self.flow.shard_count, "FLOWSENTRY_FLOW_SHARD_COUNT");
        override_usize(&mut self.flow.max_flows, "FLOWSENTRY_FLOW_MAX_FLOWS");
        override_u64(
            &mut self.flow.idle_timeout_secs,
            "FLOWSENTRY_FLOW_IDLE_TIMEOUT_SECS",
        );
        override_u64(
            &mut self.flow.active_timeout_secs,
            "FLOWSENTRY_FLOW_ACTIVE_TIMEOUT_SECS",
        );
        override_u64(
            &mut self.flow.sweep_interval_ms,
            "FLOWSENTRY_FLOW_SWEEP_INTERVAL_MS",
        );
        override_string(&mut self.flow.clock, "FLOWSENTRY_FLOW_CLOCK");
        override_csv(
            &mut self.flow.protected_networks,
            "FLOWSENTRY_FLOW_PROTECTED_NETWORKS",
        );

        // Classifier
        override_string(&mut self.classifier.kind, "FLOWSENTRY_CLASSIFIER_KIND");
        override_string(
            &mut self.classifier.model_path,
            "FLOWSENTRY_CLASSIFIER_MODEL_PATH",
        );
        override_u64(
            &mut self.classifier.deadline_ms,
            "FLOWSENTRY_CLASSIFIER_DEADLINE_MS",
        );
        override_string(
            &mut self.classifier.fail_policy,
            "FLOWSENTRY_CLASSIFIER_FAIL_POLICY",
        );
        override_f64(
            &mut self.classifier.confidence_threshold,
            "FLOWSENTRY_CLASSIFIER_CONFIDENCE_THRESHOLD",
        );
        override_u32(
            &mut self.classifier.hysteresis_count,
            "FLOWSENTRY_CLASSIFIER_HYSTERESIS_COUNT",
        );
        override_u64(
            &mut self.classifier.hysteresis_ttl_secs,
            "FLOWSENTRY_CLASSIFIER_HYSTERESIS_TTL_SECS",
        );
        override_usize(
            &mut self.classifier.hysteresis_max_entries,
            "FLOWSENTRY_CLASSIFIER_HYSTERESIS_MAX_ENTRIES",
        );
        override_usize(&mut self.classifier.workers, "FLOWSENTRY_CLASSIFIER_WORKERS");
        override_usize(
            &mut self.classifier.queue_capacity,
            "FLOWSENTRY_CLASSIFIER_QUEUE_CAPACITY",
        );

        // Enforcement
        override_string(&mut self.enforcement.sink, "FLOWSENTRY_ENFORCEMENT_SINK");
        override_string(
            &mut self.enforcement.output_path,
            "FLOWSENTRY_ENFORCEMENT_OUTPUT_PATH",
        );
        override_u64(
            &mut self.enforcement.decision_ttl_secs,
            "FLOWSENTRY_ENFORCEMENT_DECISION_TTL_SECS",
        );
        override_u32(
            &mut self.enforcement.rate_limit_pps,
            "FLOWSENTRY_ENFORCEMENT_RATE_LIMIT_PPS",
        );
        override_u32(
            &mut self.enforcement.max_retries,
            "FLOWSENTRY_ENFORCEMENT_MAX_RETRIES",
        );
        override_u64(
            &mut self.enforcement.retry_backoff_ms,
            "FLOWSENTRY_ENFORCEMENT_RETRY_BACKOFF_MS",
        );
        override_u64(
            &mut self.enforcement.attempt_timeout_ms,
            "FLOWSENTRY_ENFORCEMENT_ATTEMPT_TIMEOUT_MS",
        );
        override_usize(
            &mut self.enforcement.channel_capacity,
            "FLOWSENTRY_ENFORCEMENT_CHANNEL_CAPACITY",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "FLOWSENTRY_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "FLOWSENTRY_METRICS_LISTEN_ADDR",
        );
        override_u16(&mut self.metrics.port, "FLOWSENTRY_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), FlowSentryError> {
        // general
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        // capture
        if self.capture.enabled {
            let valid_sources = ["replay-jsonl", "replay-raw", "none"];
            if !valid_sources.contains(&self.capture.source.as_str()) {
                return Err(invalid(
                    "capture.source",
                    format!("must be one of: {}", valid_sources.join(", ")),
                ));
            }
            if self.capture.source.starts_with("replay") && self.capture.replay_path.is_empty() {
                return Err(invalid(
                    "capture.replay_path",
                    "replay_path must not be empty for replay sources".to_owned(),
                ));
            }
        }
        if self.capture.ingest_workers == 0 {
            return Err(invalid("capture.ingest_workers", "must be greater than 0".to_owned()));
        }
        if self.capture.channel_capacity == 0 {
            return Err(invalid(
                "capture.channel_capacity",
                "must be greater than 0".to_owned(),
            ));
        }

        // flow
        if self.flow.shard_count == 0 {
            return Err(invalid("flow.shard_count", "must be greater than 0".to_owned()));
        }
        if self.flow.max_flows == 0 {
            return Err(invalid("flow.max_flows", "must be greater than 0".to_owned()));
        }
        if self.flow.idle_timeout_secs == 0 {
            return Err(invalid(
                "flow.idle_timeout_secs",
                "must be greater than 0".to_owned(),
            ));
        }
        if self.flow.active_timeout_secs < self.flow.idle_timeout_secs {
            return Err(invalid(
                "flow.active_timeout_secs",
                "must be greater than or equal to idle_timeout_secs".to_owned(),
            ));
        }
        if self.flow.sweep_interval_ms == 0 {
            return Err(invalid(
                "flow.sweep_interval_ms",
                "must be greater than 0".to_owned(),
            ));
        }
        let valid_clocks = ["wall", "packet"];
        if !valid_clocks.contains(&self.flow.clock.as_str()) {
            return Err(invalid(
                "flow.clock",
                format!("must be one of: {}", valid_clocks.join(", ")),
            ));
        }
        self.flow.parsed_protected_networks()?;

        // classifier
        let valid_kinds = ["threshold", "linear"];
        if !valid_kinds.contains(&self.classifier.kind.as_str()) {
            return Err(invalid(
                "classifier.kind",
                format!("must be one of: {}", valid_kinds.join(", ")),
            ));
        }
        if self.classifier.kind == "linear" && self.classifier.model_path.is_empty() {
            return Err(invalid(
                "classifier.model_path",
                "model_path is required for the linear classifier".to_owned(),
            ));
        }
        if self.classifier.deadline_ms == 0 {
            return Err(invalid(
                "classifier.deadline_ms",
                "must be greater than 0".to_owned(),
            ));
        }
        self.classifier.parsed_fail_policy()?;
        if !(0.0..=1.0).contains(&self.classifier.confidence_threshold) {
            return Err(invalid(
                "classifier.confidence_threshold",
                "must be within [0.0, 1.0]".to_owned(),
            ));
        }
        if self.classifier.hysteresis_count == 0 {
            return Err(invalid(
                "classifier.hysteresis_count",
                "must be at least 1 (1 disables hysteresis)".to_owned(),
            ));
        }
        if self.classifier.hysteresis_max_entries == 0 {
            return Err(invalid(
                "classifier.hysteresis_max_entries",
                "must be greater than 0".to_owned(),
            ));
        }
        if self.classifier.workers == 0 {
            return Err(invalid("classifier.workers", "must be greater than 0".to_owned()));
        }
        if self.classifier.queue_capacity == 0 {
            return Err(invalid(
                "classifier.queue_capacity",
                "must be greater than 0".to_owned(),
            ));
        }

        // enforcement
        let valid_sinks = ["log", "jsonl", "blocklist"];
        if !valid_sinks.contains(&self.enforcement.sink.as_str()) {
            return Err(invalid(
                "enforcement.sink",
                format!("must be one of: {}", valid_sinks.join(", ")),
            ));
        }
        if self.enforcement.sink == "jsonl" && self.enforcement.output_path.is_empty() {
            return Err(invalid(
                "enforcement.output_path",
                "output_path is required for the jsonl sink".to_owned(),
            ));
        }
        if self.enforcement.channel_capacity == 0 {
            return Err(invalid(
                "enforcement.channel_capacity",
                "must be greater than 0".to_owned(),
            ));
        }
        if self.enforcement.attempt_timeout_ms == 0 {
            return Err(invalid(
                "enforcement.attempt_timeout_ms",
                "must be greater than 0".to_owned(),
            ));
        }

        // metrics
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(invalid("metrics.port", "must be greater than 0".to_owned()));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> FlowSentryError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// PID 파일 경로 (빈 문자열이면 생성하지 않음)
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            pid_file: "/var/run/flowsentry.pid".to_owned(),
        }
    }
}

/// 패킷 캡처 소스 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 캡처 소스 (replay-jsonl, replay-raw, none)
    pub source: String,
    /// 리플레이 파일 경로
    pub replay_path: String,
    /// 수집 워커 수 (RX 큐 수)
    pub ingest_workers: usize,
    /// 워커당 패킷 채널 용량
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: "replay-jsonl".to_owned(),
            replay_path: String::new(),
            ingest_workers: 4,
            channel_capacity: 4096,
        }
    }
}

/// 플로우 테이블 / 생명주기 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// 플로우 테이블 샤드 수
    pub shard_count: usize,
    /// 최대 동시 플로우 수
    pub max_flows: usize,
    /// 유휴 타임아웃 (초)
    pub idle_timeout_secs: u64,
    /// 활성 타임아웃 (초)
    pub active_timeout_secs: u64,
    /// 스윕 주기 (밀리초)
    pub sweep_interval_ms: u64,
    /// 스윕 기준 시계 (wall, packet)
    pub clock: String,
    /// 보호 대상 네트워크 (CIDR) -- Inbound 특징 계산에 사용
    pub protected_networks: Vec<String>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            shard_count: 64,
            max_flows: 1_000_000,
            idle_timeout_secs: 120,
            active_timeout_secs: 1800,
            sweep_interval_ms: 1000,
            clock: "wall".to_owned(),
            protected_networks: Vec::new(),
        }
    }
}

impl FlowConfig {
    /// `protected_networks`를 CIDR로 파싱합니다.
    pub fn parsed_protected_networks(&self) -> Result<Vec<IpNetwork>, FlowSentryError> {
        self.protected_networks
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNetwork>().map_err(|e| {
                    invalid(
                        "flow.protected_networks",
                        format!("invalid CIDR '{cidr}': {e}"),
                    )
                })
            })
            .collect()
    }
}

/// 분류 파이프라인 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// 분류기 종류 (threshold, linear)
    pub kind: String,
    /// 모델 파일 경로 (linear 전용)
    pub model_path: String,
    /// 예측 데드라인 (밀리초)
    pub deadline_ms: u64,
    /// 장애 시 정책 (allow, drop)
    pub fail_policy: String,
    /// 악성 판정 최소 신뢰도
    pub confidence_threshold: f64,
    /// Drop으로 격상하기 위한 연속 악성 판정 횟수 (1 = 히스테리시스 없음)
    pub hysteresis_count: u32,
    /// 히스테리시스 카운터 만료 (초)
    pub hysteresis_ttl_secs: u64,
    /// 히스테리시스 맵 최대 엔트리 수
    pub hysteresis_max_entries: usize,
    /// 분류 워커 수
    pub workers: usize,
    /// 분류 큐 용량
    pub queue_capacity: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kind: "threshold".to_owned(),
            model_path: String::new(),
            deadline_ms: 50,
            fail_policy: "allow".to_owned(),
            confidence_threshold: 0.8,
            hysteresis_count: 3,
            hysteresis_ttl_secs: 300,
            hysteresis_max_entries: 100_000,
            workers: 4,
            queue_capacity: 10_000,
        }
    }
}

impl ClassifierConfig {
    /// `fail_policy` 문자열을 파싱합니다.
    pub fn parsed_fail_policy(&self) -> Result<FailPolicy, FlowSentryError> {
        FailPolicy::parse(&self.fail_policy).ok_or_else(|| {
            invalid(
                "classifier.fail_policy",
                "must be one of: allow, drop".to_owned(),
            )
        })
    }
}

/// 집행 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// 싱크 종류 (log, jsonl, blocklist)
    pub sink: String,
    /// jsonl 싱크 출력 경로
    pub output_path: String,
    /// 결정 유효 기간 (초)
    pub decision_ttl_secs: u64,
    /// 히스테리시스 미달 악성 플로우에 적용할 pps 제한 (0이면 Allow)
    pub rate_limit_pps: u32,
    /// 최대 재시도 횟수
    pub max_retries: u32,
    /// 재시도 백오프 기본 간격 (밀리초, 선형 증가)
    pub retry_backoff_ms: u64,
    /// 전달 시도당 타임아웃 (밀리초)
    pub attempt_timeout_ms: u64,
    /// 결정 채널 용량
    pub channel_capacity: usize,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            sink: "log".to_owned(),
            output_path: String::new(),
            decision_ttl_secs: 600,
            rate_limit_pps: 1000,
            max_retries: 3,
            retry_backoff_ms: 100,
            attempt_timeout_ms: 1000,
            channel_capacity: 1024,
        }
    }
}

/// 메트릭 노출 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 바인드 주소
    pub listen_addr: String,
    /// 포트
    pub port: u16,
    /// 엔드포인트 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    override_parsed(target, env_key, "bool");
}

fn override_usize(target: &mut usize, env_key: &str) {
    override_parsed(target, env_key, "usize");
}

fn override_u16(target: &mut u16, env_key: &str) {
    override_parsed(target, env_key, "u16");
}

fn override_u32(target: &mut u32, env_key: &str) {
    override_parsed(target, env_key, "u32");
}

fn override_u64(target: &mut u64, env_key: &str) {
    override_parsed(target, env_key, "u64");
}

fn override_f64(target: &mut f64, env_key: &str) {
    override_parsed(target, env_key, "f64");
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str, type_name: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = type_name,
                "failed to parse env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = FlowSentryConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.flow.shard_count, 64);
        assert_eq!(config.classifier.fail_policy, "allow");
        assert_eq!(config.enforcement.sink, "log");
        assert!(!config.capture.enabled);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn default_config_passes_validation() {
        FlowSentryConfig::default().validate().unwrap();
    }

    #[test]
    fn from_str_empty_toml_uses_defaults() {
        let config = FlowSentryConfig::parse("").unwrap();
        assert_eq!(config.flow.idle_timeout_secs, 120);
        assert_eq!(config.classifier.deadline_ms, 50);
    }

    #[test]
    fn from_str_partial_toml_merges_with_defaults() {
        let toml = r#"
[flow]
shard_count = 16
protected_networks = ["10.0.0.0/8"]

[classifier]
fail_policy = "drop"
"#;
        let config = FlowSentryConfig::parse(toml).unwrap();
        assert_eq!(config.flow.shard_count, 16);
        // max_flows는 기본값 유지
        assert_eq!(config.flow.max_flows, 1_000_000);
        assert_eq!(
            config.classifier.parsed_fail_policy().unwrap(),
            FailPolicy::Drop
        );
        assert_eq!(config.flow.parsed_protected_networks().unwrap().len(), 1);
    }

    #[test]
    fn from_str_invalid_toml_returns_error() {
        let err = FlowSentryConfig::parse("invalid = [[[toml").unwrap_err();
        assert!(matches!(
            err,
            FlowSentryError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_shards() {
        let mut config = FlowSentryConfig::default();
        config.flow.shard_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shard_count"));
    }

    #[test]
    fn validate_rejects_active_shorter_than_idle() {
        let mut config = FlowSentryConfig::default();
        config.flow.idle_timeout_secs = 60;
        config.flow.active_timeout_secs = 30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("active_timeout_secs"));
    }

    #[test]
    fn validate_rejects_unknown_fail_policy() {
        let mut config = FlowSentryConfig::default();
        config.classifier.fail_policy = "maybe".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fail_policy"));
    }

    #[test]
    fn validate_rejects_threshold_out_of_range() {
        let mut config = FlowSentryConfig::default();
        config.classifier.confidence_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));
    }

    #[test]
    fn validate_rejects_bad_cidr() {
        let mut config = FlowSentryConfig::default();
        config.flow.protected_networks = vec!["10.0.0.0/33".to_owned()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("protected_networks"));
    }

    #[test]
    fn validate_requires_model_for_linear() {
        let mut config = FlowSentryConfig::default();
        config.classifier.kind = "linear".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("model_path"));
    }

    #[test]
    fn validate_requires_replay_path_when_capture_enabled() {
        let mut config = FlowSentryConfig::default();
        config.capture.enabled = true;
        config.capture.source = "replay-jsonl".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("replay_path"));
    }

    #[test]
    fn validate_skips_capture_source_when_disabled() {
        let mut config = FlowSentryConfig::default();
        config.capture.enabled = false;
        config.capture.source = "pcap".to_owned();
        // 캡처가 비활성화 상태면 source 검증을 건너뜀
        config.validate().unwrap();
    }

    #[test]
    fn env_override_string() {
        let mut val = "original".to_owned();
        // SAFETY: 테스트는 단일 스레드에서 실행되므로 환경변수 조작이 안전합니다.
        unsafe { std::env::set_var("TEST_FLOWSENTRY_STR", "overridden") };
        override_string(&mut val, "TEST_FLOWSENTRY_STR");
        assert_eq!(val, "overridden");
        unsafe { std::env::remove_var("TEST_FLOWSENTRY_STR") };
    }

    #[test]
    fn env_override_f64_invalid_keeps_original() {
        let mut val = 0.8;
        // SAFETY: 테스트는 단일 스레드에서 실행되므로 환경변수 조작이 안전합니다.
        unsafe { std::env::set_var("TEST_FLOWSENTRY_F64_BAD", "high") };
        override_f64(&mut val, "TEST_FLOWSENTRY_F64_BAD");
        assert_eq!(val, 0.8);
        unsafe { std::env::remove_var("TEST_FLOWSENTRY_F64_BAD") };
    }

    #[test]
    fn env_override_csv_skips_empty_items() {
        let mut val = Vec::new();
        // SAFETY: 테스트는 단일 스레드에서 실행되므로 환경변수 조작이 안전합니다.
        unsafe { std::env::set_var("TEST_FLOWSENTRY_CSV", "10.0.0.0/8, ,192.168.0.0/16") };
        override_csv(&mut val, "TEST_FLOWSENTRY_CSV");
        assert_eq!(val, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        unsafe { std::env::remove_var("TEST_FLOWSENTRY_CSV") };
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = 7usize;
        override_usize(&mut val, "TEST_FLOWSENTRY_NONEXISTENT_12345");
        assert_eq!(val, 7);
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = FlowSentryConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = FlowSentryConfig::parse(&toml_str).unwrap();
        assert_eq!(config.flow.max_flows, parsed.flow.max_flows);
        assert_eq!(
            config.classifier.confidence_threshold,
            parsed.classifier.confidence_threshold
        );
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let err = FlowSentryConfig::from_file("/nonexistent/path/flowsentry.toml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlowSentryError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
