//! 분류 파이프라인 / 집행 에미터 설정
//!
//! core의 `[classifier]`, `[enforcement]` 섹션을 내부에서 바로 쓰는 형태
//! (Duration, 파싱된 [`FailPolicy`])로 변환합니다.
//!
//! # 사용 예시
//! ```ignore
//! use flowsentry_core::config::FlowSentryConfig;
//! use flowsentry_classifier::config::{ClassifierPipelineConfig, EmitterConfig};
//!
//! let core = FlowSentryConfig::default();
//! let pipeline = ClassifierPipelineConfig::from_core(&core.classifier, &core.enforcement)?;
//! let emitter = EmitterConfig::from_core(&core.enforcement)?;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use flowsentry_core::config::{ClassifierConfig, EnforcementConfig};
use flowsentry_core::types::FailPolicy;

use crate::error::{ClassifierError, EnforcementError};

/// 설정 상한값
const MAX_WORKERS: usize = 256;
const MAX_RETRIES: u32 = 10;

/// 분류기 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassifierKind {
    /// 규칙 기반 임계값 분류기
    #[default]
    Threshold,
    /// JSON 모델 파일을 읽는 로지스틱 선형 분류기
    Linear,
}

impl ClassifierKind {
    /// 설정 문자열을 파싱합니다.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "threshold" => Some(Self::Threshold),
            "linear" => Some(Self::Linear),
            _ => None,
        }
    }
}

/// 분류 파이프라인 설정
#[derive(Debug, Clone)]
pub struct ClassifierPipelineConfig {
    /// 분류기 종류
    pub kind: ClassifierKind,
    /// 모델 파일 경로 (linear 전용)
    pub model_path: Option<PathBuf>,
    /// 플로우당 예측 데드라인
    pub deadline: Duration,
    /// 분류기 장애 시 정책
    pub fail_policy: FailPolicy,
    /// 악성 판정 최소 신뢰도
    pub confidence_threshold: f64,
    /// Drop 격상까지 필요한 연속 악성 판정 수
    pub hysteresis_count: u32,
    /// 히스테리시스 카운터 만료
    pub hysteresis_ttl: Duration,
    /// 히스테리시스 맵 최대 엔트리 수
    pub hysteresis_max_entries: usize,
    /// 분류 워커 수
    pub workers: usize,
    /// 분류 큐 용량
    pub queue_capacity: usize,
    /// RateLimit 결정의 pps (0이면 Allow)
    pub rate_limit_pps: u32,
    /// 결정 유효 기간 (초)
    pub decision_ttl_secs: u64,
}

impl Default for ClassifierPipelineConfig {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::Threshold,
            model_path: None,
            deadline: Duration::from_millis(50),
            fail_policy: FailPolicy::Allow,
            confidence_threshold: 0.8,
            hysteresis_count: 3,
            hysteresis_ttl: Duration::from_secs(300),
            hysteresis_max_entries: 100_000,
            workers: 4,
            queue_capacity: 10_000,
            rate_limit_pps: 1000,
            decision_ttl_secs: 600,
        }
    }
}

impl ClassifierPipelineConfig {
    /// core 설정 섹션에서 파이프라인 설정을 생성합니다.
    ///
    /// # 에러
    /// - `ClassifierError::Config`: 알 수 없는 종류/정책 또는 범위를 벗어난 값
    pub fn from_core(
        classifier: &ClassifierConfig,
        enforcement: &EnforcementConfig,
    ) -> Result<Self, ClassifierError> {
        let kind = ClassifierKind::parse(&classifier.kind).ok_or_else(|| ClassifierError::Config {
            field: "classifier.kind".to_owned(),
            reason: format!("unknown classifier '{}'", classifier.kind),
        })?;
        let fail_policy =
            FailPolicy::parse(&classifier.fail_policy).ok_or_else(|| ClassifierError::Config {
                field: "classifier.fail_policy".to_owned(),
                reason: "must be one of: allow, drop".to_owned(),
            })?;

        let config = Self {
            kind,
            model_path: (!classifier.model_path.is_empty())
                .then(|| PathBuf::from(&classifier.model_path)),
            deadline: Duration::from_millis(classifier.deadline_ms),
            fail_policy,
            confidence_threshold: classifier.confidence_threshold,
            hysteresis_count: classifier.hysteresis_count,
            hysteresis_ttl: Duration::from_secs(classifier.hysteresis_ttl_secs),
            hysteresis_max_entries: classifier.hysteresis_max_entries,
            workers: classifier.workers,
            queue_capacity: classifier.queue_capacity,
            rate_limit_pps: enforcement.rate_limit_pps,
            decision_ttl_secs: enforcement.decision_ttl_secs,
        };
        config.validate()?;
        Ok(config)
    }

    /// 설정값을 검증합니다.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let invalid = |field: &str, reason: &str| ClassifierError::Config {
            field: field.to_owned(),
            reason: reason.to_owned(),
        };

        if self.deadline.is_zero() {
            return Err(invalid("deadline", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(invalid("confidence_threshold", "must be within [0.0, 1.0]"));
        }
        if self.hysteresis_count == 0 {
            return Err(invalid("hysteresis_count", "must be greater than 0"));
        }
        if self.hysteresis_max_entries == 0 {
            return Err(invalid("hysteresis_max_entries", "must be greater than 0"));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(invalid(
                "workers",
                &format!("must be between 1 and {MAX_WORKERS}"),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be greater than 0"));
        }
        if self.kind == ClassifierKind::Linear && self.model_path.is_none() {
            return Err(invalid("model_path", "required for the linear classifier"));
        }
        Ok(())
    }
}

/// 집행 싱크 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkKind {
    /// tracing 로그로만 기록
    #[default]
    Log,
    /// JSON lines 파일에 추가
    JsonLines,
    /// 메모리 내 차단 목록 갱신
    Blocklist,
}

impl SinkKind {
    /// 설정 문자열을 파싱합니다.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "log" => Some(Self::Log),
            "jsonl" => Some(Self::JsonLines),
            "blocklist" => Some(Self::Blocklist),
            _ => None,
        }
    }
}

/// 집행 에미터 설정
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// 싱크 종류
    pub sink: SinkKind,
    /// jsonl 출력 경로
    pub output_path: Option<PathBuf>,
    /// 최대 재시도 횟수 (첫 시도 제외)
    pub max_retries: u32,
    /// 재시도 백오프 기본 간격 (시도 번호만큼 선형 증가)
    pub retry_backoff: Duration,
    /// 전달 시도당 타임아웃
    pub attempt_timeout: Duration,
    /// 결정 채널 용량
    pub channel_capacity: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            output_path: None,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            attempt_timeout: Duration::from_millis(1000),
            channel_capacity: 1024,
        }
    }
}

impl EmitterConfig {
    /// core의 `[enforcement]` 섹션에서 에미터 설정을 생성합니다.
    ///
    /// # 에러
    /// - `EnforcementError::Config`: 알 수 없는 싱크 또는 범위를 벗어난 값
    pub fn from_core(enforcement: &EnforcementConfig) -> Result<Self, EnforcementError> {
        let sink = SinkKind::parse(&enforcement.sink).ok_or_else(|| EnforcementError::Config {
            field: "enforcement.sink".to_owned(),
            reason: format!("unknown sink '{}'", enforcement.sink),
        })?;

        let config = Self {
            sink,
            output_path: (!enforcement.output_path.is_empty())
                .then(|| PathBuf::from(&enforcement.output_path)),
            max_retries: enforcement.max_retries,
            retry_backoff: Duration::from_millis(enforcement.retry_backoff_ms),
            attempt_timeout: Duration::from_millis(enforcement.attempt_timeout_ms),
            channel_capacity: enforcement.channel_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// 설정값을 검증합니다.
    pub fn validate(&self) -> Result<(), EnforcementError> {
        let invalid = |field: &str, reason: String| EnforcementError::Config {
            field: field.to_owned(),
            reason,
        };

        if self.max_retries > MAX_RETRIES {
            return Err(invalid(
                "max_retries",
                format!("must be at most {MAX_RETRIES}"),
            ));
        }
        if self.attempt_timeout.is_zero() {
            return Err(invalid("attempt_timeout", "must be greater than 0".to_owned()));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("channel_capacity", "must be greater than 0".to_owned()));
        }
        if self.sink == SinkKind::JsonLines && self.output_path.is_none() {
            return Err(invalid(
                "output_path",
                "required for the jsonl sink".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_core_sections_convert() {
        let config = ClassifierPipelineConfig::from_core(
            &ClassifierConfig::default(),
            &EnforcementConfig::default(),
        )
        .unwrap();

        assert_eq!(config.kind, ClassifierKind::Threshold);
        assert_eq!(config.deadline, Duration::from_millis(50));
        assert_eq!(config.fail_policy, FailPolicy::Allow);
        assert_eq!(config.rate_limit_pps, 1000);
        assert!(config.model_path.is_none());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let core = ClassifierConfig {
            kind: "forest".to_owned(),
            ..ClassifierConfig::default()
        };
        let err = ClassifierPipelineConfig::from_core(&core, &EnforcementConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("forest"));
    }

    #[test]
    fn linear_requires_model_path() {
        let core = ClassifierConfig {
            kind: "linear".to_owned(),
            ..ClassifierConfig::default()
        };
        let err = ClassifierPipelineConfig::from_core(&core, &EnforcementConfig::default())
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Config { ref field, .. } if field == "model_path"));
    }

    #[test]
    fn zero_hysteresis_is_rejected() {
        let config = ClassifierPipelineConfig {
            hysteresis_count: 0,
            ..ClassifierPipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn fail_policy_drop_parses() {
        let core = ClassifierConfig {
            fail_policy: "drop".to_owned(),
            ..ClassifierConfig::default()
        };
        let config =
            ClassifierPipelineConfig::from_core(&core, &EnforcementConfig::default()).unwrap();
        assert_eq!(config.fail_policy, FailPolicy::Drop);
    }

    #[test]
    fn emitter_from_core_converts_units() {
        let core = EnforcementConfig {
            retry_backoff_ms: 250,
            attempt_timeout_ms: 2000,
            ..EnforcementConfig::default()
        };
        let config = EmitterConfig::from_core(&core).unwrap();
        assert_eq!(config.sink, SinkKind::Log);
        assert_eq!(config.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.attempt_timeout, Duration::from_secs(2));
    }

    #[test]
    fn jsonl_sink_requires_output_path() {
        let core = EnforcementConfig {
            sink: "jsonl".to_owned(),
            ..EnforcementConfig::default()
        };
        assert!(EmitterConfig::from_core(&core).is_err());
    }

    #[test]
    fn excessive_retries_rejected() {
        let config = EmitterConfig {
            max_retries: 50,
            ..EmitterConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
