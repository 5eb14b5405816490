//! 분류/집행 에러 타입
//!
//! [`ClassifierError`]와 [`EnforcementError`]는 각각 분류 파이프라인과
//! 집행 에미터 내부 에러를 표현합니다.
//! 두 타입 모두 `From<_> for FlowSentryError` 변환이 구현되어 있습니다.

use flowsentry_core::error::{ConfigError, FlowSentryError, PipelineError};
use flowsentry_core::pipeline::DeliveryError;

/// 분류 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// 모델 파일 로딩 실패
    #[error("model load error: {path}: {reason}")]
    ModelLoad {
        /// 모델 파일 경로
        path: String,
        /// 실패 사유
        reason: String,
    },

    /// 모델 특징 스키마 불일치
    #[error("feature schema mismatch: expected '{expected}', model has '{found}'")]
    SchemaMismatch {
        /// 엔진의 스키마 버전
        expected: String,
        /// 모델 파일의 스키마 버전
        found: String,
    },

    /// 지원하지 않는 모델 형식 버전
    #[error("unsupported model format version {version} (requires {requirement})")]
    UnsupportedFormat {
        /// 모델 파일의 형식 버전
        version: String,
        /// 지원 범위
        requirement: String,
    },

    /// 예측 실패
    #[error("prediction failed: {0}")]
    Prediction(String),

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),
}

impl From<ClassifierError> for FlowSentryError {
    fn from(err: ClassifierError) -> Self {
        match err {
            ClassifierError::Config { field, reason } => {
                FlowSentryError::Config(ConfigError::InvalidValue { field, reason })
            }
            ClassifierError::Channel(msg) => {
                FlowSentryError::Pipeline(PipelineError::ChannelSend(msg))
            }
            other => FlowSentryError::Classification(other.to_string()),
        }
    }
}

/// 집행 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum EnforcementError {
    /// 재시도 소진
    #[error("delivery to '{sink}' failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        /// 싱크 이름
        sink: String,
        /// 시도 횟수
        attempts: u32,
        /// 마지막 실패 사유
        reason: String,
    },

    /// 재시도 불가 실패
    #[error("delivery to '{sink}' failed permanently: {reason}")]
    Permanent {
        /// 싱크 이름
        sink: String,
        /// 실패 사유
        reason: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),
}

impl EnforcementError {
    /// 단일 전달 실패로부터 최종 에러를 만듭니다.
    pub fn from_delivery(sink: &str, attempts: u32, err: DeliveryError) -> Self {
        match err {
            DeliveryError::Permanent(reason) => Self::Permanent {
                sink: sink.to_owned(),
                reason,
            },
            DeliveryError::Transient(reason) => Self::RetriesExhausted {
                sink: sink.to_owned(),
                attempts,
                reason,
            },
        }
    }
}

impl From<EnforcementError> for FlowSentryError {
    fn from(err: EnforcementError) -> Self {
        match err {
            EnforcementError::Config { field, reason } => {
                FlowSentryError::Config(ConfigError::InvalidValue { field, reason })
            }
            EnforcementError::Channel(msg) => {
                FlowSentryError::Pipeline(PipelineError::ChannelSend(msg))
            }
            other => FlowSentryError::Enforcement(other.to_string()),
        }
    }
}
