//! 플로우 엔진 에러 타입
//!
//! [`FlowEngineError`]는 플로우 엔진 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<FlowEngineError> for FlowSentryError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

use flowsentry_core::error::{CaptureError, ConfigError, FlowSentryError, PipelineError};

/// 플로우 엔진 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum FlowEngineError {
    /// 플로우로 추적할 수 없는 패킷 (지원하지 않는 프로토콜, 잘못된 주소 등)
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// 플로우 테이블 포화
    #[error("flow table full: {max_flows} live flows")]
    TableFull {
        /// 최대 플로우 수
        max_flows: usize,
    },

    /// 캡처 소스 에러
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

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

impl From<FlowEngineError> for FlowSentryError {
    fn from(err: FlowEngineError) -> Self {
        match err {
            FlowEngineError::Capture(inner) => FlowSentryError::Capture(inner),
            FlowEngineError::Config { field, reason } => {
                FlowSentryError::Config(ConfigError::InvalidValue { field, reason })
            }
            FlowEngineError::Channel(msg) => {
                FlowSentryError::Pipeline(PipelineError::ChannelSend(msg))
            }
            other @ (FlowEngineError::Malformed(_) | FlowEngineError::TableFull { .. }) => {
                FlowSentryError::Pipeline(PipelineError::InitFailed(other.to_string()))
            }
        }
    }
}
