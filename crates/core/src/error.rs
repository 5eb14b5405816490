//! 에러 타입 -- 도메인별 에러 정의
//!
//! 에러 분류:
//! - **일시적(Transient)**: 분류기 타임아웃, 집행 싱크 일시 장애 → 재시도 또는 fail-policy
//! - **용량(Capacity)**: 플로우 테이블 포화, 분류 큐 포화 → 거부/드롭 + 메트릭
//! - **잘못된 입력(Malformed)**: 파싱 불가 패킷 디스크립터 → 카운트 후 폐기
//! - **불변식 위반(Invariant)**: 디버그 빌드에서는 치명적, 릴리스에서는 로그 후 무시

/// flowsentry 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum FlowSentryError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 처리 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 캡처 제어 에러
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// 분류 에러
    #[error("classification error: {0}")]
    Classification(String),

    /// 집행 에러
    #[error("enforcement error: {0}")]
    Enforcement(String),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 파이프라인 처리 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 채널 전송 실패
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// 채널 수신 실패
    #[error("channel receive failed: {0}")]
    ChannelRecv(String),

    /// 파이프라인 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    /// 이미 실행 중
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline is not running")]
    NotRunning,
}

/// 캡처 제어 에러
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// 캡처 어태치 실패
    #[error("capture attach failed: {0}")]
    AttachFailed(String),

    /// 캡처 레코드 디코딩 실패
    #[error("capture record decode failed at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    /// 캡처 소스 읽기 실패
    #[error("capture source error: {0}")]
    Source(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_to_top_level() {
        let err: FlowSentryError = ConfigError::InvalidValue {
            field: "flow.shard_count".to_owned(),
            reason: "must be greater than 0".to_owned(),
        }
        .into();
        assert!(matches!(err, FlowSentryError::Config(_)));
        assert!(err.to_string().contains("flow.shard_count"));
    }

    #[test]
    fn capture_decode_error_display() {
        let err = CaptureError::Decode {
            offset: 48,
            reason: "truncated record".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("48"));
        assert!(msg.contains("truncated"));
    }

    #[test]
    fn pipeline_state_errors_display() {
        assert_eq!(
            PipelineError::AlreadyRunning.to_string(),
            "pipeline is already running"
        );
        assert_eq!(PipelineError::NotRunning.to_string(), "pipeline is not running");
    }
}
