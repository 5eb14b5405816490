//! flowsentry-core: 공통 타입, trait, 에러, 설정
//!
//! 모든 flowsentry 크레이트가 공유하는 기반 계층입니다.
//!
//! ```text
//! capture ──▶ flow-engine ──▶ classifier ──▶ enforcement
//!   PacketDescriptor   FinalizedFlow   ClassificationResult   EnforcementDecision
//! ```
//!
//! - [`types`]: 패킷 디스크립터, 플로우 키, 특징 벡터, 분류/집행 타입
//! - [`pipeline`]: 모듈 생명주기 및 확장 포인트 trait
//! - [`config`]: `flowsentry.toml` 로딩과 검증
//! - [`error`]: 도메인별 에러 계층
//! - [`metrics`]: Prometheus 메트릭 이름 상수

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod types;

// --- 주요 타입 re-export ---

// 에러
pub use error::{CaptureError, ConfigError, FlowSentryError, PipelineError};

// 설정
pub use config::FlowSentryConfig;

// 파이프라인 trait
pub use pipeline::{
    BoxFuture, CaptureControl, DeliveryError, DynPipeline, EnforcementSink, FlowClassifier,
    FlowSink, HealthStatus, Pipeline,
};

// 도메인 타입
pub use types::{
    ClassificationResult, EnforcementAction, EnforcementDecision, Endpoint, EndpointPair,
    FEATURE_COUNT, FEATURE_NAMES, FEATURE_SCHEMA_VERSION, FailPolicy, FeatureVector,
    FinalizeReason, FinalizedFlow, FlowKey, PacketDescriptor, Prediction,
};
