//! flowsentry-classifier: 플로우 분류, 결정 정책, 집행 결정 전달
//!
//! 플로우 엔진이 확정한 [`FinalizedFlow`]를 분류하고,
//! 히스테리시스 정책을 거쳐 [`EnforcementDecision`]을 싱크로 전달합니다.
//!
//! ```text
//! FlowSink(ClassificationQueue, drop-oldest)
//!   → ClassificationPipeline (worker ×N, spawn_blocking + deadline)
//!       → FlowClassifier (threshold | linear)
//!       → DecisionPolicy (streak per endpoint pair)
//!   → EmitterHandle → EnforcementEmitter (retry, backoff)
//!   → EnforcementSink (log | jsonl | channel | blocklist)
//! ```
//!
//! # 모듈 구성
//! - [`classifier`]: 임계값/선형 모델 분류기
//! - [`queue`]: 용량 제한 분류 큐
//! - [`policy`]: 히스테리시스 결정 정책
//! - [`pool`]: 분류 워커 풀 (Pipeline trait 구현)
//! - [`enforcement`]: 집행 에미터 (Pipeline trait 구현)
//! - [`sink`]: 집행 싱크 구현
//!
//! [`FinalizedFlow`]: flowsentry_core::types::FinalizedFlow
//! [`EnforcementDecision`]: flowsentry_core::types::EnforcementDecision

pub mod classifier;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod sink;

// --- 주요 타입 re-export ---

// 파이프라인
pub use enforcement::{EmitterHandle, EmitterSnapshot, EnforcementEmitter, EnforcementEmitterBuilder};
pub use pool::{ClassificationPipeline, ClassificationPipelineBuilder, PoolSnapshot};
pub use queue::ClassificationQueue;

// 설정 / 에러
pub use config::{ClassifierKind, ClassifierPipelineConfig, EmitterConfig, SinkKind};
pub use error::{ClassifierError, EnforcementError};

// 분류기 / 정책
pub use classifier::{
    LinearModel, LinearModelClassifier, ThresholdClassifier, ThresholdRules, build_classifier,
};
pub use policy::DecisionPolicy;

// 싱크
pub use sink::{BlocklistSink, ChannelSink, JsonLinesSink, LogSink, blocklist_key, build_sink};
