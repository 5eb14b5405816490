//! flowsentry-flow-engine: 양방향 플로우 재구성과 특징 추출
//!
//! 패킷 디스크립터 스트림을 정규화된 양방향 플로우로 묶고,
//! 플로우가 끝나면 80차원 특징 벡터를 만들어 [`FlowSink`]로 넘깁니다.
//!
//! ```text
//! PacketDescriptor
//!   → canonical   (방향 무관 FlowKey)
//!   → table       (샤딩된 FlowTable, 키별 직렬화)
//!   → accumulator (O(1) 증분 통계)
//!   → lifecycle   (FIN/RST/타임아웃 → 정확히 한 번 확정)
//!   → features    (cic-ddos2019-v1 특징 벡터)
//!   → FlowSink
//! ```
//!
//! # 모듈 구성
//! - [`canonical`]: 플로우 키 정규화
//! - [`table`]: 샤딩된 플로우 테이블
//! - [`accumulator`], [`stats`]: 방향별 증분 통계 (Welford)
//! - [`lifecycle`]: 종료 감지, 만료 스윕, 드레인
//! - [`features`]: 80차원 특징 추출
//! - [`ingest`], [`capture`]: 수집 큐 분배와 리플레이 캡처
//! - [`engine`]: FlowEngine -- 워커/스윕 태스크 관리, Pipeline trait 구현
//!
//! [`FlowSink`]: flowsentry_core::pipeline::FlowSink

pub mod accumulator;
pub mod canonical;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod ingest;
pub mod lifecycle;
pub mod stats;
pub mod table;

// --- 주요 타입 re-export ---

// 엔진
pub use engine::{FlowEngine, FlowEngineBuilder};
pub use ingest::IngestHandle;

// 설정 / 에러
pub use config::{ClockSource, FlowEngineConfig};
pub use error::FlowEngineError;

// 플로우 상태
pub use accumulator::FlowAccumulator;
pub use lifecycle::{LifecycleManager, LifecycleSnapshot, PacketOutcome};
pub use table::{FlowEntry, FlowState, FlowTable};

// 특징
pub use features::FeatureExtractor;
pub use stats::RunningStats;

// 캡처
pub use capture::{NullCapture, ReplayCapture, ReplayFormat, ReplaySummary};

// 공유 타입 (캡처 레코드 레이아웃)
pub use flowsentry_capture_common;
