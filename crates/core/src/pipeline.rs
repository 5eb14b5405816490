//! 파이프라인 trait -- 모듈 생명주기와 확장 포인트 정의
//!
//! - [`Pipeline`] / [`DynPipeline`]: 데몬이 관리하는 모듈의 start/stop/health_check
//! - [`FlowSink`]: 확정된 플로우를 받는 쪽 (분류 큐)
//! - [`FlowClassifier`]: 특징 벡터 → 예측
//! - [`EnforcementSink`]: 집행 결정을 외부 필터링 계층으로 전달
//! - [`CaptureControl`]: 캡처 메커니즘 어태치/디태치/상태 조회

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, FlowSentryError};
use crate::types::{EnforcementDecision, FeatureVector, FinalizedFlow, Prediction};

/// 박싱된 Send future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 모듈 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// 정상
    Healthy,
    /// 성능 저하 (동작은 하지만 주의 필요)
    Degraded(String),
    /// 비정상
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 여부
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 비정상 여부
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

/// 모든 모듈이 구현하는 생명주기 trait
///
/// 구현체는 `async fn`으로 작성할 수 있습니다.
pub trait Pipeline: Send + Sync {
    /// 모듈을 시작합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), FlowSentryError>> + Send;

    /// 모듈을 정지합니다 (graceful).
    fn stop(&mut self) -> impl Future<Output = Result<(), FlowSentryError>> + Send;

    /// 현재 상태를 확인합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// trait object로 사용할 수 있는 [`Pipeline`]
///
/// 데몬의 모듈 레지스트리는 `Box<dyn DynPipeline>`으로 모듈을 보관합니다.
/// 모든 `Pipeline` 구현체에 blanket 구현이 제공됩니다.
pub trait DynPipeline: Send + Sync {
    /// 모듈을 시작합니다.
    fn start(&mut self) -> BoxFuture<'_, Result<(), FlowSentryError>>;

    /// 모듈을 정지합니다.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), FlowSentryError>>;

    /// 현재 상태를 확인합니다.
    fn health_check(&self) -> BoxFuture<'_, HealthStatus>;
}

impl<T: Pipeline> DynPipeline for T {
    fn start(&mut self) -> BoxFuture<'_, Result<(), FlowSentryError>> {
        Box::pin(Pipeline::start(self))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), FlowSentryError>> {
        Box::pin(Pipeline::stop(self))
    }

    fn health_check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(Pipeline::health_check(self))
    }
}

/// 확정된 플로우를 받는 싱크
///
/// 수집(ingestion) 경로에서 호출되므로 절대 블로킹하면 안 됩니다.
/// 용량이 부족하면 구현체가 자체 드롭 정책을 적용합니다.
pub trait FlowSink: Send + Sync {
    /// 확정된 플로우를 제출합니다.
    fn submit(&self, flow: FinalizedFlow);
}

/// 플로우 분류기
///
/// 규칙 기반, 통계 모델, 학습된 모델 등 구현에 무관하게
/// 파이프라인은 이 trait에만 의존합니다.
/// `predict`는 동기 함수이며 분류 워커의 blocking 스레드에서 호출됩니다.
pub trait FlowClassifier: Send + Sync {
    /// 분류기 이름
    fn name(&self) -> &str;

    /// 특징 벡터를 분류합니다.
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, FlowSentryError>;
}

/// 집행 결정 전달 실패 유형
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// 일시적 실패 (재시도 대상)
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// 영구 실패 (재시도하지 않음)
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// 집행 결정을 외부 필터링 계층으로 전달하는 싱크
pub trait EnforcementSink: Send + Sync {
    /// 싱크 이름
    fn name(&self) -> &str;

    /// 결정을 한 번 전달합니다 (재시도는 호출자가 담당).
    fn deliver<'a>(
        &'a self,
        decision: &'a EnforcementDecision,
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// 캡처 메커니즘 제어
///
/// 코어는 캡처 프로그램의 생명주기를 직접 관리하지 않으며,
/// 이 인터페이스로 수집 워커 실행 여부만 판단합니다.
pub trait CaptureControl: Send + Sync {
    /// 캡처 이름
    fn name(&self) -> &str;

    /// 캡처를 어태치합니다.
    fn attach(&self) -> Result<(), CaptureError>;

    /// 캡처를 디태치합니다.
    fn detach(&self) -> Result<(), CaptureError>;

    /// 캡처가 동작 중인지 여부
    fn is_up(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        running: bool,
    }

    impl Pipeline for Dummy {
        async fn start(&mut self) -> Result<(), FlowSentryError> {
            self.running = true;
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), FlowSentryError> {
            self.running = false;
            Ok(())
        }

        async fn health_check(&self) -> HealthStatus {
            if self.running {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy("stopped".to_owned())
            }
        }
    }

    #[tokio::test]
    async fn dyn_pipeline_delegates_to_pipeline() {
        let mut boxed: Box<dyn DynPipeline> = Box::new(Dummy { running: false });
        assert!(boxed.health_check().await.is_unhealthy());
        boxed.start().await.unwrap();
        assert!(boxed.health_check().await.is_healthy());
        boxed.stop().await.unwrap();
        assert!(boxed.health_check().await.is_unhealthy());
    }

    #[test]
    fn health_status_predicates() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Degraded("slow".to_owned()).is_healthy());
        assert!(!HealthStatus::Degraded("slow".to_owned()).is_unhealthy());
    }
}
