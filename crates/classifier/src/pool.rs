//! 분류 파이프라인 -- 워커 풀, 데드라인, fail policy
//!
//! [`ClassificationPipeline`]은 [`ClassificationQueue`]에서 확정된 플로우를 꺼내
//! 분류기를 호출하고, 결정 정책을 거쳐 [`EmitterHandle`]로 결정을 넘깁니다.
//!
//! ```text
//! ClassificationQueue ──pop──▶ worker ×N
//!                                 │ in-flight permit (try_acquire, cap = workers)
//!                                 │ spawn_blocking(predict) + timeout(deadline)
//!                                 ├─ Ok        → ClassificationResult → DecisionPolicy
//!                                 └─ Err/timeout/saturated → fail policy
//!                                 ▼
//!                            EmitterHandle::emit
//! ```
//!
//! 확정된 플로우 하나당 분류 결과(또는 실패) 하나와 결정 하나가 정확히 만들어집니다.
//! 데드라인을 넘긴 예측은 blocking 스레드에서 끝까지 실행되지만 결과는 버려집니다.
//! 이때 예측은 in-flight 퍼밋을 반환할 때까지 쥐고 있으므로, 동시에 실행되는
//! `predict` 호출 수는 항상 `workers` 이하입니다. 퍼밋이 모두 사용 중이면
//! 분류기를 호출하지 않고 곧바로 fail policy(`kind = "saturated"`)를 적용합니다.
//!
//! 워크스페이스 프로파일은 `panic = "abort"`이므로 배포 바이너리에서 분류기 패닉은
//! 프로세스를 종료시킵니다. `JoinError`를 실패로 처리하는 경로는 패닉이 unwind되는
//! 환경(테스트 하니스 등)에서만 실행됩니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use flowsentry_core::error::{FlowSentryError, PipelineError};
use flowsentry_core::metrics as m;
use flowsentry_core::pipeline::{FlowClassifier, HealthStatus, Pipeline};
use flowsentry_core::types::{ClassificationResult, EnforcementDecision, FinalizedFlow};

use crate::config::ClassifierPipelineConfig;
use crate::enforcement::EmitterHandle;
use crate::error::ClassifierError;
use crate::policy::DecisionPolicy;
use crate::queue::ClassificationQueue;

/// 큐 사용률이 이 값을 넘으면 `Degraded`
const QUEUE_PRESSURE_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Initialized,
    Running,
    Stopped,
}

/// 분류 파이프라인 로컬 카운터
#[derive(Debug, Default)]
pub struct PoolCounters {
    classified: AtomicU64,
    malicious: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    saturated: AtomicU64,
    decisions: AtomicU64,
    emit_failures: AtomicU64,
}

/// 분류 파이프라인 카운터 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    /// 분류 성공 수
    pub classified: u64,
    /// 그중 악성 판정 수
    pub malicious: u64,
    /// 분류기 에러 수
    pub failures: u64,
    /// 데드라인 초과 수
    pub timeouts: u64,
    /// in-flight 퍼밋이 없어 분류기를 호출하지 못한 수
    pub saturated: u64,
    /// 생성된 결정 수
    pub decisions: u64,
    /// 에미터로 넘기지 못한 결정 수
    pub emit_failures: u64,
    /// 큐 overrun 수
    pub overruns: u64,
}

/// 워커가 공유하는 상태
struct WorkerContext {
    classifier: Arc<dyn FlowClassifier>,
    policy: DecisionPolicy,
    emitter: EmitterHandle,
    queue: Arc<ClassificationQueue>,
    counters: PoolCounters,
    /// 동시에 실행 중인 `predict` 호출 상한 (`workers`개)
    inflight: Arc<Semaphore>,
    config: ClassifierPipelineConfig,
}

/// 분류 시도 결과
enum Outcome {
    Classified(ClassificationResult),
    Failed { kind: &'static str, reason: String },
}

impl WorkerContext {
    async fn classify(&self, flow: &FinalizedFlow) -> Outcome {
        let Ok(permit) = Arc::clone(&self.inflight).try_acquire_owned() else {
            return Outcome::Failed {
                kind: "saturated",
                reason: format!(
                    "all {} prediction slots busy with overdue predictions",
                    self.config.workers
                ),
            };
        };

        let classifier = Arc::clone(&self.classifier);
        let features = flow.features.clone();
        let started = Instant::now();
        // 퍼밋은 데드라인과 무관하게 예측이 실제로 끝날 때 반환
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            classifier.predict(&features)
        });

        match tokio::time::timeout(self.config.deadline, task).await {
            Ok(Ok(Ok(prediction))) => {
                metrics::histogram!(m::CLASSIFIER_LATENCY_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                Outcome::Classified(ClassificationResult::from_prediction(flow.key, prediction))
            }
            Ok(Ok(Err(e))) => Outcome::Failed {
                kind: "error",
                reason: e.to_string(),
            },
            Ok(Err(join_error)) => Outcome::Failed {
                kind: "error",
                reason: ClassifierError::Prediction(format!("classifier task failed: {join_error}"))
                    .to_string(),
            },
            Err(_elapsed) => Outcome::Failed {
                kind: "timeout",
                reason: format!(
                    "deadline of {}ms exceeded",
                    self.config.deadline.as_millis()
                ),
            },
        }
    }

    async fn handle(&self, flow: FinalizedFlow) {
        let decision = match self.classify(&flow).await {
            Outcome::Classified(result) => {
                self.counters.classified.fetch_add(1, Ordering::Relaxed);
                if result.is_malicious {
                    self.counters.malicious.fetch_add(1, Ordering::Relaxed);
                }
                metrics::counter!(
                    m::CLASSIFIER_CLASSIFICATIONS_TOTAL,
                    m::LABEL_LABEL => result.label.clone()
                )
                .increment(1);
                self.policy.decide(&result)
            }
            Outcome::Failed { kind, reason } => {
                let counter = match kind {
                    "timeout" => &self.counters.timeouts,
                    "saturated" => &self.counters.saturated,
                    _ => &self.counters.failures,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::CLASSIFIER_FAILURES_TOTAL, m::LABEL_KIND => kind).increment(1);

                let decision = self.policy.fail_decision(flow.key);
                warn!(
                    flow = %flow.key,
                    kind,
                    reason = %reason,
                    action = %decision.action,
                    "classification failed, applying fail policy"
                );
                decision
            }
        };
        self.emit(decision).await;
    }

    async fn emit(&self, decision: EnforcementDecision) {
        self.counters.decisions.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.emitter.emit(decision).await {
            self.counters.emit_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "decision dropped");
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            classified: self.counters.classified.load(Ordering::Relaxed),
            malicious: self.counters.malicious.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            saturated: self.counters.saturated.load(Ordering::Relaxed),
            decisions: self.counters.decisions.load(Ordering::Relaxed),
            emit_failures: self.counters.emit_failures.load(Ordering::Relaxed),
            overruns: self.queue.overruns(),
        }
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>) {
    while let Some(flow) = ctx.queue.pop().await {
        ctx.handle(flow).await;
    }
}

/// 분류 파이프라인
pub struct ClassificationPipeline {
    state: PoolState,
    ctx: Arc<WorkerContext>,
    tasks: Vec<JoinHandle<()>>,
}

/// 분류 파이프라인 빌더
///
/// `build()`는 `(ClassificationPipeline, Arc<ClassificationQueue>)` 튜플을 반환하며,
/// 큐는 플로우 엔진의 [`FlowSink`](flowsentry_core::pipeline::FlowSink)로 연결합니다.
pub struct ClassificationPipelineBuilder {
    config: ClassifierPipelineConfig,
    classifier: Option<Arc<dyn FlowClassifier>>,
    emitter: Option<EmitterHandle>,
}

impl ClassificationPipelineBuilder {
    fn new() -> Self {
        Self {
            config: ClassifierPipelineConfig::default(),
            classifier: None,
            emitter: None,
        }
    }

    /// 파이프라인 설정을 지정합니다.
    pub fn config(mut self, config: ClassifierPipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// 분류기를 지정합니다. 지정하지 않으면 설정에 따라 생성합니다.
    pub fn classifier(mut self, classifier: Arc<dyn FlowClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// 결정을 넘길 에미터 핸들을 지정합니다 (필수).
    pub fn emitter(mut self, emitter: EmitterHandle) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// 파이프라인을 빌드합니다.
    ///
    /// # 에러
    /// - `ClassifierError::Config`: 설정 검증 실패, 에미터 미지정
    /// - 모델 로딩 에러 (분류기를 설정으로 생성하는 경우)
    pub fn build(
        self,
    ) -> Result<(ClassificationPipeline, Arc<ClassificationQueue>), ClassifierError> {
        self.config.validate()?;
        let emitter = self.emitter.ok_or_else(|| ClassifierError::Config {
            field: "emitter".to_owned(),
            reason: "enforcement emitter handle is required".to_owned(),
        })?;
        let classifier = match self.classifier {
            Some(classifier) => classifier,
            None => crate::classifier::build_classifier(&self.config)?,
        };

        let queue = Arc::new(ClassificationQueue::new(self.config.queue_capacity));
        let ctx = Arc::new(WorkerContext {
            classifier,
            policy: DecisionPolicy::new(&self.config),
            emitter,
            queue: Arc::clone(&queue),
            counters: PoolCounters::default(),
            inflight: Arc::new(Semaphore::new(self.config.workers)),
            config: self.config,
        });

        let pipeline = ClassificationPipeline {
            state: PoolState::Initialized,
            ctx,
            tasks: Vec::new(),
        };
        Ok((pipeline, queue))
    }
}

impl ClassificationPipeline {
    /// 빌더를 생성합니다.
    pub fn builder() -> ClassificationPipelineBuilder {
        ClassificationPipelineBuilder::new()
    }

    /// 카운터 스냅샷
    pub fn counters(&self) -> PoolSnapshot {
        self.ctx.snapshot()
    }

    /// 분류 큐
    pub fn queue(&self) -> &Arc<ClassificationQueue> {
        &self.ctx.queue
    }

    /// 결정 정책
    pub fn policy(&self) -> &DecisionPolicy {
        &self.ctx.policy
    }

    /// 사용 중인 분류기 이름
    pub fn classifier_name(&self) -> &str {
        self.ctx.classifier.name()
    }

    /// 현재 상태 이름
    pub fn state_name(&self) -> &'static str {
        match self.state {
            PoolState::Initialized => "initialized",
            PoolState::Running => "running",
            PoolState::Stopped => "stopped",
        }
    }
}

impl Pipeline for ClassificationPipeline {
    async fn start(&mut self) -> Result<(), FlowSentryError> {
        match self.state {
            PoolState::Running => return Err(PipelineError::AlreadyRunning.into()),
            PoolState::Stopped => {
                return Err(PipelineError::InitFailed(
                    "classification pipeline cannot be restarted after stop".to_owned(),
                )
                .into());
            }
            PoolState::Initialized => {}
        }

        for _ in 0..self.ctx.config.workers {
            self.tasks.push(tokio::spawn(worker_loop(Arc::clone(&self.ctx))));
        }

        self.state = PoolState::Running;
        info!(
            classifier = self.ctx.classifier.name(),
            workers = self.ctx.config.workers,
            queue_capacity = self.ctx.queue.capacity(),
            deadline_ms = u64::try_from(self.ctx.config.deadline.as_millis()).unwrap_or(u64::MAX),
            fail_policy = %self.ctx.config.fail_policy,
            hysteresis_count = self.ctx.config.hysteresis_count,
            "classification pipeline started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), FlowSentryError> {
        if self.state != PoolState::Running {
            return Err(PipelineError::NotRunning.into());
        }
        info!(pending = self.ctx.queue.len(), "stopping classification pipeline");

        // 닫힌 큐를 워커가 끝까지 비운 뒤 종료
        self.ctx.queue.close();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "classification worker join failed");
            }
        }

        let counters = self.ctx.snapshot();
        self.state = PoolState::Stopped;
        info!(
            classified = counters.classified,
            malicious = counters.malicious,
            failures = counters.failures,
            timeouts = counters.timeouts,
            saturated = counters.saturated,
            overruns = counters.overruns,
            "classification pipeline stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            PoolState::Running => {
                if self.ctx.emitter.is_closed() {
                    return HealthStatus::Unhealthy("enforcement emitter closed".to_owned());
                }
                let utilization = self.ctx.queue.len() as f64 / self.ctx.queue.capacity() as f64;
                if utilization > QUEUE_PRESSURE_RATIO {
                    HealthStatus::Degraded(format!(
                        "classification queue utilization high: {:.1}%",
                        utilization * 100.0
                    ))
                } else {
                    HealthStatus::Healthy
                }
            }
            PoolState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            PoolState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flowsentry_core::pipeline::FlowSink;
    use flowsentry_core::types::{
        Endpoint, EnforcementAction, FEATURE_COUNT, FailPolicy, FeatureVector, FinalizeReason,
        FlowKey, Prediction,
    };

    use crate::enforcement::EnforcementEmitter;
    use crate::sink::ChannelSink;

    use super::*;

    struct FixedClassifier(Prediction);

    impl FlowClassifier for FixedClassifier {
        fn name(&self) -> &str {
            "fixed"
        }
        fn predict(&self, _features: &FeatureVector) -> Result<Prediction, FlowSentryError> {
            Ok(self.0.clone())
        }
    }

    struct SlowClassifier;

    impl FlowClassifier for SlowClassifier {
        fn name(&self) -> &str {
            "slow"
        }
        fn predict(&self, _features: &FeatureVector) -> Result<Prediction, FlowSentryError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Prediction::benign(1.0))
        }
    }

    /// 동시에 실행 중인 `predict` 호출 수와 최댓값을 기록하는 느린 분류기
    #[derive(Default)]
    struct InFlightClassifier {
        current: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    impl FlowClassifier for InFlightClassifier {
        fn name(&self) -> &str {
            "in-flight"
        }
        fn predict(&self, _features: &FeatureVector) -> Result<Prediction, FlowSentryError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(500));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Prediction::benign(1.0))
        }
    }

    struct PanickingClassifier;

    impl FlowClassifier for PanickingClassifier {
        fn name(&self) -> &str {
            "panicking"
        }
        fn predict(&self, _features: &FeatureVector) -> Result<Prediction, FlowSentryError> {
            panic!("model crashed")
        }
    }

    fn flow(port: u16) -> FinalizedFlow {
        let a = Endpoint::new("203.0.113.7".parse().unwrap(), port);
        let b = Endpoint::new("10.10.0.5".parse().unwrap(), 443);
        FinalizedFlow {
            key: FlowKey::new(6, a, b),
            forward: a,
            generation: 1,
            reason: FinalizeReason::Fin,
            features: FeatureVector::new([0.0; FEATURE_COUNT]),
        }
    }

    async fn run(
        classifier: Arc<dyn FlowClassifier>,
        config: ClassifierPipelineConfig,
        flows: Vec<FinalizedFlow>,
    ) -> (PoolSnapshot, Vec<EnforcementDecision>) {
        let (sink, mut rx) = ChannelSink::new(1024);
        let (mut emitter, handle) = EnforcementEmitter::builder()
            .sink(Arc::new(sink))
            .build()
            .unwrap();
        let (mut pipeline, queue) = ClassificationPipeline::builder()
            .config(config)
            .classifier(classifier)
            .emitter(handle)
            .build()
            .unwrap();

        emitter.start().await.unwrap();
        pipeline.start().await.unwrap();
        for f in flows {
            queue.submit(f);
        }
        pipeline.stop().await.unwrap();
        emitter.stop().await.unwrap();

        let mut decisions = Vec::new();
        while let Ok(d) = rx.try_recv() {
            decisions.push(d);
        }
        (pipeline.counters(), decisions)
    }

    #[tokio::test]
    async fn one_decision_per_flow() {
        let classifier = Arc::new(FixedClassifier(Prediction::benign(0.99)));
        let flows = (1..=25).map(flow).collect();
        let (counters, decisions) = run(classifier, ClassifierPipelineConfig::default(), flows).await;

        assert_eq!(counters.classified, 25);
        assert_eq!(counters.decisions, 25);
        assert_eq!(decisions.len(), 25);
        assert!(decisions.iter().all(|d| d.action == EnforcementAction::Allow));
    }

    #[tokio::test]
    async fn malicious_streak_escalates() {
        let classifier = Arc::new(FixedClassifier(Prediction::malicious("Syn", 0.97)));
        let config = ClassifierPipelineConfig {
            workers: 1,
            hysteresis_count: 2,
            ..ClassifierPipelineConfig::default()
        };
        let (counters, decisions) = run(classifier, config, vec![flow(1), flow(2), flow(3)]).await;

        assert_eq!(counters.malicious, 3);
        let actions: Vec<_> = decisions.iter().map(|d| d.action).collect();
        assert_eq!(
            actions,
            vec![
                EnforcementAction::RateLimit { pps: 1000 },
                EnforcementAction::Drop,
                EnforcementAction::Drop,
            ]
        );
    }

    #[tokio::test]
    async fn deadline_exceeded_applies_fail_policy() {
        let config = ClassifierPipelineConfig {
            deadline: Duration::from_millis(10),
            fail_policy: FailPolicy::Drop,
            ..ClassifierPipelineConfig::default()
        };
        let (counters, decisions) = run(Arc::new(SlowClassifier), config, vec![flow(1)]).await;

        assert_eq!(counters.timeouts, 1);
        assert_eq!(counters.classified, 0);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, EnforcementAction::Drop);
    }

    #[tokio::test]
    async fn overdue_predictions_never_exceed_worker_count() {
        // Given: 워커 1개, 5ms 데드라인, 500ms 걸리는 분류기
        let classifier = Arc::new(InFlightClassifier::default());
        let config = ClassifierPipelineConfig {
            workers: 1,
            deadline: Duration::from_millis(5),
            fail_policy: FailPolicy::Drop,
            ..ClassifierPipelineConfig::default()
        };

        // When: 첫 예측이 끝나기 전에 플로우 20개를 모두 처리
        let flows = (1..=20).map(flow).collect();
        let (counters, decisions) =
            run(Arc::clone(&classifier) as Arc<dyn FlowClassifier>, config, flows).await;

        // Then: 동시 predict 호출은 1개를 넘지 않고 플로우마다 fail policy 결정이 하나씩
        assert!(classifier.peak.load(Ordering::SeqCst) <= 1);
        assert_eq!(decisions.len(), 20);
        assert!(decisions.iter().all(|d| d.action == EnforcementAction::Drop));
        assert_eq!(counters.classified, 0);
        assert!(counters.timeouts >= 1);
        assert!(counters.saturated >= 1);
        assert_eq!(counters.timeouts + counters.saturated, 20);
    }

    #[tokio::test]
    async fn panicking_classifier_counts_as_failure() {
        // 테스트 하니스는 패닉을 unwind하므로 JoinError 경로가 실행됨
        let (counters, decisions) = run(
            Arc::new(PanickingClassifier),
            ClassifierPipelineConfig::default(),
            vec![flow(1), flow(2)],
        )
        .await;

        assert_eq!(counters.failures, 2);
        assert!(decisions.iter().all(|d| d.action == EnforcementAction::Allow));
        assert_eq!(decisions.len(), 2);
    }

    #[tokio::test]
    async fn build_requires_emitter() {
        let result = ClassificationPipeline::builder()
            .classifier(Arc::new(FixedClassifier(Prediction::benign(1.0))))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn lifecycle_and_health() {
        let (sink, _rx) = ChannelSink::new(8);
        let (_emitter, handle) = EnforcementEmitter::builder()
            .sink(Arc::new(sink))
            .build()
            .unwrap();
        let (mut pipeline, _queue) = ClassificationPipeline::builder()
            .classifier(Arc::new(FixedClassifier(Prediction::benign(1.0))))
            .emitter(handle)
            .build()
            .unwrap();

        assert!(pipeline.health_check().await.is_unhealthy());
        pipeline.start().await.unwrap();
        assert!(pipeline.health_check().await.is_healthy());
        assert!(pipeline.start().await.is_err());
        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.state_name(), "stopped");
        assert!(pipeline.start().await.is_err());
    }
}
