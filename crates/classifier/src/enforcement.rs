//! 집행 에미터 -- 결정을 싱크로 전달
//!
//! [`EnforcementEmitter`]는 용량 제한 mpsc 채널에서 결정을 꺼내
//! [`EnforcementSink`]로 전달하는 태스크를 소유합니다.
//!
//! ```text
//! EmitterHandle::emit ──mpsc──▶ delivery task ──deliver_with_retry──▶ EnforcementSink
//!                                    │ 일시적 실패: 선형 백오프 재시도
//!                                    └ 영구 실패 / 재시도 소진: 집계 + 로그
//! ```
//!
//! 전달 실패는 호출자에게 전파되지 않습니다. 종료 시 채널을 비운 뒤
//! 태스크가 끝납니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowsentry_core::error::{FlowSentryError, PipelineError};
use flowsentry_core::metrics as m;
use flowsentry_core::pipeline::{DeliveryError, EnforcementSink, HealthStatus, Pipeline};
use flowsentry_core::types::EnforcementDecision;

use crate::config::EmitterConfig;
use crate::error::EnforcementError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmitterState {
    Initialized,
    Running,
    Stopped,
}

/// 에미터 로컬 카운터
#[derive(Debug, Default)]
pub struct EmitterCounters {
    emitted: AtomicU64,
    delivered: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

/// 에미터 카운터 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmitterSnapshot {
    /// 채널에 들어간 결정 수
    pub emitted: u64,
    /// 전달 성공 수
    pub delivered: u64,
    /// 재시도 횟수
    pub retries: u64,
    /// 최종 실패 수
    pub failures: u64,
}

impl EmitterCounters {
    /// 현재 값을 읽습니다.
    pub fn snapshot(&self) -> EmitterSnapshot {
        EmitterSnapshot {
            emitted: self.emitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// 결정 송신 핸들 (복제 가능)
#[derive(Clone)]
pub struct EmitterHandle {
    tx: mpsc::Sender<EnforcementDecision>,
    counters: Arc<EmitterCounters>,
}

impl EmitterHandle {
    /// 결정을 전달 큐에 넣습니다. 채널 여유가 생길 때까지만 대기합니다.
    ///
    /// # 에러
    /// - `EnforcementError::Channel`: 에미터가 종료된 경우
    pub async fn emit(&self, decision: EnforcementDecision) -> Result<(), EnforcementError> {
        let action = decision.action.as_str();
        self.tx
            .send(decision)
            .await
            .map_err(|_| EnforcementError::Channel("enforcement emitter closed".to_owned()))?;
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::ENFORCEMENT_DECISIONS_TOTAL, m::LABEL_ACTION => action).increment(1);
        Ok(())
    }

    /// 에미터가 닫혔는지 여부
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 집행 에미터
pub struct EnforcementEmitter {
    config: EmitterConfig,
    state: EmitterState,
    sink: Arc<dyn EnforcementSink>,
    counters: Arc<EmitterCounters>,
    rx: Option<mpsc::Receiver<EnforcementDecision>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// 에미터 빌더
pub struct EnforcementEmitterBuilder {
    config: EmitterConfig,
    sink: Option<Arc<dyn EnforcementSink>>,
}

impl EnforcementEmitterBuilder {
    fn new() -> Self {
        Self {
            config: EmitterConfig::default(),
            sink: None,
        }
    }

    /// 에미터 설정을 지정합니다.
    pub fn config(mut self, config: EmitterConfig) -> Self {
        self.config = config;
        self
    }

    /// 전달 대상 싱크를 지정합니다 (필수).
    pub fn sink(mut self, sink: Arc<dyn EnforcementSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 에미터를 빌드합니다.
    ///
    /// # 에러
    /// - `EnforcementError::Config`: 설정 검증 실패, 싱크 미지정
    pub fn build(self) -> Result<(EnforcementEmitter, EmitterHandle), EnforcementError> {
        self.config.validate()?;
        let sink = self.sink.ok_or_else(|| EnforcementError::Config {
            field: "sink".to_owned(),
            reason: "enforcement sink is required".to_owned(),
        })?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let counters = Arc::new(EmitterCounters::default());
        let handle = EmitterHandle {
            tx,
            counters: Arc::clone(&counters),
        };
        let emitter = EnforcementEmitter {
            config: self.config,
            state: EmitterState::Initialized,
            sink,
            counters,
            rx: Some(rx),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        };
        Ok((emitter, handle))
    }
}

impl EnforcementEmitter {
    /// 빌더를 생성합니다.
    pub fn builder() -> EnforcementEmitterBuilder {
        EnforcementEmitterBuilder::new()
    }

    /// 카운터 스냅샷
    pub fn counters(&self) -> EmitterSnapshot {
        self.counters.snapshot()
    }

    /// 싱크 이름
    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// 현재 상태 이름
    pub fn state_name(&self) -> &'static str {
        match self.state {
            EmitterState::Initialized => "initialized",
            EmitterState::Running => "running",
            EmitterState::Stopped => "stopped",
        }
    }
}

async fn delivery_loop(
    mut rx: mpsc::Receiver<EnforcementDecision>,
    sink: Arc<dyn EnforcementSink>,
    config: EmitterConfig,
    counters: Arc<EmitterCounters>,
    cancel: CancellationToken,
) {
    loop {
        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(decision) => decision,
                None => break,
            },
        };
        deliver_and_record(sink.as_ref(), &config, &counters, &decision).await;
    }

    // 남은 결정을 비움
    rx.close();
    let mut drained = 0u64;
    while let Some(decision) = rx.recv().await {
        deliver_and_record(sink.as_ref(), &config, &counters, &decision).await;
        drained += 1;
    }
    debug!(drained, "enforcement delivery task stopped");
}

async fn deliver_and_record(
    sink: &dyn EnforcementSink,
    config: &EmitterConfig,
    counters: &EmitterCounters,
    decision: &EnforcementDecision,
) {
    match deliver_with_retry(sink, config, counters, decision).await {
        Ok(()) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::ENFORCEMENT_DELIVERIES_TOTAL).increment(1);
        }
        Err(e) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::ENFORCEMENT_FAILURES_TOTAL).increment(1);
            warn!(
                decision_id = %decision.id,
                flow = %decision.flow_key,
                action = %decision.action,
                error = %e,
                "enforcement decision not delivered"
            );
        }
    }
}

/// 결정 하나를 재시도와 함께 전달합니다.
///
/// 일시적 실패는 `max_retries`까지 `retry_backoff * attempt` 간격으로 재시도하며,
/// 각 시도는 `attempt_timeout`으로 제한됩니다. 영구 실패는 즉시 반환합니다.
///
/// # 에러
/// - `EnforcementError::Permanent`: 재시도 불가 실패
/// - `EnforcementError::RetriesExhausted`: 모든 시도 실패
pub async fn deliver_with_retry(
    sink: &dyn EnforcementSink,
    config: &EmitterConfig,
    counters: &EmitterCounters,
    decision: &EnforcementDecision,
) -> Result<(), EnforcementError> {
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff * attempt;
            counters.retries.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::ENFORCEMENT_RETRIES_TOTAL).increment(1);
            warn!(
                sink = sink.name(),
                decision_id = %decision.id,
                attempt = attempt,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "retrying enforcement delivery"
            );
            tokio::time::sleep(backoff).await;
        }

        match tokio::time::timeout(config.attempt_timeout, sink.deliver(decision)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(DeliveryError::Permanent(reason))) => {
                return Err(EnforcementError::Permanent {
                    sink: sink.name().to_owned(),
                    reason,
                });
            }
            Ok(Err(e)) => {
                last_error = Some(e);
            }
            Err(_elapsed) => {
                last_error = Some(DeliveryError::Transient("attempt timed out".to_owned()));
            }
        }
    }

    Err(EnforcementError::from_delivery(
        sink.name(),
        config.max_retries + 1,
        last_error.unwrap_or_else(|| DeliveryError::Transient("unknown error".to_owned())),
    ))
}

impl Pipeline for EnforcementEmitter {
    async fn start(&mut self) -> Result<(), FlowSentryError> {
        if self.state == EmitterState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        let rx = self.rx.take().ok_or_else(|| {
            PipelineError::InitFailed("enforcement emitter cannot be restarted after stop".to_owned())
        })?;

        self.cancel = CancellationToken::new();
        self.tasks.push(tokio::spawn(delivery_loop(
            rx,
            Arc::clone(&self.sink),
            self.config.clone(),
            Arc::clone(&self.counters),
            self.cancel.clone(),
        )));

        self.state = EmitterState::Running;
        info!(
            sink = self.sink.name(),
            max_retries = self.config.max_retries,
            retry_backoff_ms = u64::try_from(self.config.retry_backoff.as_millis()).unwrap_or(u64::MAX),
            "enforcement emitter started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), FlowSentryError> {
        if self.state != EmitterState::Running {
            return Err(PipelineError::NotRunning.into());
        }
        info!("stopping enforcement emitter");

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "enforcement task join failed");
            }
        }

        let counters = self.counters.snapshot();
        self.state = EmitterState::Stopped;
        info!(
            emitted = counters.emitted,
            delivered = counters.delivered,
            failures = counters.failures,
            "enforcement emitter stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            EmitterState::Running => {
                if self.tasks.iter().any(JoinHandle::is_finished) {
                    HealthStatus::Unhealthy("delivery task exited".to_owned())
                } else {
                    let c = self.counters.snapshot();
                    if c.failures > 0 && c.failures * 2 > c.delivered {
                        HealthStatus::Degraded(format!(
                            "{} of {} decisions failed delivery",
                            c.failures,
                            c.delivered + c.failures
                        ))
                    } else {
                        HealthStatus::Healthy
                    }
                }
            }
            EmitterState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            EmitterState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use flowsentry_core::pipeline::BoxFuture;
    use flowsentry_core::types::{EnforcementAction, Endpoint, FlowKey};

    use crate::sink::ChannelSink;

    use super::*;

    /// 처음 `failures`번은 일시적으로 실패하는 싱크
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        permanent: bool,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                permanent: false,
            }
        }
    }

    impl EnforcementSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        fn deliver<'a>(
            &'a self,
            _decision: &'a EnforcementDecision,
        ) -> BoxFuture<'a, Result<(), DeliveryError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if self.permanent {
                    Err(DeliveryError::Permanent("rejected".to_owned()))
                } else if call < self.failures {
                    Err(DeliveryError::Transient("unavailable".to_owned()))
                } else {
                    Ok(())
                }
            })
        }
    }

    /// 응답하지 않는 싱크
    struct HangingSink;

    impl EnforcementSink for HangingSink {
        fn name(&self) -> &str {
            "hanging"
        }

        fn deliver<'a>(
            &'a self,
            _decision: &'a EnforcementDecision,
        ) -> BoxFuture<'a, Result<(), DeliveryError>> {
            Box::pin(std::future::pending())
        }
    }

    fn decision() -> EnforcementDecision {
        let key = FlowKey::new(
            17,
            Endpoint::new("198.51.100.1".parse().unwrap(), 53),
            Endpoint::new("10.0.0.9".parse().unwrap(), 40000),
        );
        EnforcementDecision::new(key, EnforcementAction::Drop, 60)
    }

    fn fast_config(max_retries: u32) -> EmitterConfig {
        EmitterConfig {
            max_retries,
            retry_backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(50),
            ..EmitterConfig::default()
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sink = FlakySink::new(2);
        let counters = EmitterCounters::default();
        deliver_with_retry(&sink, &fast_config(3), &counters, &decision())
            .await
            .unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(counters.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let sink = FlakySink::new(u32::MAX);
        let counters = EmitterCounters::default();
        let err = deliver_with_retry(&sink, &fast_config(2), &counters, &decision())
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let sink = FlakySink {
            permanent: true,
            ..FlakySink::new(0)
        };
        let counters = EmitterCounters::default();
        let err = deliver_with_retry(&sink, &fast_config(5), &counters, &decision())
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::Permanent { .. }));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hanging_sink_times_out_each_attempt() {
        let counters = EmitterCounters::default();
        let err = deliver_with_retry(&HangingSink, &fast_config(1), &counters, &decision())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn emitter_delivers_and_drains_on_stop() {
        // Given
        let (sink, mut rx) = ChannelSink::new(64);
        let (mut emitter, handle) = EnforcementEmitter::builder()
            .config(fast_config(0))
            .sink(Arc::new(sink))
            .build()
            .unwrap();
        emitter.start().await.unwrap();

        // When
        for _ in 0..10 {
            handle.emit(decision()).await.unwrap();
        }
        emitter.stop().await.unwrap();

        // Then
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 10);
        let counters = emitter.counters();
        assert_eq!(counters.emitted, 10);
        assert_eq!(counters.delivered, 10);
        assert!(handle.emit(decision()).await.is_err());
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let (mut emitter, handle) = EnforcementEmitter::builder()
            .config(fast_config(1))
            .sink(Arc::new(FlakySink::new(u32::MAX)))
            .build()
            .unwrap();
        emitter.start().await.unwrap();

        handle.emit(decision()).await.unwrap();
        emitter.stop().await.unwrap();

        let counters = emitter.counters();
        assert_eq!(counters.failures, 1);
        assert_eq!(counters.retries, 1);
        assert_eq!(counters.delivered, 0);
    }

    #[tokio::test]
    async fn lifecycle_states() {
        let (mut emitter, _handle) = EnforcementEmitter::builder()
            .sink(Arc::new(FlakySink::new(0)))
            .build()
            .unwrap();
        assert!(emitter.health_check().await.is_unhealthy());
        assert!(emitter.stop().await.is_err());

        emitter.start().await.unwrap();
        assert!(emitter.start().await.is_err());
        assert!(emitter.health_check().await.is_healthy());

        emitter.stop().await.unwrap();
        assert_eq!(emitter.state_name(), "stopped");
        assert!(emitter.start().await.is_err());
    }

    #[test]
    fn build_requires_sink() {
        assert!(EnforcementEmitter::builder().build().is_err());
    }
}
