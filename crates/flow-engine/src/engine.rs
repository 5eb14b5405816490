//! 플로우 엔진 -- 수집 워커, 스윕 태스크, 리플레이 캡처를 관리
//!
//! [`FlowEngine`]은 빌더 패턴([`FlowEngineBuilder`])으로 생성하며
//! [`Pipeline`] trait을 구현합니다.
//!
//! # 아키텍처
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ CaptureCtl / │──▶│ IngestHandle │──▶│ ingest worker ×N │──┐
//! │ ReplayCapture│   │ (hash(key))  │   │ (mpsc per queue) │  │
//! └──────────────┘   └──────────────┘   └──────────────────┘  ▼
//!                                                      ┌──────────────────┐
//!                         sweep task (interval) ──────▶│ LifecycleManager │──▶ FlowSink
//!                                                      │  + FlowTable     │
//!                                                      └──────────────────┘
//! ```
//!
//! # 캡처 감시
//! 수집 워커는 캡처 어태치가 성공한 뒤에만 시작합니다. 실행 중에는 스윕 주기마다
//! `is_up()`을 확인하여 상태가 바뀔 때 로그와 `flowsentry_flow_capture_up` 게이지를
//! 남기고, 캡처가 내려가 있는 동안 헬스는 `Degraded`입니다. 이미 큐에 들어온 패킷은
//! 캡처 상태와 무관하게 처리합니다.
//!
//! # 종료 순서
//! 캡처 감시 종료 → 캡처 디태치 → 취소 토큰 발동 → 워커가 자신의 큐를 비우고 종료
//! → 스윕 종료 → 남은 플로우 전부 `Shutdown`으로 확정
//!
//! # 사용 예시
//! ```ignore
//! let (mut engine, ingest) = FlowEngine::builder()
//!     .config(engine_config)
//!     .sink(classification_queue)
//!     .build()?;
//!
//! engine.start().await?;
//! ingest.send(packet).await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowsentry_core::error::{FlowSentryError, PipelineError};
use flowsentry_core::metrics as m;
use flowsentry_core::pipeline::{CaptureControl, FlowSink, HealthStatus, Pipeline};
use flowsentry_core::types::PacketDescriptor;

use crate::capture::ReplayCapture;
use crate::config::FlowEngineConfig;
use crate::error::FlowEngineError;
use crate::ingest::IngestHandle;
use crate::lifecycle::{LifecycleManager, LifecycleSnapshot};
use crate::table::FlowTable;

/// 테이블 사용률이 이 값을 넘으면 `Degraded`
const TABLE_PRESSURE_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Initialized,
    Running,
    Stopped,
}

/// 플로우 엔진
pub struct FlowEngine {
    config: FlowEngineConfig,
    state: EngineState,
    lifecycle: Arc<LifecycleManager>,
    capture: Option<Arc<dyn CaptureControl>>,
    replay: Option<Arc<ReplayCapture>>,
    ingest: IngestHandle,
    receivers: Vec<mpsc::Receiver<PacketDescriptor>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    watch_cancel: CancellationToken,
    watch_task: Option<JoinHandle<()>>,
    capture_down_events: Arc<AtomicU64>,
}

/// 캡처 상태 변화 감시
struct CaptureWatch {
    capture: Arc<dyn CaptureControl>,
    was_up: bool,
    down_events: Arc<AtomicU64>,
}

impl CaptureWatch {
    /// 현재 상태를 확인하고 바뀌었으면 기록합니다.
    fn poll(&mut self) {
        let up = self.capture.is_up();
        if up == self.was_up {
            return;
        }
        self.was_up = up;
        metrics::gauge!(m::FLOW_CAPTURE_UP).set(if up { 1.0 } else { 0.0 });
        if up {
            info!(capture = self.capture.name(), "capture is up again");
        } else {
            self.down_events.fetch_add(1, Ordering::Relaxed);
            warn!(
                capture = self.capture.name(),
                "capture went down, no new packets will arrive until it is re-attached"
            );
        }
    }
}

/// 플로우 엔진 빌더
///
/// `build()`는 `(FlowEngine, IngestHandle)` 튜플을 반환하여
/// 외부 캡처가 패킷을 공급할 수 있게 합니다.
pub struct FlowEngineBuilder {
    config: FlowEngineConfig,
    sink: Option<Arc<dyn FlowSink>>,
    capture: Option<Arc<dyn CaptureControl>>,
    replay: Option<Arc<ReplayCapture>>,
}

impl FlowEngineBuilder {
    fn new() -> Self {
        Self {
            config: FlowEngineConfig::default(),
            sink: None,
            capture: None,
            replay: None,
        }
    }

    /// 엔진 설정을 지정합니다.
    pub fn config(mut self, config: FlowEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 확정된 플로우를 받을 싱크를 지정합니다 (필수).
    pub fn sink(mut self, sink: Arc<dyn FlowSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 캡처 제어를 지정합니다.
    pub fn capture(mut self, capture: Arc<dyn CaptureControl>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// 리플레이 캡처를 지정합니다.
    ///
    /// 별도 캡처 제어가 없으면 리플레이 캡처가 캡처 제어를 겸합니다.
    pub fn replay(mut self, replay: Arc<ReplayCapture>) -> Self {
        self.replay = Some(replay);
        self
    }

    /// 엔진을 빌드합니다.
    ///
    /// # 에러
    /// - `FlowEngineError::Config`: 설정 검증 실패, 싱크 미지정
    pub fn build(self) -> Result<(FlowEngine, IngestHandle), FlowEngineError> {
        self.config.validate()?;
        let sink = self.sink.ok_or_else(|| FlowEngineError::Config {
            field: "sink".to_owned(),
            reason: "flow sink is required".to_owned(),
        })?;

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..self.config.ingest_workers)
            .map(|_| mpsc::channel(self.config.channel_capacity))
            .unzip();
        let ingest = IngestHandle::new(senders);

        let table = Arc::new(FlowTable::new(self.config.shard_count, self.config.max_flows));
        let lifecycle = Arc::new(LifecycleManager::new(table, sink, &self.config));

        let capture = self.capture.or_else(|| {
            self.replay
                .clone()
                .map(|replay| replay as Arc<dyn CaptureControl>)
        });

        let engine = FlowEngine {
            config: self.config,
            state: EngineState::Initialized,
            lifecycle,
            capture,
            replay: self.replay,
            ingest: ingest.clone(),
            receivers,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            watch_cancel: CancellationToken::new(),
            watch_task: None,
            capture_down_events: Arc::new(AtomicU64::new(0)),
        };
        Ok((engine, ingest))
    }
}

impl FlowEngine {
    /// 새 빌더를 생성합니다.
    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::new()
    }

    /// 엔진 설정
    pub fn config(&self) -> &FlowEngineConfig {
        &self.config
    }

    /// 현재 상태 이름
    pub fn state_name(&self) -> &'static str {
        match self.state {
            EngineState::Initialized => "initialized",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
        }
    }

    /// 생명주기 카운터 스냅샷
    pub fn counters(&self) -> LifecycleSnapshot {
        self.lifecycle.counters()
    }

    /// 플로우 테이블
    pub fn table(&self) -> &Arc<FlowTable> {
        self.lifecycle.table()
    }

    /// 생명주기 관리자
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// 수집 핸들 복제본
    pub fn ingest(&self) -> IngestHandle {
        self.ingest.clone()
    }

    /// 리플레이 캡처
    pub fn replay(&self) -> Option<&Arc<ReplayCapture>> {
        self.replay.as_ref()
    }

    /// 실행 중 캡처가 내려간 것을 감지한 횟수
    pub fn capture_down_events(&self) -> u64 {
        self.capture_down_events.load(Ordering::Relaxed)
    }

    fn spawn_ingest_workers(&mut self) {
        for (worker, rx) in self.receivers.drain(..).enumerate() {
            let lifecycle = Arc::clone(&self.lifecycle);
            let cancel = self.cancel.clone();
            self.tasks
                .push(tokio::spawn(ingest_worker(worker, rx, lifecycle, cancel)));
        }
    }

    fn spawn_sweeper(&mut self) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let cancel = self.cancel.clone();
        let period = self.config.sweep_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(interval_ms = period.as_millis() as u64, "sweep task started");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let now = lifecycle.now_us();
                        lifecycle.sweep(now);
                    }
                }
            }
            debug!("sweep task stopped");
        }));
    }

    fn spawn_capture_watch(&mut self) {
        let Some(capture) = self.capture.clone() else {
            return;
        };
        let mut watch = CaptureWatch {
            was_up: capture.is_up(),
            capture,
            down_events: Arc::clone(&self.capture_down_events),
        };
        metrics::gauge!(m::FLOW_CAPTURE_UP).set(if watch.was_up { 1.0 } else { 0.0 });
        let cancel = self.watch_cancel.clone();
        let period = self.config.sweep_interval;

        self.watch_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => watch.poll(),
                }
            }
        }));
    }

    fn spawn_replay(&mut self) {
        let Some(replay) = self.replay.clone() else {
            return;
        };
        let ingest = self.ingest.clone();
        let cancel = self.cancel.child_token();

        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = replay.run(ingest, cancel).await {
                error!(error = %e, path = %replay.path().display(), "replay failed");
            }
        }));
    }
}

/// 수집 워커: 취소될 때까지 큐에서 패킷을 받아 처리하고, 취소 후 남은 패킷을 비웁니다.
async fn ingest_worker(
    worker: usize,
    mut rx: mpsc::Receiver<PacketDescriptor>,
    lifecycle: Arc<LifecycleManager>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => {
                    lifecycle.process_packet(&packet);
                }
                None => break,
            },
        }
    }

    rx.close();
    let mut drained: u64 = 0;
    while let Ok(packet) = rx.try_recv() {
        lifecycle.process_packet(&packet);
        drained += 1;
    }
    debug!(worker, drained, "ingest worker stopped");
}

impl Pipeline for FlowEngine {
    async fn start(&mut self) -> Result<(), FlowSentryError> {
        if self.state == EngineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        if self.receivers.is_empty() {
            return Err(PipelineError::InitFailed(
                "flow engine cannot be restarted after stop".to_owned(),
            )
            .into());
        }

        if let Some(capture) = &self.capture {
            capture.attach()?;
            info!(capture = capture.name(), "capture attached");
        }

        self.cancel = CancellationToken::new();
        self.watch_cancel = CancellationToken::new();
        self.spawn_ingest_workers();
        self.spawn_sweeper();
        self.spawn_capture_watch();
        self.spawn_replay();

        self.state = EngineState::Running;
        info!(
            shards = self.table().shard_count(),
            max_flows = self.config.max_flows,
            workers = self.config.ingest_workers,
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            active_timeout_secs = self.config.active_timeout.as_secs(),
            clock = ?self.config.clock,
            "flow engine started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), FlowSentryError> {
        if self.state != EngineState::Running {
            return Err(PipelineError::NotRunning.into());
        }
        info!("stopping flow engine");

        // 디태치를 장애로 기록하지 않도록 감시를 먼저 종료
        self.watch_cancel.cancel();
        if let Some(task) = self.watch_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "capture watch join failed");
            }
        }
        if let Some(capture) = &self.capture {
            if let Err(e) = capture.detach() {
                warn!(capture = capture.name(), error = %e, "capture detach failed");
            }
        }

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "flow engine task join failed");
            }
        }

        let drained = self.lifecycle.drain_all();
        let counters = self.lifecycle.counters();
        self.state = EngineState::Stopped;
        info!(
            drained,
            packets = counters.packets,
            flows_finalized = counters.flows_finalized,
            table_full = counters.table_full,
            capture_down_events = self.capture_down_events(),
            "flow engine stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            EngineState::Running => {
                if let Some(capture) = self.capture.as_ref().filter(|c| !c.is_up()) {
                    return HealthStatus::Degraded(format!("capture '{}' down", capture.name()));
                }
                let utilization = self.table().len() as f64 / self.config.max_flows as f64;
                if utilization > TABLE_PRESSURE_RATIO {
                    HealthStatus::Degraded(format!(
                        "flow table utilization high: {:.1}%",
                        utilization * 100.0
                    ))
                } else {
                    HealthStatus::Healthy
                }
            }
            EngineState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            EngineState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}
