//! 플로우 생명주기 관리
//!
//! [`LifecycleManager`]는 패킷 반영, 종료 감지, 만료 스윕, 종료 시 드레인을 담당하며
//! 각 플로우 세대를 정확히 한 번 확정(finalize)합니다.
//!
//! # 상태 전이
//! ```text
//! Active ──FIN(한쪽)──▶ Terminating ──FIN(양쪽)──▶ Closed
//!   │                       │
//!   └──RST / timeout────────┴──────────────────────▶ Closed
//! ```
//!
//! 확정은 항상 샤드 락 안에서 엔트리를 제거한 호출자만 수행하며,
//! 특징 추출과 싱크 제출은 락 밖에서 이루어집니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, error, trace};

use flowsentry_core::metrics as m;
use flowsentry_core::pipeline::FlowSink;
use flowsentry_core::types::{FinalizeReason, FinalizedFlow, PacketDescriptor};

use crate::canonical::canonicalize;
use crate::config::{ClockSource, FlowEngineConfig};
use crate::error::FlowEngineError;
use crate::features::FeatureExtractor;
use crate::table::{FlowEntry, FlowState, FlowTable};

/// 패킷 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// 플로우 대상이 아님 (집계 후 폐기)
    NonFlow,
    /// 테이블 포화로 신규 플로우 거부
    Rejected,
    /// 기존 또는 새 플로우에 반영됨
    Tracked,
    /// 반영 후 해당 세대가 확정됨
    Finalized(FinalizeReason),
}

/// 생명주기 카운터
#[derive(Debug, Default)]
pub struct LifecycleCounters {
    packets: AtomicU64,
    non_flow: AtomicU64,
    flows_created: AtomicU64,
    flows_finalized: AtomicU64,
    evicted: AtomicU64,
    table_full: AtomicU64,
    invariant_violations: AtomicU64,
}

/// 카운터 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleSnapshot {
    /// 처리된 전체 패킷 수
    pub packets: u64,
    /// 플로우 대상이 아닌 패킷 수
    pub non_flow: u64,
    /// 생성된 플로우 세대 수
    pub flows_created: u64,
    /// 확정된 플로우 세대 수
    pub flows_finalized: u64,
    /// 타임아웃으로 축출된 수
    pub evicted: u64,
    /// 테이블 포화로 거부된 패킷 수
    pub table_full: u64,
    /// 불변식 위반 수
    pub invariant_violations: u64,
}

impl LifecycleCounters {
    /// 현재 값을 읽습니다.
    pub fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            non_flow: self.non_flow.load(Ordering::Relaxed),
            flows_created: self.flows_created.load(Ordering::Relaxed),
            flows_finalized: self.flows_finalized.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            table_full: self.table_full.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
        }
    }
}

/// 플로우 생명주기 관리자
pub struct LifecycleManager {
    table: Arc<FlowTable>,
    extractor: FeatureExtractor,
    sink: Arc<dyn FlowSink>,
    clock: ClockSource,
    idle_timeout_us: u64,
    active_timeout_us: u64,
    counters: LifecycleCounters,
}

impl LifecycleManager {
    /// 새 관리자를 생성합니다.
    pub fn new(table: Arc<FlowTable>, sink: Arc<dyn FlowSink>, config: &FlowEngineConfig) -> Self {
        Self {
            table,
            extractor: FeatureExtractor::new(config.protected_networks.clone()),
            sink,
            clock: config.clock,
            idle_timeout_us: config.idle_timeout_us(),
            active_timeout_us: config.active_timeout_us(),
            counters: LifecycleCounters::default(),
        }
    }

    /// 플로우 테이블
    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    /// 카운터 스냅샷
    pub fn counters(&self) -> LifecycleSnapshot {
        self.counters.snapshot()
    }

    /// 설정된 시계 기준 현재 시각 (마이크로초)
    pub fn now_us(&self) -> u64 {
        self.clock.now_us(self.table.latest_ts())
    }

    /// 패킷 하나를 처리합니다.
    ///
    /// 1. 정규화 실패 → `NonFlow`
    /// 2. 기존 엔트리가 패킷 시각 기준 만료 → 이전 세대 확정 후 새 세대 시작
    /// 3. 패킷 반영, RST/양방향 FIN이면 반영 후 확정
    pub fn process_packet(&self, packet: &PacketDescriptor) -> PacketOutcome {
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::FLOW_PACKETS_TOTAL).increment(1);

        let (key, source) = match canonicalize(packet) {
            Ok(pair) => pair,
            Err(err) => {
                self.counters.non_flow.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::FLOW_NON_FLOW_PACKETS_TOTAL).increment(1);
                trace!(error = %err, "non-flow packet discarded");
                return PacketOutcome::NonFlow;
            }
        };
        self.table.observe_ts(packet.ts_us);

        let mut expired: Option<(FlowEntry, FinalizeReason)> = None;
        let mut terminated: Option<(FlowEntry, FinalizeReason)> = None;
        let mut rejected = false;
        {
            let mut handle = self.table.lock(key);

            let stale = handle.entry().and_then(|entry| {
                entry.accumulator.expiry_reason(
                    packet.ts_us,
                    self.idle_timeout_us,
                    self.active_timeout_us,
                )
            });
            if let Some(reason) = stale {
                expired = handle.remove().map(|entry| (entry, reason));
            }

            let reason = if handle.entry().is_some() {
                handle.update(packet, &source).flatten()
            } else {
                match handle.create(source, packet) {
                    Ok(entry) => {
                        self.counters.flows_created.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(m::FLOW_CREATED_TOTAL).increment(1);
                        entry.termination()
                    }
                    Err(FlowEngineError::TableFull { .. }) => {
                        rejected = true;
                        None
                    }
                    Err(err) => {
                        error!(error = %err, "unexpected flow table error");
                        rejected = true;
                        None
                    }
                }
            };
            if let Some(reason) = reason {
                terminated = handle.remove().map(|entry| (entry, reason));
            }
        }

        if let Some((entry, reason)) = expired {
            self.finalize(entry, reason);
        }
        if rejected {
            self.counters.table_full.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::FLOW_TABLE_FULL_TOTAL).increment(1);
            debug!(flow = %key, "flow table full, packet not tracked");
            return PacketOutcome::Rejected;
        }
        self.update_live_gauge();
        match terminated {
            Some((entry, reason)) => {
                self.finalize(entry, reason);
                PacketOutcome::Finalized(reason)
            }
            None => PacketOutcome::Tracked,
        }
    }

    /// 만료된 플로우를 확정합니다. 확정된 세대 수를 반환합니다.
    pub fn sweep(&self, now_us: u64) -> usize {
        let expired = self
            .table
            .extract_expired(now_us, self.idle_timeout_us, self.active_timeout_us);
        let count = expired.len();
        for (entry, reason) in expired {
            self.finalize(entry, reason);
        }
        if count > 0 {
            debug!(finalized = count, live = self.table.len(), "sweep completed");
            self.update_live_gauge();
        }
        count
    }

    /// 모든 활성 플로우를 `Shutdown` 사유로 강제 확정합니다.
    pub fn drain_all(&self) -> usize {
        let drained = self.table.drain_all();
        let count = drained.len();
        for entry in drained {
            self.finalize(entry, FinalizeReason::Shutdown);
        }
        self.update_live_gauge();
        count
    }

    /// 테이블에서 제거된 엔트리를 확정합니다.
    ///
    /// 호출자는 엔트리를 단독 소유해야 합니다. 세대마다 한 번만 확정된다는 보장은
    /// 소유권에서 나옵니다: 확정 경로(도착 시 만료, RST/FIN, sweep, drain)는 모두
    /// 샤드 락 안에서 엔트리를 테이블에서 꺼낸 뒤 값으로 넘깁니다.
    /// 아래 `Closed` 검사는 이 경로 밖에서 만들어진 엔트리에 대한 방어적 검사이며
    /// 정상 경로에서는 도달하지 않습니다.
    pub(crate) fn finalize(&self, mut entry: FlowEntry, reason: FinalizeReason) {
        debug_assert_ne!(
            entry.state,
            FlowState::Closed,
            "flow generation finalized twice"
        );
        if entry.state == FlowState::Closed {
            self.counters
                .invariant_violations
                .fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::FLOW_INVARIANT_VIOLATIONS_TOTAL).increment(1);
            error!(
                flow = %entry.accumulator.key(),
                generation = entry.generation,
                "flow generation reached finalization twice, ignoring"
            );
            return;
        }
        entry.state = FlowState::Closed;

        self.counters.flows_finalized.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::FLOW_FINALIZED_TOTAL, m::LABEL_REASON => reason.as_str())
            .increment(1);
        if reason.is_eviction() {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::FLOW_EVICTED_TOTAL).increment(1);
        }

        let features = self.extractor.extract(&entry.accumulator);
        trace!(
            flow = %entry.accumulator.key(),
            generation = entry.generation,
            reason = reason.as_str(),
            packets = entry.accumulator.total_packets(),
            "flow finalized"
        );
        self.sink.submit(FinalizedFlow {
            key: *entry.accumulator.key(),
            forward: *entry.accumulator.forward(),
            generation: entry.generation,
            reason,
            features,
        });
    }

    fn update_live_gauge(&self) {
        metrics::gauge!(m::FLOW_LIVE).set(self.table.len() as f64);
    }
}
