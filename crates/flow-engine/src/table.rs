//! 샤딩된 플로우 테이블
//!
//! [`FlowTable`]은 정규화된 키 → [`FlowEntry`] 맵을 `shard_count`개의
//! `parking_lot::Mutex<HashMap>`으로 분할하여 보관합니다.
//!
//! # 동시성
//! - 같은 키에 대한 갱신은 [`FlowHandle`]이 쥔 샤드 락으로 직렬화됩니다.
//! - 서로 다른 샤드는 서로를 블로킹하지 않습니다.
//! - 만료 추출은 샤드별로 해당 샤드 락 안에서 수행되므로,
//!   엔트리를 제거한 호출자만 해당 세대를 소유합니다.
//!
//! # 용량
//! 전역 활성 플로우 수(`AtomicUsize`)가 `max_flows`에 도달하면 새 키는
//! `TableFull`로 거부됩니다. 기존 플로우는 삽입 압력으로 축출되지 않습니다.

use std::collections::HashMap;
use std::collections::hash_map::{Entry, RandomState};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use flowsentry_core::types::{Endpoint, FinalizeReason, FlowKey, PacketDescriptor};

use crate::accumulator::FlowAccumulator;
use crate::canonical::is_forward;
use crate::error::FlowEngineError;

/// 플로우 생명주기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// 활성
    Active,
    /// 한쪽 방향 FIN 관찰
    Terminating,
    /// 확정 완료
    ///
    /// 엔트리는 테이블에서 꺼낸 뒤에만 확정되므로 테이블 안의 엔트리가
    /// 이 상태를 갖는 일은 없습니다.
    Closed,
}

/// 테이블 엔트리 -- 한 플로우 세대
#[derive(Debug, Clone)]
pub struct FlowEntry {
    /// 누적 상태
    pub accumulator: FlowAccumulator,
    /// 세대 번호 (테이블 전역 단조 증가)
    pub generation: u64,
    /// 생명주기 상태
    pub state: FlowState,
}

impl FlowEntry {
    /// 새 세대 엔트리를 생성합니다.
    pub fn new(key: FlowKey, forward: Endpoint, generation: u64, packet: &PacketDescriptor) -> Self {
        let mut entry = Self {
            accumulator: FlowAccumulator::new(key, forward, packet),
            generation,
            state: FlowState::Active,
        };
        entry.state = entry.next_state();
        entry
    }

    /// FIN 관찰 여부로 다음 상태를 계산합니다.
    fn next_state(&self) -> FlowState {
        let acc = &self.accumulator;
        if acc.forward_stats().fin_seen || acc.backward_stats().fin_seen {
            FlowState::Terminating
        } else {
            self.state
        }
    }

    /// 패킷을 반영하고 상태를 전이합니다.
    ///
    /// 반영 후 확정이 필요하면 사유를 반환합니다 (RST, 양방향 FIN).
    pub fn apply(&mut self, packet: &PacketDescriptor, is_forward: bool) -> Option<FinalizeReason> {
        self.accumulator.update(packet, is_forward);
        self.state = self.next_state();
        self.termination()
    }

    /// 현재 누적 상태가 프로토콜 종료 조건을 만족하는지 확인합니다.
    pub fn termination(&self) -> Option<FinalizeReason> {
        if self.accumulator.flags().rst > 0 {
            Some(FinalizeReason::Rst)
        } else if self.accumulator.fin_seen_both() {
            Some(FinalizeReason::Fin)
        } else {
            None
        }
    }
}

type Shard = HashMap<FlowKey, FlowEntry>;

/// 샤딩된 플로우 테이블
pub struct FlowTable {
    shards: Box<[Mutex<Shard>]>,
    hasher: RandomState,
    live: AtomicUsize,
    max_flows: usize,
    next_generation: AtomicU64,
    latest_ts_us: AtomicU64,
}

impl FlowTable {
    /// 새 테이블을 생성합니다. `shard_count`는 최소 1로 보정됩니다.
    pub fn new(shard_count: usize, max_flows: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
            live: AtomicUsize::new(0),
            max_flows,
            next_generation: AtomicU64::new(1),
            latest_ts_us: AtomicU64::new(0),
        }
    }

    /// 샤드 수
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// 최대 플로우 수
    pub fn max_flows(&self) -> usize {
        self.max_flows
    }

    /// 키가 속한 샤드 인덱스
    pub fn shard_index(&self, key: &FlowKey) -> usize {
        (self.hasher.hash_one(key) % self.shards.len() as u64) as usize
    }

    /// 키의 샤드를 잠그고 핸들을 반환합니다.
    pub fn lock(&self, key: FlowKey) -> FlowHandle<'_> {
        let guard = self.shards[self.shard_index(&key)].lock();
        FlowHandle {
            table: self,
            guard,
            key,
        }
    }

    /// 키의 엔트리를 가져오거나 첫 패킷으로 생성합니다.
    ///
    /// # 에러
    /// - `FlowEngineError::TableFull`: 새 키인데 테이블이 가득 찬 경우
    pub fn get_or_create(
        &self,
        key: FlowKey,
        forward: Endpoint,
        first_packet: &PacketDescriptor,
    ) -> Result<FlowHandle<'_>, FlowEngineError> {
        let mut handle = self.lock(key);
        if handle.entry().is_none() {
            handle.create(forward, first_packet)?;
        }
        Ok(handle)
    }

    /// 엔트리를 제거합니다.
    pub fn remove(&self, key: &FlowKey) -> Option<FlowEntry> {
        self.lock(*key).remove()
    }

    /// 모든 활성 플로우의 스냅샷을 반환합니다 (샤드별로 잠금).
    pub fn snapshot(&self) -> Vec<(FlowKey, FlowAccumulator)> {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let guard = shard.lock();
            out.extend(
                guard
                    .iter()
                    .map(|(key, entry)| (*key, entry.accumulator.clone())),
            );
        }
        out
    }

    /// 만료된 엔트리를 샤드별로 추출합니다.
    ///
    /// 추출은 각 샤드 락 안에서 일어나므로 반환된 엔트리는 호출자가 단독 소유합니다.
    pub fn extract_expired(
        &self,
        now_us: u64,
        idle_us: u64,
        active_us: u64,
    ) -> Vec<(FlowEntry, FinalizeReason)> {
        let mut expired = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.lock();
            let keys: Vec<(FlowKey, FinalizeReason)> = guard
                .iter()
                .filter_map(|(key, entry)| {
                    entry
                        .accumulator
                        .expiry_reason(now_us, idle_us, active_us)
                        .map(|reason| (*key, reason))
                })
                .collect();
            for (key, reason) in keys {
                if let Some(entry) = guard.remove(&key) {
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    expired.push((entry, reason));
                }
            }
        }
        expired
    }

    /// 모든 엔트리를 제거하여 반환합니다.
    pub fn drain_all(&self) -> Vec<FlowEntry> {
        let mut drained = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let mut guard = shard.lock();
            let count = guard.len();
            drained.extend(guard.drain().map(|(_, entry)| entry));
            self.live.fetch_sub(count, Ordering::AcqRel);
        }
        drained
    }

    /// 활성 플로우 수
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// 비어 있는지 여부
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 관찰된 최대 패킷 타임스탬프
    pub fn latest_ts(&self) -> u64 {
        self.latest_ts_us.load(Ordering::Acquire)
    }

    /// 패킷 타임스탬프를 관찰합니다.
    pub fn observe_ts(&self, ts_us: u64) {
        self.latest_ts_us.fetch_max(ts_us, Ordering::AcqRel);
    }

    fn reserve_slot(&self) -> Result<(), FlowEngineError> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_flows).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| FlowEngineError::TableFull {
                max_flows: self.max_flows,
            })
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }
}

/// 한 키의 샤드 락을 쥔 핸들
///
/// 핸들이 살아 있는 동안 같은 샤드의 다른 키도 대기하므로,
/// 한 패킷 처리 범위를 넘어 보관하지 않아야 합니다.
pub struct FlowHandle<'a> {
    table: &'a FlowTable,
    guard: MutexGuard<'a, Shard>,
    key: FlowKey,
}

impl FlowHandle<'_> {
    /// 대상 키
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// 현재 엔트리
    pub fn entry(&self) -> Option<&FlowEntry> {
        self.guard.get(&self.key)
    }

    /// 현재 엔트리 (가변)
    pub fn entry_mut(&mut self) -> Option<&mut FlowEntry> {
        self.guard.get_mut(&self.key)
    }

    /// 엔트리에 패킷을 반영합니다. 엔트리가 없으면 `None`.
    pub fn update(&mut self, packet: &PacketDescriptor, source: &Endpoint) -> Option<Option<FinalizeReason>> {
        self.guard.get_mut(&self.key).map(|entry| {
            let forward = is_forward(source, entry.accumulator.forward());
            entry.apply(packet, forward)
        })
    }

    /// 첫 패킷으로 새 세대를 생성합니다.
    ///
    /// # 에러
    /// - `FlowEngineError::TableFull`: 테이블 용량 초과
    pub fn create(
        &mut self,
        forward: Endpoint,
        first_packet: &PacketDescriptor,
    ) -> Result<&mut FlowEntry, FlowEngineError> {
        match self.guard.entry(self.key) {
            Entry::Occupied(occupied) => Ok(occupied.into_mut()),
            Entry::Vacant(vacant) => {
                self.table.reserve_slot()?;
                let generation = self.table.next_generation();
                Ok(vacant.insert(FlowEntry::new(
                    self.key,
                    forward,
                    generation,
                    first_packet,
                )))
            }
        }
    }

    /// 엔트리를 제거합니다.
    pub fn remove(&mut self) -> Option<FlowEntry> {
        let removed = self.guard.remove(&self.key);
        if removed.is_some() {
            self.table.live.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }
}
