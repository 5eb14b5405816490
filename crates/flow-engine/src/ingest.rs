//! 수집 채널 핸들
//!
//! [`IngestHandle`]은 패킷을 정규화 키 해시로 수집 큐에 분배합니다.
//! 같은 플로우의 패킷은 항상 같은 큐로 가므로 플로우 내 순서가 보존됩니다.
//!
//! ```text
//! capture ──▶ IngestHandle ──hash(key) % N──▶ mpsc[i] ──▶ ingest worker i
//! ```

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use flowsentry_core::types::PacketDescriptor;

use crate::canonical::canonicalize;
use crate::error::FlowEngineError;

/// 수집 큐 송신 핸들 (복제 가능)
#[derive(Clone)]
pub struct IngestHandle {
    queues: Arc<[mpsc::Sender<PacketDescriptor>]>,
    hasher: RandomState,
}

impl IngestHandle {
    pub(crate) fn new(queues: Vec<mpsc::Sender<PacketDescriptor>>) -> Self {
        Self {
            queues: queues.into(),
            hasher: RandomState::new(),
        }
    }

    /// 수집 큐 수
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// 패킷이 배정될 큐 인덱스
    ///
    /// 플로우 대상이 아닌 패킷은 0번 큐로 보내 워커에서 집계합니다.
    pub fn queue_for(&self, packet: &PacketDescriptor) -> usize {
        match canonicalize(packet) {
            Ok((key, _)) => (self.hasher.hash_one(key) % self.queues.len() as u64) as usize,
            Err(_) => 0,
        }
    }

    /// 패킷을 전송합니다. 큐에 여유가 생길 때까지 대기합니다.
    ///
    /// # 에러
    /// - `FlowEngineError::Channel`: 수집 워커가 종료된 경우
    pub async fn send(&self, packet: PacketDescriptor) -> Result<(), FlowEngineError> {
        let index = self.queue_for(&packet);
        self.queues[index]
            .send(packet)
            .await
            .map_err(|_| FlowEngineError::Channel(format!("ingest queue {index} closed")))
    }

    /// 대기 없이 전송을 시도합니다.
    ///
    /// # 에러
    /// - `FlowEngineError::Channel`: 큐가 가득 찼거나 닫힌 경우
    pub fn try_send(&self, packet: PacketDescriptor) -> Result<(), FlowEngineError> {
        let index = self.queue_for(&packet);
        self.queues[index].try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => FlowEngineError::Channel(format!("ingest queue {index} full")),
            TrySendError::Closed(_) => {
                FlowEngineError::Channel(format!("ingest queue {index} closed"))
            }
        })
    }

    /// 모든 큐가 닫혔는지 여부
    pub fn is_closed(&self) -> bool {
        self.queues.iter().all(|q| q.is_closed())
    }
}
