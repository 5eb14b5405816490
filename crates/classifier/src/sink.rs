//! 집행 싱크 구현
//!
//! [`EnforcementSink`]는 결정 하나를 한 번 전달합니다. 재시도는
//! [`EnforcementEmitter`](crate::enforcement::EnforcementEmitter)가 담당합니다.
//!
//! - [`LogSink`]: tracing 로그 기록
//! - [`JsonLinesSink`]: JSON lines 파일 추가
//! - [`ChannelSink`]: mpsc 채널 전달 (통합/테스트용)
//! - [`BlocklistSink`]: 메모리 내 차단 목록 (커널 맵 레이아웃과 동일한 키/값)

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use flowsentry_capture_common::{ACTION_DROP, ACTION_RATE_LIMIT, BlocklistKey, BlocklistValue};
use flowsentry_core::pipeline::{BoxFuture, DeliveryError, EnforcementSink};
use flowsentry_core::types::{EnforcementAction, EnforcementDecision, FlowKey};

use crate::config::{EmitterConfig, SinkKind};
use crate::error::EnforcementError;

// ─── LogSink ───

/// 결정을 로그로만 남기는 싱크
#[derive(Debug, Default)]
pub struct LogSink;

impl EnforcementSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver<'a>(
        &'a self,
        decision: &'a EnforcementDecision,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            info!(
                decision_id = %decision.id,
                flow = %decision.flow_key,
                action = %decision.action,
                ttl_secs = decision.ttl_secs,
                "enforcement decision"
            );
            Ok(())
        })
    }
}

// ─── JsonLinesSink ───

/// 결정을 JSON lines 파일에 추가하는 싱크
///
/// 파일은 첫 전달 시 열리며, 쓰기 실패 시 핸들을 버리고 다음 시도에서 다시 엽니다.
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
    /// 출력 경로로 싱크를 생성합니다.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    /// 출력 경로
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &[u8]) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            return Err(std::io::Error::other("output file unavailable"));
        };

        let result = async {
            file.write_all(line).await?;
            file.flush().await
        }
        .await;
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

impl EnforcementSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn deliver<'a>(
        &'a self,
        decision: &'a EnforcementDecision,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(decision)
                .map_err(|e| DeliveryError::Permanent(format!("serialize: {e}")))?;
            line.push(b'\n');
            self.append(&line).await.map_err(|e| {
                DeliveryError::Transient(format!("{}: {e}", self.path.display()))
            })
        })
    }
}

// ─── ChannelSink ───

/// 결정을 mpsc 채널로 넘기는 싱크
pub struct ChannelSink {
    tx: mpsc::Sender<EnforcementDecision>,
}

impl ChannelSink {
    /// 주어진 용량의 채널 싱크와 수신단을 생성합니다.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EnforcementDecision>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EnforcementSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    fn deliver<'a>(
        &'a self,
        decision: &'a EnforcementDecision,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            self.tx.try_send(decision.clone()).map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Transient("channel full".to_owned()),
                TrySendError::Closed(_) => DeliveryError::Permanent("channel closed".to_owned()),
            })
        })
    }
}

// ─── BlocklistSink ───

/// 차단 목록 정리를 시작하는 최소 엔트리 수
const BLOCKLIST_PURGE_MIN: usize = 1024;

/// 메모리 내 차단 목록 싱크
///
/// `Allow`는 엔트리를 제거하고, `Drop`/`RateLimit`은 만료 시각과 함께 기록합니다.
/// 엔트리 수가 정리 기준을 넘으면 삽입 시 만료된 엔트리를 함께 제거하며,
/// 기준은 정리 후 남은 엔트리 수의 두 배로 다시 잡습니다.
/// 만료된 엔트리는 제거되기 전이라도 조회되지 않습니다.
#[derive(Default)]
pub struct BlocklistSink {
    table: parking_lot::Mutex<BlocklistTable>,
}

#[derive(Default)]
struct BlocklistTable {
    entries: HashMap<BlocklistKey, BlocklistValue>,
    /// 이 수에 도달하면 다음 삽입에서 만료 엔트리를 정리
    purge_at: usize,
}

impl BlocklistTable {
    fn purge_expired(&mut self, now_secs: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now_secs));
        self.purge_at = (self.entries.len() * 2).max(BLOCKLIST_PURGE_MIN);
        before - self.entries.len()
    }

    fn insert(&mut self, key: BlocklistKey, value: BlocklistValue, now_secs: u64) {
        if self.entries.len() >= self.purge_at.max(BLOCKLIST_PURGE_MIN) {
            let purged = self.purge_expired(now_secs);
            debug!(purged, remaining = self.entries.len(), "blocklist expired entries purged");
        }
        self.entries.insert(key, value);
    }
}

impl BlocklistSink {
    /// 빈 차단 목록을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 플로우 키에 대한 만료되지 않은 엔트리를 조회합니다.
    pub fn lookup(&self, flow_key: &FlowKey) -> Option<BlocklistValue> {
        self.lookup_at(flow_key, unix_now_secs())
    }

    fn lookup_at(&self, flow_key: &FlowKey, now_secs: u64) -> Option<BlocklistValue> {
        self.table
            .lock()
            .entries
            .get(&blocklist_key(flow_key))
            .filter(|v| !v.is_expired(now_secs))
            .copied()
    }

    /// 만료된 엔트리를 제거하고 제거 수를 반환합니다.
    pub fn purge_expired(&self, now_secs: u64) -> usize {
        self.table.lock().purge_expired(now_secs)
    }

    /// 엔트리 수 (아직 정리되지 않은 만료 엔트리 포함)
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// 비었는지 여부
    pub fn is_empty(&self) -> bool {
        self.table.lock().entries.is_empty()
    }

    fn apply(&self, decision: &EnforcementDecision, now_secs: u64) {
        let key = blocklist_key(&decision.flow_key);
        let expires_at_secs = now_secs.saturating_add(decision.ttl_secs);
        let mut table = self.table.lock();
        match decision.action {
            EnforcementAction::Allow => {
                table.entries.remove(&key);
            }
            EnforcementAction::Drop => {
                table.insert(
                    key,
                    BlocklistValue {
                        expires_at_secs,
                        pps: 0,
                        action: ACTION_DROP,
                        _pad: [0; 3],
                    },
                    now_secs,
                );
            }
            EnforcementAction::RateLimit { pps } => {
                table.insert(
                    key,
                    BlocklistValue {
                        expires_at_secs,
                        pps,
                        action: ACTION_RATE_LIMIT,
                        _pad: [0; 3],
                    },
                    now_secs,
                );
            }
        }
    }
}

impl EnforcementSink for BlocklistSink {
    fn name(&self) -> &str {
        "blocklist"
    }

    fn deliver<'a>(
        &'a self,
        decision: &'a EnforcementDecision,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            self.apply(decision, unix_now_secs());
            Ok(())
        })
    }
}

/// 플로우 키를 차단 목록 키 레이아웃으로 변환합니다.
///
/// IPv4 주소는 앞 4바이트에 놓이고 나머지는 0입니다.
pub fn blocklist_key(flow_key: &FlowKey) -> BlocklistKey {
    BlocklistKey {
        low_ip: ip_octets(flow_key.low.ip),
        high_ip: ip_octets(flow_key.high.ip),
        low_port: flow_key.low.port,
        high_port: flow_key.high.port,
        protocol: flow_key.protocol,
        _pad: [0; 3],
    }
}

fn ip_octets(ip: IpAddr) -> [u8; 16] {
    let mut out = [0u8; 16];
    match ip {
        IpAddr::V4(v4) => out[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out = v6.octets(),
    }
    out
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 설정에 맞는 싱크를 생성합니다.
///
/// # 에러
/// - `EnforcementError::Config`: jsonl 싱크에 출력 경로가 없는 경우
pub fn build_sink(config: &EmitterConfig) -> Result<Arc<dyn EnforcementSink>, EnforcementError> {
    match config.sink {
        SinkKind::Log => Ok(Arc::new(LogSink)),
        SinkKind::Blocklist => Ok(Arc::new(BlocklistSink::new())),
        SinkKind::JsonLines => {
            let path = config
                .output_path
                .clone()
                .ok_or_else(|| EnforcementError::Config {
                    field: "output_path".to_owned(),
                    reason: "required for the jsonl sink".to_owned(),
                })?;
            Ok(Arc::new(JsonLinesSink::new(path)))
        }
    }
}
