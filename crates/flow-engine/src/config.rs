//! 플로우 엔진 설정
//!
//! [`FlowEngineConfig`]는 core의 `[flow]`, `[capture]` 섹션을 결합하여
//! 엔진이 바로 사용할 수 있는 형태(Duration, 파싱된 CIDR)로 변환합니다.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ipnetwork::IpNetwork;

use flowsentry_core::config::{CaptureConfig, FlowConfig};

use crate::error::FlowEngineError;

/// 스윕 기준 시계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// 시스템 시각
    #[default]
    Wall,
    /// 관찰된 최대 패킷 타임스탬프 (리플레이용)
    Packet,
}

impl ClockSource {
    /// 설정 문자열을 파싱합니다.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "wall" => Some(Self::Wall),
            "packet" => Some(Self::Packet),
            _ => None,
        }
    }

    /// 현재 시각(마이크로초)을 반환합니다.
    ///
    /// `Packet` 시계는 `latest_packet_us`를 그대로 사용합니다.
    pub fn now_us(&self, latest_packet_us: u64) -> u64 {
        match self {
            Self::Wall => wall_clock_us(),
            Self::Packet => latest_packet_us,
        }
    }
}

/// 시스템 시각을 마이크로초로 반환합니다.
pub fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// 플로우 엔진 설정
#[derive(Debug, Clone)]
pub struct FlowEngineConfig {
    /// 플로우 테이블 샤드 수
    pub shard_count: usize,
    /// 최대 동시 플로우 수
    pub max_flows: usize,
    /// 유휴 타임아웃
    pub idle_timeout: Duration,
    /// 활성 타임아웃
    pub active_timeout: Duration,
    /// 스윕 주기
    pub sweep_interval: Duration,
    /// 스윕 기준 시계
    pub clock: ClockSource,
    /// 보호 대상 네트워크
    pub protected_networks: Vec<IpNetwork>,
    /// 수집 워커 수
    pub ingest_workers: usize,
    /// 워커당 채널 용량
    pub channel_capacity: usize,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self {
            shard_count: 64,
            max_flows: 1_000_000,
            idle_timeout: Duration::from_secs(120),
            active_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_millis(1000),
            clock: ClockSource::Wall,
            protected_networks: Vec::new(),
            ingest_workers: 4,
            channel_capacity: 4096,
        }
    }
}

impl FlowEngineConfig {
    /// core 설정 섹션에서 엔진 설정을 생성합니다.
    pub fn from_core(flow: &FlowConfig, capture: &CaptureConfig) -> Result<Self, FlowEngineError> {
        let clock = ClockSource::parse(&flow.clock).ok_or_else(|| FlowEngineError::Config {
            field: "flow.clock".to_owned(),
            reason: format!("unknown clock '{}'", flow.clock),
        })?;

        let protected_networks = flow
            .protected_networks
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNetwork>().map_err(|e| FlowEngineError::Config {
                    field: "flow.protected_networks".to_owned(),
                    reason: format!("invalid CIDR '{cidr}': {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            shard_count: flow.shard_count,
            max_flows: flow.max_flows,
            idle_timeout: Duration::from_secs(flow.idle_timeout_secs),
            active_timeout: Duration::from_secs(flow.active_timeout_secs),
            sweep_interval: Duration::from_millis(flow.sweep_interval_ms),
            clock,
            protected_networks,
            ingest_workers: capture.ingest_workers,
            channel_capacity: capture.channel_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// 설정값을 검증합니다.
    pub fn validate(&self) -> Result<(), FlowEngineError> {
        let checks = [
            ("shard_count", self.shard_count == 0),
            ("max_flows", self.max_flows == 0),
            ("idle_timeout", self.idle_timeout.is_zero()),
            ("sweep_interval", self.sweep_interval.is_zero()),
            ("ingest_workers", self.ingest_workers == 0),
            ("channel_capacity", self.channel_capacity == 0),
        ];
        for (field, is_zero) in checks {
            if is_zero {
                return Err(FlowEngineError::Config {
                    field: field.to_owned(),
                    reason: "must be greater than 0".to_owned(),
                });
            }
        }
        if self.active_timeout < self.idle_timeout {
            return Err(FlowEngineError::Config {
                field: "active_timeout".to_owned(),
                reason: "must be greater than or equal to idle_timeout".to_owned(),
            });
        }
        Ok(())
    }

    /// 유휴 타임아웃 (마이크로초)
    pub fn idle_timeout_us(&self) -> u64 {
        duration_us(self.idle_timeout)
    }

    /// 활성 타임아웃 (마이크로초)
    pub fn active_timeout_us(&self) -> u64 {
        duration_us(self.active_timeout)
    }
}

fn duration_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
