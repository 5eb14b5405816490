//! 플로우 누적기 -- 패킷 단위 증분 통계
//!
//! [`FlowAccumulator`]는 한 플로우 세대의 모든 상태를 O(1) 메모리로 보관합니다.
//! 패킷 이력은 저장하지 않으며, 특징 추출에 필요한 값만 증분으로 갱신합니다.
//!
//! # 방향별 상태
//! ```text
//! FlowAccumulator
//!   ├── fwd: DirectionStats   (forward 엔드포인트가 보낸 패킷)
//!   ├── bwd: DirectionStats   (반대 방향)
//!   ├── length / iat          (플로우 전체 Welford)
//!   ├── flags                 (FIN/SYN/RST/PSH/ACK/URG/CWR/ECE)
//!   ├── subflow / active-idle
//!   └── payload_ring          (최근 16개 페이로드 패킷 방향)
//! ```

use flowsentry_capture_common::{
    PROTO_TCP, TCP_ACK, TCP_CWR, TCP_ECE, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN, TCP_URG,
};
use flowsentry_core::types::{Endpoint, FinalizeReason, FlowKey, PacketDescriptor};

use crate::stats::RunningStats;

/// 벌크로 인정하는 최소 연속 페이로드 패킷 수
pub const BULK_MIN_PACKETS: u64 = 4;
/// 벌크 내 패킷 간 최대 간격 (마이크로초)
pub const BULK_GAP_US: u64 = 1_000_000;
/// 서브플로우 경계 간격 (마이크로초)
pub const SUBFLOW_GAP_US: u64 = 1_000_000;
/// 활성/유휴 구분 임계값 (마이크로초)
pub const ACTIVITY_TIMEOUT_US: u64 = 5_000_000;

// =============================================================================
// 방향 링
// =============================================================================

/// 최근 16개 페이로드 패킷의 방향 비트마스크 (bit0 = 가장 최근, 1 = forward)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionRing {
    bits: u16,
    len: u8,
}

impl DirectionRing {
    const SLOTS: u8 = 16;

    /// 방향을 기록합니다.
    pub fn push(&mut self, forward: bool) {
        self.bits = (self.bits << 1) | u16::from(forward);
        if self.len < Self::SLOTS {
            self.len += 1;
        }
    }

    /// 가장 최근 기록의 방향 (비어 있으면 None)
    pub fn last(&self) -> Option<bool> {
        (self.len > 0).then_some(self.bits & 1 == 1)
    }

    /// 기록된 슬롯 수
    pub fn len(&self) -> u8 {
        self.len
    }

    /// 비어 있는지 여부
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// =============================================================================
// 벌크 상태
// =============================================================================

/// 한 방향의 벌크 전송 상태
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkState {
    /// 완료된 벌크 수
    pub bulk_count: u64,
    /// 벌크에 포함된 패킷 수
    pub packets: u64,
    /// 벌크에 포함된 페이로드 바이트
    pub bytes: u64,
    /// 벌크 지속 시간 합계 (마이크로초)
    pub duration_us: u64,
    helper_packets: u64,
    helper_bytes: u64,
    helper_start_us: u64,
    last_us: u64,
}

impl BulkState {
    /// 페이로드 패킷을 반영합니다.
    ///
    /// `interrupted`는 직전 페이로드 패킷이 반대 방향이었는지를 나타내며,
    /// 참이면 진행 중인 벌크 후보를 버리고 새로 시작합니다.
    pub fn observe(&mut self, ts_us: u64, payload: u64, interrupted: bool) {
        if payload == 0 {
            return;
        }
        if interrupted
            || self.helper_packets == 0
            || ts_us.saturating_sub(self.last_us) > BULK_GAP_US
        {
            self.helper_start_us = ts_us;
            self.helper_packets = 1;
            self.helper_bytes = payload;
            self.last_us = ts_us;
            return;
        }

        self.helper_packets += 1;
        self.helper_bytes += payload;
        if self.helper_packets == BULK_MIN_PACKETS {
            self.bulk_count += 1;
            self.packets += self.helper_packets;
            self.bytes += self.helper_bytes;
            self.duration_us += ts_us.saturating_sub(self.helper_start_us);
        } else if self.helper_packets > BULK_MIN_PACKETS {
            self.packets += 1;
            self.bytes += payload;
            self.duration_us += ts_us.saturating_sub(self.last_us);
        }
        self.last_us = ts_us;
    }
}

// =============================================================================
// 방향별 통계
// =============================================================================

/// 한 방향의 누적 통계
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectionStats {
    /// 패킷 수
    pub packets: u64,
    /// 바이트 수 (IP 길이 합)
    pub bytes: u64,
    /// 패킷 길이 통계
    pub length: RunningStats,
    /// 도착 간격 통계 (마이크로초)
    pub iat: RunningStats,
    /// 마지막 패킷 시각
    pub last_ts_us: Option<u64>,
    /// 전송 계층 헤더 바이트 합
    pub header_bytes: u64,
    /// PSH 플래그 패킷 수
    pub psh: u64,
    /// URG 플래그 패킷 수
    pub urg: u64,
    /// 첫 TCP 패킷의 윈도우
    pub init_window: Option<u16>,
    /// 페이로드가 있는 패킷 수
    pub payload_packets: u64,
    /// 최소 헤더 길이
    pub min_header_len: Option<u16>,
    /// FIN 관찰 여부
    pub fin_seen: bool,
    /// 벌크 상태
    pub bulk: BulkState,
}

impl DirectionStats {
    fn observe(&mut self, packet: &PacketDescriptor) {
        let ts = packet.ts_us;
        self.packets += 1;
        self.bytes += u64::from(packet.length);
        self.length.push(f64::from(packet.length));
        if let Some(last) = self.last_ts_us {
            self.iat.push(ts.saturating_sub(last) as f64);
        }
        self.last_ts_us = Some(ts.max(self.last_ts_us.unwrap_or(0)));
        self.header_bytes += u64::from(packet.header_len);
        self.min_header_len = Some(
            self.min_header_len
                .map_or(packet.header_len, |m| m.min(packet.header_len)),
        );

        if packet.protocol == PROTO_TCP {
            if self.init_window.is_none() {
                self.init_window = Some(packet.window);
            }
            if packet.tcp_flags & TCP_PSH != 0 {
                self.psh += 1;
            }
            if packet.tcp_flags & TCP_URG != 0 {
                self.urg += 1;
            }
            if packet.tcp_flags & TCP_FIN != 0 {
                self.fin_seen = true;
            }
        }
        if packet.payload_len() > 0 {
            self.payload_packets += 1;
        }
    }
}

/// TCP 플래그 카운트
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagCounts {
    /// FIN
    pub fin: u64,
    /// SYN
    pub syn: u64,
    /// RST
    pub rst: u64,
    /// PSH
    pub psh: u64,
    /// ACK
    pub ack: u64,
    /// URG
    pub urg: u64,
    /// CWR
    pub cwr: u64,
    /// ECE
    pub ece: u64,
}

impl FlagCounts {
    fn observe(&mut self, flags: u8) {
        for (bit, counter) in [
            (TCP_FIN, &mut self.fin),
            (TCP_SYN, &mut self.syn),
            (TCP_RST, &mut self.rst),
            (TCP_PSH, &mut self.psh),
            (TCP_ACK, &mut self.ack),
            (TCP_URG, &mut self.urg),
            (TCP_CWR, &mut self.cwr),
            (TCP_ECE, &mut self.ece),
        ] {
            if flags & bit != 0 {
                *counter += 1;
            }
        }
    }
}

// =============================================================================
// 플로우 누적기
// =============================================================================

/// 한 플로우 세대의 누적 상태
#[derive(Debug, Clone, PartialEq)]
pub struct FlowAccumulator {
    key: FlowKey,
    forward: Endpoint,
    first_seen_us: u64,
    last_seen_us: u64,
    fwd: DirectionStats,
    bwd: DirectionStats,
    length: RunningStats,
    iat: RunningStats,
    flags: FlagCounts,
    subflows: u64,
    active: RunningStats,
    idle: RunningStats,
    active_start_us: u64,
    active_end_us: u64,
    payload_ring: DirectionRing,
}

impl FlowAccumulator {
    /// 첫 패킷으로 새 누적기를 생성합니다.
    ///
    /// `forward`는 첫 패킷의 (정규화된) 출발지입니다. 첫 패킷도 집계됩니다.
    pub fn new(key: FlowKey, forward: Endpoint, first_packet: &PacketDescriptor) -> Self {
        let ts = first_packet.ts_us;
        let mut acc = Self {
            key,
            forward,
            first_seen_us: ts,
            last_seen_us: ts,
            fwd: DirectionStats::default(),
            bwd: DirectionStats::default(),
            length: RunningStats::new(),
            iat: RunningStats::new(),
            flags: FlagCounts::default(),
            subflows: 1,
            active: RunningStats::new(),
            idle: RunningStats::new(),
            active_start_us: ts,
            active_end_us: ts,
            payload_ring: DirectionRing::default(),
        };
        acc.update(first_packet, true);
        acc
    }

    /// 패킷을 반영합니다.
    pub fn update(&mut self, packet: &PacketDescriptor, is_forward: bool) {
        let ts = packet.ts_us;

        if self.total_packets() > 0 {
            let gap = ts.saturating_sub(self.last_seen_us);
            self.iat.push(gap as f64);
            if gap > SUBFLOW_GAP_US {
                self.subflows += 1;
            }
            self.update_active_idle(ts);
        }
        self.last_seen_us = self.last_seen_us.max(ts);
        self.length.push(f64::from(packet.length));
        if packet.protocol == PROTO_TCP {
            self.flags.observe(packet.tcp_flags);
        }

        let payload = u64::from(packet.payload_len());
        let interrupted = self.payload_ring.last() == Some(!is_forward);
        let dir = if is_forward {
            &mut self.fwd
        } else {
            &mut self.bwd
        };
        dir.observe(packet);
        if payload > 0 {
            dir.bulk.observe(ts, payload, interrupted);
            self.payload_ring.push(is_forward);
        }
    }

    fn update_active_idle(&mut self, ts: u64) {
        if ts.saturating_sub(self.active_end_us) > ACTIVITY_TIMEOUT_US {
            let active = self.active_end_us.saturating_sub(self.active_start_us);
            if active > 0 {
                self.active.push(active as f64);
            }
            self.idle.push(ts.saturating_sub(self.active_end_us) as f64);
            self.active_start_us = ts;
            self.active_end_us = ts;
        } else {
            self.active_end_us = self.active_end_us.max(ts);
        }
    }

    /// 주어진 시각 기준 만료 사유를 반환합니다.
    ///
    /// 활성 타임아웃이 유휴 타임아웃보다 우선합니다.
    pub fn expiry_reason(&self, now_us: u64, idle_us: u64, active_us: u64) -> Option<FinalizeReason> {
        if now_us.saturating_sub(self.first_seen_us) > active_us {
            Some(FinalizeReason::ActiveTimeout)
        } else if now_us.saturating_sub(self.last_seen_us) > idle_us {
            Some(FinalizeReason::IdleTimeout)
        } else {
            None
        }
    }

    /// 플로우 키
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// 정방향 엔드포인트 (첫 패킷의 출발지)
    pub fn forward(&self) -> &Endpoint {
        &self.forward
    }

    /// 정방향 목적지 엔드포인트
    pub fn destination(&self) -> Endpoint {
        self.key.peer_of(&self.forward)
    }

    /// 첫 패킷 시각
    pub fn first_seen_us(&self) -> u64 {
        self.first_seen_us
    }

    /// 마지막 패킷 시각
    pub fn last_seen_us(&self) -> u64 {
        self.last_seen_us
    }

    /// 플로우 지속 시간 (마이크로초)
    pub fn duration_us(&self) -> u64 {
        self.last_seen_us.saturating_sub(self.first_seen_us)
    }

    /// 전체 패킷 수
    pub fn total_packets(&self) -> u64 {
        self.fwd.packets + self.bwd.packets
    }

    /// 정방향 통계
    pub fn forward_stats(&self) -> &DirectionStats {
        &self.fwd
    }

    /// 역방향 통계
    pub fn backward_stats(&self) -> &DirectionStats {
        &self.bwd
    }

    /// 플로우 전체 패킷 길이 통계
    pub fn length_stats(&self) -> &RunningStats {
        &self.length
    }

    /// 플로우 전체 도착 간격 통계
    pub fn iat_stats(&self) -> &RunningStats {
        &self.iat
    }

    /// TCP 플래그 카운트
    pub fn flags(&self) -> &FlagCounts {
        &self.flags
    }

    /// 서브플로우 수 (최소 1)
    pub fn subflows(&self) -> u64 {
        self.subflows
    }

    /// 유휴 구간 통계
    pub fn idle_stats(&self) -> &RunningStats {
        &self.idle
    }

    /// 종료 시점까지의 활성 구간 통계 (진행 중인 활성 구간 포함)
    pub fn active_stats_at_close(&self) -> RunningStats {
        let mut stats = self.active;
        let current = self.active_end_us.saturating_sub(self.active_start_us);
        if current > 0 {
            stats.push(current as f64);
        }
        stats
    }

    /// 양방향 모두 FIN이 관찰되었는지 여부
    pub fn fin_seen_both(&self) -> bool {
        self.fwd.fin_seen && self.bwd.fin_seen
    }

    /// 최근 페이로드 패킷 방향 링
    pub fn payload_ring(&self) -> &DirectionRing {
        &self.payload_ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsentry_capture_common::PROTO_UDP;

    fn ep(ip: &str, port: u16) -> Endpoint {
        Endpoint::new(ip.parse().unwrap(), port)
    }

    fn pkt(ts: u64, from_client: bool, length: u32, flags: u8) -> PacketDescriptor {
        let (src, dst) = if from_client {
            (ep("10.0.0.1", 40000), ep("10.0.0.2", 80))
        } else {
            (ep("10.0.0.2", 80), ep("10.0.0.1", 40000))
        };
        PacketDescriptor {
            ts_us: ts,
            protocol: PROTO_TCP,
            src_ip: src.ip,
            src_port: src.port,
            dst_ip: dst.ip,
            dst_port: dst.port,
            length,
            tcp_flags: flags,
            header_len: 40,
            window: if from_client { 64240 } else { 65535 },
        }
    }

    fn new_acc(first: &PacketDescriptor) -> FlowAccumulator {
        let key = FlowKey::new(first.protocol, first.source(), first.destination());
        FlowAccumulator::new(key, first.source(), first)
    }

    #[test]
    fn first_packet_is_counted_forward() {
        let first = pkt(1_000, true, 60, TCP_SYN);
        let acc = new_acc(&first);

        assert_eq!(acc.forward_stats().packets, 1);
        assert_eq!(acc.backward_stats().packets, 0);
        assert_eq!(acc.flags().syn, 1);
        assert_eq!(acc.forward_stats().init_window, Some(64240));
        assert_eq!(acc.backward_stats().init_window, None);
        assert_eq!(acc.duration_us(), 0);
        assert_eq!(acc.subflows(), 1);
    }

    #[test]
    fn directions_and_iat_are_tracked() {
        let mut acc = new_acc(&pkt(0, true, 60, TCP_SYN));
        acc.update(&pkt(100, false, 60, TCP_SYN | TCP_ACK), false);
        acc.update(&pkt(300, true, 52, TCP_ACK), true);

        assert_eq!(acc.forward_stats().packets, 2);
        assert_eq!(acc.backward_stats().packets, 1);
        assert_eq!(acc.iat_stats().count(), 2);
        assert_eq!(acc.iat_stats().mean(), 150.0);
        assert_eq!(acc.forward_stats().iat.sum(), 300.0);
        assert_eq!(acc.duration_us(), 300);
        assert_eq!(acc.flags().ack, 2);
    }

    #[test]
    fn fin_in_both_directions_is_detected() {
        let mut acc = new_acc(&pkt(0, true, 60, TCP_SYN));
        acc.update(&pkt(10, true, 52, TCP_FIN | TCP_ACK), true);
        assert!(!acc.fin_seen_both());
        acc.update(&pkt(20, false, 52, TCP_FIN | TCP_ACK), false);
        assert!(acc.fin_seen_both());
    }

    #[test]
    fn bulk_requires_four_consecutive_payload_packets() {
        // 헤더 40 + 페이로드 100
        let mut acc = new_acc(&pkt(0, true, 140, TCP_ACK));
        for i in 1..4 {
            acc.update(&pkt(i * 1_000, true, 140, TCP_ACK), true);
        }
        let bulk = acc.forward_stats().bulk;
        assert_eq!(bulk.bulk_count, 1);
        assert_eq!(bulk.packets, 4);
        assert_eq!(bulk.bytes, 400);
        assert_eq!(bulk.duration_us, 3_000);

        // 다섯 번째 패킷은 같은 벌크를 연장
        acc.update(&pkt(4_000, true, 140, TCP_ACK), true);
        let bulk = acc.forward_stats().bulk;
        assert_eq!(bulk.bulk_count, 1);
        assert_eq!(bulk.packets, 5);
        assert_eq!(bulk.duration_us, 4_000);
    }

    #[test]
    fn bulk_is_interrupted_by_reverse_payload() {
        let mut acc = new_acc(&pkt(0, true, 140, TCP_ACK));
        acc.update(&pkt(1_000, true, 140, TCP_ACK), true);
        acc.update(&pkt(2_000, false, 140, TCP_ACK), false);
        acc.update(&pkt(3_000, true, 140, TCP_ACK), true);
        acc.update(&pkt(4_000, true, 140, TCP_ACK), true);
        assert_eq!(acc.forward_stats().bulk.bulk_count, 0);
    }

    #[test]
    fn pure_acks_do_not_interrupt_bulk() {
        let mut acc = new_acc(&pkt(0, true, 140, TCP_ACK));
        acc.update(&pkt(1_000, true, 140, TCP_ACK), true);
        // 페이로드 없는 역방향 ACK
        acc.update(&pkt(1_500, false, 40, TCP_ACK), false);
        acc.update(&pkt(2_000, true, 140, TCP_ACK), true);
        acc.update(&pkt(3_000, true, 140, TCP_ACK), true);
        assert_eq!(acc.forward_stats().bulk.bulk_count, 1);
    }

    #[test]
    fn subflow_and_idle_periods_follow_gaps() {
        let mut acc = new_acc(&pkt(0, true, 60, TCP_ACK));
        acc.update(&pkt(500_000, true, 60, TCP_ACK), true);
        // 2초 간격 → 새 서브플로우, 활성 구간은 유지
        acc.update(&pkt(2_500_000, true, 60, TCP_ACK), true);
        assert_eq!(acc.subflows(), 2);
        assert_eq!(acc.idle_stats().count(), 0);

        // 6초 간격 → 유휴 구간 기록
        acc.update(&pkt(8_500_000, true, 60, TCP_ACK), true);
        assert_eq!(acc.subflows(), 3);
        assert_eq!(acc.idle_stats().count(), 1);
        assert_eq!(acc.idle_stats().max(), 6_000_000.0);

        let active = acc.active_stats_at_close();
        assert_eq!(active.count(), 1);
        assert_eq!(active.max(), 2_500_000.0);
    }

    #[test]
    fn expiry_prefers_active_timeout() {
        let mut acc = new_acc(&pkt(0, true, 60, TCP_ACK));
        acc.update(&pkt(90, true, 60, TCP_ACK), true);

        assert_eq!(acc.expiry_reason(100, 50, 1_000), None);
        assert_eq!(
            acc.expiry_reason(200, 50, 1_000),
            Some(FinalizeReason::IdleTimeout)
        );
        assert_eq!(
            acc.expiry_reason(2_000, 50, 1_000),
            Some(FinalizeReason::ActiveTimeout)
        );
    }

    #[test]
    fn udp_does_not_record_tcp_state() {
        let mut first = pkt(0, true, 100, TCP_FIN);
        first.protocol = PROTO_UDP;
        let acc = new_acc(&first);
        assert_eq!(acc.flags().fin, 0);
        assert_eq!(acc.forward_stats().init_window, None);
        assert!(!acc.forward_stats().fin_seen);
    }

    #[test]
    fn direction_ring_keeps_last_sixteen() {
        let mut ring = DirectionRing::default();
        assert!(ring.is_empty());
        assert_eq!(ring.last(), None);

        ring.push(true);
        ring.push(false);
        assert_eq!(ring.last(), Some(false));
        assert_eq!(ring.len(), 2);

        for _ in 0..20 {
            ring.push(true);
        }
        assert_eq!(ring.len(), 16);
        assert_eq!(ring.last(), Some(true));
    }
}
