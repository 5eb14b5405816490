//! 특징 추출 -- 누적기 → 80차원 특징 벡터
//!
//! [`FeatureExtractor::extract`]는 확정된 누적기로부터 `cic-ddos2019-v1`
//! 순서의 [`FeatureVector`]를 만드는 순수 함수입니다.
//!
//! # 규약
//! - 시간 값(지속 시간, IAT, 활성/유휴)은 마이크로초
//! - 비율(`/s`)은 초 단위 지속 시간 기준이며, 지속 시간이 0이면 0
//! - 표준편차는 모집단 표준편차
//! - 유한하지 않은 값은 0으로 대체

use ipnetwork::IpNetwork;

use flowsentry_core::types::{FEATURE_COUNT, FeatureVector};

use crate::accumulator::{BulkState, DirectionStats, FlowAccumulator};
use crate::stats::RunningStats;

/// 관찰된 TCP 윈도우가 없을 때의 `Init_Win_bytes_*` 값
pub const NO_WINDOW: f64 = -1.0;

/// 특징 추출기
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    protected: Vec<IpNetwork>,
}

impl FeatureExtractor {
    /// 보호 대상 네트워크 목록으로 추출기를 생성합니다.
    pub fn new(protected: Vec<IpNetwork>) -> Self {
        Self { protected }
    }

    /// 보호 대상 네트워크 목록
    pub fn protected_networks(&self) -> &[IpNetwork] {
        &self.protected
    }

    /// 누적기로부터 특징 벡터를 생성합니다.
    pub fn extract(&self, acc: &FlowAccumulator) -> FeatureVector {
        let fwd = acc.forward_stats();
        let bwd = acc.backward_stats();
        let flow_len = acc.length_stats();
        let flow_iat = acc.iat_stats();
        let flags = acc.flags();
        let active = acc.active_stats_at_close();
        let idle = acc.idle_stats();
        let destination = acc.destination();

        let duration_us = acc.duration_us();
        let duration_secs = duration_us as f64 / 1_000_000.0;
        let total_packets = acc.total_packets();
        let subflows = acc.subflows().max(1) as f64;

        let mut v = [0.0_f64; FEATURE_COUNT];

        v[0] = f64::from(destination.port);
        v[1] = f64::from(acc.key().protocol);
        v[2] = duration_us as f64;
        v[3] = fwd.packets as f64;
        v[4] = bwd.packets as f64;
        v[5] = fwd.bytes as f64;
        v[6] = bwd.bytes as f64;

        write_length(&mut v[7..11], &fwd.length);
        write_length(&mut v[11..15], &bwd.length);

        v[15] = rate((fwd.bytes + bwd.bytes) as f64, duration_secs);
        v[16] = rate(total_packets as f64, duration_secs);

        v[17] = flow_iat.mean();
        v[18] = flow_iat.population_std();
        v[19] = flow_iat.max();
        v[20] = flow_iat.min();
        write_iat(&mut v[21..26], &fwd.iat);
        write_iat(&mut v[26..31], &bwd.iat);

        v[31] = fwd.psh as f64;
        v[32] = bwd.psh as f64;
        v[33] = fwd.urg as f64;
        v[34] = bwd.urg as f64;
        v[35] = fwd.header_bytes as f64;
        v[36] = bwd.header_bytes as f64;
        v[37] = rate(fwd.packets as f64, duration_secs);
        v[38] = rate(bwd.packets as f64, duration_secs);

        v[39] = flow_len.min();
        v[40] = flow_len.max();
        v[41] = flow_len.mean();
        v[42] = flow_len.population_std();
        v[43] = flow_len.population_variance();

        v[44] = flags.fin as f64;
        v[45] = flags.syn as f64;
        v[46] = flags.rst as f64;
        v[47] = flags.psh as f64;
        v[48] = flags.ack as f64;
        v[49] = flags.urg as f64;
        v[50] = flags.cwr as f64;
        v[51] = flags.ece as f64;

        v[52] = ratio(bwd.packets as f64, fwd.packets as f64);
        v[53] = ratio(flow_len.sum(), total_packets as f64);
        v[54] = fwd.length.mean();
        v[55] = bwd.length.mean();
        v[56] = fwd.header_bytes as f64;

        write_bulk(&mut v[57..60], &fwd.bulk);
        write_bulk(&mut v[60..63], &bwd.bulk);

        v[63] = fwd.packets as f64 / subflows;
        v[64] = fwd.bytes as f64 / subflows;
        v[65] = bwd.packets as f64 / subflows;
        v[66] = bwd.bytes as f64 / subflows;

        v[67] = init_window(fwd);
        v[68] = init_window(bwd);
        v[69] = fwd.payload_packets as f64;
        v[70] = fwd.min_header_len.map_or(0.0, f64::from);

        write_period(&mut v[71..75], &active);
        write_period(&mut v[75..79], idle);

        v[79] = if self.is_protected(destination.ip) { 1.0 } else { 0.0 };

        FeatureVector::new(v)
    }

    fn is_protected(&self, ip: std::net::IpAddr) -> bool {
        self.protected.iter().any(|net| net.contains(ip))
    }
}

// ─── 헬퍼 ───

fn rate(amount: f64, duration_secs: f64) -> f64 {
    if duration_secs > 0.0 {
        amount / duration_secs
    } else {
        0.0
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// max, min, mean, std
fn write_length(out: &mut [f64], stats: &RunningStats) {
    out[0] = stats.max();
    out[1] = stats.min();
    out[2] = stats.mean();
    out[3] = stats.population_std();
}

/// total, mean, std, max, min
fn write_iat(out: &mut [f64], stats: &RunningStats) {
    out[0] = stats.sum();
    out[1] = stats.mean();
    out[2] = stats.population_std();
    out[3] = stats.max();
    out[4] = stats.min();
}

/// mean, std, max, min
fn write_period(out: &mut [f64], stats: &RunningStats) {
    out[0] = stats.mean();
    out[1] = stats.population_std();
    out[2] = stats.max();
    out[3] = stats.min();
}

/// bytes/bulk, packets/bulk, bulk rate
fn write_bulk(out: &mut [f64], bulk: &BulkState) {
    let count = bulk.bulk_count as f64;
    out[0] = ratio(bulk.bytes as f64, count);
    out[1] = ratio(bulk.packets as f64, count);
    out[2] = rate(bulk.bytes as f64, bulk.duration_us as f64 / 1_000_000.0);
}

fn init_window(stats: &DirectionStats) -> f64 {
    stats.init_window.map_or(NO_WINDOW, f64::from)
}
