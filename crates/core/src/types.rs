//! 도메인 타입 -- 시스템 전역에서 사용되는 공통 타입
//!
//! 패킷 디스크립터, 정규화된 플로우 키, 80차원 특징 벡터, 분류 결과,
//! 집행 결정 등 모든 크레이트가 공유하는 데이터 구조를 정의합니다.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

// =============================================================================
// 패킷 디스크립터
// =============================================================================

/// 캡처 소스가 전달하는 파싱된 패킷 디스크립터
///
/// `header_len`과 `window`는 생략 가능하며 (기본값 0),
/// 페이로드 길이는 `length - header_len`으로 계산됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketDescriptor {
    /// 캡처 시각 (마이크로초)
    pub ts_us: u64,
    /// IP 프로토콜 번호 (TCP=6, UDP=17, ICMP=1)
    pub protocol: u8,
    /// 출발지 IP
    pub src_ip: IpAddr,
    /// 출발지 포트
    pub src_port: u16,
    /// 목적지 IP
    pub dst_ip: IpAddr,
    /// 목적지 포트
    pub dst_port: u16,
    /// IP 패킷 길이 (바이트)
    pub length: u32,
    /// TCP 플래그 (비-TCP는 0)
    #[serde(default)]
    pub tcp_flags: u8,
    /// 전송 계층 헤더 길이 (바이트)
    #[serde(default)]
    pub header_len: u16,
    /// TCP 수신 윈도우
    #[serde(default)]
    pub window: u16,
}

impl PacketDescriptor {
    /// 출발지 엔드포인트를 반환합니다.
    pub fn source(&self) -> Endpoint {
        Endpoint::new(self.src_ip, self.src_port)
    }

    /// 목적지 엔드포인트를 반환합니다.
    pub fn destination(&self) -> Endpoint {
        Endpoint::new(self.dst_ip, self.dst_port)
    }

    /// 페이로드 길이를 반환합니다.
    pub fn payload_len(&self) -> u32 {
        self.length.saturating_sub(u32::from(self.header_len))
    }
}

impl fmt::Display for PacketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto={} len={} flags={:#04x}",
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.protocol,
            self.length,
            self.tcp_flags,
        )
    }
}

// =============================================================================
// 플로우 키
// =============================================================================

/// 통신 엔드포인트 (IP, 포트)
///
/// 파생된 `Ord`가 정규화 순서를 결정합니다:
/// IPv4 < IPv6, 그 다음 주소 값, 그 다음 포트.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP 주소
    pub ip: IpAddr,
    /// 포트 (ICMP는 0)
    pub port: u16,
}

impl Endpoint {
    /// 새 엔드포인트를 생성합니다.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{ip}:{}", self.port),
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

/// 정규화된 양방향 플로우 식별자
///
/// 두 엔드포인트 중 작은 쪽이 `low`, 큰 쪽이 `high`가 되므로
/// 같은 대화의 양방향 패킷은 항상 같은 키로 매핑됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    /// IP 프로토콜 번호
    pub protocol: u8,
    /// 정렬상 작은 엔드포인트
    pub low: Endpoint,
    /// 정렬상 큰 엔드포인트
    pub high: Endpoint,
}

impl FlowKey {
    /// 두 엔드포인트로부터 정규화된 키를 생성합니다 (인자 순서 무관).
    pub fn new(protocol: u8, a: Endpoint, b: Endpoint) -> Self {
        if a <= b {
            Self {
                protocol,
                low: a,
                high: b,
            }
        } else {
            Self {
                protocol,
                low: b,
                high: a,
            }
        }
    }

    /// 엔드포인트 쌍 (포트 제외) -- 히스테리시스 카운터의 키로 사용됩니다.
    pub fn endpoint_pair(&self) -> EndpointPair {
        // low <= high 이므로 IP 순서도 유지됩니다.
        EndpointPair {
            low: self.low.ip,
            high: self.high.ip,
        }
    }

    /// 주어진 엔드포인트의 반대편 엔드포인트를 반환합니다.
    pub fn peer_of(&self, endpoint: &Endpoint) -> Endpoint {
        if *endpoint == self.low {
            self.high
        } else {
            self.low
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {} proto={}", self.low, self.high, self.protocol)
    }
}

/// 포트를 제외한 IP 쌍
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointPair {
    /// 작은 IP
    pub low: IpAddr,
    /// 큰 IP
    pub high: IpAddr,
}

// =============================================================================
// 특징 벡터
// =============================================================================

/// 특징 스키마 버전
///
/// 필드 위치가 바뀌면 반드시 버전을 올려야 합니다.
/// 모델 로더는 이 값과 모델 파일의 `schema`를 비교합니다.
pub const FEATURE_SCHEMA_VERSION: &str = "cic-ddos2019-v1";

/// 특징 개수
pub const FEATURE_COUNT: usize = 80;

/// 특징 이름 (인덱스 = 벡터 위치)
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "Destination Port",
    "Protocol",
    "Flow Duration",
    "Total Fwd Packets",
    "Total Backward Packets",
    "Total Length of Fwd Packets",
    "Total Length of Bwd Packets",
    "Fwd Packet Length Max",
    "Fwd Packet Length Min",
    "Fwd Packet Length Mean",
    "Fwd Packet Length Std",
    "Bwd Packet Length Max",
    "Bwd Packet Length Min",
    "Bwd Packet Length Mean",
    "Bwd Packet Length Std",
    "Flow Bytes/s",
    "Flow Packets/s",
    "Flow IAT Mean",
    "Flow IAT Std",
    "Flow IAT Max",
    "Flow IAT Min",
    "Fwd IAT Total",
    "Fwd IAT Mean",
    "Fwd IAT Std",
    "Fwd IAT Max",
    "Fwd IAT Min",
    "Bwd IAT Total",
    "Bwd IAT Mean",
    "Bwd IAT Std",
    "Bwd IAT Max",
    "Bwd IAT Min",
    "Fwd PSH Flags",
    "Bwd PSH Flags",
    "Fwd URG Flags",
    "Bwd URG Flags",
    "Fwd Header Length",
    "Bwd Header Length",
    "Fwd Packets/s",
    "Bwd Packets/s",
    "Min Packet Length",
    "Max Packet Length",
    "Packet Length Mean",
    "Packet Length Std",
    "Packet Length Variance",
    "FIN Flag Count",
    "SYN Flag Count",
    "RST Flag Count",
    "PSH Flag Count",
    "ACK Flag Count",
    "URG Flag Count",
    "CWE Flag Count",
    "ECE Flag Count",
    "Down/Up Ratio",
    "Average Packet Size",
    "Avg Fwd Segment Size",
    "Avg Bwd Segment Size",
    "Fwd Header Length.1",
    "Fwd Avg Bytes/Bulk",
    "Fwd Avg Packets/Bulk",
    "Fwd Avg Bulk Rate",
    "Bwd Avg Bytes/Bulk",
    "Bwd Avg Packets/Bulk",
    "Bwd Avg Bulk Rate",
    "Subflow Fwd Packets",
    "Subflow Fwd Bytes",
    "Subflow Bwd Packets",
    "Subflow Bwd Bytes",
    "Init_Win_bytes_forward",
    "Init_Win_bytes_backward",
    "act_data_pkt_fwd",
    "min_seg_size_forward",
    "Active Mean",
    "Active Std",
    "Active Max",
    "Active Min",
    "Idle Mean",
    "Idle Std",
    "Idle Max",
    "Idle Min",
    "Inbound",
];

/// 이름으로 특징 인덱스를 찾습니다.
pub fn feature_index(name: &str) -> Option<usize> {
    FEATURE_NAMES.iter().position(|n| *n == name)
}

/// 80차원 특징 벡터
///
/// 생성 후 변경할 수 없습니다. 모든 값은 유한(finite)합니다.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    schema: &'static str,
    values: Vec<f64>,
}

impl FeatureVector {
    /// 값 배열로부터 특징 벡터를 생성합니다.
    ///
    /// 유한하지 않은 값(NaN, ±inf)은 0으로 대체됩니다.
    pub fn new(values: [f64; FEATURE_COUNT]) -> Self {
        Self {
            schema: FEATURE_SCHEMA_VERSION,
            values: values
                .iter()
                .map(|v| if v.is_finite() { *v } else { 0.0 })
                .collect(),
        }
    }

    /// 스키마 버전을 반환합니다.
    pub fn schema(&self) -> &'static str {
        self.schema
    }

    /// 값 슬라이스를 반환합니다 (길이는 항상 [`FEATURE_COUNT`]).
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// 인덱스로 값을 조회합니다.
    pub fn value(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// 이름으로 값을 조회합니다.
    pub fn get(&self, name: &str) -> Option<f64> {
        feature_index(name).and_then(|i| self.value(i))
    }

    /// (이름, 값) 쌍을 순회합니다.
    pub fn iter_named(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        FEATURE_NAMES.iter().copied().zip(self.values.iter().copied())
    }
}

// =============================================================================
// 플로우 확정
// =============================================================================

/// 플로우 확정(finalization) 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    /// 양방향 FIN 관찰
    Fin,
    /// RST 관찰
    Rst,
    /// 유휴 타임아웃
    IdleTimeout,
    /// 활성 타임아웃 (최대 플로우 지속 시간)
    ActiveTimeout,
    /// 종료 시 강제 확정
    Shutdown,
}

impl FinalizeReason {
    /// 메트릭 레이블용 고정 이름
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fin => "fin",
            Self::Rst => "rst",
            Self::IdleTimeout => "idle_timeout",
            Self::ActiveTimeout => "active_timeout",
            Self::Shutdown => "shutdown",
        }
    }

    /// 타임아웃에 의한 축출인지 여부
    pub fn is_eviction(&self) -> bool {
        matches!(self, Self::IdleTimeout | Self::ActiveTimeout)
    }
}

impl fmt::Display for FinalizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 확정된 플로우 -- 특징 추출이 끝나 분류 대기 중인 상태
#[derive(Debug, Clone, Serialize)]
pub struct FinalizedFlow {
    /// 플로우 키
    pub key: FlowKey,
    /// 첫 패킷을 보낸 엔드포인트
    pub forward: Endpoint,
    /// 플로우 세대 번호
    pub generation: u64,
    /// 확정 사유
    pub reason: FinalizeReason,
    /// 추출된 특징 벡터
    pub features: FeatureVector,
}

// =============================================================================
// 분류 / 집행
// =============================================================================

/// 분류기 출력 (플로우 키 미포함)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// 레이블 (예: "BENIGN", "DrDoS_DNS")
    pub label: String,
    /// 신뢰도 (0.0 ~ 1.0)
    pub confidence: f64,
    /// 악성 여부
    pub is_malicious: bool,
}

impl Prediction {
    /// 정상 예측을 생성합니다.
    pub fn benign(confidence: f64) -> Self {
        Self {
            label: "BENIGN".to_owned(),
            confidence: confidence.clamp(0.0, 1.0),
            is_malicious: false,
        }
    }

    /// 악성 예측을 생성합니다.
    pub fn malicious(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            is_malicious: true,
        }
    }
}

/// 플로우 분류 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// 대상 플로우
    pub flow_key: FlowKey,
    /// 레이블
    pub label: String,
    /// 신뢰도 (0.0 ~ 1.0)
    pub confidence: f64,
    /// 악성 여부
    pub is_malicious: bool,
}

impl ClassificationResult {
    /// 예측 결과에 플로우 키를 붙입니다.
    pub fn from_prediction(flow_key: FlowKey, prediction: Prediction) -> Self {
        Self {
            flow_key,
            label: prediction.label,
            confidence: prediction.confidence.clamp(0.0, 1.0),
            is_malicious: prediction.is_malicious,
        }
    }
}

/// 집행 액션
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnforcementAction {
    /// 통과
    Allow,
    /// 차단
    Drop,
    /// 초당 패킷 수 제한
    RateLimit {
        /// 허용 pps
        pps: u32,
    },
}

impl EnforcementAction {
    /// 메트릭 레이블용 고정 이름
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Drop => "drop",
            Self::RateLimit { .. } => "rate_limit",
        }
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit { pps } => write!(f, "rate_limit({pps}pps)"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// 집행 결정
///
/// `id`는 at-least-once 재전송 시 싱크 측 중복 제거에 사용됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementDecision {
    /// 결정 ID (uuid v4)
    pub id: uuid::Uuid,
    /// 대상 플로우
    pub flow_key: FlowKey,
    /// 액션
    pub action: EnforcementAction,
    /// 유효 기간 (초)
    pub ttl_secs: u64,
}

impl EnforcementDecision {
    /// 새 결정을 생성합니다.
    pub fn new(flow_key: FlowKey, action: EnforcementAction, ttl_secs: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            flow_key,
            action,
            ttl_secs,
        }
    }
}

/// 분류기 장애 시 적용 정책
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// fail-open: 통과 (기본값)
    #[default]
    Allow,
    /// fail-closed: 차단
    Drop,
}

impl FailPolicy {
    /// 정책에 해당하는 집행 액션
    pub fn action(&self) -> EnforcementAction {
        match self {
            Self::Allow => EnforcementAction::Allow,
            Self::Drop => EnforcementAction::Drop,
        }
    }

    /// 설정 문자열을 파싱합니다.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Self::Allow),
            "drop" => Some(Self::Drop),
            _ => None,
        }
    }
}

impl fmt::Display for FailPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow (fail-open)"),
            Self::Drop => write!(f, "drop (fail-closed)"),
        }
    }
}
