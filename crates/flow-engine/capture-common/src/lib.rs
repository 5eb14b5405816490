//! 캡처 계층/유저스페이스 공유 레코드 레이아웃
//!
//! 이 크레이트는 `#![no_std]` 환경에서 사용 가능한 공통 타입을 정의합니다.
//! 커널 측 캡처 프로그램, 리플레이 파일 작성기, 유저스페이스 디코더가
//! 동일한 바이트 레이아웃을 사용하도록 보장합니다.
//!
//! # 레코드 종류
//! - [`PacketRecord`]: 캡처 → 수집 워커로 전달되는 고정 길이 패킷 레코드
//! - [`BlocklistKey`] / [`BlocklistValue`]: 집행 결정 → 필터링 계층 차단 목록 엔트리

#![no_std]

// =============================================================================
// 프로토콜 상수
// =============================================================================

/// ICMP 프로토콜 번호
pub const PROTO_ICMP: u8 = 1;
/// TCP 프로토콜 번호
pub const PROTO_TCP: u8 = 6;
/// UDP 프로토콜 번호
pub const PROTO_UDP: u8 = 17;
/// ICMPv6 프로토콜 번호
pub const PROTO_ICMPV6: u8 = 58;

// =============================================================================
// TCP 플래그
// =============================================================================

/// FIN 플래그
pub const TCP_FIN: u8 = 0x01;
/// SYN 플래그
pub const TCP_SYN: u8 = 0x02;
/// RST 플래그
pub const TCP_RST: u8 = 0x04;
/// PSH 플래그
pub const TCP_PSH: u8 = 0x08;
/// ACK 플래그
pub const TCP_ACK: u8 = 0x10;
/// URG 플래그
pub const TCP_URG: u8 = 0x20;
/// ECE 플래그
pub const TCP_ECE: u8 = 0x40;
/// CWR 플래그
pub const TCP_CWR: u8 = 0x80;

// =============================================================================
// 액션 코드 (차단 목록)
// =============================================================================

/// 패킷 통과
pub const ACTION_PASS: u8 = 0;
/// 패킷 차단
pub const ACTION_DROP: u8 = 1;
/// 초당 패킷 수 제한
pub const ACTION_RATE_LIMIT: u8 = 2;

// =============================================================================
// 패킷 레코드
// =============================================================================

/// IPv4 레코드 표시
pub const IP_VERSION_4: u8 = 4;
/// IPv6 레코드 표시
pub const IP_VERSION_6: u8 = 6;

/// 직렬화된 [`PacketRecord`]의 바이트 길이
pub const RECORD_SIZE: usize = 56;

/// 고정 길이 패킷 레코드
///
/// 숫자 필드는 리틀 엔디언, IP 주소는 네트워크 바이트 오더로 직렬화됩니다.
/// IPv4 주소는 16바이트 필드의 앞 4바이트만 사용합니다.
///
/// # 메모리 레이아웃 (56 바이트, 8바이트 정렬)
/// ```text
/// offset  field        size
/// 0       ts_us        8
/// 8       src_ip       16
/// 24      dst_ip       16
/// 40      src_port     2
/// 42      dst_port     2
/// 44      length       4
/// 48      header_len   2
/// 50      window       2
/// 52      protocol     1
/// 53      tcp_flags    1
/// 54      ip_version   1
/// 55      _pad         1
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord {
    /// 캡처 시각 (마이크로초)
    pub ts_us: u64,
    /// 출발지 IP
    pub src_ip: [u8; 16],
    /// 목적지 IP
    pub dst_ip: [u8; 16],
    /// 출발지 포트
    pub src_port: u16,
    /// 목적지 포트
    pub dst_port: u16,
    /// IP 패킷 길이
    pub length: u32,
    /// 전송 계층 헤더 길이
    pub header_len: u16,
    /// TCP 윈도우
    pub window: u16,
    /// IP 프로토콜 번호
    pub protocol: u8,
    /// TCP 플래그
    pub tcp_flags: u8,
    /// IP 버전 (IP_VERSION_4, IP_VERSION_6)
    pub ip_version: u8,
    /// 8바이트 정렬을 위한 패딩
    pub _pad: u8,
}

impl PacketRecord {
    /// 제로 초기화된 레코드를 생성합니다.
    pub const fn zeroed() -> Self {
        Self {
            ts_us: 0,
            src_ip: [0; 16],
            dst_ip: [0; 16],
            src_port: 0,
            dst_port: 0,
            length: 0,
            header_len: 0,
            window: 0,
            protocol: 0,
            tcp_flags: 0,
            ip_version: 0,
            _pad: 0,
        }
    }

    /// 레코드를 와이어 바이트로 직렬화합니다.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..8].copy_from_slice(&self.ts_us.to_le_bytes());
        out[8..24].copy_from_slice(&self.src_ip);
        out[24..40].copy_from_slice(&self.dst_ip);
        out[40..42].copy_from_slice(&self.src_port.to_le_bytes());
        out[42..44].copy_from_slice(&self.dst_port.to_le_bytes());
        out[44..48].copy_from_slice(&self.length.to_le_bytes());
        out[48..50].copy_from_slice(&self.header_len.to_le_bytes());
        out[50..52].copy_from_slice(&self.window.to_le_bytes());
        out[52] = self.protocol;
        out[53] = self.tcp_flags;
        out[54] = self.ip_version;
        out
    }
}

// =============================================================================
// 차단 목록
// =============================================================================

/// 차단 목록 키 -- 정규화된 플로우 키의 고정 길이 표현
///
/// # 메모리 레이아웃 (40 바이트)
/// ```text
/// offset  field        size
/// 0       low_ip       16
/// 16      high_ip      16
/// 32      low_port     2
/// 34      high_port    2
/// 36      protocol     1
/// 37      _pad         3
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlocklistKey {
    /// 정렬상 작은 엔드포인트 IP
    pub low_ip: [u8; 16],
    /// 정렬상 큰 엔드포인트 IP
    pub high_ip: [u8; 16],
    /// 작은 엔드포인트 포트
    pub low_port: u16,
    /// 큰 엔드포인트 포트
    pub high_port: u16,
    /// IP 프로토콜 번호
    pub protocol: u8,
    /// 4바이트 정렬을 위한 패딩
    pub _pad: [u8; 3],
}

/// 차단 목록 값
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlocklistValue {
    /// 만료 시각 (유닉스 초)
    pub expires_at_secs: u64,
    /// 허용 pps (ACTION_RATE_LIMIT 전용)
    pub pps: u32,
    /// 적용할 액션 (ACTION_DROP, ACTION_RATE_LIMIT)
    pub action: u8,
    /// 8바이트 정렬을 위한 패딩
    pub _pad: [u8; 3],
}

impl BlocklistValue {
    /// 주어진 시각에 만료되었는지 여부
    pub const fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.expires_at_secs
    }
}
