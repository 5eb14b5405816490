//! 플로우 키 정규화
//!
//! 패킷 디스크립터를 방향과 무관한 [`FlowKey`]로 변환합니다.
//! 같은 대화의 양방향 패킷은 항상 같은 키로 매핑되며,
//! 실제 방향은 첫 패킷의 출발지(`forward`)와 비교하여 판단합니다.

use flowsentry_capture_common::{PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP, PROTO_UDP};
use flowsentry_core::types::{Endpoint, FlowKey, PacketDescriptor};

use crate::error::FlowEngineError;

/// 플로우로 추적 가능한 프로토콜인지 여부
pub fn is_flow_protocol(protocol: u8) -> bool {
    matches!(protocol, PROTO_TCP | PROTO_UDP | PROTO_ICMP | PROTO_ICMPV6)
}

/// 패킷을 정규화된 플로우 키와 출발지 엔드포인트로 변환합니다.
///
/// ICMP 계열은 포트를 0으로 고정합니다.
///
/// # 에러
/// - `FlowEngineError::Malformed`: 지원하지 않는 프로토콜, 미지정 주소,
///   IPv4/IPv6 혼합 엔드포인트
pub fn canonicalize(packet: &PacketDescriptor) -> Result<(FlowKey, Endpoint), FlowEngineError> {
    if !is_flow_protocol(packet.protocol) {
        return Err(FlowEngineError::Malformed(format!(
            "unsupported protocol {}",
            packet.protocol
        )));
    }
    if packet.src_ip.is_unspecified() || packet.dst_ip.is_unspecified() {
        return Err(FlowEngineError::Malformed(
            "unspecified endpoint address".to_owned(),
        ));
    }
    if packet.src_ip.is_ipv4() != packet.dst_ip.is_ipv4() {
        return Err(FlowEngineError::Malformed(
            "mixed IPv4/IPv6 endpoints".to_owned(),
        ));
    }

    let (src_port, dst_port) = if matches!(packet.protocol, PROTO_ICMP | PROTO_ICMPV6) {
        (0, 0)
    } else {
        (packet.src_port, packet.dst_port)
    };

    let source = Endpoint::new(packet.src_ip, src_port);
    let destination = Endpoint::new(packet.dst_ip, dst_port);
    Ok((FlowKey::new(packet.protocol, source, destination), source))
}

/// 패킷 출발지가 플로우의 정방향 엔드포인트인지 여부
pub fn is_forward(source: &Endpoint, forward: &Endpoint) -> bool {
    source == forward
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(src: &str, sport: u16, dst: &str, dport: u16, protocol: u8) -> PacketDescriptor {
        PacketDescriptor {
            ts_us: 0,
            protocol,
            src_ip: src.parse().unwrap(),
            src_port: sport,
            dst_ip: dst.parse().unwrap(),
            dst_port: dport,
            length: 60,
            tcp_flags: 0,
            header_len: 20,
            window: 0,
        }
    }

    #[test]
    fn swapped_endpoints_produce_same_key() {
        let a = packet("10.0.0.1", 40000, "192.168.1.10", 80, PROTO_TCP);
        let b = packet("192.168.1.10", 80, "10.0.0.1", 40000, PROTO_TCP);

        let (key_a, src_a) = canonicalize(&a).unwrap();
        let (key_b, src_b) = canonicalize(&b).unwrap();

        assert_eq!(key_a, key_b);
        assert_ne!(src_a, src_b);
        assert!(is_forward(&src_a, &src_a));
        assert!(!is_forward(&src_b, &src_a));
    }

    #[test]
    fn ipv6_endpoints_are_supported() {
        let a = packet("2001:db8::1", 5353, "2001:db8::2", 53, PROTO_UDP);
        let b = packet("2001:db8::2", 53, "2001:db8::1", 5353, PROTO_UDP);
        assert_eq!(canonicalize(&a).unwrap().0, canonicalize(&b).unwrap().0);
    }

    #[test]
    fn icmp_ports_are_zeroed() {
        let p = packet("10.0.0.1", 8, "10.0.0.2", 0, PROTO_ICMP);
        let (key, source) = canonicalize(&p).unwrap();
        assert_eq!(key.low.port, 0);
        assert_eq!(key.high.port, 0);
        assert_eq!(source.port, 0);
    }

    #[test]
    fn unsupported_protocol_is_malformed() {
        // GRE
        let p = packet("10.0.0.1", 0, "10.0.0.2", 0, 47);
        assert!(matches!(
            canonicalize(&p),
            Err(FlowEngineError::Malformed(_))
        ));
    }

    #[test]
    fn mixed_address_families_are_malformed() {
        let p = packet("10.0.0.1", 1000, "2001:db8::1", 80, PROTO_TCP);
        assert!(canonicalize(&p).is_err());
    }

    #[test]
    fn unspecified_address_is_malformed() {
        let p = packet("0.0.0.0", 1000, "10.0.0.1", 80, PROTO_UDP);
        assert!(canonicalize(&p).is_err());
    }
}
