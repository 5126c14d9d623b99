//! ICMP error/echo generation and RFC 1812 §4.3.2.7 suppression (§4.3.4).

use vnet_types::{
    icmpv4::{DestUnreachCode, IcmpV4Packet},
    ip::{Ipv4Flags, Ipv4Packet, PROTO_ICMPV4},
    mac::MacAddress,
};

use super::port::RouterPort;

/// RFC 792: an ICMP error quotes the offending IP header plus its first 8
/// payload octets.
fn offending_header_and_octets(offender: &Ipv4Packet) -> Vec<u8> {
    let mut bytes = offender.to_vec().expect("ipv4 header encoding is infallible");
    bytes.truncate(28);
    bytes
}

/// Whether an ICMP error may legally be generated in response to `offender`
/// arriving on `dst_mac`, per RFC 1812 §4.3.2.7 — do not generate ICMP
/// errors in response to ICMP errors, multicast/broadcast destinations,
/// link-layer broadcast/multicast, all-ones endpoints, or non-first
/// fragments.
#[must_use]
pub fn may_generate_icmp_error(offender: &Ipv4Packet, dst_mac: MacAddress, egress_subnet: Option<vnet_types::ip::Cidr>) -> bool {
    if offender.proto == PROTO_ICMPV4 {
        if let Ok(icmp) = IcmpV4Packet::from_slice(&offender.content) {
            if icmp.typ.is_error() {
                return false;
            }
        }
    }

    if dst_mac.is_broadcast() || dst_mac.is_multicast() {
        return false;
    }

    if offender.dest.is_multicast() {
        return false;
    }

    if let Some(subnet) = egress_subnet {
        if offender.dest == subnet.broadcast() {
            return false;
        }
    }

    let src_u32 = u32::from(offender.src);
    let dst_u32 = u32::from(offender.dest);
    if src_u32 == u32::MAX || dst_u32 == u32::MAX {
        return false;
    }

    if !offender.is_first_fragment() {
        return false;
    }

    true
}

#[must_use]
pub fn time_exceeded(offender: &Ipv4Packet, port: &RouterPort) -> Ipv4Packet {
    let mut reply = offender.reply_skeleton();
    reply.proto = PROTO_ICMPV4;
    reply.src = port.ip;
    let icmp = IcmpV4Packet::time_exceeded(offending_header_and_octets(offender));
    reply.content = icmp.to_vec().expect("icmp encoding is infallible");
    reply
}

#[must_use]
pub fn destination_unreachable(offender: &Ipv4Packet, port: &RouterPort, code: DestUnreachCode) -> Ipv4Packet {
    let mut reply = offender.reply_skeleton();
    reply.proto = PROTO_ICMPV4;
    reply.src = port.ip;
    let icmp = IcmpV4Packet::destination_unreachable(code, offending_header_and_octets(offender));
    reply.content = icmp.to_vec().expect("icmp encoding is infallible");
    reply
}

#[must_use]
pub fn echo_reply(request: &Ipv4Packet, port: &RouterPort, identifier: u16, sequence: u16, payload: Vec<u8>) -> Ipv4Packet {
    let mut reply = request.reply_skeleton();
    reply.proto = PROTO_ICMPV4;
    reply.src = port.ip;
    reply.flags = Ipv4Flags { df: false, mf: false };
    let icmp = IcmpV4Packet::echo_reply_to(identifier, sequence, payload);
    reply.content = icmp.to_vec().expect("icmp encoding is infallible");
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use vnet_types::ip::{Cidr, Ipv4Flags as Flags};

    fn test_port() -> RouterPort {
        RouterPort {
            id: 1,
            mac: MacAddress::from([1, 2, 3, 4, 5, 6]),
            ip: Ipv4Addr::new(10, 0, 0, 1),
            nw_addr: Ipv4Addr::new(10, 0, 0, 0),
            nw_length: 24,
            variant: crate::router::port::PortVariant::Exterior,
        }
    }

    fn plain_packet(dest: Ipv4Addr) -> Ipv4Packet {
        Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 1,
            flags: Flags { df: false, mf: false },
            fragment_offset: 0,
            ttl: 1,
            proto: 17,
            src: Ipv4Addr::new(10, 0, 0, 5),
            dest,
            content: vec![0; 8],
        }
    }

    #[test]
    fn ordinary_packet_permits_icmp_error() {
        let pkt = plain_packet(Ipv4Addr::new(10, 0, 0, 1));
        assert!(may_generate_icmp_error(&pkt, MacAddress::from([9, 9, 9, 9, 9, 9]), None));
    }

    #[test]
    fn broadcast_destination_mac_suppresses_icmp_error() {
        let pkt = plain_packet(Ipv4Addr::new(10, 0, 0, 1));
        assert!(!may_generate_icmp_error(&pkt, MacAddress::BROADCAST, None));
    }

    #[test]
    fn multicast_destination_suppresses_icmp_error() {
        let pkt = plain_packet(Ipv4Addr::new(224, 0, 0, 5));
        assert!(!may_generate_icmp_error(&pkt, MacAddress::from([9; 6]), None));
    }

    #[test]
    fn subnet_broadcast_destination_suppresses_icmp_error() {
        let subnet = Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 24);
        let pkt = plain_packet(subnet.broadcast());
        assert!(!may_generate_icmp_error(&pkt, MacAddress::from([9; 6]), Some(subnet)));
    }

    #[test]
    fn non_first_fragment_suppresses_icmp_error() {
        let mut pkt = plain_packet(Ipv4Addr::new(10, 0, 0, 1));
        pkt.fragment_offset = 8;
        assert!(!may_generate_icmp_error(&pkt, MacAddress::from([9; 6]), None));
    }

    #[test]
    fn icmp_error_triggering_packet_suppresses_another_error() {
        let mut pkt = plain_packet(Ipv4Addr::new(10, 0, 0, 1));
        pkt.proto = PROTO_ICMPV4;
        pkt.content = IcmpV4Packet::time_exceeded(vec![0; 20]).to_vec().unwrap();
        assert!(!may_generate_icmp_error(&pkt, MacAddress::from([9; 6]), None));
    }

    #[test]
    fn time_exceeded_builder_sets_source_to_port_ip() {
        let port = test_port();
        let pkt = plain_packet(port.ip);
        let reply = time_exceeded(&pkt, &port);
        assert_eq!(reply.src, port.ip);
        assert_eq!(reply.dest, pkt.src);
        assert_eq!(reply.proto, PROTO_ICMPV4);
    }
}
