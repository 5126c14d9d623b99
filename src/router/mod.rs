//! The per-router packet-processing pipeline (§4.3).

pub mod icmp;
pub mod port;

use std::{net::Ipv4Addr, sync::Arc, time::Instant};

use tokio::sync::RwLock;
use tracing::{trace, warn};

use vnet_types::{
    arp::ArpPacket,
    ethernet::{EthernetFrame, ETHERTYPE_ARP, ETHERTYPE_IPV4},
    icmpv4::{DestUnreachCode, IcmpV4Packet, IcmpV4Type},
    ip::{Ipv4Packet, PROTO_ICMPV4},
    mac::MacAddress,
};

use crate::{
    arp::{ArpTable, FrameSink},
    config::RouterConfig,
    error::{AgentError, AgentResult},
    routing::{LoadBalancer, NextHop, Route, RouteMatch},
};

use port::{PortId, PortResolver, PortVariant, RouterPort};

/// A frame arriving on a concrete port, the input to [`Router::process`].
#[derive(Debug, Clone)]
pub struct Ingress {
    pub port_id: PortId,
    pub frame: EthernetFrame,
}

/// The outcome of [`Router::process`], returned to the (external) datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Not an Ethertype this router speaks.
    NotIPv4,
    Drop,
    /// Handled entirely inside the router (an ARP answer or ICMP reply was
    /// emitted directly); the datapath has nothing further to do.
    Consumed,
    ToPort { port_id: PortId, frame: EthernetFrame },
}

struct Inner {
    ports: Arc<dyn PortResolver>,
    routes: RwLock<LoadBalancer>,
    arp: ArpTable,
    sink: Arc<dyn FrameSink>,
    config: RouterConfig,
}

/// A single L3 router (§4.3). Cheaply cloneable — clones share the same
/// routing table, ARP table and port resolver.
#[derive(Clone)]
pub struct Router(Arc<Inner>);

impl Router {
    #[must_use]
    pub fn new(ports: Arc<dyn PortResolver>, sink: Arc<dyn FrameSink>, config: RouterConfig) -> Self {
        let arp = ArpTable::new(
            Arc::new(crate::store::InMemoryMap::new()),
            sink.clone(),
            config.arp,
        );
        Self(Arc::new(Inner {
            ports,
            routes: RwLock::new(LoadBalancer::new()),
            arp,
            sink,
            config,
        }))
    }

    /// Builds a router sharing an externally-owned ARP table — used when
    /// several routers must resolve against the same shared cache.
    #[must_use]
    pub fn with_arp_table(ports: Arc<dyn PortResolver>, sink: Arc<dyn FrameSink>, config: RouterConfig, arp: ArpTable) -> Self {
        Self(Arc::new(Inner {
            ports,
            routes: RwLock::new(LoadBalancer::new()),
            arp,
            sink,
            config,
        }))
    }

    pub async fn add_route(&self, route: Route) {
        self.0.routes.write().await.add_route(route);
    }

    pub async fn remove_route(&self, dst: vnet_types::ip::Cidr, src: vnet_types::ip::Cidr) {
        self.0.routes.write().await.remove_route(dst, src);
    }

    /// The top-level pipeline: pre-routing, routing, post-routing (§4.3).
    pub async fn process(&self, ingress: Ingress) -> AgentResult<Action> {
        if !ingress.frame.is_arp() && !ingress.frame.is_ipv4() {
            return Ok(Action::NotIPv4);
        }

        let Some(in_port) = self.0.ports.port(ingress.port_id).await else {
            trace!(port = ingress.port_id, "unknown ingress port, dropping");
            return Ok(Action::Drop);
        };

        if ingress.frame.dst.is_broadcast() {
            if ingress.frame.is_arp() {
                if let Ok(arp) = ArpPacket::from_slice(&ingress.frame.payload) {
                    if arp.is_request() {
                        self.handle_arp_request(&in_port, arp).await?;
                        return Ok(Action::Consumed);
                    }
                }
            }
            return Ok(Action::Drop);
        }

        if ingress.frame.dst != in_port.mac {
            warn!(port = in_port.id, dst = %ingress.frame.dst, "unicast frame not addressed to this port, dropping");
            return Ok(Action::Drop);
        }

        if ingress.frame.is_arp() {
            let Ok(arp) = ArpPacket::from_slice(&ingress.frame.payload) else {
                return Ok(Action::Drop);
            };
            if arp.is_request() {
                // A unicast ARP request is not the broadcast case §4.3.1
                // documents; the spec treats only opcode=reply as valid here.
                return Ok(Action::Drop);
            }
            self.handle_arp_reply(&in_port, arp).await;
            return Ok(Action::Consumed);
        }

        let Ok(mut packet) = Ipv4Packet::from_slice(&ingress.frame.payload) else {
            return Ok(Action::Drop);
        };

        if packet.dest == in_port.ip {
            return self.handle_local_delivery(&ingress.frame, &packet, &in_port).await;
        }

        if packet.ttl <= 1 {
            if icmp::may_generate_icmp_error(&packet, ingress.frame.dst, Some(in_port.subnet())) {
                let reply = icmp::time_exceeded(&packet, &in_port);
                self.emit_ip_packet_via(&in_port, reply, ingress.frame.src).await?;
            }
            return Ok(Action::Drop);
        }
        packet.ttl -= 1;

        let route_match = RouteMatch {
            network_src: packet.src,
            network_dst: packet.dest,
        };
        let route = self.0.routes.read().await.lookup(&route_match);

        let Some(route) = route else {
            if icmp::may_generate_icmp_error(&packet, ingress.frame.dst, Some(in_port.subnet())) {
                let reply = icmp::destination_unreachable(&packet, &in_port, DestUnreachCode::NetUnreachable);
                self.emit_ip_packet_via(&in_port, reply, ingress.frame.src).await?;
            }
            return Ok(Action::Drop);
        };

        let egress_port_id = match route.next_hop {
            NextHop::Blackhole | NextHop::Local => return Ok(Action::Drop),
            NextHop::Reject => {
                if icmp::may_generate_icmp_error(&packet, ingress.frame.dst, Some(in_port.subnet())) {
                    let reply = icmp::destination_unreachable(&packet, &in_port, DestUnreachCode::AdminProhibited);
                    self.emit_ip_packet_via(&in_port, reply, ingress.frame.src).await?;
                }
                return Ok(Action::Drop);
            }
            NextHop::Port(id) => id,
        };

        let Some(egress_port) = self.0.ports.port(egress_port_id).await else {
            return Ok(Action::Drop);
        };

        if packet.dest == egress_port.ip {
            return self.handle_local_delivery(&ingress.frame, &packet, &egress_port).await;
        }

        let mut new_frame = ingress.frame.clone();
        new_frame.src = egress_port.mac;

        let next_hop_mac = self.resolve_next_hop_mac(&route, &egress_port, packet.dest).await?;
        let Some(next_hop_mac) = next_hop_mac else {
            if icmp::may_generate_icmp_error(&packet, ingress.frame.dst, Some(egress_port.subnet())) {
                let code = if route.next_hop_gateway.is_unspecified() || route.next_hop_gateway == Ipv4Addr::BROADCAST {
                    DestUnreachCode::HostUnreachable
                } else {
                    DestUnreachCode::NetUnreachable
                };
                let reply = icmp::destination_unreachable(&packet, &egress_port, code);
                self.emit_ip_packet_via(&in_port, reply, ingress.frame.src).await?;
            }
            return Ok(Action::Drop);
        };

        new_frame.dst = next_hop_mac;
        new_frame.ethertype = ETHERTYPE_IPV4;
        new_frame.payload = packet.to_vec().map_err(|e| AgentError::Serialization(e.to_string()))?;

        Ok(Action::ToPort {
            port_id: egress_port.id,
            frame: new_frame,
        })
    }

    /// `sendIPPacket` (§4.3.5): a locally-originated packet, routed like a
    /// forwarded one but skipping ingress and pre-routing. Resolves the
    /// next-hop MAC in the background and emits once known; returns
    /// immediately with nothing to hand the datapath.
    pub async fn send_ip_packet(&self, packet: Ipv4Packet) -> AgentResult<()> {
        let route_match = RouteMatch {
            network_src: packet.src,
            network_dst: packet.dest,
        };
        let Some(route) = self.0.routes.read().await.lookup(&route_match) else {
            return Ok(());
        };
        let NextHop::Port(egress_port_id) = route.next_hop else {
            return Ok(());
        };
        let Some(egress_port) = self.0.ports.port(egress_port_id).await else {
            return Ok(());
        };
        if packet.dest == egress_port.ip {
            return Ok(());
        }

        let this = self.clone();
        tokio::spawn(async move {
            match this.resolve_next_hop_mac(&route, &egress_port, packet.dest).await {
                Ok(Some(mac)) => {
                    let Ok(payload) = packet.to_vec() else { return };
                    let frame = EthernetFrame {
                        dst: mac,
                        src: egress_port.mac,
                        ethertype: ETHERTYPE_IPV4,
                        payload,
                    };
                    let _ = this.0.sink.emit(egress_port.id, frame).await;
                }
                Ok(None) => trace!(dest = %packet.dest, "send_ip_packet: next hop unresolved, dropping"),
                Err(e) => warn!(dest = %packet.dest, error = %e, "send_ip_packet: arp resolution failed"),
            }
        });
        Ok(())
    }

    async fn handle_arp_request(&self, port: &RouterPort, arp: ArpPacket) -> AgentResult<()> {
        if arp.tpa != port.ip {
            return Ok(());
        }
        let reply = arp.into_reply(port.mac);
        let frame = EthernetFrame {
            dst: reply.tha,
            src: port.mac,
            ethertype: ETHERTYPE_ARP,
            payload: reply.to_vec().map_err(|e| AgentError::Serialization(e.to_string()))?,
        };
        self.0.sink.emit(port.id, frame).await
    }

    async fn handle_arp_reply(&self, port: &RouterPort, arp: ArpPacket) {
        if arp.tpa == port.ip && arp.tha == port.mac {
            if let Err(e) = self.0.arp.set(arp.spa, arp.sha).await {
                warn!(ip = %arp.spa, error = %e, "failed to record arp reply");
            }
        }
    }

    /// Handles a packet destined to one of this router's own addresses:
    /// answers ICMP echo, drops everything else (this router offers no
    /// other local service, per the stated ICMP non-goal).
    async fn handle_local_delivery(&self, frame: &EthernetFrame, packet: &Ipv4Packet, port: &RouterPort) -> AgentResult<Action> {
        if packet.proto == PROTO_ICMPV4 {
            if let Ok(icmp) = IcmpV4Packet::from_slice(&packet.content) {
                if let IcmpV4Type::EchoRequest { identifier, sequence } = icmp.typ {
                    let reply = icmp::echo_reply(packet, port, identifier, sequence, icmp.payload);
                    self.emit_ip_packet_via(port, reply, frame.src).await?;
                    return Ok(Action::Consumed);
                }
            }
        }
        Ok(Action::Drop)
    }

    /// Next-hop MAC resolution (§4.3.3). `Ok(None)` covers both "ARP says
    /// no answer" and "the caller's own ARP deadline elapsed" — the two
    /// are equivalent from the pipeline's point of view (§4.3's "If null").
    async fn resolve_next_hop_mac(&self, route: &Route, egress_port: &RouterPort, packet_dest: Ipv4Addr) -> AgentResult<Option<MacAddress>> {
        if let PortVariant::Interior { peer_port_id } = egress_port.variant {
            if let Some(peer) = self.0.ports.port(peer_port_id).await {
                return Ok(Some(peer.mac));
            }
        }

        let next_hop_ip = if route.next_hop_gateway.is_unspecified() || route.next_hop_gateway == Ipv4Addr::BROADCAST {
            packet_dest
        } else {
            route.next_hop_gateway
        };

        let deadline = Instant::now() + self.0.config.arp.timeout;
        match self.0.arp.get(next_hop_ip, egress_port, deadline).await {
            Ok(mac) => Ok(mac),
            Err(AgentError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Emits a locally-generated IP packet out `port` straight to
    /// `dst_mac` — used for ICMP replies/errors, where the destination's
    /// MAC is already known from the triggering frame.
    async fn emit_ip_packet_via(&self, port: &RouterPort, packet: Ipv4Packet, dst_mac: MacAddress) -> AgentResult<()> {
        let frame = EthernetFrame {
            dst: dst_mac,
            src: port.mac,
            ethertype: ETHERTYPE_IPV4,
            payload: packet.to_vec().map_err(|e| AgentError::Serialization(e.to_string()))?,
        };
        self.0.sink.emit(port.id, frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::FrameSink;
    use crate::config::RouterConfig;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use vnet_types::ip::{Cidr, Ipv4Flags};

    struct StaticPorts(HashMap<PortId, RouterPort>);

    #[async_trait::async_trait]
    impl PortResolver for StaticPorts {
        async fn port(&self, id: PortId) -> Option<RouterPort> {
            self.0.get(&id).copied()
        }
    }

    struct RecordingSink {
        sent: StdMutex<Vec<(PortId, EthernetFrame)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { sent: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl FrameSink for RecordingSink {
        async fn emit(&self, port_id: PortId, frame: EthernetFrame) -> AgentResult<()> {
            self.sent.lock().unwrap().push((port_id, frame));
            Ok(())
        }
    }

    fn port_a() -> RouterPort {
        RouterPort {
            id: 1,
            mac: MacAddress::from([0xaa, 0xaa, 0xaa, 0, 0, 1]),
            ip: Ipv4Addr::new(10, 0, 0, 1),
            nw_addr: Ipv4Addr::new(10, 0, 0, 0),
            nw_length: 24,
            variant: PortVariant::Exterior,
        }
    }

    fn port_b() -> RouterPort {
        RouterPort {
            id: 2,
            mac: MacAddress::from([0xbb, 0xbb, 0xbb, 0, 0, 2]),
            ip: Ipv4Addr::new(10, 0, 1, 1),
            nw_addr: Ipv4Addr::new(10, 0, 1, 0),
            nw_length: 24,
            variant: PortVariant::Exterior,
        }
    }

    fn test_router(sink: Arc<RecordingSink>) -> Router {
        let mut ports = HashMap::new();
        ports.insert(1, port_a());
        ports.insert(2, port_b());
        let resolver: Arc<dyn PortResolver> = Arc::new(StaticPorts(ports));
        Router::new(resolver, sink, RouterConfig::default())
    }

    /// S1: an ARP request for a port's own IP gets a single emitted reply.
    #[tokio::test]
    async fn arp_request_for_port_ip_is_answered() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone());

        let requester_mac = MacAddress::from([1, 1, 1, 1, 1, 1]);
        let arp = ArpPacket::new_request(requester_mac, Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(10, 0, 0, 1));
        let frame = EthernetFrame {
            dst: MacAddress::BROADCAST,
            src: requester_mac,
            ethertype: ETHERTYPE_ARP,
            payload: arp.to_vec().unwrap(),
        };

        let action = router.process(Ingress { port_id: 1, frame }).await.unwrap();
        assert_eq!(action, Action::Consumed);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (_, reply_frame) = &sent[0];
        assert_eq!(reply_frame.src, port_a().mac);
        let reply = ArpPacket::from_slice(&reply_frame.payload).unwrap();
        assert_eq!(reply.spa, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(reply.tpa, Ipv4Addr::new(10, 0, 0, 50));
    }

    /// S2: TTL=1 triggers ICMP Time Exceeded and a drop.
    #[tokio::test]
    async fn ttl_of_one_triggers_time_exceeded() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone());

        let ip_packet = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 1,
            flags: Ipv4Flags { df: false, mf: false },
            fragment_offset: 0,
            ttl: 1,
            proto: 17,
            src: Ipv4Addr::new(10, 0, 0, 50),
            dest: Ipv4Addr::new(8, 8, 8, 8),
            content: vec![0; 8],
        };
        let requester_mac = MacAddress::from([1, 1, 1, 1, 1, 1]);
        let frame = EthernetFrame {
            dst: port_a().mac,
            src: requester_mac,
            ethertype: ETHERTYPE_IPV4,
            payload: ip_packet.to_vec().unwrap(),
        };

        let action = router.process(Ingress { port_id: 1, frame }).await.unwrap();
        assert_eq!(action, Action::Drop);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (_, reply_frame) = &sent[0];
        let reply_ip = Ipv4Packet::from_slice(&reply_frame.payload).unwrap();
        let icmp = IcmpV4Packet::from_slice(&reply_ip.content).unwrap();
        assert!(icmp.typ.is_error());
    }

    #[tokio::test]
    async fn no_route_generates_net_unreachable() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone());

        let ip_packet = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 1,
            flags: Ipv4Flags { df: false, mf: false },
            fragment_offset: 0,
            ttl: 64,
            proto: 17,
            src: Ipv4Addr::new(10, 0, 0, 50),
            dest: Ipv4Addr::new(203, 0, 113, 5),
            content: vec![0; 8],
        };
        let frame = EthernetFrame {
            dst: port_a().mac,
            src: MacAddress::from([1, 1, 1, 1, 1, 1]),
            ethertype: ETHERTYPE_IPV4,
            payload: ip_packet.to_vec().unwrap(),
        };

        let action = router.process(Ingress { port_id: 1, frame }).await.unwrap();
        assert_eq!(action, Action::Drop);
        let sent = sink.sent.lock().unwrap();
        let reply_ip = Ipv4Packet::from_slice(&sent[0].1.payload).unwrap();
        let icmp = IcmpV4Packet::from_slice(&reply_ip.content).unwrap();
        assert_eq!(icmp.typ, IcmpV4Type::DestinationUnreachable(DestUnreachCode::NetUnreachable));
    }

    #[tokio::test]
    async fn blackhole_route_drops_silently() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone());
        router
            .add_route(Route {
                dst: Cidr::new(Ipv4Addr::new(203, 0, 113, 0), 24),
                src: Cidr::new(Ipv4Addr::UNSPECIFIED, 0),
                next_hop: NextHop::Blackhole,
                next_hop_gateway: Ipv4Addr::UNSPECIFIED,
                weight: 10,
            })
            .await;

        let ip_packet = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 1,
            flags: Ipv4Flags { df: false, mf: false },
            fragment_offset: 0,
            ttl: 64,
            proto: 17,
            src: Ipv4Addr::new(10, 0, 0, 50),
            dest: Ipv4Addr::new(203, 0, 113, 5),
            content: vec![0; 8],
        };
        let frame = EthernetFrame {
            dst: port_a().mac,
            src: MacAddress::from([1, 1, 1, 1, 1, 1]),
            ethertype: ETHERTYPE_IPV4,
            payload: ip_packet.to_vec().unwrap(),
        };

        let action = router.process(Ingress { port_id: 1, frame }).await.unwrap();
        assert_eq!(action, Action::Drop);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn echo_request_to_port_ip_is_answered() {
        let sink = Arc::new(RecordingSink::new());
        let router = test_router(sink.clone());

        let icmp = IcmpV4Packet {
            typ: IcmpV4Type::EchoRequest { identifier: 42, sequence: 1 },
            payload: vec![9, 9, 9],
        };
        let ip_packet = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 1,
            flags: Ipv4Flags { df: false, mf: false },
            fragment_offset: 0,
            ttl: 64,
            proto: PROTO_ICMPV4,
            src: Ipv4Addr::new(10, 0, 0, 50),
            dest: Ipv4Addr::new(10, 0, 0, 1),
            content: icmp.to_vec().unwrap(),
        };
        let frame = EthernetFrame {
            dst: port_a().mac,
            src: MacAddress::from([1, 1, 1, 1, 1, 1]),
            ethertype: ETHERTYPE_IPV4,
            payload: ip_packet.to_vec().unwrap(),
        };

        let action = router.process(Ingress { port_id: 1, frame }).await.unwrap();
        assert_eq!(action, Action::Consumed);
        let sent = sink.sent.lock().unwrap();
        let reply_ip = Ipv4Packet::from_slice(&sent[0].1.payload).unwrap();
        let reply_icmp = IcmpV4Packet::from_slice(&reply_ip.content).unwrap();
        assert_eq!(reply_icmp.typ, IcmpV4Type::EchoReply { identifier: 42, sequence: 1 });
    }
}
