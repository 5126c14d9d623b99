//! `VxGatewayManager` (§4.5): tracks a bridge's bound VTEPs, mirrors its
//! MAC/ARP state onto the [`VxGateway`] bus, and attaches/detaches peers.

use std::{collections::HashSet, net::Ipv4Addr, sync::Arc};

use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use vnet_types::mac::MacAddress;

use crate::{
    error::{AgentError, AgentResult},
    router::port::PortId,
    store::{MapChange, SharedMapHandle},
};

use super::bus::{MacLocation, VxGateway};

/// A hardware VTEP's management/tunnel endpoint (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VxLanPort {
    pub id: PortId,
    pub mgmt_ip: Ipv4Addr,
    pub mgmt_port: u16,
    pub vni: u32,
    pub tunnel_ip: Ipv4Addr,
}

/// A bridge's bound VxLAN ports, in attach order (§3).
#[derive(Debug, Clone)]
pub struct Bridge {
    pub id: String,
    pub vxlan_port_ids: Vec<PortId>,
}

/// Resolves the topology facts the manager needs about its bridge and
/// ports — the virtual-topology cache collaborator (out of scope per §1).
#[async_trait::async_trait]
pub trait BridgeSource: Send + Sync {
    async fn bridge(&self, id: &str) -> Option<Bridge>;
    async fn vxlan_port(&self, id: PortId) -> Option<VxLanPort>;
    /// True if `port_id` is an ordinary (non-VxLAN) bridge port.
    async fn is_midonet_port(&self, port_id: PortId) -> bool;
    /// This bridge's own VxLAN tunnel endpoint, used when the other side of
    /// a MAC move is a MidoNet port rather than a known VTEP.
    async fn tunnel_endpoint(&self) -> Option<Ipv4Addr>;
}

/// The remote end of an attached VTEP (§4.5: "have the VtepPool peer
/// `join(gateway, snapshot)`").
#[async_trait::async_trait]
pub trait VtepPeer: Send + Sync {
    async fn join(&self, gateway_name: &str, snapshot: Vec<MacLocation>);
    async fn abandon(&self, gateway_name: &str);
}

#[async_trait::async_trait]
pub trait VtepPool: Send + Sync {
    async fn peer_for(&self, vxlan_port: &VxLanPort) -> Arc<dyn VtepPeer>;
}

#[derive(Debug, Clone, Copy)]
pub struct VxGatewayManagerConfig {
    /// §11(a): the resolution of the flooding-proxy open question. When
    /// `None` and a tunnel endpoint can't be determined, affected entries
    /// are skipped (with a `warn!`) rather than emitted against a bogus
    /// address.
    pub flooding_proxy: Option<Ipv4Addr>,
}

struct State {
    vni: Option<u32>,
    bound_ports: HashSet<PortId>,
    peers: std::collections::HashMap<PortId, Arc<dyn VtepPeer>>,
    terminated: bool,
}

pub struct VxGatewayManager {
    bridge_id: String,
    bridges: Arc<dyn BridgeSource>,
    vtep_pool: Arc<dyn VtepPool>,
    mac_port_map: SharedMapHandle<MacAddress, PortId>,
    arp_map: SharedMapHandle<Ipv4Addr, MacAddress>,
    bus: VxGateway,
    config: VxGatewayManagerConfig,
    state: RwLock<State>,
}

impl VxGatewayManager {
    #[must_use]
    pub fn new(
        bridge_id: String,
        bridges: Arc<dyn BridgeSource>,
        vtep_pool: Arc<dyn VtepPool>,
        mac_port_map: SharedMapHandle<MacAddress, PortId>,
        arp_map: SharedMapHandle<Ipv4Addr, MacAddress>,
        config: VxGatewayManagerConfig,
    ) -> Self {
        let bus = VxGateway::new(bridge_id.clone());
        Self {
            bridge_id,
            bridges,
            vtep_pool,
            mac_port_map,
            arp_map,
            bus,
            config,
            state: RwLock::new(State {
                vni: None,
                bound_ports: HashSet::new(),
                peers: std::collections::HashMap::new(),
                terminated: false,
            }),
        }
    }

    #[must_use]
    pub fn bus(&self) -> &VxGateway {
        &self.bus
    }

    /// Loads bridge state and attaches to every VxLAN port currently bound
    /// (§4.5 `start`).
    pub async fn start(&self) -> AgentResult<()> {
        let bridge = self
            .bridges
            .bridge(&self.bridge_id)
            .await
            .ok_or_else(|| AgentError::NotFound(format!("bridge {}", self.bridge_id)))?;
        self.on_bridge_update(&bridge.vxlan_port_ids).await
    }

    /// Recomputes the bound-port set against `new_port_ids` (§4.5): removed
    /// ports are unbound and told to abandon this gateway; added ports
    /// adopt or validate the VNI and join with a fresh snapshot.
    pub async fn on_bridge_update(&self, new_port_ids: &[PortId]) -> AgentResult<()> {
        let new_set: HashSet<PortId> = new_port_ids.iter().copied().collect();

        let removed: Vec<PortId> = {
            let state = self.state.read().await;
            state.bound_ports.difference(&new_set).copied().collect()
        };
        for port_id in removed {
            self.unbind(port_id).await;
        }

        let added: Vec<PortId> = {
            let state = self.state.read().await;
            new_set.difference(&state.bound_ports).copied().collect()
        };
        for port_id in added {
            self.bind(port_id).await?;
        }

        if new_set.is_empty() {
            self.terminate().await;
        }

        Ok(())
    }

    async fn bind(&self, port_id: PortId) -> AgentResult<()> {
        let Some(vxlan_port) = self.bridges.vxlan_port(port_id).await else {
            warn!(port = port_id, "bound port is not a known vxlan port, ignoring");
            return Ok(());
        };

        {
            let mut state = self.state.write().await;
            match state.vni {
                None => {
                    debug!(vni = vxlan_port.vni, "adopting vni from first bound vxlan port");
                    state.vni = Some(vxlan_port.vni);
                }
                Some(vni) if vni != vxlan_port.vni => {
                    warn!(expected = vni, got = vxlan_port.vni, port = port_id, "vni mismatch, ignoring port");
                    return Ok(());
                }
                _ => {}
            }
            state.bound_ports.insert(port_id);
        }

        let peer = self.vtep_pool.peer_for(&vxlan_port).await;
        let snapshot = self.snapshot().await?;
        peer.join(&self.bus.name, snapshot).await;
        self.state.write().await.peers.insert(port_id, peer);
        Ok(())
    }

    async fn unbind(&self, port_id: PortId) {
        let peer = {
            let mut state = self.state.write().await;
            state.bound_ports.remove(&port_id);
            state.peers.remove(&port_id)
        };
        if let Some(peer) = peer {
            peer.abandon(&self.bus.name).await;
        }
    }

    /// §4.5 `terminate`: unsubscribe, stop watchers (the caller's `run`
    /// loop, not modeled here, simply exits), and surface
    /// `NotInVxlanGateway` to anyone still awaiting on this manager.
    pub async fn terminate(&self) {
        let mut state = self.state.write().await;
        if state.terminated {
            return;
        }
        state.terminated = true;
        debug!(bridge = %self.bridge_id, "vxgateway manager terminated: no vteps bound");
    }

    #[must_use]
    pub async fn is_terminated(&self) -> bool {
        self.state.read().await.terminated
    }

    /// The MAC→port watcher (§4.5): republishes a change when either side
    /// references a MidoNet port; moves strictly between VTEPs are left to
    /// the VTEP peers themselves.
    pub async fn handle_mac_port_change(&self, change: MapChange<MacAddress, PortId>) -> AgentResult<()> {
        if self.is_terminated().await {
            return Err(AgentError::NotInVxlanGateway);
        }

        let old_is_mido = match change.old {
            Some(p) => self.bridges.is_midonet_port(p).await,
            None => false,
        };
        let new_is_mido = match change.new {
            Some(p) => self.bridges.is_midonet_port(p).await,
            None => false,
        };
        if !old_is_mido && !new_is_mido {
            trace!(mac = %change.key, "mac moved strictly between vteps, leaving to peers");
            return Ok(());
        }

        for loc in self.to_mac_locations(change.key, change.new, change.old, true).await {
            self.bus.publish(loc);
        }
        Ok(())
    }

    /// The ARP-table watcher (§4.5): withdraws the old binding and
    /// (re-)advertises the new one, each gated on the owning port being a
    /// MidoNet port.
    pub async fn handle_arp_change(&self, change: MapChange<Ipv4Addr, MacAddress>) -> AgentResult<()> {
        if self.is_terminated().await {
            return Err(AgentError::NotInVxlanGateway);
        }

        if let Some(old_mac) = change.old {
            if let Some(port) = self.mac_port_map.get(&old_mac).await? {
                if self.bridges.is_midonet_port(port).await {
                    self.bus.publish(MacLocation {
                        mac: old_mac,
                        ip: Some(change.key),
                        logical_switch: self.bus.name.clone(),
                        vxlan_tunnel_ip: None,
                    });
                }
            }
        }

        if let Some(new_mac) = change.new {
            if let Some(port) = self.mac_port_map.get(&new_mac).await? {
                if self.bridges.is_midonet_port(port).await {
                    self.advertise_mac_and_ip_at(new_mac, change.key, port).await?;
                }
            }
        }
        Ok(())
    }

    /// Rechecks the MAC still lives at `port` before advertising — the MAC
    /// may have moved again between the ARP event firing and this handler
    /// running.
    async fn advertise_mac_and_ip_at(&self, mac: MacAddress, ip: Ipv4Addr, port: PortId) -> AgentResult<()> {
        if self.mac_port_map.get(&mac).await? != Some(port) {
            trace!(%mac, "mac moved again before advertisement, skipping");
            return Ok(());
        }
        let tunnel_dst = self.tunnel_dst_for(port).await;
        if let Some(dst) = tunnel_dst {
            self.bus.publish(MacLocation {
                mac,
                ip: Some(ip),
                logical_switch: self.bus.name.clone(),
                vxlan_tunnel_ip: Some(dst),
            });
        } else {
            warn!(%mac, %ip, "no tunnel endpoint available, dropping advertisement");
        }
        Ok(())
    }

    async fn tunnel_dst_for(&self, port_id: PortId) -> Option<Ipv4Addr> {
        if self.bridges.is_midonet_port(port_id).await {
            self.bridges.tunnel_endpoint().await
        } else {
            self.bridges.vxlan_port(port_id).await.map(|p| p.tunnel_ip)
        }
    }

    /// `toMacLocations` (§4.5): translates one MAC-port map entry into the
    /// `MacLocation`s to publish.
    async fn to_mac_locations(&self, mac: MacAddress, new_port: Option<PortId>, old_port: Option<PortId>, only_mido: bool) -> Vec<MacLocation> {
        if only_mido {
            let old_is_mido = match old_port {
                Some(p) => self.bridges.is_midonet_port(p).await,
                None => false,
            };
            let new_is_mido = match new_port {
                Some(p) => self.bridges.is_midonet_port(p).await,
                None => false,
            };
            if !old_is_mido && !new_is_mido {
                return Vec::new();
            }
        }

        let tunnel_dst = match new_port {
            Some(p) => self.tunnel_dst_for(p).await,
            None => None,
        };

        let ips = self.known_ips_for(mac).await;

        match (tunnel_dst, new_port) {
            (None, Some(_)) => {
                let Some(proxy) = self.config.flooding_proxy else {
                    warn!(%mac, "no tunnel endpoint and no flooding proxy configured, skipping");
                    return vec![self.withdraw(mac)];
                };
                let mut out = vec![self.withdraw(mac)];
                for ip in ips {
                    out.push(MacLocation {
                        mac,
                        ip: Some(ip),
                        logical_switch: self.bus.name.clone(),
                        vxlan_tunnel_ip: Some(proxy),
                    });
                }
                out
            }
            (None, None) => vec![self.withdraw(mac)],
            (Some(dst), _) => {
                let mut out = vec![MacLocation {
                    mac,
                    ip: None,
                    logical_switch: self.bus.name.clone(),
                    vxlan_tunnel_ip: Some(dst),
                }];
                for ip in ips {
                    out.push(MacLocation {
                        mac,
                        ip: Some(ip),
                        logical_switch: self.bus.name.clone(),
                        vxlan_tunnel_ip: Some(dst),
                    });
                }
                out
            }
        }
    }

    fn withdraw(&self, mac: MacAddress) -> MacLocation {
        MacLocation {
            mac,
            ip: None,
            logical_switch: self.bus.name.clone(),
            vxlan_tunnel_ip: None,
        }
    }

    async fn known_ips_for(&self, mac: MacAddress) -> Vec<Ipv4Addr> {
        match self.arp_map.snapshot().await {
            Ok(entries) => entries.into_iter().filter(|(_, m)| *m == mac).map(|(ip, _)| ip).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// On VTEP join: every MAC-port entry, translated with `only_mido =
    /// false` (§4.5 "Snapshot").
    pub async fn snapshot(&self) -> AgentResult<Vec<MacLocation>> {
        let mut out = Vec::new();
        for (mac, port) in self.mac_port_map.snapshot().await? {
            out.extend(self.to_mac_locations(mac, Some(port), None, false).await);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMap;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    struct FixtureTopology {
        midonet_ports: HashSet<PortId>,
        vxlan_ports: StdHashMap<PortId, VxLanPort>,
        tunnel_endpoint: Option<Ipv4Addr>,
    }

    #[async_trait::async_trait]
    impl BridgeSource for FixtureTopology {
        async fn bridge(&self, id: &str) -> Option<Bridge> {
            Some(Bridge {
                id: id.to_string(),
                vxlan_port_ids: self.vxlan_ports.keys().copied().collect(),
            })
        }
        async fn vxlan_port(&self, id: PortId) -> Option<VxLanPort> {
            self.vxlan_ports.get(&id).copied()
        }
        async fn is_midonet_port(&self, port_id: PortId) -> bool {
            self.midonet_ports.contains(&port_id)
        }
        async fn tunnel_endpoint(&self) -> Option<Ipv4Addr> {
            self.tunnel_endpoint
        }
    }

    struct NoopPeer;
    #[async_trait::async_trait]
    impl VtepPeer for NoopPeer {
        async fn join(&self, _gateway_name: &str, _snapshot: Vec<MacLocation>) {}
        async fn abandon(&self, _gateway_name: &str) {}
    }

    struct FixturePool;
    #[async_trait::async_trait]
    impl VtepPool for FixturePool {
        async fn peer_for(&self, _vxlan_port: &VxLanPort) -> Arc<dyn VtepPeer> {
            Arc::new(NoopPeer)
        }
    }

    fn mac(n: u8) -> MacAddress {
        MacAddress::from([0xaa, 0xaa, 0xaa, 0, 0, n])
    }

    /// S6: join snapshot covers both a MidoNet-origin and a VTEP-origin MAC.
    #[tokio::test]
    async fn snapshot_covers_both_mido_and_vtep_origin_macs() {
        let port_a = 1; // midonet
        let port_b = 2; // vtep

        let topo = Arc::new(FixtureTopology {
            midonet_ports: [port_a].into_iter().collect(),
            vxlan_ports: StdHashMap::from([(
                port_b,
                VxLanPort {
                    id: port_b,
                    mgmt_ip: Ipv4Addr::new(172, 16, 0, 2),
                    mgmt_port: 6632,
                    vni: 5001,
                    tunnel_ip: Ipv4Addr::new(172, 16, 0, 2),
                },
            )]),
            tunnel_endpoint: Some(Ipv4Addr::new(10, 200, 0, 1)),
        });

        let mac_port_map: SharedMapHandle<MacAddress, PortId> = Arc::new(InMemoryMap::new());
        mac_port_map.put(mac(1), port_a).await.unwrap();
        mac_port_map.put(mac(2), port_b).await.unwrap();

        let arp_map: SharedMapHandle<Ipv4Addr, MacAddress> = Arc::new(InMemoryMap::new());
        arp_map.put(Ipv4Addr::new(10, 0, 0, 10), mac(1)).await.unwrap();
        arp_map.put(Ipv4Addr::new(10, 0, 0, 20), mac(2)).await.unwrap();

        let manager = VxGatewayManager::new(
            "net-1".to_string(),
            topo,
            Arc::new(FixturePool),
            mac_port_map,
            arp_map,
            VxGatewayManagerConfig { flooding_proxy: None },
        );

        let snapshot = manager.snapshot().await.unwrap();
        let mac1_entries: Vec<_> = snapshot.iter().filter(|l| l.mac == mac(1)).collect();
        let mac2_entries: Vec<_> = snapshot.iter().filter(|l| l.mac == mac(2)).collect();

        assert!(mac1_entries.iter().any(|l| l.vxlan_tunnel_ip == Some(Ipv4Addr::new(10, 200, 0, 1))));
        assert!(mac2_entries.iter().any(|l| l.vxlan_tunnel_ip == Some(Ipv4Addr::new(172, 16, 0, 2))));
        assert!(snapshot.iter().all(|l| l.logical_switch == "mn-net-1"));
    }

    #[tokio::test]
    async fn mac_location_always_names_its_own_logical_switch() {
        let topo = Arc::new(FixtureTopology {
            midonet_ports: HashSet::new(),
            vxlan_ports: StdHashMap::new(),
            tunnel_endpoint: None,
        });
        let mac_port_map: SharedMapHandle<MacAddress, PortId> = Arc::new(InMemoryMap::new());
        let arp_map: SharedMapHandle<Ipv4Addr, MacAddress> = Arc::new(InMemoryMap::new());
        let manager = VxGatewayManager::new(
            "net-2".to_string(),
            topo,
            Arc::new(FixturePool),
            mac_port_map,
            arp_map,
            VxGatewayManagerConfig { flooding_proxy: Some(Ipv4Addr::new(44, 44, 44, 44)) },
        );

        let locations = StdMutex::new(Vec::new());
        let mut rx = manager.bus().subscribe();
        manager.bus().publish(MacLocation {
            mac: mac(9),
            ip: None,
            logical_switch: manager.bus().name.clone(),
            vxlan_tunnel_ip: Some(Ipv4Addr::new(1, 1, 1, 1)),
        });
        let got = rx.try_recv().unwrap();
        locations.lock().unwrap().push(got.clone());
        assert_eq!(got.logical_switch, manager.bus().name);
    }

    #[tokio::test]
    async fn unbinding_every_vtep_terminates_the_manager() {
        let topo = Arc::new(FixtureTopology {
            midonet_ports: HashSet::new(),
            vxlan_ports: StdHashMap::new(),
            tunnel_endpoint: None,
        });
        let mac_port_map: SharedMapHandle<MacAddress, PortId> = Arc::new(InMemoryMap::new());
        let arp_map: SharedMapHandle<Ipv4Addr, MacAddress> = Arc::new(InMemoryMap::new());
        let manager = VxGatewayManager::new(
            "net-3".to_string(),
            topo,
            Arc::new(FixturePool),
            mac_port_map,
            arp_map,
            VxGatewayManagerConfig { flooding_proxy: None },
        );

        manager.on_bridge_update(&[]).await.unwrap();
        assert!(manager.is_terminated().await);

        let err = manager
            .handle_mac_port_change(MapChange { key: mac(1), old: None, new: Some(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotInVxlanGateway));
    }
}
