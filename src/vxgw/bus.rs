//! `VxGateway`: the per-logical-switch `MacLocation` pub/sub (§4.4).

use std::net::Ipv4Addr;

use tokio::sync::broadcast;
use tracing::trace;

use vnet_types::mac::MacAddress;

/// A single MAC/IP binding advertised onto (or withdrawn from) a logical
/// switch. `vxlan_tunnel_ip = None` means "withdraw"; `ip = None` means
/// "MAC-only, no ARP suppression entry" (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacLocation {
    pub mac: MacAddress,
    pub ip: Option<Ipv4Addr>,
    pub logical_switch: String,
    pub vxlan_tunnel_ip: Option<Ipv4Addr>,
}

/// The bus for one Neutron network's logical switch. Filters out anything
/// published for a different switch name (§4.4) — this is what lets
/// multiple `VxGatewayManager`s share one transport without cross-talk.
pub struct VxGateway {
    network_id: String,
    pub name: String,
    tx: broadcast::Sender<MacLocation>,
}

impl VxGateway {
    #[must_use]
    pub fn new(network_id: impl Into<String>) -> Self {
        let network_id = network_id.into();
        let name = format!("mn-{network_id}");
        let (tx, _rx) = broadcast::channel(1024);
        Self { network_id, name, tx }
    }

    #[must_use]
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Publishes `loc`, silently dropping it if it names a different
    /// logical switch than this bus serves.
    pub fn publish(&self, loc: MacLocation) {
        if loc.logical_switch != self.name {
            trace!(bus = %self.name, published_for = %loc.logical_switch, "dropping mac location for foreign logical switch");
            return;
        }
        let _ = self.tx.send(loc);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MacLocation> {
        self.tx.subscribe()
    }
}
