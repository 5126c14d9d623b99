//! `RouterPort` (§3) and the `PortResolver` seam (§9) that breaks the
//! Router↔VirtualTopology↔Port reference cycle the original design had.

use vnet_types::{ip::Cidr, mac::MacAddress};
use std::net::Ipv4Addr;

pub type PortId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortVariant {
    Exterior,
    Interior { peer_port_id: PortId },
}

/// A single router-facing interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterPort {
    pub id: PortId,
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub nw_addr: Ipv4Addr,
    pub nw_length: u8,
    pub variant: PortVariant,
}

impl RouterPort {
    #[must_use]
    pub fn subnet(&self) -> Cidr {
        Cidr::new(self.nw_addr, self.nw_length)
    }

    #[must_use]
    pub fn is_interior(&self) -> bool {
        matches!(self.variant, PortVariant::Interior { .. })
    }

    #[must_use]
    pub fn peer_port_id(&self) -> Option<PortId> {
        match self.variant {
            PortVariant::Interior { peer_port_id } => Some(peer_port_id),
            PortVariant::Exterior => None,
        }
    }
}

/// Resolves ports by id without the Router needing a back-reference into
/// the virtual-topology cache (§9: "break with an explicit PortResolver
/// interface injected into the Router").
#[async_trait::async_trait]
pub trait PortResolver: Send + Sync {
    async fn port(&self, id: PortId) -> Option<RouterPort>;
}
