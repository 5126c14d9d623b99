//! VxLAN Gateway synchronization: the per-logical-switch bus (§4.4) and the
//! control loop that mirrors a bridge's MAC/ARP state onto it (§4.5).

pub mod bus;
pub mod manager;

pub use bus::{MacLocation, VxGateway};
pub use manager::{Bridge, BridgeSource, VtepPeer, VtepPool, VxGatewayManager, VxGatewayManagerConfig, VxLanPort};
