//! Narrow IPsec site-to-site VPN container lifecycle (§4.6): config
//! rendering plus the `vpn-helper`-driven namespace lifecycle.

pub mod container;
pub mod render;

pub use container::{
    ContainerConfig, ContainerHealth, ContainerStatus, HealthCode, HelperInvoker, IpsecContainer, ProcessHelperInvoker,
    TopologySource, VpnTopologyState,
};
pub use render::{
    DpdAction, IPSecServiceDef, IPSecSiteConnection, IkePolicy, IkeVersion, Initiator, IpsecMode, IpsecPolicy,
};
