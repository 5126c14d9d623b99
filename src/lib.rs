//! Core of a distributed virtual-networking agent: an L3 router with ARP
//! resolution, a VxLAN Gateway control-plane sync loop, and a narrow
//! IPsec site-to-site VPN container lifecycle.
//!
//! The packet-facing pieces (wire types, checksums) live in the `vnet-types`
//! workspace member; this crate is the control plane on top of them.

pub mod arp;
pub mod config;
pub mod error;
pub mod ipsec;
pub mod router;
pub mod routing;
pub mod store;
pub mod supervisor;
pub mod vxgw;

pub use config::{ArpConfig, RouterConfig};
pub use error::{AgentError, AgentResult};
pub use router::{Action, Ingress, Router};
pub use routing::{LoadBalancer, NextHop, Route, RouteMatch};
pub use store::{InMemoryMap, MapChange, SharedMap, SharedMapHandle};
pub use supervisor::{Component, Supervisor};
