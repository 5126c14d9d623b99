//! The Address Resolution Protocol (ARP): a shared, watchable IP→MAC cache
//! (§3) and the asynchronous resolver built on top of it (§4.1).

mod table;
pub use table::ArpTable;

use std::time::Instant;

use vnet_types::mac::MacAddress;

/// A record in the shared ARP cache (§3). `mac = None` means "resolution in
/// flight" — a waiter is registered but no reply has arrived yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpCacheEntry {
    pub mac: Option<MacAddress>,
    /// The entry is usable at all until this instant.
    pub expiry: Instant,
    /// The entry is usable *without* a refresh ARP until this instant.
    /// Invariant: `stale <= expiry`.
    pub stale: Instant,
    /// The last instant an ARP request was sent for this IP, used as a
    /// cooperative lease between racing resolvers.
    pub last_arp: Instant,
}

impl ArpCacheEntry {
    #[must_use]
    pub fn in_flight(now: Instant, expiration: std::time::Duration) -> Self {
        Self {
            mac: None,
            expiry: now + expiration,
            stale: now,
            last_arp: now,
        }
    }

    #[must_use]
    pub fn resolved(mac: MacAddress, now: Instant, stale: std::time::Duration, expiration: std::time::Duration) -> Self {
        Self {
            mac: Some(mac),
            expiry: now + expiration,
            stale: now + stale,
            last_arp: now,
        }
    }
}

/// The emitter of Ethernet frames onto a port — the datapath/simulation
/// controller collaborator (out of scope per §1, modeled as a trait so the
/// router and ARP table can be driven against a recorder in tests).
#[async_trait::async_trait]
pub trait FrameSink: Send + Sync {
    async fn emit(&self, port_id: u32, frame: vnet_types::ethernet::EthernetFrame) -> crate::error::AgentResult<()>;
}
