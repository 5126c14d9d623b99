//! In-process configuration surface.
//!
//! Loading these from a file or CLI flags is an external concern (§1); the
//! structs here are the knobs an embedding program sets directly, the same
//! role the teacher's `ArpConfig { validity, timeout }` plays.

use std::time::Duration;

/// Timing constants governing one IP's ARP cache entry lifecycle (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpConfig {
    /// How long an ARP request waits for a reply before retrying.
    pub retry: Duration,
    /// Overall deadline for a single `get()` call when the caller supplies
    /// none of their own.
    pub timeout: Duration,
    /// How long a resolved entry is considered fresh without re-ARPing.
    pub stale: Duration,
    /// How long a resolved entry is usable at all before it is evicted.
    pub expiration: Duration,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            retry: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            stale: Duration::from_secs(1800),
            expiration: Duration::from_secs(3600),
        }
    }
}

/// Router-wide knobs beyond ARP timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    pub arp: ArpConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            arp: ArpConfig::default(),
        }
    }
}
