//! `ArpTable`: coalesced, retrying, shared-cache-backed ARP resolution
//! (§4.1, §5).

use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use fxhash::{FxHashMap, FxHashSet};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{trace, warn};

use vnet_types::{
    arp::ArpPacket,
    ethernet::{EthernetFrame, ETHERTYPE_ARP},
    mac::MacAddress,
};

use crate::{
    arp::{ArpCacheEntry, FrameSink},
    config::ArpConfig,
    error::AgentResult,
    router::port::RouterPort,
    store::SharedMapHandle,
};

type Cache = SharedMapHandle<Ipv4Addr, ArpCacheEntry>;
type WaiterMap = FxHashMap<Ipv4Addr, FxHashMap<u64, oneshot::Sender<Option<MacAddress>>>>;

struct Inner {
    cache: Cache,
    sink: Arc<dyn FrameSink>,
    config: ArpConfig,
    waiters: Mutex<WaiterMap>,
    notifies: Mutex<FxHashMap<Ipv4Addr, Arc<Notify>>>,
    next_waiter_id: AtomicU64,
    /// IPs with an active retry loop. Gates `get()`'s decision to spawn one
    /// so two concurrent cold-start lookups for the same IP can't each
    /// conclude "nobody's resolving this yet" and both spawn (and both
    /// re-ARP).
    resolving: Mutex<FxHashSet<Ipv4Addr>>,
}

/// Cheaply cloneable handle to the shared resolver state; background retry
/// and expiry tasks hold their own clone.
#[derive(Clone)]
pub struct ArpTable(Arc<Inner>);

impl ArpTable {
    #[must_use]
    pub fn new(cache: Cache, sink: Arc<dyn FrameSink>, config: ArpConfig) -> Self {
        Self(Arc::new(Inner {
            cache,
            sink,
            config,
            waiters: Mutex::new(FxHashMap::default()),
            notifies: Mutex::new(FxHashMap::default()),
            next_waiter_id: AtomicU64::new(0),
            resolving: Mutex::new(FxHashSet::default()),
        }))
    }

    /// Resolves `ip` reachable via `port`, bounded by `deadline`.
    ///
    /// Returns `Ok(None)` when the address is known to have no answer (it's
    /// outside the port's subnet, or every retry drained with nothing
    /// found); returns `Err(Timeout)` only when the *caller's* deadline
    /// elapses without any resolution, positive or negative, arriving.
    pub async fn get(
        &self,
        ip: Ipv4Addr,
        port: &RouterPort,
        deadline: Instant,
    ) -> AgentResult<Option<MacAddress>> {
        if !port.subnet().contains(ip) {
            trace!(%ip, port = port.id, "address outside port subnet, not arping");
            return Ok(None);
        }

        let now = Instant::now();
        let entry = self.0.cache.get(&ip).await?;
        let needs_resolution = entry.as_ref().map_or(true, |e| e.mac.is_none() || e.stale < now);

        if needs_resolution {
            if entry.is_none() {
                self.0
                    .cache
                    .put(ip, ArpCacheEntry::in_flight(now, self.0.config.expiration))
                    .await?;
                self.schedule_expiry(ip, self.0.config.expiration);
            }
            // Only the caller that wins the race to claim `ip` in
            // `resolving` spawns a retry loop for it; everyone else's
            // request is served by that one loop's `set()`/expiry.
            let claimed = self.0.resolving.lock().await.insert(ip);
            if claimed {
                self.spawn_retry_loop(ip, *port, None);
            }
        }

        if let Some(entry) = &entry {
            if entry.expiry >= now {
                return Ok(entry.mac);
            }
        }

        self.wait_for_resolution(ip, deadline).await
    }

    /// Publishes a resolved binding, waking every waiter for `ip`.
    pub async fn set(&self, ip: Ipv4Addr, mac: MacAddress) -> AgentResult<()> {
        let now = Instant::now();
        let entry = ArpCacheEntry::resolved(mac, now, self.0.config.stale, self.0.config.expiration);
        self.0.cache.put(ip, entry).await?;
        self.complete_waiters(ip, Some(mac)).await;
        self.wake_retry_loop(ip).await;
        self.schedule_expiry(ip, self.0.config.expiration);
        Ok(())
    }

    /// Builds (without emitting) the ARP request frame for `ip` on `port` —
    /// resolving the ambiguity in the original source, where the
    /// equivalent builder discarded its own return value (§11(b)).
    #[must_use]
    pub fn make_arp_request(port: &RouterPort, ip: Ipv4Addr) -> EthernetFrame {
        let arp = ArpPacket::new_request(port.mac, port.ip, ip);
        EthernetFrame {
            dst: MacAddress::BROADCAST,
            src: port.mac,
            ethertype: ETHERTYPE_ARP,
            payload: arp.to_vec().expect("arp packet encoding is infallible"),
        }
    }

    async fn wait_for_resolution(&self, ip: Ipv4Addr, deadline: Instant) -> AgentResult<Option<MacAddress>> {
        let id = self.0.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.0
            .waiters
            .lock()
            .await
            .entry(ip)
            .or_default()
            .insert(id, tx);

        let result = tokio::time::timeout_at(deadline.into(), rx).await;

        // Remove ourselves regardless of outcome; a completed waiter was
        // already drained by `complete_waiters`, this is a no-op then.
        if let Some(map) = self.0.waiters.lock().await.get_mut(&ip) {
            map.remove(&id);
        }

        match result {
            Ok(Ok(mac)) => Ok(mac),
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(crate::error::AgentError::Timeout),
        }
    }

    async fn complete_waiters(&self, ip: Ipv4Addr, mac: Option<MacAddress>) {
        if let Some(list) = self.0.waiters.lock().await.remove(&ip) {
            for (_, tx) in list {
                let _ = tx.send(mac);
            }
        }
    }

    async fn notify_handle(&self, ip: Ipv4Addr) -> Arc<Notify> {
        self.0
            .notifies
            .lock()
            .await
            .entry(ip)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    async fn wake_retry_loop(&self, ip: Ipv4Addr) {
        if let Some(n) = self.0.notifies.lock().await.get(&ip) {
            n.notify_waiters();
        }
    }

    fn spawn_retry_loop(&self, ip: Ipv4Addr, port: RouterPort, previous: Option<Instant>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.arp_for_address(ip, port, previous).await;
            this.0.resolving.lock().await.remove(&ip);
        });
    }

    fn schedule_expiry(&self, ip: Ipv4Addr, after: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let now = Instant::now();
            if let Ok(Some(entry)) = this.0.cache.get(&ip).await {
                if entry.expiry <= now {
                    this.complete_waiters(ip, None).await;
                    let _ = this.0.cache.remove(&ip).await;
                }
            }
        });
    }

    /// The retry loop of §4.1: top half refetches, bottom half decides
    /// whether to back off, to re-ARP, or to exit because the entry is
    /// current or another resolver took the lease.
    async fn arp_for_address(&self, ip: Ipv4Addr, port: RouterPort, mut previous: Option<Instant>) {
        loop {
            let now = Instant::now();
            let entry = match self.0.cache.get(&ip).await {
                Ok(Some(e)) => e,
                Ok(None) => {
                    self.complete_waiters(ip, None).await;
                    return;
                }
                Err(_) => {
                    self.complete_waiters(ip, None).await;
                    return;
                }
            };

            if entry.expiry <= now {
                self.complete_waiters(ip, None).await;
                let _ = self.0.cache.remove(&ip).await;
                return;
            }

            if let Some(prev) = previous {
                if entry.last_arp != prev {
                    // Unless the lease-holder's last attempt is stale enough
                    // that it looks stalled (§5: "unless the entry is older
                    // than 2x RETRY"), yield to it rather than re-arping too.
                    if now.duration_since(entry.last_arp) < 2 * self.0.config.retry {
                        trace!(%ip, "another resolver holds the arp lease, backing off");
                        return;
                    }
                    trace!(%ip, "lease holder appears stalled, re-arping anyway");
                }
            }

            if let Some(mac) = entry.mac {
                if entry.stale > now {
                    trace!(%ip, %mac, "entry already fresh, leaving resolution to set()");
                    return;
                }
            }

            let notify = self.notify_handle(ip).await;
            let notified = notify.notified();

            let mut updated = entry;
            updated.last_arp = now;
            if self.0.cache.put(ip, updated).await.is_err() {
                return;
            }

            let frame = Self::make_arp_request(&port, ip);
            match self.0.sink.emit(port.id, frame).await {
                Ok(()) => trace!(%ip, port = port.id, "sent arp request"),
                Err(e) => warn!(%ip, error = %e, "failed to emit arp request"),
            }

            if tokio::time::timeout(self.0.config.retry, notified).await.is_ok() {
                return;
            }
            previous = Some(now);
        }
    }
}
