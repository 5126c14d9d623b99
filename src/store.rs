//! The shared-state store abstraction.
//!
//! Per §1 this is modeled, not implemented: in production it is a
//! replicated KV store written to by every agent node and watched for
//! changes. `SharedMap` is the minimal async, watchable map the rest of
//! this crate needs from it — an in-memory implementation is provided for
//! tests and the demo binary, grounded in the same "atomic add/remove with
//! watch callbacks" contract §5 describes.

use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::error::AgentResult;

/// A change observed on a [`SharedMap`]: `old`/`new` are `None` on
/// insertion-from-nothing / removal respectively.
#[derive(Debug, Clone)]
pub struct MapChange<K, V> {
    pub key: K,
    pub old: Option<V>,
    pub new: Option<V>,
}

/// A replicated, watchable key/value map — the "shared-state store"
/// external collaborator.
#[async_trait]
pub trait SharedMap<K, V>: Send + Sync
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> AgentResult<Option<V>>;
    async fn put(&self, key: K, value: V) -> AgentResult<()>;
    async fn remove(&self, key: &K) -> AgentResult<()>;
    async fn snapshot(&self) -> AgentResult<Vec<(K, V)>>;
    /// Subscribes to every future add/remove. Replay-safe: a watcher that
    /// reconnects and re-derives state from a fresh `snapshot()` plus the
    /// events seen from here on reaches the same conclusion (§9).
    fn watch(&self) -> broadcast::Receiver<MapChange<K, V>>;
}

/// An in-process implementation of [`SharedMap`], standing in for the
/// external store in tests and the demo binary.
pub struct InMemoryMap<K, V> {
    inner: Mutex<HashMap<K, V>>,
    events: broadcast::Sender<MapChange<K, V>>,
}

impl<K, V> InMemoryMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(HashMap::new()),
            events: tx,
        }
    }
}

impl<K, V> Default for InMemoryMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> SharedMap<K, V> for InMemoryMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> AgentResult<Option<V>> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn put(&self, key: K, value: V) -> AgentResult<()> {
        let old = {
            let mut guard = self.inner.lock().await;
            guard.insert(key.clone(), value.clone())
        };
        let _ = self.events.send(MapChange {
            key,
            old,
            new: Some(value),
        });
        Ok(())
    }

    async fn remove(&self, key: &K) -> AgentResult<()> {
        let old = {
            let mut guard = self.inner.lock().await;
            guard.remove(key)
        };
        if let Some(old) = old {
            let _ = self.events.send(MapChange {
                key: key.clone(),
                old: Some(old),
                new: None,
            });
        }
        Ok(())
    }

    async fn snapshot(&self) -> AgentResult<Vec<(K, V)>> {
        Ok(self
            .inner
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<MapChange<K, V>> {
        self.events.subscribe()
    }
}

/// A convenience alias: most of this crate shares maps behind an `Arc`.
pub type SharedMapHandle<K, V> = Arc<dyn SharedMap<K, V>>;
