//! Plain supervisor owning named child components (§9, §10.5): a flat
//! replacement for an actor-style supervisor and its mailbox-based
//! identity pings.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{AgentError, AgentResult};

/// A supervised child. Implementors drive their own readiness signalling
/// through the `ReadyHandle` they receive at registration — `start`
/// returning `Ok(())` only means "accepted", not "ready".
#[async_trait::async_trait]
pub trait Component: Send + Sync {
    async fn start(&self) -> AgentResult<()>;
    async fn stop(&self) -> AgentResult<()>;
}

struct Child {
    component: Arc<dyn Component>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

/// Owns named children, drives `start`/`stop`, and answers an async
/// "ready, by when" handshake — the §9 redesign of actor `ask`-with-timeout.
#[derive(Default)]
pub struct Supervisor {
    children: RwLock<HashMap<String, Child>>,
}

impl Supervisor {
    #[must_use]
    pub fn new() -> Self {
        Self { children: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, name: impl Into<String>, component: Arc<dyn Component>) {
        let name = name.into();
        let (ready_tx, ready_rx) = watch::channel(false);
        debug!(child = %name, "registering supervised component");
        self.children.write().await.insert(name, Child { component, ready_tx, ready_rx });
    }

    pub async fn unregister(&self, name: &str) {
        self.children.write().await.remove(name);
    }

    pub async fn start(&self, name: &str) -> AgentResult<()> {
        let component = self.component(name).await?;
        info!(child = %name, "starting component");
        component.start().await
    }

    pub async fn stop(&self, name: &str) -> AgentResult<()> {
        let component = self.component(name).await?;
        info!(child = %name, "stopping component");
        let result = component.stop().await;
        if let Some(child) = self.children.write().await.get(name) {
            let _ = child.ready_tx.send(false);
        }
        result
    }

    /// Marks `name` ready; wakes anyone currently blocked in `ready`.
    pub async fn mark_ready(&self, name: &str) -> AgentResult<()> {
        let children = self.children.read().await;
        let child = children.get(name).ok_or_else(|| AgentError::NotFound(name.to_string()))?;
        let _ = child.ready_tx.send(true);
        Ok(())
    }

    /// Blocks until `name` signals readiness or `deadline` passes, whichever
    /// comes first. A missing child is `NotFound`; a late one is `Timeout`.
    pub async fn ready(&self, name: &str, deadline: Instant) -> AgentResult<()> {
        let mut rx = {
            let children = self.children.read().await;
            let child = children.get(name).ok_or_else(|| AgentError::NotFound(name.to_string()))?;
            child.ready_rx.clone()
        };

        loop {
            if *rx.borrow() {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Err(AgentError::Timeout),
            }
        }
    }

    async fn component(&self, name: &str) -> AgentResult<Arc<dyn Component>> {
        self.children
            .read()
            .await
            .get(name)
            .map(|c| c.component.clone())
            .ok_or_else(|| AgentError::NotFound(name.to_string()))
    }
}
