//! ==============================================================================
//! hub.rs - broadcast hub (client registry + fan-out)
//! ==============================================================================
//!
//! purpose:
//!     keeps the set of connected clients and delivers one serialized frame to
//!     all of them. each client is a bounded mpsc queue drained by that
//!     connection's writer task (server.rs), so "send failed" means the writer
//!     is gone or the client stopped draining within the send timeout.
//!
//! rules:
//!     - a broadcast works on a snapshot of the registry; membership can change
//!       while sends are in flight without affecting the pass.
//!     - a failed client never blocks or fails the others.
//!     - failed clients are removed after the pass, not during it.
//!
//! ==============================================================================

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Outbound half of one connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<String>,
}

impl ClientHandle {
    pub fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn send(&self, text: String, timeout: Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(timeout, self.tx.send(text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<ClientId>,
}

pub struct BroadcastHub {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    pub fn next_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn register(&self, handle: ClientHandle) {
        let id = handle.id();
        let total = {
            let mut clients = self.clients.write().unwrap_or_else(|p| p.into_inner());
            clients.insert(id, handle);
            clients.len()
        };
        tracing::info!(client = %id, total, "client connected");
    }

    /// Register and get a guard that deregisters on drop.
    pub fn register_guarded(self: &Arc<Self>, handle: ClientHandle) -> Registration {
        let id = handle.id();
        self.register(handle);
        Registration { hub: Arc::clone(self), id }
    }

    /// Returns whether the client was still registered. Safe to call twice.
    pub fn deregister(&self, id: ClientId) -> bool {
        let (removed, total) = {
            let mut clients = self.clients.write().unwrap_or_else(|p| p.into_inner());
            (clients.remove(&id).is_some(), clients.len())
        };
        if removed {
            tracing::info!(client = %id, total, "client disconnected");
        }
        removed
    }

    #[cfg(test)]
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.read().unwrap_or_else(|p| p.into_inner()).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Deliver `text` to every registered client, then drop the ones that failed.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        let targets = self.snapshot();
        let timeout = self.send_timeout;

        let results = join_all(targets.iter().map(|client| async move {
            (client.id(), client.send(text.to_string(), timeout).await)
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(client = %id, error = %e, "broadcast send failed; dropping client");
                    report.dropped.push(id);
                }
            }
        }

        for id in &report.dropped {
            self.deregister(*id);
        }
        report
    }
}

/// Ties registry membership to a connection's lifetime.
pub struct Registration {
    hub: Arc<BroadcastHub>,
    id: ClientId,
}

impl Registration {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.deregister(self.id);
    }
}
