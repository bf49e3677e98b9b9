//! Message transport between partition members

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use super::{NodeId, RaftError, RaftHandle, RaftMessage, Result};

/// Delivers messages to other members of a partition.
///
/// Delivery is best effort; the protocol tolerates lost messages.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send(&self, from: NodeId, to: NodeId, message: RaftMessage) -> Result<()>;
}

/// In-process transport routing messages straight into each server's inbox
#[derive(Default)]
pub struct InMemoryRouter {
    handles: RwLock<HashMap<NodeId, RaftHandle>>,
    disconnected: RwLock<HashSet<NodeId>>,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: RaftHandle) {
        self.handles.write().await.insert(handle.id(), handle);
    }

    pub async fn unregister(&self, id: NodeId) {
        self.handles.write().await.remove(&id);
    }

    /// Drop every message to or from `id` until it is reconnected
    pub async fn disconnect(&self, id: NodeId) {
        debug!("Disconnecting node {}", id);
        self.disconnected.write().await.insert(id);
    }

    pub async fn reconnect(&self, id: NodeId) {
        debug!("Reconnecting node {}", id);
        self.disconnected.write().await.remove(&id);
    }
}

#[async_trait]
impl RaftTransport for InMemoryRouter {
    async fn send(&self, from: NodeId, to: NodeId, message: RaftMessage) -> Result<()> {
        {
            let disconnected = self.disconnected.read().await;
            if disconnected.contains(&from) || disconnected.contains(&to) {
                return Err(RaftError::RpcError(format!("node {} is unreachable from {}", to, from)));
            }
        }

        let handles = self.handles.read().await;
        let handle = handles.get(&to).ok_or(RaftError::NodeNotFound(to))?;
        handle.deliver(from, message)
    }
}
