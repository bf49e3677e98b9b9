//! Finding the member to restore from

use async_trait::async_trait;
use quorum_config::RestoreSourceKind;
use quorum_core::NodeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::raft::{RaftHandle, Role};

/// What a restore source provider can learn about the partition's members
#[async_trait]
pub trait ClusterView: Send + Sync {
    fn local_id(&self) -> NodeId;

    /// Current leader, if one is known
    async fn leader(&self) -> Option<NodeId>;

    /// Every other member of the partition
    async fn peers(&self) -> Vec<NodeId>;

    /// Give up leadership if the local member holds it
    async fn step_down(&self);
}

/// Picks a source for restore, or none if no suitable member is available yet
#[async_trait]
pub trait RestoreSourceProvider: Send + Sync {
    async fn find_restore_source(&self) -> Option<NodeId>;
}

/// Restores from the current leader.
///
/// A local member that is itself leader steps down so another member can take
/// over and serve it.
pub struct LeaderRestoreSourceProvider {
    cluster: Arc<dyn ClusterView>,
}

impl LeaderRestoreSourceProvider {
    pub fn new(cluster: Arc<dyn ClusterView>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl RestoreSourceProvider for LeaderRestoreSourceProvider {
    async fn find_restore_source(&self) -> Option<NodeId> {
        let leader = self.cluster.leader().await?;
        if leader == self.cluster.local_id() {
            info!("Node {} is leader, stepping down to restore from another member", leader);
            self.cluster.step_down().await;
            return None;
        }
        Some(leader)
    }
}

/// Restores from any other member, rotating through them on each attempt
pub struct RegistryRestoreSourceProvider {
    cluster: Arc<dyn ClusterView>,
    next: AtomicUsize,
}

impl RegistryRestoreSourceProvider {
    pub fn new(cluster: Arc<dyn ClusterView>) -> Self {
        Self { cluster, next: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl RestoreSourceProvider for RegistryRestoreSourceProvider {
    async fn find_restore_source(&self) -> Option<NodeId> {
        let local = self.cluster.local_id();
        let peers: Vec<NodeId> =
            self.cluster.peers().await.into_iter().filter(|&id| id != local).collect();
        if peers.is_empty() {
            return None;
        }
        let turn = self.next.fetch_add(1, Ordering::Relaxed);
        Some(peers[turn % peers.len()])
    }
}

/// Build the provider selected in configuration
pub fn restore_source_provider(
    kind: RestoreSourceKind,
    cluster: Arc<dyn ClusterView>,
) -> Arc<dyn RestoreSourceProvider> {
    match kind {
        RestoreSourceKind::Leader => Arc::new(LeaderRestoreSourceProvider::new(cluster)),
        RestoreSourceKind::Registry => Arc::new(RegistryRestoreSourceProvider::new(cluster)),
    }
}

/// Cluster view backed by a running partition server
pub struct RaftClusterView {
    handle: RaftHandle,
    members: Vec<NodeId>,
}

impl RaftClusterView {
    pub fn new(handle: RaftHandle, members: Vec<NodeId>) -> Self {
        Self { handle, members }
    }
}

#[async_trait]
impl ClusterView for RaftClusterView {
    fn local_id(&self) -> NodeId {
        self.handle.id()
    }

    async fn leader(&self) -> Option<NodeId> {
        self.handle.current_status().leader_id
    }

    async fn peers(&self) -> Vec<NodeId> {
        let local = self.handle.id();
        self.members.iter().copied().filter(|&id| id != local).collect()
    }

    async fn step_down(&self) {
        if self.handle.current_status().role != Role::Leader {
            return;
        }
        if let Err(e) = self.handle.step_down() {
            debug!("Failed to step down node {}: {}", self.handle.id(), e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Cluster view whose leader is set by the test
    pub(crate) struct StaticClusterView {
        pub local: NodeId,
        pub leader: Mutex<Option<NodeId>>,
        pub peers: Vec<NodeId>,
        pub step_downs: AtomicU32,
    }

    impl StaticClusterView {
        pub(crate) fn new(local: NodeId, leader: Option<NodeId>, peers: Vec<NodeId>) -> Self {
            Self { local, leader: Mutex::new(leader), peers, step_downs: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl ClusterView for StaticClusterView {
        fn local_id(&self) -> NodeId {
            self.local
        }

        async fn leader(&self) -> Option<NodeId> {
            *self.leader.lock().unwrap()
        }

        async fn peers(&self) -> Vec<NodeId> {
            self.peers.clone()
        }

        async fn step_down(&self) {
            self.step_downs.fetch_add(1, Ordering::SeqCst);
            let mut leader = self.leader.lock().unwrap();
            if *leader == Some(self.local) {
                *leader = None;
            }
        }
    }

    #[tokio::test]
    async fn test_leader_provider_returns_remote_leader() {
        let cluster = Arc::new(StaticClusterView::new(1, Some(2), vec![2, 3]));
        let provider = LeaderRestoreSourceProvider::new(cluster.clone());

        assert_eq!(provider.find_restore_source().await, Some(2));
        assert_eq!(cluster.step_downs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_leader_provider_steps_down_local_leader() {
        let cluster = Arc::new(StaticClusterView::new(1, Some(1), vec![2, 3]));
        let provider = LeaderRestoreSourceProvider::new(cluster.clone());

        assert_eq!(provider.find_restore_source().await, None);
        assert_eq!(cluster.step_downs.load(Ordering::SeqCst), 1);

        *cluster.leader.lock().unwrap() = Some(3);
        assert_eq!(provider.find_restore_source().await, Some(3));
    }

    #[tokio::test]
    async fn test_leader_provider_without_leader() {
        let cluster = Arc::new(StaticClusterView::new(1, None, vec![2]));
        let provider = LeaderRestoreSourceProvider::new(cluster);
        assert_eq!(provider.find_restore_source().await, None);
    }

    #[tokio::test]
    async fn test_registry_provider_rotates_peers() {
        let cluster = Arc::new(StaticClusterView::new(1, None, vec![1, 2, 3]));
        let provider = restore_source_provider(RestoreSourceKind::Registry, cluster);

        let picks = vec![
            provider.find_restore_source().await,
            provider.find_restore_source().await,
            provider.find_restore_source().await,
        ];
        assert_eq!(picks, vec![Some(2), Some(3), Some(2)]);
    }

    #[tokio::test]
    async fn test_registry_provider_without_peers() {
        let cluster = Arc::new(StaticClusterView::new(1, Some(1), vec![1]));
        let provider = RegistryRestoreSourceProvider::new(cluster);
        assert_eq!(provider.find_restore_source().await, None);
    }
}
