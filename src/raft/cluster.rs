//! In-process cluster of partition servers connected by an [`InMemoryRouter`]

use quorum_core::{Member, PartitionId};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{
    InMemoryRouter, MemoryLog, MemoryMetaStore, NodeId, RaftConfig, RaftContext, RaftError,
    RaftHandle, RaftServer, Result, Role,
};

pub struct InMemoryRaftCluster {
    router: Arc<InMemoryRouter>,
    handles: Vec<RaftHandle>,
}

impl InMemoryRaftCluster {
    /// Start one server per id, all of them voting members
    pub async fn start(ids: Vec<NodeId>, config: RaftConfig) -> Result<Self> {
        let members = ids.into_iter().map(Member::active).collect();
        Self::start_with_members(members, config).await
    }

    /// Start one server per member, each with an in-memory log and meta store
    pub async fn start_with_members(members: Vec<Member>, config: RaftConfig) -> Result<Self> {
        let router = Arc::new(InMemoryRouter::new());
        let mut servers = Vec::with_capacity(members.len());

        for member in &members {
            let context = RaftContext::new(
                member.id,
                PartitionId::default(),
                members.clone(),
                config.clone(),
                Box::new(MemoryLog::with_max_entry_size(config.max_entry_size)),
                Box::new(MemoryMetaStore::new()),
            )?;
            let server = RaftServer::new(context, router.clone());
            router.register(server.handle()).await;
            servers.push(server);
        }

        let handles = servers.into_iter().map(RaftServer::start).collect();
        info!("Started in-memory cluster with {} members", members.len());
        Ok(Self { router, handles })
    }

    pub fn router(&self) -> &Arc<InMemoryRouter> {
        &self.router
    }

    pub fn handles(&self) -> &[RaftHandle] {
        &self.handles
    }

    pub fn handle(&self, id: NodeId) -> Option<&RaftHandle> {
        self.handles.iter().find(|handle| handle.id() == id)
    }

    /// Member currently claiming leadership with the highest term
    pub fn leader(&self) -> Option<&RaftHandle> {
        self.handles
            .iter()
            .map(|handle| (handle, handle.current_status()))
            .filter(|(_, status)| status.role == Role::Leader)
            .max_by_key(|(_, status)| status.term)
            .map(|(handle, _)| handle)
    }

    /// Wait until some member is leader
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<RaftHandle> {
        let poll = async {
            loop {
                if let Some(leader) = self.leader() {
                    return leader.clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| RaftError::NoLeader(timeout))
    }

    pub async fn shutdown(&self) {
        for handle in &self.handles {
            handle.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{AppendError, AppendEvent, JournalError};

    #[tokio::test(start_paused = true)]
    async fn test_cluster_elects_single_leader() {
        let cluster = InMemoryRaftCluster::start(vec![1, 2, 3], RaftConfig::default()).await.unwrap();

        let leader = cluster.wait_for_leader(Duration::from_secs(30)).await.unwrap();
        let status = leader.current_status();

        for handle in cluster.handles() {
            if handle.id() != leader.id() {
                let follower = handle
                    .wait_for(|s| s.role == Role::Follower && s.leader_id.is_some())
                    .await
                    .unwrap();
                assert!(follower.term >= status.term);
            }
        }

        cluster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_leader_without_quorum() {
        let cluster = InMemoryRaftCluster::start(vec![1, 2, 3], RaftConfig::default()).await.unwrap();
        for id in [2, 3] {
            cluster.router().disconnect(id).await;
        }

        let result = cluster.wait_for_leader(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(RaftError::NoLeader(_))));

        cluster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_entry_fails_against_configured_limit() {
        let config = RaftConfig { max_entry_size: 256, ..RaftConfig::default() };
        let cluster = InMemoryRaftCluster::start(vec![1], config).await.unwrap();
        let leader = cluster.wait_for_leader(Duration::from_secs(30)).await.unwrap();

        let mut events = leader.append(1, 1, vec![7; 1024]);
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            AppendEvent::WriteFailed(AppendError::Journal(JournalError::TooLarge { max: 256, .. }))
        ));

        let status = leader.wait_for(|s| s.role != Role::Leader).await.unwrap();
        assert_eq!(status.role, Role::Follower);

        cluster.shutdown().await;
    }
}
