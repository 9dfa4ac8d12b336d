use std::net::IpAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::directory::directory_connection::DirectoryConnection;
use crate::directory::directory_pool::DirectoryPool;
use crate::model::{MessageTarget, User, UserData, UserId};


#[derive(Default)]
struct FakeReplica {
    users: RwLock<FxHashMap<UserId, UserData>>,
    pending: RwLock<Vec<MessageTarget>>,
    notifications: RwLock<Vec<MessageTarget>>,
    available: RwLock<bool>,
}

#[async_trait]
impl DirectoryConnection for FakeReplica {
    async fn query_users(&self, ids: &[UserId]) -> anyhow::Result<FxHashMap<UserId, UserData>> {
        let users = self.users.read().await;
        Ok(ids.iter()
            .filter_map(|id| users.get(id).map(|d| (id.clone(), d.clone())))
            .collect())
    }

    async fn notify_of_pending_messages(&self, targets: &[MessageTarget]) -> anyhow::Result<()> {
        self.notifications.write().await
            .extend(targets.iter().cloned());
        Ok(())
    }

    async fn get_pending_messages(&self) -> anyhow::Result<Vec<MessageTarget>> {
        let mut result = self.pending.read().await.clone();
        result.extend(self.notifications.read().await.iter().cloned());
        Ok(result)
    }
}

/// An in-memory directory with a single replica. Users are registered directly, and
///  notifications are recorded for inspection.
#[derive(Clone)]
pub struct FakeDirectory {
    replica: Arc<FakeReplica>,
}

impl FakeDirectory {
    pub async fn new() -> FakeDirectory {
        let replica = FakeReplica::default();
        *replica.available.write().await = true;
        FakeDirectory {
            replica: Arc::new(replica),
        }
    }

    pub async fn register(&self, user: &User, ip: Option<IpAddr>) {
        self.replica.users.write().await
            .insert(user.id.clone(), UserData { user: user.clone(), ip });
    }

    /// messages some other node claims to hold
    pub async fn add_pending(&self, target: MessageTarget) {
        self.replica.pending.write().await
            .push(target);
    }

    pub async fn notifications(&self) -> Vec<MessageTarget> {
        self.replica.notifications.read().await.clone()
    }

    /// simulates all replicas being gone
    pub async fn set_available(&self, available: bool) {
        *self.replica.available.write().await = available;
    }
}

#[async_trait]
impl DirectoryPool for FakeDirectory {
    async fn connections(&self) -> anyhow::Result<Vec<Arc<dyn DirectoryConnection>>> {
        Ok(vec![self.get_any().await?])
    }

    async fn get_any(&self) -> anyhow::Result<Arc<dyn DirectoryConnection>> {
        if !*self.replica.available.read().await {
            bail!("no available directory replicas");
        }
        Ok(self.replica.clone())
    }
}
