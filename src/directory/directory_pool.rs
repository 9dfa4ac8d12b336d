use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::directory::directory_connection::{DirectoryConnection, HttpDirectoryConnection};
use crate::model::UserId;


/// The directory replicas this node currently knows about. Replicas announce themselves
///  periodically, and an entry expires if its replica was not heard from for `expiry`.
pub struct DirectoryRegistry {
    expiry: Duration,
    replicas: RwLock<FxHashMap<String, (SocketAddr, Instant)>>,
}

impl DirectoryRegistry {
    pub fn new(expiry: Duration) -> DirectoryRegistry {
        DirectoryRegistry {
            expiry,
            replicas: Default::default(),
        }
    }

    /// registers a replica, or refreshes it if it is known already
    pub async fn announce(&self, id: impl Into<String>, addr: SocketAddr) {
        let id = id.into();
        trace!(%id, %addr, "directory replica announced");
        self.replicas.write().await
            .insert(id, (addr, Instant::now()));
    }

    /// addresses of all replicas that did not expire, in no particular order
    pub async fn get_all(&self) -> Vec<SocketAddr> {
        self.replicas.read().await
            .values()
            .filter(|(_, last_seen)| last_seen.elapsed() <= self.expiry)
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// removes expired entries, returning the number of removed entries
    pub async fn prune(&self) -> usize {
        let mut replicas = self.replicas.write().await;
        let before = replicas.len();
        replicas.retain(|_, (_, last_seen)| last_seen.elapsed() <= self.expiry);
        let removed = before - replicas.len();
        if removed > 0 {
            debug!("pruned {} expired directory replicas", removed);
        }
        removed
    }
}


/// Hands out connections to directory replicas
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DirectoryPool: Send + Sync + 'static {
    /// A connection to every known replica that passes its health check. Fails if there is no
    ///  such replica.
    async fn connections(&self) -> anyhow::Result<Vec<Arc<dyn DirectoryConnection>>>;

    /// A connection to a randomly chosen replica
    async fn get_any(&self) -> anyhow::Result<Arc<dyn DirectoryConnection>>;
}

pub struct HttpDirectoryPool {
    registry: Arc<DirectoryRegistry>,
    own_id: UserId,
    request_timeout: Duration,
}

impl HttpDirectoryPool {
    pub fn new(registry: Arc<DirectoryRegistry>, own_id: UserId, request_timeout: Duration) -> HttpDirectoryPool {
        HttpDirectoryPool {
            registry,
            own_id,
            request_timeout,
        }
    }
}

#[async_trait]
impl DirectoryPool for HttpDirectoryPool {
    async fn connections(&self) -> anyhow::Result<Vec<Arc<dyn DirectoryConnection>>> {
        self.registry.prune().await;

        let mut result: Vec<Arc<dyn DirectoryConnection>> = Vec::new();
        for addr in self.registry.get_all().await {
            match HttpDirectoryConnection::connect(addr, self.own_id.clone(), self.request_timeout).await {
                Ok(conn) => result.push(Arc::new(conn)),
                Err(e) => warn!("skipping directory replica: {}", e),
            }
        }

        if result.is_empty() {
            return Err(anyhow!("no available directory replicas"));
        }
        Ok(result)
    }

    async fn get_any(&self) -> anyhow::Result<Arc<dyn DirectoryConnection>> {
        let addr = {
            let replicas = self.registry.get_all().await;
            replicas.choose(&mut rand::thread_rng())
                .copied()
                .ok_or_else(|| anyhow!("no available directory replicas"))?
        };
        Ok(Arc::new(HttpDirectoryConnection::connect(addr, self.own_id.clone(), self.request_timeout).await?))
    }
}
