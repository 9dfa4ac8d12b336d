use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::directory::directory_pool::DirectoryPool;
use crate::directory::user_cache::UserCache;
use crate::model::{UserData, UserId};


/// Looks up users, first in the local cache and then by asking directory replicas one after the
///  other. Whatever a replica reports is written to the cache.
pub struct DirectoryResolver {
    cache: Arc<UserCache>,
    directory: Arc<dyn DirectoryPool>,
}

impl DirectoryResolver {
    pub fn new(cache: Arc<UserCache>, directory: Arc<dyn DirectoryPool>) -> DirectoryResolver {
        DirectoryResolver { cache, directory }
    }

    pub fn directory(&self) -> &Arc<dyn DirectoryPool> {
        &self.directory
    }

    /// Returns data for those of `ids` that could be resolved. With `only_connected`, users
    ///  without a current IP address count as unresolved.
    ///
    /// Replicas are asked in order for whatever is still unresolved, the first replica reporting a
    ///  user wins. Failures are logged and treated as 'not found'.
    pub async fn get_user_data(&self, ids: &[UserId], only_connected: bool) -> FxHashMap<UserId, UserData> {
        let mut result = FxHashMap::default();
        let mut unresolved = Vec::new();

        for id in ids {
            if result.contains_key(id) || unresolved.contains(id) {
                continue;
            }
            match self.cache.get(id).await {
                Some(data) if !only_connected || data.ip.is_some() => {
                    result.insert(id.clone(), data);
                }
                _ => unresolved.push(id.clone()),
            }
        }

        if unresolved.is_empty() {
            return result;
        }

        let connections = match self.directory.connections().await {
            Ok(connections) => connections,
            Err(e) => {
                warn!("could not query the directory: {}", e);
                return result;
            }
        };

        for conn in connections {
            let answer = match conn.query_users(&unresolved).await {
                Ok(answer) => answer,
                Err(e) => {
                    warn!("error querying users: {}", e);
                    continue;
                }
            };

            for (id, data) in answer {
                if !unresolved.contains(&id) {
                    continue;
                }
                // the cache keeps a known user's public key, so its view wins over the replica's
                self.cache.save(data.clone()).await;
                let data = self.cache.get(&id).await
                    .unwrap_or(data);
                if !only_connected || data.ip.is_some() {
                    unresolved.retain(|u| u != &id);
                    result.insert(id, data);
                }
            }

            if unresolved.is_empty() {
                break;
            }
        }

        if !unresolved.is_empty() {
            debug!("users not found in the network: {:?}", unresolved);
        }
        result
    }

    pub async fn get_one(&self, id: &UserId, only_connected: bool) -> Option<UserData> {
        self.get_user_data(std::slice::from_ref(id), only_connected).await
            .remove(id)
    }
}
