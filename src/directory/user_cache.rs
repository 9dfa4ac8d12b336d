use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, trace};

use crate::model::{UserData, UserId};


struct CachedUser {
    data: UserData,
    last_seen: Instant,
}

/// Users this node knows about, with the IP address they were last seen at. An IP address is
///  only returned while it is younger than `ip_expiry`; expiry is checked on read.
pub struct UserCache {
    ip_expiry: Duration,
    users: RwLock<FxHashMap<UserId, CachedUser>>,
}

impl UserCache {
    pub fn new(ip_expiry: Duration) -> UserCache {
        UserCache {
            ip_expiry,
            users: Default::default(),
        }
    }

    /// Stores or refreshes a user's data. A user's public key is never replaced: if a user shows
    ///  up with a different key than the cached one, that is logged and the cached key is kept.
    pub async fn save(&self, data: UserData) {
        let mut users = self.users.write().await;

        match users.get_mut(data.id()) {
            Some(cached) => {
                if cached.data.user.public_key != data.user.public_key {
                    error!(user = %data.id(), "directory reported a different public key for a known user - keeping the known key");
                }
                cached.data.user.name = data.user.name;
                cached.data.ip = data.ip;
                cached.last_seen = Instant::now();
            }
            None => {
                trace!(user = %data.id(), "caching user");
                users.insert(data.id().clone(), CachedUser {
                    data,
                    last_seen: Instant::now(),
                });
            }
        }
    }

    pub async fn get(&self, id: &UserId) -> Option<UserData> {
        let users = self.users.read().await;
        let cached = users.get(id)?;

        let mut data = cached.data.clone();
        if cached.last_seen.elapsed() > self.ip_expiry {
            data.ip = None;
        }
        Some(data)
    }
}
