use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::model::{MessageTarget, PendingMessage, PendingMessageTargetLists, UserId};


/// Holding area for messages that could not be delivered yet. Entries are either *immune*
///  (kept until explicitly deleted) or *expiring* (protected from cleanup for a limited time).
///
/// Permanent immunity is never downgraded: storing an immune message again as expiring has no
///  effect.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PendingStore: Send + Sync + 'static {
    async fn store_immune(&self, msg: PendingMessage) -> anyhow::Result<()>;

    /// Stores a message that is protected from cleanup for `period`. Storing a message that is
    ///  already expiring resets its protection to `now + period`.
    async fn store_expiring(&self, msg: PendingMessage, period: Duration) -> anyhow::Result<()>;

    /// Deletes every expiring entry whose protection ran out and whose target is not in `keep`.
    ///  Immune entries are never touched.
    async fn delete_non_pending(&self, keep: &[MessageTarget]) -> anyhow::Result<()>;

    async fn delete_immune(&self, targets: &[MessageTarget]) -> anyhow::Result<()>;

    async fn get_all(&self) -> Vec<PendingMessage>;

    async fn get_by_target_id(&self, user: &UserId) -> Vec<PendingMessage>;

    async fn get_targets(&self) -> PendingMessageTargetLists;
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Retention {
    Immune,
    ExpiresAt(Instant),
}

struct Entry {
    msg: PendingMessage,
    retention: Retention,
    /// insertion order, so queries return messages oldest first
    seq: u64,
}

#[derive(Default)]
struct StoreData {
    entries: FxHashMap<MessageTarget, Entry>,
    next_seq: u64,
}
impl StoreData {
    fn insert(&mut self, msg: PendingMessage, retention: Retention) {
        match self.entries.get_mut(&msg.target) {
            Some(entry) => {
                entry.msg = msg;
                entry.retention = retention;
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries.insert(msg.target.clone(), Entry { msg, retention, seq });
            }
        }
    }

    fn is_immune(&self, target: &MessageTarget) -> bool {
        matches!(self.entries.get(target), Some(e) if e.retention == Retention::Immune)
    }

    fn sorted(&self) -> Vec<&Entry> {
        let mut result = self.entries.values().collect::<Vec<_>>();
        result.sort_by_key(|e| e.seq);
        result
    }
}

#[derive(Default)]
pub struct InMemoryPendingStore {
    data: RwLock<StoreData>,
}

impl InMemoryPendingStore {
    pub fn new() -> InMemoryPendingStore {
        Default::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.entries.len()
    }

    pub async fn is_immune(&self, target: &MessageTarget) -> Option<bool> {
        self.data.read().await
            .entries.get(target)
            .map(|e| e.retention == Retention::Immune)
    }
}

#[async_trait]
impl PendingStore for InMemoryPendingStore {
    async fn store_immune(&self, msg: PendingMessage) -> anyhow::Result<()> {
        trace!(message = ?msg.target, "storing immune message");
        self.data.write().await
            .insert(msg, Retention::Immune);
        Ok(())
    }

    async fn store_expiring(&self, msg: PendingMessage, period: Duration) -> anyhow::Result<()> {
        let mut data = self.data.write().await;

        if data.is_immune(&msg.target) {
            trace!(message = ?msg.target, "message is immune already - ignoring expiring store");
            return Ok(());
        }

        trace!(message = ?msg.target, "storing expiring message");
        data.insert(msg, Retention::ExpiresAt(Instant::now() + period));
        Ok(())
    }

    async fn delete_non_pending(&self, keep: &[MessageTarget]) -> anyhow::Result<()> {
        let keep = keep.iter().collect::<BTreeSet<_>>();
        let now = Instant::now();

        let mut data = self.data.write().await;
        let before = data.entries.len();
        data.entries.retain(|target, entry| match entry.retention {
            Retention::Immune => true,
            Retention::ExpiresAt(expiry) => expiry > now || keep.contains(target),
        });

        let removed = before - data.entries.len();
        if removed > 0 {
            debug!("removed {} expired pending messages", removed);
        }
        Ok(())
    }

    async fn delete_immune(&self, targets: &[MessageTarget]) -> anyhow::Result<()> {
        let mut data = self.data.write().await;
        for target in targets {
            if data.is_immune(target) {
                data.entries.remove(target);
            }
        }
        Ok(())
    }

    async fn get_all(&self) -> Vec<PendingMessage> {
        self.data.read().await
            .sorted().into_iter()
            .map(|e| e.msg.clone())
            .collect()
    }

    async fn get_by_target_id(&self, user: &UserId) -> Vec<PendingMessage> {
        self.data.read().await
            .sorted().into_iter()
            .filter(|e| &e.msg.target.target == user)
            .map(|e| e.msg.clone())
            .collect()
    }

    async fn get_targets(&self) -> PendingMessageTargetLists {
        let data = self.data.read().await;

        let mut result = PendingMessageTargetLists::default();
        for entry in data.sorted() {
            match entry.retention {
                Retention::Immune => result.immune.push(entry.msg.target.clone()),
                Retention::ExpiresAt(_) => result.non_immune.push(entry.msg.target.clone()),
            }
        }
        result
    }
}
