use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tracing::{debug, info, trace, warn};

use crate::config::MessengerConfig;
use crate::directory::resolver::DirectoryResolver;
use crate::model::{MessageTarget, UserData, UserId};
use crate::peer::connection_pool::PeerTransport;
use crate::peer::peer_addr::PeerAddress;
use crate::pending::pending_store::PendingStore;


/// Periodically retries pending messages for recipients that are online, and periodically
///  sweeps expired messages nobody in the network is waiting for anymore.
pub struct Resender {
    config: Arc<MessengerConfig>,
    transport: Arc<dyn PeerTransport>,
    resolver: Arc<DirectoryResolver>,
    store: Arc<dyn PendingStore>,
}

impl Resender {
    pub fn new(config: Arc<MessengerConfig>, transport: Arc<dyn PeerTransport>, resolver: Arc<DirectoryResolver>, store: Arc<dyn PendingStore>) -> Resender {
        Resender {
            config,
            transport,
            resolver,
            store,
        }
    }

    /// Runs resend ticks and cleanup sweeps forever. Callers stop it by dropping the future.
    pub async fn run(&self) {
        let mut resend_ticks = time::interval(self.config.resend_interval);
        resend_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_ticks = time::interval(self.config.pending_cleanup_interval);
        cleanup_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = resend_ticks.tick() => {
                    self.resend_tick().await;
                }
                _ = cleanup_ticks.tick() => {
                    self.cleanup().await;
                }
            }
        }
    }

    /// One resend round. Recipients of permanently immune messages go first, and at most
    ///  `max_peers_per_resend_tick` of them are served concurrently. Returns the number of
    ///  recipients that were attempted.
    ///
    /// Delivered immune messages are deleted. Delivered expiring messages stay in the store and
    ///  are left to the cleanup sweep.
    #[tracing::instrument(skip(self))]
    pub async fn resend_tick(&self) -> usize {
        let targets = self.store.get_targets().await;
        if targets.is_empty() {
            return 0;
        }

        let mut ids: Vec<UserId> = Vec::new();
        for t in targets.all() {
            if !ids.contains(&t.target) {
                ids.push(t.target.clone());
            }
        }

        let mut online = self.resolver.get_user_data(&ids, true).await;
        let mut recipients: Vec<UserData> = ids.iter()
            .filter_map(|id| online.remove(id))
            .collect();
        if recipients.is_empty() {
            trace!("no recipient of pending messages is online");
            return 0;
        }

        if recipients.len() > self.config.max_peers_per_resend_tick {
            debug!("{} recipients of pending messages are online, serving {} in this round", recipients.len(), self.config.max_peers_per_resend_tick);
            recipients.truncate(self.config.max_peers_per_resend_tick);
        }
        let num_recipients = recipients.len();

        let mut tasks = JoinSet::new();
        for user in recipients {
            tasks.spawn(resend_to(self.transport.clone(), self.store.clone(), user, self.config.peer_port));
        }

        let immune = targets.immune.iter().collect::<FxHashSet<_>>();
        let mut delivered_immune = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(delivered) => delivered_immune.extend(delivered.into_iter().filter(|t| immune.contains(t))),
                Err(e) => warn!("resend task failed: {}", e),
            }
        }

        if !delivered_immune.is_empty() {
            info!("delivered {} pending messages", delivered_immune.len());
            if let Err(e) = self.store.delete_immune(&delivered_immune).await {
                warn!("error deleting delivered messages: {}", e);
            }
        }
        num_recipients
    }

    /// Removes expired messages that no node reports as pending. The sweep is skipped if no
    ///  replica answers, since an empty keep list would then mean 'unknown' rather than
    ///  'nothing pending'. Returns `true` if the sweep ran.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> bool {
        let connections = match self.resolver.directory().connections().await {
            Ok(connections) => connections,
            Err(e) => {
                debug!("skipping pending message cleanup: {}", e);
                return false;
            }
        };

        let mut keep = BTreeSet::new();
        let mut answered = false;
        for conn in connections {
            match conn.get_pending_messages().await {
                Ok(targets) => {
                    answered = true;
                    keep.extend(targets);
                }
                Err(e) => warn!("error querying pending messages: {}", e),
            }
        }

        if !answered {
            debug!("skipping pending message cleanup: no directory replica answered");
            return false;
        }

        let keep = keep.into_iter().collect::<Vec<_>>();
        if let Err(e) = self.store.delete_non_pending(&keep).await {
            warn!("error cleaning up pending messages: {}", e);
            return false;
        }
        true
    }
}

/// tries each of a recipient's pending messages once, returning the ones that were delivered
async fn resend_to(transport: Arc<dyn PeerTransport>, store: Arc<dyn PendingStore>, user: UserData, peer_port: u16) -> Vec<MessageTarget> {
    let Some(ip) = user.ip
    else {
        return Vec::new();
    };
    let addr = PeerAddress::new(ip, peer_port);

    let mut delivered = Vec::new();
    for msg in store.get_by_target_id(user.id()).await {
        let payload = match serde_json::to_vec(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("error serializing pending message {:?}: {}", msg.target, e);
                continue;
            }
        };

        match transport.message(&addr, payload).await {
            Ok(()) => {
                trace!(%addr, "resent {:?}", msg.target);
                delivered.push(msg.target);
            }
            Err(e) => debug!(%addr, "resending {:?} failed: {}", msg.target, e),
        }
    }
    delivered
}


#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::directory::directory_pool::{DirectoryPool, MockDirectoryPool};
    use crate::directory::user_cache::UserCache;
    use crate::model::PendingMessage;
    use crate::peer::connection_pool::MockPeerTransport;
    use crate::peer::SendError;
    use crate::pending::pending_store::InMemoryPendingStore;
    use crate::test_util::directory::FakeDirectory;
    use crate::test_util::keys::test_user;

    const PERIOD: Duration = Duration::from_secs(30);

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    fn msg(id: &str, target: &str) -> PendingMessage {
        PendingMessage::new(MessageTarget::new(id, UserId::from(target)), id.as_bytes().to_vec())
    }

    fn message_id(payload: &[u8]) -> String {
        serde_json::from_slice::<PendingMessage>(payload).unwrap()
            .target.id
    }

    fn resender(config: MessengerConfig, transport: MockPeerTransport, directory: Arc<dyn DirectoryPool>, store: Arc<InMemoryPendingStore>) -> Resender {
        let resolver = DirectoryResolver::new(Arc::new(UserCache::new(Duration::from_secs(30))), directory);
        Resender::new(Arc::new(config), Arc::new(transport), Arc::new(resolver), store)
    }

    async fn ids(store: &InMemoryPendingStore) -> Vec<String> {
        store.get_all().await.into_iter()
            .map(|m| m.target.id)
            .collect()
    }

    #[tokio::test]
    async fn test_resend_deletes_delivered_immune_messages_only() {
        let directory = FakeDirectory::new().await;
        directory.register(&test_user("bob", 2).0, Some(ip(2))).await;
        directory.register(&test_user("carol", 3).0, None).await;

        let store = Arc::new(InMemoryPendingStore::new());
        store.store_immune(msg("m1", "bob")).await.unwrap();
        store.store_immune(msg("m2", "bob")).await.unwrap();
        store.store_expiring(msg("m3", "bob"), PERIOD).await.unwrap();
        store.store_immune(msg("m4", "carol")).await.unwrap();

        let mut transport = MockPeerTransport::new();
        transport.expect_message()
            .withf(|addr, _| addr == &PeerAddress::new(ip(2), 7000))
            .times(3)
            .returning(|_, payload| {
                match message_id(&payload).as_str() {
                    "m2" => Err(SendError::Timeout),
                    _ => Ok(()),
                }
            });

        let resender = resender(MessengerConfig::new(7000), transport, Arc::new(directory), store.clone());
        assert_eq!(resender.resend_tick().await, 1);

        // m2 failed, m3 is expiring, carol is offline
        assert_eq!(ids(&store).await, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_immune_recipients_first_and_batch_limit() {
        let directory = FakeDirectory::new().await;
        directory.register(&test_user("bob", 2).0, Some(ip(2))).await;
        directory.register(&test_user("carol", 3).0, Some(ip(3))).await;

        let store = Arc::new(InMemoryPendingStore::new());
        store.store_expiring(msg("for-bob", "bob"), PERIOD).await.unwrap();
        store.store_immune(msg("for-carol", "carol")).await.unwrap();

        let addresses = Arc::new(Mutex::new(Vec::new()));
        let mut transport = MockPeerTransport::new();
        {
            let addresses = addresses.clone();
            transport.expect_message()
                .returning(move |addr, _| {
                    addresses.lock().unwrap().push(*addr);
                    Ok(())
                });
        }

        let mut config = MessengerConfig::new(7000);
        config.max_peers_per_resend_tick = 1;
        let resender = resender(config, transport, Arc::new(directory), store.clone());

        assert_eq!(resender.resend_tick().await, 1);
        assert_eq!(*addresses.lock().unwrap(), vec![PeerAddress::new(ip(3), 7000)]);
        assert_eq!(ids(&store).await, vec!["for-bob"]);

        // next round, bob's turn - the expiring message is sent but stays
        assert_eq!(resender.resend_tick().await, 1);
        assert_eq!(*addresses.lock().unwrap(), vec![PeerAddress::new(ip(3), 7000), PeerAddress::new(ip(2), 7000)]);
        assert_eq!(ids(&store).await, vec!["for-bob"]);
    }

    #[tokio::test]
    async fn test_nothing_pending() {
        let mut directory = MockDirectoryPool::new();
        directory.expect_connections().never();
        let mut transport = MockPeerTransport::new();
        transport.expect_message().never();

        let resender = resender(MessengerConfig::new(7000), transport, Arc::new(directory), Arc::new(InMemoryPendingStore::new()));
        assert_eq!(resender.resend_tick().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_targets_reported_by_directory() {
        let directory = FakeDirectory::new().await;
        directory.add_pending(msg("reported", "bob").target).await;

        let store = Arc::new(InMemoryPendingStore::new());
        store.store_expiring(msg("reported", "bob"), PERIOD).await.unwrap();
        store.store_expiring(msg("stale", "bob"), PERIOD).await.unwrap();
        store.store_immune(msg("immune", "bob")).await.unwrap();

        let resender = resender(MessengerConfig::new(7000), MockPeerTransport::new(), Arc::new(directory), store.clone());

        time::advance(PERIOD + Duration::from_secs(1)).await;
        assert!(resender.cleanup().await);
        assert_eq!(ids(&store).await, vec!["reported", "immune"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_skipped_without_replicas() {
        let directory = FakeDirectory::new().await;
        directory.set_available(false).await;

        let store = Arc::new(InMemoryPendingStore::new());
        store.store_expiring(msg("stale", "bob"), PERIOD).await.unwrap();

        let resender = resender(MessengerConfig::new(7000), MockPeerTransport::new(), Arc::new(directory), store.clone());

        time::advance(PERIOD + Duration::from_secs(1)).await;
        assert!(!resender.cleanup().await);
        assert_eq!(ids(&store).await, vec!["stale"]);
    }
}
