use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::MessengerConfig;
use crate::crypto::envelope::{self, SecureEnvelope};
use crate::crypto::identity::{Identity, PublicKey};
use crate::directory::directory_pool::DirectoryPool;
use crate::directory::resolver::DirectoryResolver;
use crate::directory::user_cache::UserCache;
use crate::messenger::resender::Resender;
use crate::model::{ChatMessage, MessageTarget, PendingMessage, User, UserData, UserId};
use crate::peer::connection_pool::PeerTransport;
use crate::peer::peer_addr::PeerAddress;
use crate::peer::SendError;
use crate::pending::pending_store::PendingStore;


/// Whether the directory was told that this node holds a pending message
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NotifyStatus {
    Notified,
    Failed,
}

#[derive(Debug)]
pub enum SendOutcome {
    /// The recipient acknowledged the message
    Delivered,
    /// The message is stored as pending and will be resent once the recipient is online. The
    ///  directory notification runs in the background.
    StoredPending {
        notification: JoinHandle<NotifyStatus>,
    },
}

/// The top-level messaging API: sends messages (live, or stored for later delivery), routes
///  messages arriving from peers, and drives the background resender.
///
/// Verified messages for this node are delivered through the receiver returned by
///  `connect()`. Messages for other users are stored for forwarding.
pub struct Messenger {
    config: Arc<MessengerConfig>,
    identity: Arc<Identity>,
    own_user: User,
    transport: Arc<dyn PeerTransport>,
    resolver: Arc<DirectoryResolver>,
    store: Arc<dyn PendingStore>,
    resender: Resender,
    /// dropped on shutdown, which ends the application's receiver
    received: Mutex<Option<mpsc::Sender<ChatMessage>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Debug for Messenger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Messenger{{{}}}", self.own_user.id)
    }
}

impl Messenger {
    pub fn connect(
        config: MessengerConfig,
        identity: Identity,
        own_user: User,
        transport: Arc<dyn PeerTransport>,
        directory: Arc<dyn DirectoryPool>,
        store: Arc<dyn PendingStore>,
    ) -> anyhow::Result<(Messenger, mpsc::Receiver<ChatMessage>)> {
        config.validate()?;
        if own_user.public_key != identity.public_key() {
            bail!("public key of user {} does not match the node's identity", own_user.id);
        }

        let config = Arc::new(config);
        let cache = Arc::new(UserCache::new(config.user_ip_expiry));
        let resolver = Arc::new(DirectoryResolver::new(cache, directory));
        let resender = Resender::new(config.clone(), transport.clone(), resolver.clone(), store.clone());

        // the router waits for the application to take each message
        let (received_send, received_recv) = mpsc::channel(1);

        info!("messenger for {} ({}) starting", own_user.id, own_user.name);

        let messenger = Messenger {
            config,
            identity: Arc::new(identity),
            own_user,
            transport,
            resolver,
            store,
            resender,
            received: Mutex::new(Some(received_send)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        Ok((messenger, received_recv))
    }

    pub fn own_user(&self) -> &User {
        &self.own_user
    }

    pub fn new_chat_message(&self, content: impl Into<String>, chat_index: u64) -> ChatMessage {
        let created_time = SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        ChatMessage {
            sender: self.own_user.clone(),
            content: content.into(),
            created_time,
            chat_index,
        }
    }

    /// Looks a user up in the network. The user need not be online.
    pub async fn query_user(&self, id: &UserId) -> anyhow::Result<User> {
        self.resolver.get_one(id, false).await
            .map(|data| data.user)
            .ok_or_else(|| anyhow!("user {} was not found in the network", id))
    }

    /// Seals `message` for `recipient` and delivers it if the recipient is online. Otherwise, or
    ///  if all delivery attempts fail, the message is stored as permanently pending and the
    ///  directory is notified in the background.
    ///
    /// Delivery failures never fail this call. An error means the message could not be stored
    ///  either, i.e. it is lost.
    #[tracing::instrument(skip(self, recipient, message), fields(recipient = %recipient.id))]
    pub async fn send(&self, recipient: &User, message: &ChatMessage) -> anyhow::Result<SendOutcome> {
        let pending = self.compose(recipient, message)?;
        let payload = serde_json::to_vec(&pending)?;

        match self.resolver.get_one(&recipient.id, true).await {
            Some(UserData { ip: Some(ip), .. }) => {
                let addr = PeerAddress::new(ip, self.config.peer_port);
                if self.deliver(&addr, payload).await {
                    debug!("message {:?} delivered", pending.target);
                    return Ok(SendOutcome::Delivered);
                }
            }
            _ => debug!("recipient is not online"),
        }

        let target = pending.target.clone();
        if let Err(e) = self.store.store_immune(pending).await {
            warn!("could not store message {:?} as pending: {}", target, e);
            return Err(e);
        }
        info!("message {:?} stored for later delivery", target);

        let notification = self.tracker.spawn(notify_pending(self.resolver.directory().clone(), vec![target]));
        Ok(SendOutcome::StoredPending { notification })
    }

    fn compose(&self, recipient: &User, message: &ChatMessage) -> anyhow::Result<PendingMessage> {
        let plaintext = serde_json::to_vec(message)?;
        let sealed = envelope::seal(&plaintext, &self.identity, &recipient.public_key)?;
        Ok(PendingMessage::new(
            MessageTarget::new_random(recipient.id.clone()),
            serde_json::to_vec(&sealed)?,
        ))
    }

    async fn deliver(&self, addr: &PeerAddress, payload: Vec<u8>) -> bool {
        let attempts = self.config.send_attempts;
        for attempt in 1..=attempts {
            match self.transport.message(addr, payload.clone()).await {
                Ok(()) => return true,
                Err(SendError::PoolClosed) => {
                    debug!(%addr, "connection pool is closed, giving up");
                    return false;
                }
                Err(e) => debug!(%addr, "delivery attempt {} of {} failed: {}", attempt, attempts, e),
            }

            if attempt < attempts {
                select! {
                    _ = time::sleep(self.config.send_retry_delay) => {}
                    _ = self.cancel.cancelled() => return false,
                }
            }
        }
        false
    }

    /// Routes payloads from peers, and runs the resender and cleanup sweeps, until `shutdown()`
    ///  is called or the transport closes
    pub async fn run(&self) {
        select! {
            _ = self.cancel.cancelled() => {}
            _ = self.route_inbound() => {}
            _ = self.resender.run() => {}
        }
        self.close_received();
        debug!("messenger for {} stopped", self.own_user.id);
    }

    fn close_received(&self) {
        self.received.lock().unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn route_inbound(&self) {
        while let Some(raw) = self.transport.recv().await {
            self.handle_inbound(&raw).await;
        }
        debug!("transport closed");
    }

    async fn handle_inbound(&self, raw: &[u8]) {
        let msg: PendingMessage = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping undecodable payload from a peer: {}", e);
                return;
            }
        };

        if msg.target.target == self.own_user.id {
            self.receive(msg).await;
        }
        else {
            self.store_for_forwarding(msg).await;
        }
    }

    async fn receive(&self, msg: PendingMessage) {
        let (chat, sender_key) = match self.unseal(&msg) {
            Ok(unsealed) => unsealed,
            Err(e) => {
                warn!("dropping message {:?}: {}", msg.target, e);
                return;
            }
        };

        if chat.sender.public_key != sender_key {
            warn!("security alert: sender public key mismatch in message {}", msg.target.id);
            return;
        }

        let received = self.received.lock().unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(received) = received
        else {
            debug!("messenger is shut down, dropping {:?}", msg.target);
            return;
        };

        trace!("received message {:?} from {}", msg.target, chat.sender.id);
        select! {
            r = received.send(chat) => {
                if r.is_err() {
                    debug!("nobody is listening for received messages, dropping {:?}", msg.target);
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }

    fn unseal(&self, msg: &PendingMessage) -> anyhow::Result<(ChatMessage, PublicKey)> {
        let sealed: SecureEnvelope = serde_json::from_slice(&msg.content)?;
        let (plaintext, sender_key) = envelope::open(&sealed, &self.identity)?;
        Ok((serde_json::from_slice(&plaintext)?, sender_key))
    }

    async fn store_for_forwarding(&self, msg: PendingMessage) {
        let target = msg.target.clone();
        if let Err(e) = self.store.store_expiring(msg, self.config.expiring_immunity_period).await {
            warn!("could not store message {:?} for forwarding: {}", target, e);
            return;
        }
        debug!("holding message {:?} for forwarding", target);

        self.tracker.spawn(notify_pending(self.resolver.directory().clone(), vec![target]));
    }

    /// Stops all background work and closes the transport, waiting until everything is shut
    ///  down. Calling this repeatedly is harmless.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.close_received();
        self.transport.close();
        self.tracker.close();

        self.transport.done().await;
        self.tracker.wait().await;
        debug!("messenger for {} shut down", self.own_user.id);
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Tells some directory replica that this node holds messages for `targets`. Failure is logged
///  and reported, but never propagated: the messages are stored already.
async fn notify_pending(directory: Arc<dyn DirectoryPool>, targets: Vec<MessageTarget>) -> NotifyStatus {
    let result = match directory.get_any().await {
        Ok(conn) => conn.notify_of_pending_messages(&targets).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            trace!("notified directory of pending messages {:?}", targets);
            NotifyStatus::Notified
        }
        Err(e) => {
            warn!("could not notify the directory of pending messages {:?}: {}", targets, e);
            NotifyStatus::Failed
        }
    }
}


#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::Instant;

    use super::*;
    use crate::peer::connection_pool::{ConnectionPool, MockPeerTransport};
    use crate::pending::pending_store::{InMemoryPendingStore, MockPendingStore};
    use crate::test_util::directory::FakeDirectory;
    use crate::test_util::keys::{test_identity, test_user};
    use crate::test_util::network::TestNetwork;

    const PORT: u16 = 7000;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    fn config() -> MessengerConfig {
        let mut config = MessengerConfig::new(PORT);
        config.ack_timeout = Duration::from_secs(2);
        config
    }

    struct TestNode {
        messenger: Arc<Messenger>,
        received: mpsc::Receiver<ChatMessage>,
        store: Arc<InMemoryPendingStore>,
        user: User,
    }

    /// a messenger on the in-memory network, registered with the directory and running
    async fn test_node(network: &Arc<TestNetwork>, directory: &FakeDirectory, name: &str, n: u8) -> TestNode {
        let (user, identity) = test_user(name, n);
        let addr = PeerAddress::new(ip(n), PORT);

        let listener = network.listen(addr).await;
        let pool = ConnectionPool::new(Arc::new(config()), Arc::new(network.dialer(addr)), Some(Box::new(listener)));
        directory.register(&user, Some(ip(n))).await;

        let store = Arc::new(InMemoryPendingStore::new());
        let (messenger, received) = Messenger::connect(config(), identity, user.clone(), Arc::new(pool), Arc::new(directory.clone()), store.clone()).unwrap();
        let messenger = Arc::new(messenger);
        {
            let messenger = messenger.clone();
            tokio::spawn(async move { messenger.run().await });
        }

        TestNode { messenger, received, store, user }
    }

    /// alice's messenger on top of a mocked transport, not running
    async fn mocked(transport: MockPeerTransport, directory: &FakeDirectory, store: Arc<dyn PendingStore>) -> (Messenger, mpsc::Receiver<ChatMessage>) {
        let (user, identity) = test_user("alice", 1);
        directory.register(&user, Some(ip(1))).await;
        Messenger::connect(config(), identity, user, Arc::new(transport), Arc::new(directory.clone()), store).unwrap()
    }

    /// a payload as a peer would send it, sealed by `sender_identity` but claiming `claimed_sender`
    fn sealed_payload(claimed_sender: &User, sender_identity: &Identity, recipient: &User, content: &str) -> Vec<u8> {
        let chat = ChatMessage {
            sender: claimed_sender.clone(),
            content: content.to_string(),
            created_time: 1,
            chat_index: 0,
        };
        let sealed = envelope::seal(&serde_json::to_vec(&chat).unwrap(), sender_identity, &recipient.public_key).unwrap();
        let msg = PendingMessage::new(MessageTarget::new_random(recipient.id.clone()), serde_json::to_vec(&sealed).unwrap());
        serde_json::to_vec(&msg).unwrap()
    }

    #[test]
    fn test_connect_rejects_foreign_identity() {
        let (user, _) = test_user("alice", 1);
        let result = Messenger::connect(config(), test_identity(2), user, Arc::new(MockPeerTransport::new()), Arc::new(crate::directory::directory_pool::MockDirectoryPool::new()), Arc::new(InMemoryPendingStore::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_connect_rejects_invalid_config() {
        let (user, identity) = test_user("alice", 1);
        let mut config = config();
        config.send_attempts = 0;
        let result = Messenger::connect(config, identity, user, Arc::new(MockPeerTransport::new()), Arc::new(crate::directory::directory_pool::MockDirectoryPool::new()), Arc::new(InMemoryPendingStore::new()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_to_online_peer() {
        let network = TestNetwork::new();
        let directory = FakeDirectory::new().await;
        let alice = test_node(&network, &directory, "alice", 1).await;
        let mut bob = test_node(&network, &directory, "bob", 2).await;

        let msg = alice.messenger.new_chat_message("hello bob", 3);
        let outcome = alice.messenger.send(&bob.user, &msg).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Delivered));

        let received = bob.received.recv().await.unwrap();
        assert_eq!(received, msg);
        assert_eq!(received.sender, alice.user);

        assert_eq!(alice.store.len().await, 0);
        assert_eq!(bob.store.len().await, 0);
        assert!(directory.notifications().await.is_empty());

        alice.messenger.shutdown().await;
        bob.messenger.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_stores_pending() {
        let directory = FakeDirectory::new().await;
        directory.register(&test_user("bob", 2).0, Some(ip(2))).await;

        let mut transport = MockPeerTransport::new();
        transport.expect_message()
            .withf(|addr, _| addr == &PeerAddress::new(ip(2), PORT))
            .times(3)
            .returning(|_, _| Err(SendError::Timeout));

        let store = Arc::new(InMemoryPendingStore::new());
        let (alice, _) = mocked(transport, &directory, store.clone()).await;

        let start = Instant::now();
        let outcome = alice.send(&test_user("bob", 2).0, &alice.new_chat_message("hi", 0)).await.unwrap();
        // two delays between three attempts
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert!(start.elapsed() < Duration::from_secs(6));

        let SendOutcome::StoredPending { notification } = outcome
        else {
            panic!("expected the message to be stored");
        };
        assert_eq!(notification.await.unwrap(), NotifyStatus::Notified);

        let stored = store.get_all().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].target.target, UserId::from("bob"));
        assert_eq!(store.is_immune(&stored[0].target).await, Some(true));
        assert_eq!(directory.notifications().await, vec![stored[0].target.clone()]);
    }

    #[tokio::test]
    async fn test_closed_pool_is_not_retried() {
        let directory = FakeDirectory::new().await;
        directory.register(&test_user("bob", 2).0, Some(ip(2))).await;

        let mut transport = MockPeerTransport::new();
        transport.expect_message()
            .times(1)
            .returning(|_, _| Err(SendError::PoolClosed));

        let store = Arc::new(InMemoryPendingStore::new());
        let (alice, _) = mocked(transport, &directory, store.clone()).await;

        let outcome = alice.send(&test_user("bob", 2).0, &alice.new_chat_message("hi", 0)).await.unwrap();
        assert!(matches!(outcome, SendOutcome::StoredPending { .. }));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unresolved_recipient_is_stored_without_sending() {
        let directory = FakeDirectory::new().await;
        let mut transport = MockPeerTransport::new();
        transport.expect_message().never();

        let store = Arc::new(InMemoryPendingStore::new());
        let (alice, _) = mocked(transport, &directory, store.clone()).await;

        let outcome = alice.send(&test_user("bob", 2).0, &alice.new_chat_message("hi", 0)).await.unwrap();
        assert!(matches!(outcome, SendOutcome::StoredPending { .. }));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_notification_does_not_fail_send() {
        let directory = FakeDirectory::new().await;
        directory.set_available(false).await;

        let store = Arc::new(InMemoryPendingStore::new());
        let (alice, _) = mocked(MockPeerTransport::new(), &directory, store.clone()).await;

        let outcome = alice.send(&test_user("bob", 2).0, &alice.new_chat_message("hi", 0)).await.unwrap();
        let SendOutcome::StoredPending { notification } = outcome
        else {
            panic!("expected the message to be stored");
        };
        assert_eq!(notification.await.unwrap(), NotifyStatus::Failed);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_send() {
        let directory = FakeDirectory::new().await;

        let mut store = MockPendingStore::new();
        store.expect_store_immune()
            .times(1)
            .returning(|_| Err(anyhow!("disk full")));

        let (alice, _) = mocked(MockPeerTransport::new(), &directory, Arc::new(store)).await;
        assert!(alice.send(&test_user("bob", 2).0, &alice.new_chat_message("hi", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_inbound_message_is_verified_and_delivered() {
        let directory = FakeDirectory::new().await;
        let (bob_user, _) = test_user("bob", 2);
        let (alice_user, alice_identity) = test_user("alice", 1);

        let (bob, mut received) = {
            let (user, identity) = test_user("bob", 2);
            Messenger::connect(config(), identity, user, Arc::new(MockPeerTransport::new()), Arc::new(directory.clone()), Arc::new(InMemoryPendingStore::new())).unwrap()
        };

        bob.handle_inbound(&sealed_payload(&alice_user, &alice_identity, &bob_user, "genuine")).await;
        let msg = received.try_recv().unwrap();
        assert_eq!(msg.content, "genuine");
        assert_eq!(msg.sender, alice_user);
    }

    #[tokio::test]
    async fn test_sender_key_mismatch_is_dropped() {
        let directory = FakeDirectory::new().await;
        let (bob_user, _) = test_user("bob", 2);
        let (alice_user, _) = test_user("alice", 1);
        let eve_identity = test_identity(5);

        let store = Arc::new(InMemoryPendingStore::new());
        let (bob, mut received) = {
            let (user, identity) = test_user("bob", 2);
            Messenger::connect(config(), identity, user, Arc::new(MockPeerTransport::new()), Arc::new(directory.clone()), store.clone()).unwrap()
        };

        // eve signs with her own key, but claims to be alice
        bob.handle_inbound(&sealed_payload(&alice_user, &eve_identity, &bob_user, "forged")).await;
        assert_eq!(received.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_payloads_are_dropped() {
        let directory = FakeDirectory::new().await;
        let (bob_user, _) = test_user("bob", 2);

        let store = Arc::new(InMemoryPendingStore::new());
        let (bob, mut received) = {
            let (user, identity) = test_user("bob", 2);
            Messenger::connect(config(), identity, user, Arc::new(MockPeerTransport::new()), Arc::new(directory.clone()), store.clone()).unwrap()
        };

        bob.handle_inbound(b"not json").await;

        let garbage_envelope = PendingMessage::new(MessageTarget::new_random(bob_user.id.clone()), b"not an envelope".to_vec());
        bob.handle_inbound(&serde_json::to_vec(&garbage_envelope).unwrap()).await;

        assert_eq!(received.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_message_for_other_user_is_held_for_forwarding() {
        let directory = FakeDirectory::new().await;
        let (alice_user, alice_identity) = test_user("alice", 1);
        let (carol_user, _) = test_user("carol", 3);

        let store = Arc::new(InMemoryPendingStore::new());
        let (bob, mut received) = {
            let (user, identity) = test_user("bob", 2);
            Messenger::connect(config(), identity, user, Arc::new(MockPeerTransport::new()), Arc::new(directory.clone()), store.clone()).unwrap()
        };

        bob.handle_inbound(&sealed_payload(&alice_user, &alice_identity, &carol_user, "for carol")).await;
        bob.tracker.close();
        bob.tracker.wait().await;

        assert_eq!(received.try_recv(), Err(TryRecvError::Empty));

        let held = store.get_by_target_id(&carol_user.id).await;
        assert_eq!(held.len(), 1);
        assert_eq!(store.is_immune(&held[0].target).await, Some(false));
        assert_eq!(directory.notifications().await, vec![held[0].target.clone()]);
    }

    #[tokio::test]
    async fn test_query_user() {
        let directory = FakeDirectory::new().await;
        let (carol, _) = test_user("carol", 3);
        directory.register(&carol, None).await;

        let (alice, _) = mocked(MockPeerTransport::new(), &directory, Arc::new(InMemoryPendingStore::new())).await;
        assert_eq!(alice.query_user(&carol.id).await.unwrap(), carol);
        assert!(alice.query_user(&UserId::from("nobody")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_message_is_resent_when_recipient_comes_online() {
        let network = TestNetwork::new();
        let directory = FakeDirectory::new().await;
        let alice = test_node(&network, &directory, "alice", 1).await;

        // bob is known to the directory, but nothing listens at his address yet
        let (bob_user, _) = test_user("bob", 2);
        directory.register(&bob_user, Some(ip(2))).await;

        let msg = alice.messenger.new_chat_message("are you there?", 0);
        let outcome = alice.messenger.send(&bob_user, &msg).await.unwrap();
        assert!(matches!(outcome, SendOutcome::StoredPending { .. }));
        assert_eq!(alice.store.len().await, 1);

        let mut bob = test_node(&network, &directory, "bob", 2).await;
        let received = time::timeout(Duration::from_secs(30), bob.received.recv()).await
            .unwrap()
            .unwrap();
        assert_eq!(received, msg);

        // the delivered message is deleted once the resend round completes
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(alice.store.len().await, 0);

        alice.messenger.shutdown().await;
        bob.messenger.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let network = TestNetwork::new();
        let directory = FakeDirectory::new().await;
        let mut alice = test_node(&network, &directory, "alice", 1).await;

        alice.messenger.shutdown().await;
        alice.messenger.shutdown().await;

        // the application's receiver ends instead of waiting forever
        let r = time::timeout(Duration::from_secs(2), alice.received.recv()).await;
        assert_eq!(r.unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_delivery_after_shutdown() {
        let directory = FakeDirectory::new().await;
        let (alice_user, alice_identity) = test_user("alice", 1);

        let mut transport = MockPeerTransport::new();
        transport.expect_close().return_const(());
        transport.expect_done().return_const(());

        let (bob, mut received) = {
            let (user, identity) = test_user("bob", 2);
            Messenger::connect(config(), identity, user.clone(), Arc::new(transport), Arc::new(directory.clone()), Arc::new(InMemoryPendingStore::new())).unwrap()
        };
        bob.shutdown().await;

        bob.handle_inbound(&sealed_payload(&alice_user, &alice_identity, &bob.own_user().clone(), "too late")).await;
        assert_eq!(received.recv().await, None);
    }
}
