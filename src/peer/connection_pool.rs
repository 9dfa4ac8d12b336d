use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::MessengerConfig;
use crate::peer::dialer::{PeerDialer, TcpDialer};
use crate::peer::peer_addr::PeerAddress;
use crate::peer::peer_link::PeerLink;
use crate::peer::peer_listener::{PeerListener, TcpPeerListener};
use crate::peer::SendError;


/// Delivery of payloads to peers, plus the single stream of payloads received from any peer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Sends a payload to the peer listening at `addr` and waits for its ack, connecting first if
    ///  there is no live link to that address
    async fn message(&self, addr: &PeerAddress, payload: Vec<u8>) -> Result<(), SendError>;

    /// Returns the next payload received from any peer, `None` after the transport was closed
    async fn recv(&self) -> Option<Vec<u8>>;

    fn close(&self);

    async fn done(&self);
}


/// The dial for an address is shared by everyone asking for that address while it is in flight,
///  so concurrent callers end up with the same link - or the same error.
#[derive(Default)]
struct LinkSlot {
    link: OnceCell<Result<Arc<PeerLink>, String>>,
}
impl LinkSlot {
    fn is_dead(&self) -> bool {
        match self.link.get() {
            None => false,
            Some(Ok(link)) => link.is_closed(),
            Some(Err(_)) => true,
        }
    }
}

type Links = RwLock<FxHashMap<String, Arc<LinkSlot>>>;

struct PoolInner {
    config: Arc<MessengerConfig>,
    dialer: Arc<dyn PeerDialer>,
    /// outbound links only, keyed by `PeerAddress::key()`
    links: Links,
    inbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Owns the links to all peers: links dialed on demand and cached per address, and links
///  accepted from other peers. Everything any link receives is funneled into `recv()`.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    local_addr: Option<SocketAddr>,
}

impl Debug for ConnectionPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionPool{{{:?}}}", self.local_addr)
    }
}

impl ConnectionPool {
    pub fn new(config: Arc<MessengerConfig>, dialer: Arc<dyn PeerDialer>, listener: Option<Box<dyn PeerListener>>) -> ConnectionPool {
        let (inbound_send, inbound_recv) = mpsc::channel(config.pool_inbound_buffer);

        let inner = Arc::new(PoolInner {
            config,
            dialer,
            links: Default::default(),
            inbound: inbound_send,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let local_addr = listener.as_ref().and_then(|l| l.local_addr());
        if let Some(listener) = listener {
            inner.tracker.spawn(accept_loop(inner.clone(), listener));
        }

        ConnectionPool {
            inner,
            inbound: Mutex::new(inbound_recv),
            local_addr,
        }
    }

    /// A pool listening on the configured TCP port and dialing peers over TCP
    pub async fn bind_tcp(config: Arc<MessengerConfig>) -> anyhow::Result<ConnectionPool> {
        let listener = TcpPeerListener::bind(config.listen_port).await?;
        let dialer = TcpDialer::new(config.dial_timeout);
        Ok(ConnectionPool::new(config, Arc::new(dialer), Some(Box::new(listener))))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// number of live outbound links
    pub async fn link_count(&self) -> usize {
        self.inner.links.read().await
            .values()
            .filter(|slot| matches!(slot.link.get(), Some(Ok(link)) if !link.is_closed()))
            .count()
    }

    async fn link_for(&self, addr: &PeerAddress) -> Result<Arc<PeerLink>, SendError> {
        let key = addr.key();

        let existing = self.inner.links.read().await
            .get(&key)
            .filter(|slot| !slot.is_dead())
            .cloned();

        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut links = self.inner.links.write().await;
                match links.get(&key) {
                    Some(slot) if !slot.is_dead() => slot.clone(),
                    _ => {
                        let slot = Arc::new(LinkSlot::default());
                        links.insert(key.clone(), slot.clone());
                        slot
                    }
                }
            }
        };

        // tracked, so that `done()` waits for dials in flight
        let result = slot.link
            .get_or_init(|| self.inner.tracker.track_future(dial(self.inner.clone(), *addr, slot.clone())))
            .await;

        match result {
            Ok(_) if self.inner.cancel.is_cancelled() => Err(SendError::PoolClosed),
            Ok(link) => Ok(link.clone()),
            Err(msg) => {
                retire(&self.inner.links, &key, &slot).await;
                if self.inner.cancel.is_cancelled() {
                    Err(SendError::PoolClosed)
                }
                else {
                    Err(SendError::Dial(msg.clone()))
                }
            }
        }
    }
}

#[async_trait]
impl PeerTransport for ConnectionPool {
    async fn message(&self, addr: &PeerAddress, payload: Vec<u8>) -> Result<(), SendError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SendError::PoolClosed);
        }

        let link = self.link_for(addr).await?;
        match link.send(payload).await {
            Err(SendError::Closed) if self.inner.cancel.is_cancelled() => Err(SendError::PoolClosed),
            r => r,
        }
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        select! {
            r = inbound.recv() => r,
            _ = self.inner.cancel.cancelled() => None,
        }
    }

    /// Stops accepting, and makes every link's forwarder close its link. Returns immediately,
    ///  `done()` completes when everything has wound down.
    fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("closing connection pool");
        }
        self.inner.cancel.cancel();
        self.inner.tracker.close();
    }

    async fn done(&self) {
        self.inner.tracker.wait().await
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
    }
}


async fn dial(inner: Arc<PoolInner>, addr: PeerAddress, slot: Arc<LinkSlot>) -> Result<Arc<PeerLink>, String> {
    if inner.cancel.is_cancelled() {
        return Err("connection pool is closed".to_string());
    }

    let dialed = select! {
        r = inner.dialer.dial(&addr) => r,
        _ = inner.cancel.cancelled() => return Err("connection pool is closed".to_string()),
    };
    let stream = dialed
        .map_err(|e| {
            debug!(%addr, "dial failed: {}", e);
            e.to_string()
        })?;

    if inner.cancel.is_cancelled() {
        debug!(%addr, "connection pool was closed while dialing, dropping the connection");
        return Err("connection pool is closed".to_string());
    }

    let link = PeerLink::new(stream, addr.key(), &inner.config);
    debug!(%addr, "connected");

    inner.tracker.spawn(forward(inner.clone(), link.clone(), Some((addr.key(), slot))));
    Ok(link)
}

/// removes an outbound link's slot from the map, unless it was replaced in the meantime
async fn retire(links: &Links, key: &str, slot: &Arc<LinkSlot>) {
    let mut links = links.write().await;
    if links.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
        trace!(key, "removing link from pool");
        links.remove(key);
    }
}

#[tracing::instrument(skip(inner, link, outbound), fields(peer = %link.peer()))]
async fn forward(inner: Arc<PoolInner>, link: Arc<PeerLink>, outbound: Option<(String, Arc<LinkSlot>)>) {
    loop {
        select! {
            payload = link.recv() => {
                let Some(payload) = payload else {
                    break;
                };
                select! {
                    r = inner.inbound.send(payload) => {
                        if r.is_err() {
                            break;
                        }
                    }
                    _ = inner.cancel.cancelled() => break,
                }
            }
            _ = inner.cancel.cancelled() => break,
        }
    }

    link.close();
    link.done().await;

    if let Some((key, slot)) = outbound {
        retire(&inner.links, &key, &slot).await;
    }
    trace!("forwarder terminated");
}

#[tracing::instrument(skip(inner, listener))]
async fn accept_loop(inner: Arc<PoolInner>, listener: Box<dyn PeerListener>) {
    loop {
        let accepted = select! {
            r = listener.accept() => r,
            _ = inner.cancel.cancelled() => break,
        };

        match accepted {
            Ok(Some((stream, from))) => {
                debug!(%from, "new inbound link");
                let link = PeerLink::new(stream, from, &inner.config);
                inner.tracker.spawn(forward(inner.clone(), link, None));
            }
            Ok(None) => break,
            Err(e) => {
                warn!("error accepting peer connection: {}", e);
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    trace!("accept loop terminated");
}
