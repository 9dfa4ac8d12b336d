use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::trace;

use crate::peer::dialer::{PeerDialer, PeerStream};
use crate::peer::peer_addr::PeerAddress;
use crate::peer::peer_listener::PeerListener;


const DUPLEX_BUFFER: usize = 64*1024;

/// An in-memory network: listeners register under a `PeerAddress`, and dialers connect to them
///  through `tokio::io::duplex` streams. Dial attempts are counted per address.
#[derive(Default)]
pub struct TestNetwork {
    listeners: RwLock<FxHashMap<PeerAddress, mpsc::Sender<(DuplexStream, String)>>>,
    dial_counts: RwLock<FxHashMap<PeerAddress, usize>>,
    dial_delay: Option<Duration>,
}

impl TestNetwork {
    pub fn new() -> Arc<TestNetwork> {
        Arc::new(TestNetwork::default())
    }

    /// Every dial waits for `delay` before connecting, which makes concurrent dials to the same
    ///  address overlap reliably
    pub fn with_dial_delay(delay: Duration) -> Arc<TestNetwork> {
        Arc::new(TestNetwork {
            dial_delay: Some(delay),
            ..Default::default()
        })
    }

    pub async fn listen(&self, addr: PeerAddress) -> TestListener {
        let (send, recv) = mpsc::channel(16);
        self.listeners.write().await
            .insert(addr, send);
        TestListener {
            addr,
            incoming: Mutex::new(recv),
        }
    }

    pub fn dialer(self: &Arc<Self>, from: PeerAddress) -> TestDialer {
        TestDialer {
            network: self.clone(),
            from,
        }
    }

    pub async fn dial_count(&self, addr: &PeerAddress) -> usize {
        self.dial_counts.read().await
            .get(addr)
            .copied()
            .unwrap_or(0)
    }
}

pub struct TestDialer {
    network: Arc<TestNetwork>,
    from: PeerAddress,
}

#[async_trait]
impl PeerDialer for TestDialer {
    async fn dial(&self, addr: &PeerAddress) -> anyhow::Result<Box<dyn PeerStream>> {
        *self.network.dial_counts.write().await
            .entry(*addr)
            .or_default() += 1;

        if let Some(delay) = self.network.dial_delay {
            tokio::time::sleep(delay).await;
        }

        let listener = self.network.listeners.read().await
            .get(addr)
            .cloned()
            .ok_or_else(|| anyhow!("connection refused: {}", addr))?;

        let (local, remote) = duplex(DUPLEX_BUFFER);
        listener.send((remote, self.from.to_string())).await
            .map_err(|_| anyhow!("connection refused: {}", addr))?;

        trace!(from = %self.from, to = %addr, "connected in-memory stream");
        Ok(Box::new(local))
    }
}

pub struct TestListener {
    addr: PeerAddress,
    incoming: Mutex<mpsc::Receiver<(DuplexStream, String)>>,
}

#[async_trait]
impl PeerListener for TestListener {
    async fn accept(&self) -> anyhow::Result<Option<(Box<dyn PeerStream>, String)>> {
        let mut incoming = self.incoming.lock().await;
        Ok(incoming.recv().await
            .map(|(stream, from)| (Box::new(stream) as Box<dyn PeerStream>, from)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr.socket_addr())
    }
}
