use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::peer::peer_addr::PeerAddress;


/// A byte stream to a peer. Implemented by `TcpStream` in production and by in-memory duplex
///  streams in tests.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl <T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Establishes outbound connections to peers
#[async_trait]
pub trait PeerDialer: Send + Sync + 'static {
    async fn dial(&self, addr: &PeerAddress) -> anyhow::Result<Box<dyn PeerStream>>;
}

pub struct TcpDialer {
    dial_timeout: Duration,
}

impl TcpDialer {
    pub fn new(dial_timeout: Duration) -> TcpDialer {
        TcpDialer { dial_timeout }
    }
}

#[async_trait]
impl PeerDialer for TcpDialer {
    async fn dial(&self, addr: &PeerAddress) -> anyhow::Result<Box<dyn PeerStream>> {
        debug!(%addr, "dialing");

        let stream = time::timeout(self.dial_timeout, TcpStream::connect(addr.socket_addr())).await
            .map_err(|_| anyhow!("timeout connecting to {}", addr))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
