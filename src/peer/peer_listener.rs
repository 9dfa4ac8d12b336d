use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::peer::dialer::PeerStream;


/// Accepts inbound peer connections
#[async_trait]
pub trait PeerListener: Send + Sync + 'static {
    /// Waits for the next inbound connection and returns it together with a description of the
    ///  remote side. `Ok(None)` means the listener is gone for good.
    async fn accept(&self) -> anyhow::Result<Option<(Box<dyn PeerStream>, String)>>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

pub struct TcpPeerListener {
    listener: TcpListener,
}

impl TcpPeerListener {
    pub async fn bind(port: u16) -> anyhow::Result<TcpPeerListener> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        info!("listening for peers on {:?}", listener.local_addr()?);
        Ok(TcpPeerListener { listener })
    }
}

#[async_trait]
impl PeerListener for TcpPeerListener {
    async fn accept(&self) -> anyhow::Result<Option<(Box<dyn PeerStream>, String)>> {
        let (stream, from) = self.listener.accept().await?;
        debug!(%from, "accepted peer connection");
        stream.set_nodelay(true)?;
        Ok(Some((Box::new(stream), from.to_string())))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}
