use thiserror::Error;

pub mod connection_pool;
pub mod dialer;
pub mod peer_addr;
pub mod peer_link;
pub mod peer_listener;
pub mod wire;


/// Outcome of a failed attempt to hand a payload to a peer. All variants are transient from the
///  messenger's point of view.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no ack received within the timeout")]
    Timeout,
    #[error("link closed")]
    Closed,
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("could not encode frame: {0}")]
    Encode(String),
    #[error("connection pool is closed")]
    PoolClosed,
}
