use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::config::MessengerConfig;
use crate::peer::wire::{decode_frame, encode_frame, read_frame_bytes, write_frame, FrameDecodeError, WireFrame};
use crate::peer::SendError;


type PendingAcks = Arc<Mutex<FxHashMap<String, oneshot::Sender<()>>>>;

fn lock_acks(acks: &Mutex<FxHashMap<String, oneshot::Sender<()>>>) -> MutexGuard<'_, FxHashMap<String, oneshot::Sender<()>>> {
    // critical sections are plain map operations that can not panic half-way
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One bidirectional connection to a single peer, driven by a read loop and a write loop.
///
/// Every `send()` waits for an application-level ack of its own frame id, so any number of sends
///  can be in flight concurrently on the same link. Received payloads are handed out through
///  `recv()` one at a time: a slow consumer stalls reading from this peer (and only this peer).
pub struct PeerLink {
    peer: String,
    outgoing: mpsc::Sender<Bytes>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    pending_acks: PendingAcks,
    cancel: CancellationToken,
    tracker: TaskTracker,
    ack_timeout: Duration,
    max_frame_len: usize,
}

impl Debug for PeerLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerLink{{{}}}", self.peer)
    }
}

impl PeerLink {
    /// Takes ownership of an established stream and spawns the link's read and write loops.
    ///  `peer` identifies the remote side in logs.
    pub fn new<S>(stream: S, peer: impl Into<String>, config: &MessengerConfig) -> Arc<PeerLink>
    where S: AsyncRead + AsyncWrite + Send + 'static
    {
        let peer = peer.into();
        let (reader, writer) = tokio::io::split(stream);

        let (outgoing_send, outgoing_recv) = mpsc::channel(config.outgoing_buffer);
        // capacity 1 is as close to a rendezvous as tokio's mpsc gets
        let (incoming_send, incoming_recv) = mpsc::channel(1);

        let link = Arc::new(PeerLink {
            peer: peer.clone(),
            outgoing: outgoing_send.clone(),
            incoming: tokio::sync::Mutex::new(incoming_recv),
            pending_acks: Default::default(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            ack_timeout: config.ack_timeout,
            max_frame_len: config.max_frame_len,
        });

        link.tracker.spawn(read_loop(
            peer.clone(),
            reader,
            incoming_send,
            outgoing_send,
            link.pending_acks.clone(),
            link.cancel.clone(),
            config.max_frame_len,
        ));
        link.tracker.spawn(write_loop(
            peer,
            writer,
            outgoing_recv,
            link.cancel.clone(),
        ));
        link.tracker.close();

        link
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends a payload and waits until the peer acknowledges it, the ack timeout elapses or the
    ///  link is closed.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }

        let frame = WireFrame::new_data(payload);
        let encoded = encode_frame(&frame, self.max_frame_len)
            .map_err(|e| SendError::Encode(e.to_string()))?;

        let (ack_send, ack_recv) = oneshot::channel();
        let _registration = AckRegistration::new(&self.pending_acks, frame.id().to_string(), ack_send);

        trace!(peer = %self.peer, frame = ?frame, "sending");

        select! {
            r = self.outgoing.send(encoded) => {
                if r.is_err() {
                    return Err(SendError::Closed);
                }
            }
            _ = self.cancel.cancelled() => return Err(SendError::Closed),
        }

        select! {
            r = ack_recv => match r {
                Ok(_) => Ok(()),
                Err(_) => Err(SendError::Closed),
            },
            _ = time::sleep(self.ack_timeout) => {
                debug!(peer = %self.peer, id = frame.id(), "ack timeout");
                Err(SendError::Timeout)
            }
            _ = self.cancel.cancelled() => Err(SendError::Closed),
        }
    }

    /// Returns the next payload received from the peer, or `None` once the link is closed and
    ///  everything received before has been consumed.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await
    }

    /// Signals both loops to terminate. Calling this more than once has no further effect.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(peer = %self.peer, "closing link");
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once both loops have exited. Can be awaited any number of times.
    pub async fn done(&self) {
        self.tracker.wait().await
    }

    /// number of sends currently waiting for an ack
    pub fn pending_ack_count(&self) -> usize {
        lock_acks(&self.pending_acks).len()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Removes the ack registration for a frame id no matter how the `send()` call ends, including
///  the caller dropping its future.
struct AckRegistration<'a> {
    pending_acks: &'a Mutex<FxHashMap<String, oneshot::Sender<()>>>,
    id: String,
}
impl <'a> AckRegistration<'a> {
    fn new(pending_acks: &'a Mutex<FxHashMap<String, oneshot::Sender<()>>>, id: String, ack_send: oneshot::Sender<()>) -> AckRegistration<'a> {
        lock_acks(pending_acks).insert(id.clone(), ack_send);
        AckRegistration { pending_acks, id }
    }
}
impl Drop for AckRegistration<'_> {
    fn drop(&mut self) {
        lock_acks(self.pending_acks).remove(&self.id);
    }
}


#[tracing::instrument(skip(reader, incoming, outgoing, pending_acks, cancel))]
async fn read_loop<S: AsyncRead>(
    peer: String,
    mut reader: ReadHalf<S>,
    incoming: mpsc::Sender<Vec<u8>>,
    outgoing: mpsc::Sender<Bytes>,
    pending_acks: PendingAcks,
    cancel: CancellationToken,
    max_frame_len: usize,
) {
    loop {
        let r = select! {
            r = read_frame_bytes(&mut reader, max_frame_len) => r,
            _ = cancel.cancelled() => break,
        };

        let buf = match r {
            Ok(Some(buf)) => buf,
            Ok(None) => {
                debug!("peer closed the connection");
                break;
            }
            Err(FrameDecodeError::TooLarge { len, max }) => {
                warn!("peer announced a frame of {} bytes (max {}) - closing connection because it is apparently compromised", len, max);
                break;
            }
            Err(e) => {
                debug!(error = %e, "error reading from peer - closing connection");
                break;
            }
        };

        match decode_frame(&buf) {
            Ok(WireFrame::Data { id, payload }) => {
                trace!(%id, len = payload.len(), "received data frame");

                // wait for a consumer: this is what propagates backpressure to the peer
                select! {
                    r = incoming.send(payload) => {
                        if r.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }

                match encode_frame(&WireFrame::Ack { id }, max_frame_len) {
                    Ok(encoded) => {
                        // a lost ack only causes a timeout on the sender's side
                        if let Err(e) = outgoing.try_send(encoded) {
                            warn!("dropping ack because outgoing buffer is not available: {}", e);
                        }
                    }
                    Err(e) => warn!("could not encode ack: {}", e),
                }
            }
            Ok(WireFrame::Ack { id }) => {
                let ack_send = lock_acks(&pending_acks).remove(&id);
                match ack_send {
                    Some(ack_send) => {
                        let _ = ack_send.send(());
                    }
                    None => trace!(%id, "ignoring ack without a waiting sender"),
                }
            }
            Err(e) => {
                warn!("skipping undecodable frame: {}", e);
            }
        }
    }

    cancel.cancel();
    trace!("read loop terminated");
}

#[tracing::instrument(skip(writer, outgoing, cancel))]
async fn write_loop<S: AsyncWrite>(
    peer: String,
    mut writer: WriteHalf<S>,
    mut outgoing: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let encoded = select! {
            f = outgoing.recv() => match f {
                Some(f) => f,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        select! {
            r = write_frame(&mut writer, &encoded) => {
                if let Err(e) = r {
                    debug!(error = %e, "error writing to peer - closing connection");
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    cancel.cancel();
    let _ = writer.shutdown().await;
    trace!("write loop terminated");
}
