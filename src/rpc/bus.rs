//! Router-style bus endpoint.
//!
//! One `UnixListener` per engine. Workers connect as peers and announce
//! themselves implicitly: the slave id prefix on their first envelope binds
//! the connection to that id. Outbound sends route by slave id; sends to a
//! slave whose process has not attached yet are held in a per-slave outbox
//! and flushed on first contact. Close semantics are linger-zero: dropping
//! the bus discards pending frames and removes the socket file.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SlipwayError};
use crate::rpc::codec::{read_frame, Envelope, RpcMessage};

enum Peer {
    /// A live connection: frames go straight to its writer task.
    Connected(mpsc::UnboundedSender<BytesMut>),
    /// No connection yet; frames wait for the worker's first envelope.
    Pending(Vec<BytesMut>),
}

struct BusInner {
    tx: mpsc::UnboundedSender<Envelope>,
    peers: Mutex<HashMap<Uuid, Peer>>,
}

/// Cheap, cloneable sending side of the bus. Safe to use while holding the
/// engine mutex: sends only enqueue onto writer channels.
#[derive(Clone)]
pub struct BusHandle {
    inner: Arc<BusInner>,
}

impl BusHandle {
    /// Route a message to one slave, buffering if it has not attached yet.
    pub fn send(&self, slave_id: &Uuid, message: &RpcMessage) {
        let frame = Envelope::new(*slave_id, message.clone()).encode();
        let mut peers = self.inner.peers.lock().expect("bus peer map poisoned");

        match peers.entry(*slave_id) {
            Entry::Occupied(mut entry) => {
                let peer = entry.get_mut();
                match peer {
                    Peer::Connected(writer) => {
                        if let Err(unsent) = writer.send(frame) {
                            // Writer task is gone; hold the frame for a reconnect.
                            *peer = Peer::Pending(vec![unsent.0]);
                        }
                    }
                    Peer::Pending(outbox) => outbox.push(frame),
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Peer::Pending(vec![frame]));
            }
        }
    }

    /// Drop all routing state. Pending outboxes and queued frames are lost.
    pub fn clear(&self) {
        self.inner.peers.lock().expect("bus peer map poisoned").clear();
    }
}

/// The engine-side bus: accepts worker connections and funnels their
/// envelopes into a single channel for the event loop.
pub struct Bus {
    endpoint: PathBuf,
    listener: Option<UnixListener>,
    token: CancellationToken,
    inner: Arc<BusInner>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Bus {
    /// Bind the bus endpoint. A stale socket file from a previous run is
    /// replaced. Bind failures are configuration errors, fatal to the engine.
    pub fn bind(endpoint: &Path) -> Result<Self> {
        if endpoint.exists() {
            let _ = std::fs::remove_file(endpoint);
        }
        let listener = UnixListener::bind(endpoint).map_err(|e| {
            SlipwayError::Configuration(format!(
                "invalid bus endpoint {}: {}",
                endpoint.display(),
                e
            ))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            endpoint: endpoint.to_path_buf(),
            listener: Some(listener),
            token: CancellationToken::new(),
            inner: Arc::new(BusInner {
                tx,
                peers: Mutex::new(HashMap::new()),
            }),
            rx,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle {
            inner: self.inner.clone(),
        }
    }

    /// Spawn the accept task. Idempotent: the task lives until the bus is
    /// dropped, surviving engine stop/start cycles.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let inner = self.inner.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let inner = inner.clone();
                            let token = token.clone();
                            tokio::spawn(async move {
                                serve_peer(stream, inner, token).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Bus accept failed");
                        }
                    },
                }
            }
        });
    }

    /// Receive at least one envelope, then drain up to `max` without
    /// waiting. Returns the number of envelopes appended to `out`.
    pub async fn recv_batch(&mut self, max: usize, out: &mut Vec<Envelope>) -> usize {
        match self.rx.recv().await {
            Some(envelope) => {
                out.push(envelope);
                while out.len() < max {
                    match self.rx.try_recv() {
                        Ok(envelope) => out.push(envelope),
                        Err(_) => break,
                    }
                }
                out.len()
            }
            None => 0,
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.token.cancel();
        let _ = std::fs::remove_file(&self.endpoint);
    }
}

async fn serve_peer(stream: UnixStream, inner: Arc<BusInner>, token: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_frames(write_half, writer_rx));

    let bound_id = read_envelopes(read_half, &inner, &writer_tx, token).await;

    // Deregister only if the map still points at this connection; a
    // reconnect under the same id must not be clobbered.
    if let Some(id) = bound_id {
        let mut peers = inner.peers.lock().expect("bus peer map poisoned");
        if matches!(peers.get(&id), Some(Peer::Connected(w)) if w.same_channel(&writer_tx)) {
            peers.remove(&id);
            tracing::debug!(slave_id = %id, "Peer disconnected");
        }
    }
}

async fn read_envelopes(
    mut read_half: OwnedReadHalf,
    inner: &Arc<BusInner>,
    writer_tx: &mpsc::UnboundedSender<BytesMut>,
    token: CancellationToken,
) -> Option<Uuid> {
    let mut bound_id: Option<Uuid> = None;

    loop {
        let body = tokio::select! {
            _ = token.cancelled() => break,
            body = read_frame(&mut read_half) => body,
        };

        let body = match body {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping peer after a framing error");
                break;
            }
        };

        let envelope = match Envelope::decode(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                // The outer frame kept us in sync; skip this envelope only.
                tracing::warn!(error = %e, "Dropping an undecodable envelope");
                continue;
            }
        };

        match bound_id {
            None => bound_id = Some(envelope.slave_id),
            Some(id) if id != envelope.slave_id => {
                tracing::warn!(
                    bound = %id,
                    claimed = %envelope.slave_id,
                    "Dropping an envelope with a foreign peer id"
                );
                continue;
            }
            Some(_) => {}
        }

        // Idempotent: re-binds the route if an engine unwind cleared it.
        register_peer(inner, envelope.slave_id, writer_tx);

        if inner.tx.send(envelope).is_err() {
            break;
        }
    }

    bound_id
}

fn register_peer(inner: &Arc<BusInner>, id: Uuid, writer_tx: &mpsc::UnboundedSender<BytesMut>) {
    let mut peers = inner.peers.lock().expect("bus peer map poisoned");
    if matches!(peers.get(&id), Some(Peer::Connected(w)) if w.same_channel(writer_tx)) {
        return;
    }
    match peers.insert(id, Peer::Connected(writer_tx.clone())) {
        Some(Peer::Pending(outbox)) => {
            tracing::debug!(slave_id = %id, queued = outbox.len(), "Peer attached");
            for frame in outbox {
                let _ = writer_tx.send(frame);
            }
        }
        Some(Peer::Connected(_)) => {
            tracing::warn!(slave_id = %id, "Peer reconnected, superseding the old connection");
        }
        None => {
            tracing::debug!(slave_id = %id, "Peer attached");
        }
    }
}

async fn write_frames(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<BytesMut>) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
}
