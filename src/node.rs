//! # Overlay Node
//!
//! A [`Node`] ties the pieces together:
//!
//! ```text
//! listen ─► accept(connection) ─► handshake ─► leafset insert ─► connection loop
//!                                                                     │
//!                                          per stream: read key ─► route(key, body)
//!                                                                     │
//!                                             ┌───────────────────────┴──────────────┐
//!                                        closest = local                     closest = peer
//!                                     Deliverer (or drop)        Forwarder, then key ‖ body on a new stream
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! let keypair = Keypair::generate();
//! let transport = Arc::new(QuicTransport::new(&keypair, QuicConfig::default())?);
//! let (deliverer, mut delivered) = ChannelDeliverer::new(64);
//! let node = Node::new(keypair, transport, NodeConfig::default())
//!     .with_deliverer(Arc::new(deliverer));
//!
//! let shutdown = CancellationToken::new();
//! tokio::spawn({
//!     let node = node.clone();
//!     let shutdown = shutdown.clone();
//!     async move { node.listen_and_serve(shutdown, "0.0.0.0:4000".parse()?).await }
//! });
//! node.dial_and_accept("10.0.0.2:4000".parse()?).await?;
//! node.route(key, Box::new(&b"hello"[..])).await?;
//! ```
//!
//! ## Task Model
//!
//! - one task per accepted connection while it handshakes
//! - one task per admitted peer that accepts its streams
//! - one short-lived task per inbound stream that runs a single `route`
//!
//! Peer tasks keep only a weak reference to the node. Connection-scoped errors
//! end that connection and are logged; they never reach the accept loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::rngs::OsRng;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::handshake;
use crate::identity::{Identity, Keypair, IDENTITY_LEN};
use crate::leafset::{LeafsetHandle, LeafsetSnapshot, DEFAULT_LEAFSET_CAPACITY};
use crate::messages::{key_position, read_routing_key, write_envelope, Key};
use crate::peer::Peer;
use crate::protocols::{Body, Deliverer, Forwarder};
use crate::transport::{BiStream, Connection, Listener, Transport};

/// Default depth of the leafset actor's command queue.
pub const DEFAULT_COMMAND_CHANNEL_SIZE: usize = 256;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Peers kept on each side of the local identity. Zero is treated as one.
    pub leafset_capacity: usize,
    pub command_channel_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            leafset_capacity: DEFAULT_LEAFSET_CAPACITY,
            command_channel_size: DEFAULT_COMMAND_CHANNEL_SIZE,
        }
    }
}

/// What [`Node::route`] did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Routed {
    /// This node is the destination and the deliverer accepted the message.
    Delivered,
    /// This node is the destination but no deliverer is configured.
    Dropped,
    /// Sent on toward the given next hop.
    Forwarded(Identity),
}

/// Cheaply cloneable handle to a running overlay node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

#[derive(Clone)]
struct NodeInner {
    keypair: Keypair,
    identity: Identity,
    transport: Arc<dyn Transport>,
    leafset: LeafsetHandle,
    deliverer: Option<Arc<dyn Deliverer>>,
    forwarder: Option<Arc<dyn Forwarder>>,
    links: Arc<Links>,
}

/// Admitted connections whose peer loop is still running. Includes duplicate
/// joins that the leafset does not hold.
#[derive(Default)]
struct Links {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Peer>>,
}

impl Links {
    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Peer>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, peer: Peer) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live().insert(id, peer);
        id
    }

    fn unregister(&self, id: u64) {
        self.live().remove(&id);
    }

    fn drain(&self) -> Vec<Peer> {
        self.live().drain().map(|(_, peer)| peer).collect()
    }
}

impl Node {
    /// Create a node. Must be called within a tokio runtime: the leafset actor
    /// is spawned here.
    pub fn new(keypair: Keypair, transport: Arc<dyn Transport>, config: NodeConfig) -> Self {
        let identity = keypair.identity();
        let leafset = LeafsetHandle::spawn(identity, config.leafset_capacity, config.command_channel_size);
        Self {
            inner: Arc::new(NodeInner {
                keypair,
                identity,
                transport,
                leafset,
                deliverer: None,
                forwarder: None,
                links: Arc::default(),
            }),
        }
    }

    /// Attach the capability that receives messages addressed to this node.
    pub fn with_deliverer(self, deliverer: Arc<dyn Deliverer>) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.inner);
        inner.deliverer = Some(deliverer);
        Self { inner: Arc::new(inner) }
    }

    /// Attach the capability consulted before every forward.
    pub fn with_forwarder(self, forwarder: Arc<dyn Forwarder>) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.inner);
        inner.forwarder = Some(forwarder);
        Self { inner: Arc::new(inner) }
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    pub fn public_key(&self) -> [u8; IDENTITY_LEN] {
        *self.inner.identity.as_bytes()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    /// Current leafset members.
    pub async fn leafset(&self) -> Result<LeafsetSnapshot> {
        self.inner.leafset.snapshot().await
    }

    pub async fn listen(&self, addr: SocketAddr) -> Result<Arc<dyn Listener>> {
        self.inner.transport.listen(addr).await.map_err(Error::Transport)
    }

    /// Bind `addr` and serve until `shutdown` is cancelled.
    ///
    /// Returns [`Error::Cancelled`] after a clean shutdown.
    pub async fn listen_and_serve(&self, shutdown: CancellationToken, addr: SocketAddr) -> Result<()> {
        let listener = self.listen(addr).await?;
        if let Ok(local) = listener.local_addr() {
            info!("Node {}/{}", local, self.inner.identity);
        }
        self.serve_with_shutdown(listener, shutdown).await
    }

    /// Accept connections from `listener` until `shutdown` is cancelled, then
    /// close the listener. Admitted peers keep running.
    pub async fn serve_with_shutdown(&self, listener: Arc<dyn Listener>, shutdown: CancellationToken) -> Result<()> {
        let serve = self.serve(listener.clone());
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => result,
            _ = shutdown.cancelled() => {
                listener.close();
                if let Err(e) = serve.await {
                    trace!(error = %e, "accept loop ended");
                }
                info!(identity = %self.inner.identity.short(), "listener shut down");
                Err(Error::Cancelled)
            }
        }
    }

    /// Accept loop. Each connection is handshaken on its own task; only a
    /// listener failure ends the loop.
    pub async fn serve(&self, listener: Arc<dyn Listener>) -> Result<()> {
        loop {
            let connection = listener.accept().await.map_err(Error::Transport)?;
            let remote_addr = connection.remote_addr();
            debug!(remote = ?remote_addr, "connection accepted");

            let node = self.clone();
            tokio::spawn(async move {
                let stream = match connection.accept_stream().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(remote = ?remote_addr, error = %e, "no handshake stream");
                        let _ = connection.close().await;
                        return;
                    }
                };
                if let Err(e) = node.accept(connection, stream).await {
                    debug!(remote = ?remote_addr, error = %e, "inbound connection refused");
                }
            });
        }
    }

    /// Dial `addr`, handshake on a fresh stream and admit the remote.
    pub async fn dial_and_accept(&self, addr: SocketAddr) -> Result<Identity> {
        let connection = self.inner.transport.dial(addr).await.map_err(Error::Transport)?;
        let stream = match connection.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = connection.close().await;
                return Err(Error::Transport(e));
            }
        };
        self.accept(connection, stream).await
    }

    /// Authenticate the remote over `stream` and admit it to the leafset.
    ///
    /// On success the connection's streams are served in the background and the
    /// remote identity is returned. On failure the connection is closed.
    pub async fn accept(&self, connection: Arc<dyn Connection>, stream: BiStream) -> Result<Identity> {
        match self.admit(&connection, stream).await {
            Ok(peer) => {
                let identity = peer.identity();
                info!(peer = %identity.short(), remote = ?connection.remote_addr(), "peer admitted");
                let link = self.inner.links.register(peer.clone());
                let node = Arc::downgrade(&self.inner);
                tokio::spawn(connection_loop(node, peer, link));
                Ok(identity)
            }
            Err(e) => {
                debug!(remote = ?connection.remote_addr(), error = %e, "peer not admitted");
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    async fn admit(&self, connection: &Arc<dyn Connection>, stream: BiStream) -> Result<Peer> {
        let BiStream { mut send, mut recv } = stream;
        let handshake = handshake::perform(&self.inner.keypair, &mut send, &mut recv, &mut OsRng).await?;
        let _ = send.shutdown().await;
        let remote = handshake.remote;
        trace!(peer = %remote.short(), "handshake completed");

        if let Some(transport) = connection.transport_identity()
            && transport != remote
        {
            return Err(Error::IdentityMismatch {
                transport,
                handshake: remote,
            });
        }

        let peer = Peer::new(remote, connection.clone());
        if !self.inner.leafset.insert(peer.clone()).await? {
            return Err(Error::PeerRejected(remote));
        }
        Ok(peer)
    }

    /// Deliver `body` here if this node is closest to `key`, otherwise forward
    /// it to the closest leafset member.
    pub async fn route(&self, key: Key, body: Body) -> Result<Routed> {
        self.route_from(None, key, body).await
    }

    /// `from` is the peer a message arrived from. A message is never reflected
    /// straight back to its sender; it is delivered here instead.
    async fn route_from(&self, from: Option<Identity>, key: Key, body: Body) -> Result<Routed> {
        let closest = self.inner.leafset.closest(key_position(&key)).await?;
        match closest {
            Some(next) if Some(next.identity()) != from => self.forward(next, key, body).await,
            _ => self.deliver(key, body).await,
        }
    }

    async fn deliver(&self, key: Key, body: Body) -> Result<Routed> {
        let Some(deliverer) = &self.inner.deliverer else {
            trace!(key = %hex::encode(&key[..8]), "no deliverer, dropping message");
            return Ok(Routed::Dropped);
        };
        deliverer.deliver(key, body).await.map_err(Error::Delivery)?;
        trace!(key = %hex::encode(&key[..8]), "delivered");
        Ok(Routed::Delivered)
    }

    async fn forward(&self, next: Peer, key: Key, mut body: Body) -> Result<Routed> {
        let next_hop = next.identity();
        if let Some(forwarder) = &self.inner.forwarder {
            forwarder
                .forward(next_hop, &key, &mut body)
                .await
                .map_err(|source| Error::ForwardVetoed { next_hop, source })?;
        }

        let mut stream = next
            .connection()
            .open_stream()
            .await
            .map_err(|source| Error::RouteForward { next_hop, source })?;
        let copied = write_envelope(&mut stream.send, &key, &mut body)
            .await
            .map_err(|e| Error::RouteForward {
                next_hop,
                source: e.into(),
            })?;
        trace!(key = %hex::encode(&key[..8]), next_hop = %next_hop.short(), bytes = copied, "forwarded");
        Ok(Routed::Forwarded(next_hop))
    }

    async fn handle_stream(&self, from: Identity, stream: BiStream) -> Result<Routed> {
        let BiStream { mut recv, .. } = stream;
        let key = read_routing_key(&mut recv)
            .await
            .map_err(|e| Error::Transport(anyhow::Error::new(e).context("failed to read routing key")))?;
        self.route_from(Some(from), key, recv).await
    }

    /// Remove and close every leafset member, then close any other admitted
    /// connection still being served. Returns the first leafset close failure.
    pub async fn close(&self) -> Result<()> {
        let result = self.inner.leafset.close().await;

        let mut join_set = JoinSet::new();
        for peer in self.inner.links.drain() {
            join_set.spawn(async move { (peer.identity(), peer.close().await) });
        }
        while let Some(joined) = join_set.join_next().await {
            if let Ok((identity, Err(e))) = joined {
                trace!(peer = %identity.short(), error = %e, "connection close failed");
            }
        }
        result
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.inner.identity)
            .field("deliverer", &self.inner.deliverer.is_some())
            .field("forwarder", &self.inner.forwarder.is_some())
            .finish_non_exhaustive()
    }
}

/// Serve inbound streams of an admitted peer until its connection ends, then
/// drop it from the leafset.
async fn connection_loop(node: Weak<NodeInner>, peer: Peer, link: u64) {
    let identity = peer.identity();
    loop {
        let stream = match peer.connection().accept_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %identity.short(), error = %e, "connection closed");
                break;
            }
        };
        let Some(inner) = node.upgrade() else {
            break;
        };
        let node = Node { inner };
        tokio::spawn(async move {
            match node.handle_stream(identity, stream).await {
                Ok(routed) => trace!(peer = %identity.short(), ?routed, "stream handled"),
                Err(e) => debug!(peer = %identity.short(), error = %e, "stream error"),
            }
        });
    }

    if let Some(inner) = node.upgrade() {
        inner.links.unregister(link);
        match inner.leafset.remove(peer.clone()).await {
            Ok(true) => info!(peer = %identity.short(), "peer removed"),
            Ok(false) => {}
            Err(e) => warn!(peer = %identity.short(), error = %e, "failed to remove peer"),
        }
    }
    let _ = peer.close().await;
}
