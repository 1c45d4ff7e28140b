//! # Leafset
//!
//! The bounded set of peers numerically nearest to the local identity, kept as
//! two sorted sides:
//!
//! ```text
//!   left (keys < parent)          parent          right (keys > parent)
//!   [ farthest ... nearest ]        M        [ nearest ... farthest ]
//! ```
//!
//! Both sides are sorted ascending by key, so the nearest left member is the
//! *last* element while the nearest right member is the *first*. Each side holds
//! at most `capacity` peers; admission and eviction are decided by distance to
//! the parent, never by recency.
//!
//! ## Lookup
//!
//! [`Leafset::closest`] uses successor search: the first member whose key is
//! `>=` the target, else the last member of that side. `None` means the local
//! node is the destination (target equals the parent, or that side is empty).
//!
//! ## Ownership
//!
//! [`Leafset`] itself is a plain synchronous structure. Inside a running node it
//! is owned by a single actor task and reached through [`LeafsetHandle`], so
//! concurrent accept and teardown tasks never mutate a side at the same time.
//! Evicted peers are closed on a detached task; the inserting caller never waits
//! for that close.

use std::cmp::Ordering;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::peer::Peer;

/// Default number of peers kept on each side of the local identity.
pub const DEFAULT_LEAFSET_CAPACITY: usize = 16;

/// Outcome of [`Leafset::insert`].
#[derive(Debug)]
pub enum Insertion {
    /// The peer is now a member. Holds the farthest member of that side if it
    /// had to make room.
    Inserted { evicted: Option<Peer> },
    /// A member with the same key already exists; nothing changed.
    AlreadyPresent,
    /// The key equals the parent, or the peer is too far away to be admitted.
    Rejected,
}

impl Insertion {
    /// Whether the insert counts as a successful join.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Insertion::Rejected)
    }
}

/// Identities currently held on each side, in leafset order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafsetSnapshot {
    pub left: Vec<Identity>,
    pub right: Vec<Identity>,
}

impl LeafsetSnapshot {
    pub fn len(&self) -> usize {
        self.left.len() + self.right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.left.contains(identity) || self.right.contains(identity)
    }
}

pub struct Leafset {
    parent: Identity,
    capacity: usize,
    left: Vec<Peer>,
    right: Vec<Peer>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Index of the first member whose key is `>= key`.
fn successor(side: &[Peer], key: &Identity) -> usize {
    side.partition_point(|peer| peer.identity() < *key)
}

impl Leafset {
    /// Create an empty leafset around `parent`. A zero capacity is raised to one.
    pub fn new(parent: Identity, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            parent,
            capacity,
            left: Vec::with_capacity(capacity + 1),
            right: Vec::with_capacity(capacity + 1),
        }
    }

    pub fn parent(&self) -> Identity {
        self.parent
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn left(&self) -> &[Peer] {
        &self.left
    }

    pub fn right(&self) -> &[Peer] {
        &self.right
    }

    pub fn len(&self) -> usize {
        self.left.len() + self.right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }

    fn side_of(&self, key: &Identity) -> Option<Side> {
        match key.cmp(&self.parent) {
            Ordering::Less => Some(Side::Left),
            Ordering::Greater => Some(Side::Right),
            Ordering::Equal => None,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut Vec<Peer> {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// The member a message for `key` should go to, or `None` if it belongs here.
    pub fn closest(&self, key: &Identity) -> Option<&Peer> {
        let side = match self.side_of(key)? {
            Side::Left => &self.left,
            Side::Right => &self.right,
        };
        let index = successor(side, key);
        side.get(index).or_else(|| side.last())
    }

    /// Admit `peer` if fewer than `capacity` members of its side are nearer to
    /// the parent, evicting that side's farthest member when it overflows.
    ///
    /// Both sides are judged by distance to the parent. On the left this departs
    /// from the literal "successor index >= capacity" rule, which would reject
    /// the nearest left candidates and evict the nearest left member.
    pub fn insert(&mut self, peer: Peer) -> Insertion {
        let key = peer.identity();
        let Some(side) = self.side_of(&key) else {
            return Insertion::Rejected;
        };
        let capacity = self.capacity;
        let members = self.side_mut(side);
        let index = successor(members, &key);

        if members.get(index).is_some_and(|m| m.identity() == key) {
            return Insertion::AlreadyPresent;
        }

        // Number of current members nearer to the parent than the newcomer.
        let nearer = match side {
            Side::Left => members.len() - index,
            Side::Right => index,
        };
        if nearer >= capacity {
            return Insertion::Rejected;
        }

        members.insert(index, peer);
        let evicted = if members.len() > capacity {
            match side {
                Side::Left => Some(members.remove(0)),
                Side::Right => members.pop(),
            }
        } else {
            None
        };
        Insertion::Inserted { evicted }
    }

    /// Remove `peer` if the member under its key is held on the same connection.
    pub fn remove(&mut self, peer: &Peer) -> bool {
        let key = peer.identity();
        let Some(side) = self.side_of(&key) else {
            return false;
        };
        let members = self.side_mut(side);
        let index = successor(members, &key);
        match members.get(index) {
            Some(member) if member.identity() == key && member.same_connection(peer) => {
                members.remove(index);
                true
            }
            _ => false,
        }
    }

    /// Take every member out, left side first.
    pub fn drain(&mut self) -> Vec<Peer> {
        let mut peers = std::mem::take(&mut self.left);
        peers.append(&mut self.right);
        peers
    }

    pub fn snapshot(&self) -> LeafsetSnapshot {
        LeafsetSnapshot {
            left: self.left.iter().map(Peer::identity).collect(),
            right: self.right.iter().map(Peer::identity).collect(),
        }
    }
}

impl std::fmt::Debug for Leafset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Leafset")
            .field("parent", &self.parent)
            .field("capacity", &self.capacity)
            .field("left", &snapshot.left)
            .field("right", &snapshot.right)
            .finish()
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    Insert(Peer, oneshot::Sender<bool>),
    Remove(Peer, oneshot::Sender<bool>),
    Closest(Identity, oneshot::Sender<Option<Peer>>),
    Snapshot(oneshot::Sender<LeafsetSnapshot>),
    Drain(oneshot::Sender<Vec<Peer>>),
}

/// Shared handle to a leafset owned by a background actor.
///
/// The actor stops once every handle is dropped.
#[derive(Clone)]
pub struct LeafsetHandle {
    cmd_tx: mpsc::Sender<Command>,
    parent: Identity,
}

struct LeafsetActor {
    leafset: Leafset,
    cmd_rx: mpsc::Receiver<Command>,
}

impl LeafsetHandle {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(parent: Identity, capacity: usize, channel_size: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(channel_size.max(1));
        let actor = LeafsetActor {
            leafset: Leafset::new(parent, capacity),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx, parent }
    }

    pub fn parent(&self) -> Identity {
        self.parent
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(tx))
            .await
            .map_err(|_| Error::LeafsetClosed)?;
        rx.await.map_err(|_| Error::LeafsetClosed)
    }

    /// Returns whether the peer is a member afterwards. An evicted member is
    /// closed in the background.
    pub async fn insert(&self, peer: Peer) -> Result<bool> {
        self.request(|tx| Command::Insert(peer, tx)).await
    }

    pub async fn remove(&self, peer: Peer) -> Result<bool> {
        self.request(|tx| Command::Remove(peer, tx)).await
    }

    pub async fn closest(&self, key: Identity) -> Result<Option<Peer>> {
        self.request(|tx| Command::Closest(key, tx)).await
    }

    pub async fn snapshot(&self) -> Result<LeafsetSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Remove every member and close all of their connections concurrently.
    ///
    /// Waits for every close and returns the first failure.
    pub async fn close(&self) -> Result<()> {
        let peers = self.request(Command::Drain).await?;
        debug!(parent = %self.parent.short(), peers = peers.len(), "closing leafset");

        let mut join_set = JoinSet::new();
        for peer in peers {
            join_set.spawn(async move {
                peer.close()
                    .await
                    .map_err(|e| (peer.identity(), e))
            });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(Ok(())) => continue,
                Ok(Err((identity, e))) => {
                    debug!(peer = %identity.short(), error = %e, "failed to close peer");
                    Error::Transport(e)
                }
                Err(e) => Error::Transport(anyhow::Error::new(e).context("close task failed")),
            };
            if first_error.is_none() {
                first_error = Some(outcome);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl LeafsetActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Insert(peer, reply) => {
                    let accepted = self.handle_insert(peer);
                    let _ = reply.send(accepted);
                }
                Command::Remove(peer, reply) => {
                    let removed = self.leafset.remove(&peer);
                    if removed {
                        trace!(peer = %peer.identity().short(), "removed from leafset");
                    }
                    let _ = reply.send(removed);
                }
                Command::Closest(key, reply) => {
                    let _ = reply.send(self.leafset.closest(&key).cloned());
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.leafset.snapshot());
                }
                Command::Drain(reply) => {
                    let _ = reply.send(self.leafset.drain());
                }
            }
        }
        trace!(parent = %self.leafset.parent().short(), "leafset actor stopped");
    }

    fn handle_insert(&mut self, peer: Peer) -> bool {
        let identity = peer.identity();
        match self.leafset.insert(peer) {
            Insertion::Inserted { evicted } => {
                trace!(peer = %identity.short(), "inserted into leafset");
                if let Some(evicted) = evicted {
                    debug!(
                        peer = %evicted.identity().short(),
                        replaced_by = %identity.short(),
                        "evicting farthest leafset member"
                    );
                    tokio::spawn(async move {
                        let _ = evicted.close().await;
                    });
                }
                true
            }
            Insertion::AlreadyPresent => {
                trace!(peer = %identity.short(), "already in leafset");
                true
            }
            Insertion::Rejected => false,
        }
    }
}
