use thiserror::Error;

use crate::identity::Identity;

/// Errors surfaced by the overlay node.
///
/// Connection-scoped failures (handshake, admission) only ever affect the
/// connection attempt that produced them; the listen loop logs and moves on.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure while exchanging handshake messages, including short reads.
    #[error("handshake i/o failed: {0}")]
    HandshakeIo(#[source] std::io::Error),

    /// The remote's signature over its ephemeral key did not verify.
    #[error("invalid signature {} for identity {identity}", hex::encode(.signature))]
    InvalidSignature {
        identity: Identity,
        signature: [u8; 64],
    },

    /// The leafset refused the peer (own identity, or too far to be admitted).
    #[error("peer {0} rejected by leafset")]
    PeerRejected(Identity),

    /// The transport authenticated a different key than the handshake proved.
    #[error("transport identity {transport} does not match handshake identity {handshake}")]
    IdentityMismatch {
        transport: Identity,
        handshake: Identity,
    },

    /// The configured forwarder aborted routing toward `next_hop`.
    #[error("forwarder aborted routing to {next_hop}: {source}")]
    ForwardVetoed {
        next_hop: Identity,
        #[source]
        source: anyhow::Error,
    },

    /// Opening a stream to, or writing the envelope to, `next_hop` failed.
    #[error("failed to forward to {next_hop}: {source}")]
    RouteForward {
        next_hop: Identity,
        #[source]
        source: anyhow::Error,
    },

    /// The configured deliverer returned an error.
    #[error("delivery failed: {0}")]
    Delivery(#[source] anyhow::Error),

    /// Listener bind, accept or dial failure.
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// The leafset actor is no longer running.
    #[error("leafset actor closed")]
    LeafsetClosed,

    /// The listen loop was stopped through its cancellation token.
    #[error("listener cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
