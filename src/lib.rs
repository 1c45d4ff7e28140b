//! # Pastry - Structured Overlay Node
//!
//! A node joins a key space addressed by Ed25519 public keys, keeps a bounded
//! set of its numerically nearest peers (the *leafset*) and routes opaque
//! messages toward the node whose identity is closest to a target key.
//!
//! - **Identity**: Ed25519 keypair; the public key is the node's position in key space
//! - **Leafset**: sorted, capacity-bounded neighbours on each side of the local identity
//! - **Handshake**: mutual authentication with forward-secret X25519 agreement
//! - **Routing**: deliver locally, or forward `key ‖ body` on a new stream to the next hop
//!
//! ## Architecture
//!
//! The leafset follows the **Actor Pattern**: a cloneable handle talks over an
//! async channel to a private actor that owns all mutable state, so concurrent
//! accept and teardown tasks never race on it.
//!
//! The routing core only needs a [`Transport`] capability (listen, dial, open
//! and accept streams). [`QuicTransport`] is the bundled implementation; its
//! TLS certificates carry the node's identity key and are cross-checked against
//! the handshake.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Listen/accept/route orchestration |
//! | `identity` | Keypairs and identities |
//! | `leafset` | Sorted bounded neighbour set and its actor |
//! | `peer` | Authenticated connection handle |
//! | `handshake` | 128-byte signed ephemeral key exchange |
//! | `messages` | Routed envelope framing |
//! | `protocols` | Deliverer / Forwarder capabilities |
//! | `transport` | Transport traits and the QUIC implementation |
//! | `crypto` | TLS certificate generation and verification |
//! | `error` | Error taxonomy |

mod crypto;
mod error;
mod handshake;
mod identity;
mod leafset;
mod messages;
mod node;
mod peer;
mod protocols;
mod transport;

pub use error::{Error, Result};
pub use handshake::{perform as perform_handshake, Handshake, HandshakeMessage, HANDSHAKE_LEN};
pub use identity::{Identity, Keypair, IDENTITY_LEN, SEED_LEN};
pub use leafset::{Insertion, Leafset, LeafsetHandle, LeafsetSnapshot, DEFAULT_LEAFSET_CAPACITY};
pub use messages::{read_routing_key, write_envelope, Key, KEY_LEN};
pub use node::{Node, NodeConfig, Routed, DEFAULT_COMMAND_CHANNEL_SIZE};
pub use peer::Peer;
pub use protocols::{Body, ChannelDeliverer, Delivered, Deliverer, Forwarder, MAX_DELIVERED_BODY};
pub use transport::{BiStream, Connection, Listener, QuicConfig, QuicTransport, StreamReader, StreamWriter, Transport};
