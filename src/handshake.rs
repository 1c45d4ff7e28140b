//! # Connection Handshake
//!
//! Runs once per new connection, on a dedicated stream, before the remote is
//! admitted to the leafset. Both sides run the identical procedure, so there
//! is no client or server role:
//!
//! ```text
//! <-> [ identity public key (32) | ephemeral X25519 public key (32) | Ed25519 signature over the ephemeral key (64) ]
//! ```
//!
//! 1. Generate an ephemeral X25519 keypair.
//! 2. Write our 128-byte message in one contiguous write.
//! 3. Read exactly 128 bytes from the remote.
//! 4. Verify the remote signature over its ephemeral key with its identity key.
//! 5. Derive the X25519 shared secret from our ephemeral secret and its ephemeral public key.
//!
//! Each side writes a complete fixed-size buffer before reading, so two peers
//! running the handshake at the same time cannot deadlock. The ephemeral secret
//! is consumed by the agreement and never leaves this module.

use ed25519_dalek::{Signature, VerifyingKey};
use rand::{CryptoRng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey as EphemeralPublic, SharedSecret};

use crate::error::{Error, Result};
use crate::identity::{Identity, Keypair, IDENTITY_LEN};

/// Size of an X25519 public key.
pub const EPHEMERAL_KEY_LEN: usize = 32;

/// Size of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Size of one handshake message on the wire.
pub const HANDSHAKE_LEN: usize = IDENTITY_LEN + EPHEMERAL_KEY_LEN + SIGNATURE_LEN;

/// One side's handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub identity: Identity,
    pub ephemeral: [u8; EPHEMERAL_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl HandshakeMessage {
    /// Sign `ephemeral` with the identity key of `keypair`.
    pub fn sign(keypair: &Keypair, ephemeral: [u8; EPHEMERAL_KEY_LEN]) -> Self {
        Self {
            identity: keypair.identity(),
            ephemeral,
            signature: keypair.sign(&ephemeral).to_bytes(),
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        let (identity, rest) = out.split_at_mut(IDENTITY_LEN);
        let (ephemeral, signature) = rest.split_at_mut(EPHEMERAL_KEY_LEN);
        identity.copy_from_slice(self.identity.as_bytes());
        ephemeral.copy_from_slice(&self.ephemeral);
        signature.copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8; HANDSHAKE_LEN]) -> Self {
        let mut identity = [0u8; IDENTITY_LEN];
        let mut ephemeral = [0u8; EPHEMERAL_KEY_LEN];
        let mut signature = [0u8; SIGNATURE_LEN];
        identity.copy_from_slice(&bytes[..IDENTITY_LEN]);
        ephemeral.copy_from_slice(&bytes[IDENTITY_LEN..IDENTITY_LEN + EPHEMERAL_KEY_LEN]);
        signature.copy_from_slice(&bytes[IDENTITY_LEN + EPHEMERAL_KEY_LEN..]);
        Self {
            identity: Identity::from_bytes(identity),
            ephemeral,
            signature,
        }
    }

    /// Check that `signature` is the identity key's signature over `ephemeral`.
    ///
    /// An identity that is not a valid Ed25519 point fails the same way as a bad
    /// signature: nothing about the remote can be trusted in either case.
    pub fn verify(&self) -> Result<()> {
        let invalid = || Error::InvalidSignature {
            identity: self.identity,
            signature: self.signature,
        };
        let verifying_key = VerifyingKey::from_bytes(self.identity.as_bytes()).map_err(|_| invalid())?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify_strict(&self.ephemeral, &signature)
            .map_err(|_| invalid())
    }
}

/// Outcome of a successful handshake.
pub struct Handshake {
    /// Verified identity of the remote.
    pub remote: Identity,
    /// X25519 agreement between the two ephemeral keys. Not used by routing;
    /// available to a payload encryption layer.
    pub shared_secret: SharedSecret,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Run the handshake: write our message to `writer`, then read and verify the
/// remote's message from `reader`.
pub async fn perform<W, R, G>(keypair: &Keypair, writer: &mut W, reader: &mut R, rng: &mut G) -> Result<Handshake>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
    G: RngCore + CryptoRng,
{
    let secret = EphemeralSecret::random_from_rng(&mut *rng);
    let ephemeral = EphemeralPublic::from(&secret);

    let ours = HandshakeMessage::sign(keypair, ephemeral.to_bytes());
    writer.write_all(&ours.to_bytes()).await.map_err(Error::HandshakeIo)?;
    writer.flush().await.map_err(Error::HandshakeIo)?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf).await.map_err(Error::HandshakeIo)?;
    let theirs = HandshakeMessage::from_bytes(&buf);
    theirs.verify()?;

    let shared_secret = secret.diffie_hellman(&EphemeralPublic::from(theirs.ephemeral));

    Ok(Handshake {
        remote: theirs.identity,
        shared_secret,
    })
}
