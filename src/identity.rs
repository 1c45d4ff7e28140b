//! # Identity
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as the node's address in key space
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key.** The public key is the only ordering key
//! used by the overlay: leafset sides are sorted by it, routing keys are compared
//! against it, and the handshake proves possession of its private half.
//!
//! Identities are ordered as big-endian unsigned integers, which is the same as
//! lexicographic byte order (`[u8; 32]`'s derived `Ord`).
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - A node's identity never changes after its `Keypair` is constructed.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Size of an identity (Ed25519 public key) in bytes.
pub const IDENTITY_LEN: usize = 32;

/// Size of an Ed25519 secret seed in bytes.
pub const SEED_LEN: usize = 32;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Deterministically derive a keypair from a 32-byte seed.
    pub fn from_secret_key_bytes(bytes: &[u8; SEED_LEN]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; SEED_LEN] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; IDENTITY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Check that this identity is usable as a signature verification key.
    ///
    /// Rejects the trivially invalid all-zero and all-0xFF values and anything
    /// that does not decode to an Ed25519 point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::from_bytes(&self.0).is_ok()
    }

    /// Short hex prefix for log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_generation_yields_valid_identity() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        assert!(identity.is_valid());
        assert_eq!(*identity.as_bytes(), keypair.public_key_bytes());
    }

    #[test]
    fn signature_verifies_under_identity_key() {
        let keypair = Keypair::generate();
        let message = b"ephemeral key bytes";
        let signature = keypair.sign(message);
        let key = VerifyingKey::from_bytes(keypair.identity().as_bytes()).unwrap();
        assert!(key.verify_strict(message, &signature).is_ok());
        assert!(key.verify_strict(b"something else", &signature).is_err());
    }

    #[test]
    fn seeded_keypair_is_deterministic() {
        let seed = [7u8; SEED_LEN];
        let a = Keypair::from_secret_key_bytes(&seed);
        let b = Keypair::from_secret_key_bytes(&seed);
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.secret_key_bytes(), seed);

        let other = Keypair::from_secret_key_bytes(&[8u8; SEED_LEN]);
        assert_ne!(a.identity(), other.identity());
    }

    #[test]
    fn identity_order_is_byte_order() {
        let mut low = [0u8; IDENTITY_LEN];
        let mut high = [0u8; IDENTITY_LEN];
        low[0] = 0x01;
        low[31] = 0xFF;
        high[0] = 0x02;
        assert!(Identity::from_bytes(low) < Identity::from_bytes(high));

        let mut tail = low;
        tail[31] = 0xFE;
        assert!(Identity::from_bytes(tail) < Identity::from_bytes(low));
    }

    #[test]
    fn hex_covers_full_key_and_short_is_prefix() {
        let identity = Keypair::generate().identity();
        let full = identity.to_hex();
        assert_eq!(full.len(), 2 * IDENTITY_LEN);
        assert_eq!(hex::decode(&full).unwrap(), identity.as_bytes());
        assert_eq!(identity.short(), full[..16]);
        assert_eq!(identity.to_string(), full);
    }

    #[test]
    fn trivial_identities_are_invalid() {
        assert!(!Identity::from_bytes([0u8; IDENTITY_LEN]).is_valid());
        assert!(!Identity::from_bytes([0xFF; IDENTITY_LEN]).is_valid());
    }

    #[test]
    fn debug_output_is_truncated() {
        let identity = Identity::from_bytes([0xAB; IDENTITY_LEN]);
        assert_eq!(format!("{:?}", identity), "Identity(abababababababab)");
        assert_eq!(identity.to_string().len(), 64);
    }
}
