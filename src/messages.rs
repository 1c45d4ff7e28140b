//! # Routed Envelope Framing
//!
//! Every stream after the handshake carries exactly one routed message:
//!
//! ```text
//! [ routing key (32) | body (opaque, until the sender finishes the stream) ]
//! ```
//!
//! The key is read in full before any body byte is touched. The body length is
//! never encoded; end of stream is the only delimiter.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::{Identity, IDENTITY_LEN};

/// Length of a routing key. Keys live in the same space as identities.
pub const KEY_LEN: usize = IDENTITY_LEN;

/// A routing target in key space.
pub type Key = [u8; KEY_LEN];

/// Interpret a routing key as a position in identity space.
#[inline]
pub fn key_position(key: &Key) -> Identity {
    Identity::from_bytes(*key)
}

/// Read the fixed-length key prefix of an inbound routed stream.
pub async fn read_routing_key<R>(reader: &mut R) -> io::Result<Key>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut key = [0u8; KEY_LEN];
    reader.read_exact(&mut key).await?;
    Ok(key)
}

/// Write `key ‖ body` as the whole content of `writer` and finish it.
///
/// Returns the number of body bytes copied.
pub async fn write_envelope<W, B>(writer: &mut W, key: &Key, body: &mut B) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + Unpin + ?Sized,
{
    writer.write_all(key).await?;
    let copied = tokio::io::copy(body, writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}
