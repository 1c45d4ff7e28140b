//! Pluggable capabilities consumed by the routing core.
//!
//! | Capability | Trait | Invoked when |
//! |------------|-------|--------------|
//! | Delivery | [`Deliverer`] | this node is the closest node to the key |
//! | Forward observation | [`Forwarder`] | a message is about to leave toward a next hop |
//!
//! Both are optional. Without a deliverer, messages that arrive at their
//! destination are dropped; without a forwarder, forwarding is unobserved.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::identity::Identity;
use crate::messages::Key;

/// Opaque message body, read until end of stream.
pub type Body = Box<dyn AsyncRead + Send + Unpin>;

/// Receives messages for which this node is the destination.
#[async_trait]
pub trait Deliverer: Send + Sync + 'static {
    async fn deliver(&self, key: Key, body: Body) -> Result<()>;
}

/// Observes, and may veto, a message before it is forwarded.
///
/// The body is lent mutably so an implementation can wrap or inspect it, but
/// any bytes it consumes are not forwarded. Returning an error aborts the
/// forward.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward(&self, next_hop: Identity, key: &Key, body: &mut Body) -> Result<()>;
}

/// Largest body [`ChannelDeliverer`] will buffer.
pub const MAX_DELIVERED_BODY: u64 = 1024 * 1024;

/// A message delivered to this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub key: Key,
    pub body: Vec<u8>,
}

/// [`Deliverer`] that buffers each body and hands it to an mpsc channel.
#[derive(Clone)]
pub struct ChannelDeliverer {
    tx: mpsc::Sender<Delivered>,
}

impl ChannelDeliverer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivered>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Deliverer for ChannelDeliverer {
    async fn deliver(&self, key: Key, body: Body) -> Result<()> {
        let mut buf = Vec::new();
        body.take(MAX_DELIVERED_BODY + 1)
            .read_to_end(&mut buf)
            .await
            .context("failed to read delivered body")?;
        if buf.len() as u64 > MAX_DELIVERED_BODY {
            anyhow::bail!("delivered body exceeds {} bytes", MAX_DELIVERED_BODY);
        }
        self.tx
            .send(Delivered { key, body: buf })
            .await
            .context("delivery receiver dropped")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_deliverer_forwards_key_and_body() {
        let (deliverer, mut rx) = ChannelDeliverer::new(4);
        let body: Body = Box::new(&b"hello"[..]);
        deliverer.deliver([7u8; 32], body).await.unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.key, [7u8; 32]);
        assert_eq!(delivered.body, b"hello");
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let (deliverer, mut rx) = ChannelDeliverer::new(4);
        let big = vec![0u8; MAX_DELIVERED_BODY as usize + 1];
        let body: Body = Box::new(std::io::Cursor::new(big));
        assert!(deliverer.deliver([0u8; 32], body).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_is_an_error() {
        let (deliverer, rx) = ChannelDeliverer::new(1);
        drop(rx);
        let body: Body = Box::new(tokio::io::empty());
        assert!(deliverer.deliver([0u8; 32], body).await.is_err());
    }
}
