use std::sync::Arc;

use anyhow::Result;

use crate::identity::Identity;
use crate::transport::Connection;

/// An authenticated remote: the identity proven by the handshake plus the
/// connection it was proven on.
///
/// Cloning is cheap and shares the connection. Two peers are the *same member*
/// only if they share the connection (see [`Peer::same_connection`]); equal
/// identities on different connections are distinct joins.
#[derive(Clone)]
pub struct Peer {
    identity: Identity,
    connection: Arc<dyn Connection>,
}

impl Peer {
    pub fn new(identity: Identity, connection: Arc<dyn Connection>) -> Self {
        Self {
            identity,
            connection,
        }
    }

    #[inline]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// True if both handles refer to the same underlying connection.
    pub fn same_connection(&self, other: &Peer) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.connection), Arc::as_ptr(&other.connection))
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("identity", &self.identity)
            .field("remote_addr", &self.connection.remote_addr())
            .finish()
    }
}
