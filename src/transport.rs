//! # Transport Capability
//!
//! The overlay core is transport-agnostic. It needs exactly four things:
//!
//! | Operation | Trait method |
//! |-----------|--------------|
//! | bind a listening address | [`Transport::listen`] |
//! | connect to an address | [`Transport::dial`] |
//! | accept a new inbound stream on a connection | [`Connection::accept_stream`] |
//! | open a new outbound stream on a connection | [`Connection::open_stream`] |
//!
//! Streams must be ordered, reliable, bidirectional byte channels. A sender
//! signals the end of its message by shutting down its write half.
//!
//! [`QuicTransport`] is the bundled implementation: one quinn endpoint per
//! transport, mutual TLS with self-signed Ed25519 certificates (`crate::crypto`),
//! one QUIC bidirectional stream per [`BiStream`].

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::crypto::{self, SERVER_NAME};
use crate::identity::{Identity, Keypair};

/// Read half of a stream.
pub type StreamReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a stream.
pub type StreamWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One bidirectional stream on a [`Connection`].
pub struct BiStream {
    pub send: StreamWriter,
    pub recv: StreamReader,
}

impl BiStream {
    pub fn new(
        send: impl AsyncWrite + Send + Unpin + 'static,
        recv: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            send: Box::new(send),
            recv: Box::new(recv),
        }
    }
}

impl std::fmt::Debug for BiStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiStream").finish_non_exhaustive()
    }
}

/// Listen/dial capability.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn listen(&self, addr: SocketAddr) -> Result<Arc<dyn Listener>>;

    async fn dial(&self, addr: SocketAddr) -> Result<Arc<dyn Connection>>;
}

/// A bound listening socket.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next established connection. Fails once the listener is closed.
    async fn accept(&self) -> Result<Arc<dyn Connection>>;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Stop accepting and wake a pending [`Listener::accept`].
    /// Established connections are left running.
    fn close(&self);
}

/// A multiplexed connection to one remote.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(&self) -> Result<BiStream>;

    async fn accept_stream(&self) -> Result<BiStream>;

    async fn close(&self) -> Result<()>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Key the transport itself authenticated for the remote, if it does so.
    fn transport_identity(&self) -> Option<Identity> {
        None
    }
}

// ============================================================================
// QUIC
// ============================================================================

/// Default idle timeout for QUIC connections.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default keep-alive interval; must stay below the idle timeout so quiet
/// leafset links are not dropped.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Default cap on concurrently open bidirectional streams per connection.
pub const DEFAULT_MAX_CONCURRENT_BIDI_STREAMS: u32 = 256;

#[derive(Clone, Debug)]
pub struct QuicConfig {
    pub idle_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub max_concurrent_bidi_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            max_concurrent_bidi_streams: DEFAULT_MAX_CONCURRENT_BIDI_STREAMS,
        }
    }
}

impl QuicConfig {
    fn transport_config(&self) -> Result<quinn::TransportConfig> {
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(
            self.idle_timeout
                .try_into()
                .context("idle timeout out of range")?,
        ));
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_concurrent_bidi_streams(self.max_concurrent_bidi_streams.into());
        transport.max_concurrent_uni_streams(0u32.into());
        Ok(transport)
    }
}

/// QUIC transport backed by a single quinn endpoint.
///
/// The endpoint is created by the first [`Transport::listen`] call, or by the
/// first [`Transport::dial`] if the transport never listens. Dials reuse the
/// listening endpoint so remote nodes see a stable source address. A transport
/// listens at most once; a second [`Transport::listen`] fails.
pub struct QuicTransport {
    server_config: ServerConfig,
    client_config: ClientConfig,
    endpoint: Mutex<EndpointSlot>,
}

#[derive(Default)]
struct EndpointSlot {
    endpoint: Option<Endpoint>,
    listening: bool,
}

impl QuicTransport {
    pub fn new(keypair: &Keypair, config: QuicConfig) -> Result<Self> {
        let transport = Arc::new(config.transport_config()?);
        let server_config = crypto::create_server_config(keypair, transport.clone())?;
        let client_config = crypto::create_client_config(keypair, transport)?;
        Ok(Self {
            server_config,
            client_config,
            endpoint: Mutex::new(EndpointSlot::default()),
        })
    }

    fn current_endpoint(&self) -> Option<Endpoint> {
        self.endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .endpoint
            .clone()
    }

    fn client_endpoint(&self, remote: SocketAddr) -> Result<Endpoint> {
        let mut slot = self
            .endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(endpoint) = slot.endpoint.as_ref() {
            return Ok(endpoint.clone());
        }
        let bind: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind).context("failed to bind client endpoint")?;
        endpoint.set_default_client_config(self.client_config.clone());
        slot.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn listen(&self, addr: SocketAddr) -> Result<Arc<dyn Listener>> {
        let endpoint = {
            let mut slot = self
                .endpoint
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.listening {
                anyhow::bail!("transport is already listening");
            }
            let mut endpoint = Endpoint::server(self.server_config.clone(), addr)
                .with_context(|| format!("failed to bind QUIC endpoint on {}", addr))?;
            endpoint.set_default_client_config(self.client_config.clone());
            slot.endpoint = Some(endpoint.clone());
            slot.listening = true;
            endpoint
        };
        debug!(addr = %endpoint.local_addr()?, "QUIC listener bound");
        Ok(Arc::new(QuicListener {
            endpoint,
            closed: CancellationToken::new(),
        }))
    }

    async fn dial(&self, addr: SocketAddr) -> Result<Arc<dyn Connection>> {
        let endpoint = match self.current_endpoint() {
            Some(endpoint) => endpoint,
            None => self.client_endpoint(addr)?,
        };
        let connection = endpoint
            .connect_with(self.client_config.clone(), addr, SERVER_NAME)
            .with_context(|| format!("failed to initiate connection to {}", addr))?
            .await
            .with_context(|| format!("failed to establish connection to {}", addr))?;
        debug!(addr = %addr, "QUIC connection established");
        Ok(Arc::new(QuicConnection { connection }))
    }
}

struct QuicListener {
    endpoint: Endpoint,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        loop {
            let incoming = tokio::select! {
                _ = self.closed.cancelled() => anyhow::bail!("listener closed"),
                incoming = self.endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                anyhow::bail!("endpoint closed");
            };
            let remote = incoming.remote_address();
            match incoming.await {
                Ok(connection) => return Ok(Arc::new(QuicConnection { connection })),
                Err(e) => {
                    // One failed TLS handshake must not stop the listener.
                    debug!(remote = %remote, error = %e, "incoming QUIC connection failed");
                }
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("failed to get local address")
    }

    fn close(&self) {
        self.endpoint.set_server_config(None);
        self.closed.cancel();
    }
}

struct QuicConnection {
    connection: quinn::Connection,
}

#[async_trait]
impl Connection for QuicConnection {
    async fn open_stream(&self) -> Result<BiStream> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .context("failed to open bidirectional stream")?;
        Ok(BiStream::new(send, recv))
    }

    async fn accept_stream(&self) -> Result<BiStream> {
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .context("failed to accept bidirectional stream")?;
        trace!(remote = %self.connection.remote_address(), "accepted stream");
        Ok(BiStream::new(send, recv))
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(0u32.into(), b"close");
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.connection.remote_address())
    }

    fn transport_identity(&self) -> Option<Identity> {
        crypto::extract_verified_identity(&self.connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{timeout, Duration};

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn default_config_keeps_alive_within_idle_timeout() {
        let config = QuicConfig::default();
        assert!(config.keep_alive_interval < config.idle_timeout);
        assert!(config.max_concurrent_bidi_streams > 0);
        assert!(config.transport_config().is_ok());
    }

    #[tokio::test]
    async fn dial_exchanges_stream_and_reports_certificate_identity() {
        let server_keys = Keypair::generate();
        let client_keys = Keypair::generate();
        let server = QuicTransport::new(&server_keys, QuicConfig::default()).unwrap();
        let client = QuicTransport::new(&client_keys, QuicConfig::default()).unwrap();

        let listener = server.listen(loopback()).await.expect("listen");
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn({
            let listener = listener.clone();
            async move {
                let conn = listener.accept().await.expect("accept");
                let mut stream = conn.accept_stream().await.expect("accept stream");
                let mut buf = Vec::new();
                stream.recv.read_to_end(&mut buf).await.expect("read");
                (conn.transport_identity(), buf)
            }
        });

        let conn = timeout(TEST_TIMEOUT, client.dial(addr))
            .await
            .expect("dial timed out")
            .expect("dial");
        assert_eq!(conn.transport_identity(), Some(server_keys.identity()));

        let mut stream = conn.open_stream().await.expect("open stream");
        stream.send.write_all(b"hello overlay").await.unwrap();
        stream.send.shutdown().await.unwrap();

        let (seen_identity, body) = timeout(TEST_TIMEOUT, accept)
            .await
            .expect("accept timed out")
            .unwrap();
        assert_eq!(seen_identity, Some(client_keys.identity()));
        assert_eq!(body, b"hello overlay");
    }

    #[tokio::test]
    async fn closing_listener_wakes_pending_accept() {
        let keys = Keypair::generate();
        let transport = QuicTransport::new(&keys, QuicConfig::default()).unwrap();
        let listener = transport.listen(loopback()).await.expect("listen");

        let pending = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await.is_err() }
        });
        tokio::task::yield_now().await;
        listener.close();

        let failed = timeout(TEST_TIMEOUT, pending)
            .await
            .expect("accept was not woken")
            .unwrap();
        assert!(failed);
    }

    #[tokio::test]
    async fn second_listen_is_refused_and_first_keeps_serving() {
        let server_keys = Keypair::generate();
        let server = QuicTransport::new(&server_keys, QuicConfig::default()).unwrap();
        let client = QuicTransport::new(&Keypair::generate(), QuicConfig::default()).unwrap();

        let listener = server.listen(loopback()).await.expect("listen");
        let addr = listener.local_addr().unwrap();
        assert!(server.listen(loopback()).await.is_err());

        let accept = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await.is_ok() }
        });
        let conn = timeout(TEST_TIMEOUT, client.dial(addr))
            .await
            .expect("dial timed out")
            .expect("dial");
        assert_eq!(conn.transport_identity(), Some(server_keys.identity()));
        assert!(timeout(TEST_TIMEOUT, accept).await.expect("accept timed out").unwrap());
    }
}
