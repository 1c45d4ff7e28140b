//! Integration tests for the Node public API over the QUIC transport.
//!
//! Every node binds `127.0.0.1:0`, so tests can run in parallel.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pastry::{
    Body, ChannelDeliverer, Delivered, Error, Forwarder, Identity, Key, Keypair, Node, NodeConfig,
    QuicConfig, QuicTransport, Routed,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingForwarder {
    hops: Mutex<Vec<Identity>>,
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(&self, next_hop: Identity, _key: &Key, _body: &mut Body) -> anyhow::Result<()> {
        self.hops.lock().unwrap().push(next_hop);
        Ok(())
    }
}

struct TestNode {
    node: Node,
    addr: SocketAddr,
    shutdown: CancellationToken,
    serving: JoinHandle<pastry::Result<()>>,
    delivered: mpsc::Receiver<Delivered>,
    forwarder: Arc<RecordingForwarder>,
}

async fn start(keypair: Keypair) -> TestNode {
    let transport = Arc::new(QuicTransport::new(&keypair, QuicConfig::default()).expect("transport"));
    let (deliverer, delivered) = ChannelDeliverer::new(16);
    let forwarder = Arc::new(RecordingForwarder::default());
    let node = Node::new(keypair, transport, NodeConfig::default())
        .with_deliverer(Arc::new(deliverer))
        .with_forwarder(forwarder.clone());

    let listener = node
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn({
        let node = node.clone();
        let shutdown = shutdown.clone();
        async move { node.serve_with_shutdown(listener, shutdown).await }
    });

    TestNode {
        node,
        addr,
        shutdown,
        serving,
        delivered,
        forwarder,
    }
}

async fn wait_until_member(node: &Node, identity: Identity) {
    timeout(TEST_TIMEOUT, async {
        while !node.leafset().await.unwrap().contains(&identity) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer never joined leafset");
}

async fn wait_until_empty(node: &Node) {
    timeout(TEST_TIMEOUT, async {
        while !node.leafset().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("leafset never emptied");
}

fn sorted_keypairs(n: usize) -> Vec<Keypair> {
    let mut keypairs: Vec<Keypair> = (0..n).map(|_| Keypair::generate()).collect();
    keypairs.sort_by_key(|k| k.identity());
    keypairs
}

#[tokio::test]
async fn node_exposes_its_identity() {
    let seed = [9u8; 32];
    let test = start(Keypair::from_secret_key_bytes(&seed)).await;

    let expected = Keypair::from_secret_key_bytes(&seed).identity();
    assert_eq!(test.node.identity(), expected);
    assert_eq!(test.node.public_key(), *expected.as_bytes());
    assert!(test.addr.port() > 0);
    assert!(test.node.leafset().await.unwrap().is_empty());
}

#[tokio::test]
async fn dial_admits_peer_on_both_sides() {
    let a = start(Keypair::generate()).await;
    let b = start(Keypair::generate()).await;

    let joined = timeout(TEST_TIMEOUT, a.node.dial_and_accept(b.addr))
        .await
        .expect("dial timed out")
        .expect("dial failed");
    assert_eq!(joined, b.node.identity());

    assert!(a.node.leafset().await.unwrap().contains(&b.node.identity()));
    wait_until_member(&b.node, a.node.identity()).await;
}

#[tokio::test]
async fn routed_message_reaches_closest_node() {
    let a = start(Keypair::generate()).await;
    let mut b = start(Keypair::generate()).await;
    a.node.dial_and_accept(b.addr).await.expect("dial failed");

    let key = b.node.public_key();
    let routed = a
        .node
        .route(key, Box::new(&b"hello over quic"[..]))
        .await
        .expect("route failed");
    assert_eq!(routed, Routed::Forwarded(b.node.identity()));
    assert_eq!(*a.forwarder.hops.lock().unwrap(), vec![b.node.identity()]);

    let message = timeout(TEST_TIMEOUT, b.delivered.recv())
        .await
        .expect("delivery timed out")
        .expect("deliverer closed");
    assert_eq!(message.key, key);
    assert_eq!(message.body, b"hello over quic");
    assert!(b.forwarder.hops.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unconnected_node_delivers_locally() {
    let mut a = start(Keypair::generate()).await;

    let routed = a.node.route([0xAB; 32], Box::new(&b"self"[..])).await.unwrap();
    assert_eq!(routed, Routed::Delivered);
    let message = a.delivered.recv().await.unwrap();
    assert_eq!(message.body, b"self");
    assert!(a.forwarder.hops.lock().unwrap().is_empty());
}

#[tokio::test]
async fn message_crosses_two_hops() {
    let mut keypairs = sorted_keypairs(3).into_iter();
    let lo = start(keypairs.next().unwrap()).await;
    let mid = start(keypairs.next().unwrap()).await;
    let mut hi = start(keypairs.next().unwrap()).await;

    lo.node.dial_and_accept(mid.addr).await.expect("lo -> mid");
    mid.node.dial_and_accept(hi.addr).await.expect("mid -> hi");
    wait_until_member(&hi.node, mid.node.identity()).await;

    let key = hi.node.public_key();
    let routed = lo.node.route(key, Box::new(&b"two hops"[..])).await.unwrap();
    assert_eq!(routed, Routed::Forwarded(mid.node.identity()));

    let message = timeout(TEST_TIMEOUT, hi.delivered.recv())
        .await
        .expect("delivery timed out")
        .unwrap();
    assert_eq!(message.body, b"two hops");
    assert_eq!(*lo.forwarder.hops.lock().unwrap(), vec![mid.node.identity()]);
    assert_eq!(*mid.forwarder.hops.lock().unwrap(), vec![hi.node.identity()]);
}

#[tokio::test]
async fn cancelling_shutdown_stops_listener() {
    let a = start(Keypair::generate()).await;
    let b = start(Keypair::generate()).await;
    a.node.dial_and_accept(b.addr).await.expect("dial failed");

    b.shutdown.cancel();
    let result = timeout(TEST_TIMEOUT, b.serving)
        .await
        .expect("listener did not stop")
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    // Established peers survive the listener.
    wait_until_member(&b.node, a.node.identity()).await;

    let c = start(Keypair::generate()).await;
    let refused = timeout(TEST_TIMEOUT, c.node.dial_and_accept(b.addr)).await;
    assert!(!matches!(refused, Ok(Ok(_))));
}

#[tokio::test]
async fn listen_and_serve_returns_cancelled() {
    let keypair = Keypair::generate();
    let transport = Arc::new(QuicTransport::new(&keypair, QuicConfig::default()).unwrap());
    let node = Node::new(keypair, transport, NodeConfig::default());
    let shutdown = CancellationToken::new();

    let serving = tokio::spawn({
        let node = node.clone();
        let shutdown = shutdown.clone();
        async move { node.listen_and_serve(shutdown, "127.0.0.1:0".parse().unwrap()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let result = timeout(TEST_TIMEOUT, serving).await.expect("did not stop").unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn close_tears_down_peers_on_both_sides() {
    let a = start(Keypair::generate()).await;
    let b = start(Keypair::generate()).await;
    a.node.dial_and_accept(b.addr).await.expect("dial failed");
    wait_until_member(&b.node, a.node.identity()).await;

    a.node.close().await.expect("close failed");
    assert!(a.node.leafset().await.unwrap().is_empty());
    wait_until_empty(&b.node).await;
}

#[tokio::test]
async fn dialing_self_is_rejected() {
    let a = start(Keypair::generate()).await;
    let result = timeout(TEST_TIMEOUT, a.node.dial_and_accept(a.addr))
        .await
        .expect("self dial timed out");
    // Both ends run in this process; whichever rejects first closes the
    // connection, so the dialer may see the close before the remote message.
    assert!(matches!(
        result,
        Err(Error::PeerRejected(id)) if id == a.node.identity()
    ) || matches!(result, Err(Error::HandshakeIo(_))));
    assert!(a.node.leafset().await.unwrap().is_empty());
}
