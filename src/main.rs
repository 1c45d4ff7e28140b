use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pastry::{ChannelDeliverer, Error, Keypair, Node, NodeConfig, QuicConfig, QuicTransport, DEFAULT_LEAFSET_CAPACITY, SEED_LEN};

#[derive(Parser, Debug)]
#[command(name = "pastry")]
#[command(author, version, about = "Pastry-style overlay node: routes stdin lines by BLAKE3 key", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short, long = "dial", value_name = "ADDR")]
    dial: Vec<SocketAddr>,

    /// 64 hex characters; a random identity is used if omitted.
    #[arg(short, long, value_name = "HEX")]
    seed: Option<String>,

    #[arg(short, long, default_value_t = DEFAULT_LEAFSET_CAPACITY)]
    leafset_capacity: usize,
}

fn keypair_from_seed(seed: Option<&str>) -> Result<Keypair> {
    let Some(seed) = seed else {
        return Ok(Keypair::generate());
    };
    let bytes = hex::decode(seed).context("invalid hex seed")?;
    let seed: [u8; SEED_LEN] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("seed must be {} hex characters ({} bytes)", SEED_LEN * 2, SEED_LEN))?;
    Ok(Keypair::from_secret_key_bytes(&seed))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = keypair_from_seed(args.seed.as_deref())?;
    let transport = Arc::new(QuicTransport::new(&keypair, QuicConfig::default())?);
    let (deliverer, mut delivered) = ChannelDeliverer::new(64);
    let config = NodeConfig {
        leafset_capacity: args.leafset_capacity,
        ..NodeConfig::default()
    };
    let node = Node::new(keypair, transport, config).with_deliverer(Arc::new(deliverer));
    info!("Node identity: {}", node.identity());

    let listener = node.listen(args.bind).await?;
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn({
        let node = node.clone();
        let shutdown = shutdown.clone();
        async move { node.serve_with_shutdown(listener, shutdown).await }
    });

    for addr in &args.dial {
        match node.dial_and_accept(*addr).await {
            Ok(identity) => info!("Joined {}/{}", addr, &identity.to_hex()[..16]),
            Err(e) => warn!(addr = %addr, error = %e, "dial failed"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(message) = delivered.recv() => {
                println!("{} {}", hex::encode(&message.key[..8]), String::from_utf8_lossy(&message.body));
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        let key = *blake3::hash(line.as_bytes()).as_bytes();
                        match node.route(key, Box::new(std::io::Cursor::new(line.into_bytes()))).await {
                            Ok(routed) => info!(key = %hex::encode(&key[..8]), ?routed, "routed"),
                            Err(e) => warn!(error = %e, "route failed"),
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    shutdown.cancel();
    match serving.await {
        Ok(Err(Error::Cancelled)) | Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "listener stopped with error"),
        Err(e) => warn!(error = %e, "listener task failed"),
    }
    if let Err(e) = node.close().await {
        warn!(error = %e, "failed to close leafset");
    }

    Ok(())
}
