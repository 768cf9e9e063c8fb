//! Weft node daemon.
//!
//! A mesh overlay node configured from the environment. Received messages
//! and mesh errors are logged; applications embed [`weft_node::Node`]
//! directly instead.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weft_node::{Node, NodeConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env();
    tracing::info!(
        name = %config.name,
        port = config.port,
        degree = config.degree,
        "starting weft node"
    );

    let (node, mut receive) = Node::create(config).await?;

    // Optional static peers, comma separated host:port.
    if let Ok(peers) = std::env::var("WEFT_PEERS") {
        for addr in peers.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            if let Err(e) = node.dial(addr).await {
                tracing::warn!(%addr, error = %e, "bootstrap dial failed");
            }
        }
    }

    let mut errors = node.take_errors().expect("error channel already taken");

    loop {
        tokio::select! {
            Some(message) = receive.recv() => {
                tracing::info!(
                    source = %message.source,
                    command = message.payload.command(),
                    id = message.id,
                    "message delivered"
                );
            }
            Some(error) = errors.recv() => {
                tracing::warn!(%error, "mesh error");
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
