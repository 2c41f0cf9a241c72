//! Spins up a tiny local overlay: a gateway that knows a few peers and a
//! joining node that bootstraps through it, then prints the joiner's
//! routing table.
//!
//! Run with: `cargo run --example join`

use std::str::FromStr;

use kadmesh_dht::{Node, NodeConfig};
use tracing_subscriber::{EnvFilter, FmtSubscriber, filter::Directive};

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(
                    Directive::from_str("info").expect("valid default directive"),
                )
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("subscriber installs");

    let mut peers = Vec::new();
    for _ in 0..4 {
        let peer = Node::start(NodeConfig::default().with_port(0))
            .await
            .expect("peer starts");
        peers.push(peer);
    }

    let gateway = Node::start(NodeConfig::default().with_port(0))
        .await
        .expect("gateway starts");
    gateway.seed(peers.iter().map(|p| p.local_contact())).await;

    let joining = Node::start(NodeConfig::default().with_port(0))
        .await
        .expect("joining node starts");
    let contact = joining
        .bootstrap(gateway.local_addr())
        .await
        .expect("bootstrap against the gateway");
    tracing::info!(gateway = %contact, "Joined the overlay");

    joining
        .walk(|bucket, contact| {
            tracing::info!(bucket, contact = %contact, "Routing table entry");
        })
        .await;

    joining.shutdown().await;
    gateway.shutdown().await;
    for peer in &peers {
        peer.shutdown().await;
    }
}
