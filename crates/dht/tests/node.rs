//! End-to-end tests over real UDP sockets on localhost.

use std::time::Duration;

use kadmesh_dht::{Node, NodeConfig};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn start_node() -> Node {
    Node::start(NodeConfig::default().with_port(0))
        .await
        .expect("node starts on an ephemeral port")
}

async fn shutdown(nodes: impl IntoIterator<Item = &Node>) {
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn lookup_populates_routing_table() {
    init_tracing();

    let mut passive = Vec::new();
    for _ in 0..11 {
        passive.push(start_node().await);
    }

    let bootstrap = start_node().await;
    bootstrap
        .seed(passive.iter().map(|n| n.local_contact()))
        .await;

    let joining = start_node().await;
    joining.seed([bootstrap.local_contact()]).await;

    let found = joining
        .lookup(joining.id())
        .await
        .expect("lookup completes");
    assert!(!found.is_empty());

    // Everyone the bootstrap knew, plus the bootstrap itself.
    let mut count = 0;
    joining.walk(|_, _| count += 1).await;
    assert_eq!(count, passive.len() + 1);

    shutdown(&passive).await;
    shutdown([&bootstrap, &joining]).await;
}

#[tokio::test]
async fn bootstrap_fans_out_and_implicit_pings_propagate() {
    init_tracing();

    let node1 = start_node().await;
    let node2 = start_node().await;
    let node3 = start_node().await;
    let node4 = start_node().await;

    node2
        .seed([node3.local_contact(), node4.local_contact()])
        .await;

    let gateway = node1
        .bootstrap(node2.local_addr())
        .await
        .expect("bootstrap succeeds");
    assert_eq!(gateway.id, node2.id());

    // Give the implicit pings a moment to land.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(node1.kademlia().contact_count().await, 3);
    assert_eq!(node2.kademlia().contact_count().await, 3);
    // node3 and node4 only ever served node1's FIND_NODE; the implicit-ping
    // exchange on that request is how they learned exactly one contact.
    assert_eq!(node3.kademlia().contact_count().await, 1);
    assert_eq!(node4.kademlia().contact_count().await, 1);

    shutdown([&node1, &node2, &node3, &node4]).await;
}

#[tokio::test]
async fn store_and_resolve_roundtrip() {
    init_tracing();

    let node0 = start_node().await;
    let mut others = Vec::new();
    for _ in 0..9 {
        others.push(start_node().await);
    }
    node0.seed(others.iter().map(|n| n.local_contact())).await;

    let key = kadmesh_dht::NodeId::random();
    let value = "127.0.0.1:8000".parse().expect("valid socket address");

    let acked = node0.store(key, value).await.expect("store succeeds");
    assert_eq!(acked, 3);

    let resolved = node0.resolve(key).await.expect("resolve succeeds");
    assert_eq!(resolved, value);

    shutdown(&others).await;
    shutdown([&node0]).await;
}

#[tokio::test]
async fn sequential_pings_all_complete() {
    init_tracing();

    let node1 = start_node().await;
    let node2 = start_node().await;
    let target = node1.local_contact();

    let client = node2.client();
    for i in 0..10_000 {
        let mut response = client.ping(&target);
        response.read_timeout(Duration::from_secs(3));
        response
            .read()
            .await
            .unwrap_or_else(|e| panic!("ping {i} failed: {e}"));
    }

    shutdown([&node1, &node2]).await;
}
