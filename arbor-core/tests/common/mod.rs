/*
    Shared helpers for the multi-node integration tests

    Nodes run in one process and are linked over in-memory duplex pipes,
    so topologies are exact and nothing touches the network.
*/

#![allow(dead_code)]

use std::time::Duration;

use arbor_core::core_switch::dist;
use arbor_core::crypto::{BoxPublicKey, NodeKeys};
use arbor_core::test_utils::{wait_until, TestConfigBuilder};
use arbor_core::{Conn, Node};

pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn start_node() -> Node {
    Node::start(TestConfigBuilder::new().build())
        .await
        .expect("node starts")
}

pub async fn start_node_with(builder: TestConfigBuilder) -> Node {
    Node::start(builder.build()).await.expect("node starts")
}

pub async fn start_node_with_keys(keys: NodeKeys) -> Node {
    Node::start_with_keys(TestConfigBuilder::new().build(), keys)
        .await
        .expect("node starts")
}

/// Link two nodes over an in-memory pipe and wait for both handshakes.
pub async fn link(a: &Node, b: &Node) {
    let (sa, sb) = tokio::io::duplex(256 * 1024);
    let (ra, rb) = tokio::join!(
        a.connect_stream(sa, format!("duplex:{}", b.address()), false),
        b.connect_stream(sb, format!("duplex:{}", a.address()), true),
    );
    ra.expect("link handshake (outbound side)");
    rb.expect("link handshake (inbound side)");
}

/// All nodes follow one root, and every non-root node sits one hop below
/// another node.
pub fn is_converged(nodes: &[Node]) -> bool {
    let infos: Vec<_> = nodes.iter().map(|n| n.self_info()).collect();
    let root = infos[0].root;
    if infos.iter().any(|i| i.root != root) {
        return false;
    }
    let roots = infos.iter().filter(|i| i.coords.is_empty()).count();
    if roots != 1 {
        return false;
    }
    for (idx, info) in infos.iter().enumerate() {
        if info.coords.is_empty() {
            continue;
        }
        let parent = &info.coords[..info.coords.len() - 1];
        let has_parent = infos.iter().any(|other| other.coords == parent);
        let unique = infos
            .iter()
            .enumerate()
            .all(|(j, other)| j == idx || other.coords != info.coords);
        if !has_parent || !unique {
            return false;
        }
    }
    true
}

pub async fn wait_converged(nodes: &[Node]) -> bool {
    wait_until(CONVERGE_TIMEOUT, move || async move { is_converged(nodes) }).await
}

/// Walk greedy next hops from `from` towards `to` using each node's view of
/// its peers. Returns the path, or None if a node had no strictly closer peer.
pub async fn greedy_path(nodes: &[Node], from: usize, to: usize) -> Option<Vec<usize>> {
    let dest = nodes[to].coords();
    let mut path = vec![from];
    let mut at = from;
    while at != to {
        let snapshot = nodes[at].switch_peers().await.ok()?;
        let here = dist(&snapshot.locator.coords, &dest);
        let next_coords = snapshot
            .peers
            .iter()
            .filter_map(|p| p.coords.clone())
            .filter(|c| dist(c, &dest) < here)
            .min_by_key(|c| dist(c, &dest))?;
        at = nodes.iter().position(|n| n.coords() == next_coords)?;
        path.push(at);
        if path.len() > nodes.len() {
            break;
        }
    }
    Some(path)
}

/// Dial until the search and handshake succeed.
pub async fn dial_with_retry(from: &Node, key: BoxPublicKey) -> Conn {
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        match from.dial_key(key).await {
            Ok(conn) => return conn,
            Err(e) if tokio::time::Instant::now() < deadline => {
                tracing::debug!(error = %e, "Dial failed, retrying");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => panic!("dial never succeeded: {}", e),
        }
    }
}

pub async fn shutdown_all(nodes: &[Node]) {
    futures::future::join_all(nodes.iter().map(|n| n.shutdown())).await;
}
