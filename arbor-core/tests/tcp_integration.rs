/*
    TCP loopback tests

    Nodes listening on 127.0.0.1 with configured peers, as they run in
    production: persistent peers, allow-lists and a session over real sockets.
*/

mod common;

use arbor_core::test_utils::{test_config, wait_until, TestConfigBuilder, DEFAULT_TEST_TIMEOUT};
use arbor_core::Node;
use common::{dial_with_retry, shutdown_all, wait_converged, CONVERGE_TIMEOUT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_configured_peer_over_tcp() {
    let server = Node::start(test_config()).await.unwrap();
    let addr = server.listen("tcp://127.0.0.1:0").await.unwrap();

    let client = Node::start(
        TestConfigBuilder::new()
            .with_peer(format!("tcp://{}", addr))
            .build(),
    )
    .await
    .unwrap();

    let nodes = [server, client];
    assert!(wait_converged(&nodes).await, "tree did not converge");
    let [server, client] = &nodes;
    assert_eq!(server.active_links(), 1);

    let conn = dial_with_retry(client, server.box_key()).await;
    conn.write(b"over tcp").await.unwrap();
    let accepted = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, server.accept())
        .await
        .expect("accept in time")
        .unwrap();
    let got = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, accepted.read())
        .await
        .expect("read in time")
        .unwrap();
    assert_eq!(got, b"over tcp");

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_persistent_peer_reconnects() {
    let server = Node::start(test_config()).await.unwrap();
    let addr = server.listen("tcp://127.0.0.1:0").await.unwrap();
    let client = Node::start(
        TestConfigBuilder::new()
            .with_peer(format!("tcp://{}", addr))
            .build(),
    )
    .await
    .unwrap();

    let server_ref = &server;
    let up = wait_until(CONVERGE_TIMEOUT, move || async move {
        server_ref.peers().await.map(|p| p.len() == 1).unwrap_or(false)
    })
    .await;
    assert!(up);

    // drop the link from the server side; the client dials again
    let port = server.peers().await.unwrap()[0].port;
    server.remove_peer(port).await.unwrap();
    assert!(server.peers().await.unwrap().is_empty());

    let back = wait_until(CONVERGE_TIMEOUT, move || async move {
        server_ref.peers().await.map(|p| p.len() == 1).unwrap_or(false)
    })
    .await;
    assert!(back);
    assert_eq!(client.peers().await.unwrap().len(), 1);

    shutdown_all(&[server, client]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allow_list_rejects_unknown_keys() {
    let friend = arbor_core::test_utils::test_node_keys();
    let server = Node::start(
        TestConfigBuilder::new()
            .with_allowed_key(&friend.box_keys.public)
            .build(),
    )
    .await
    .unwrap();
    let addr = server.listen("tcp://127.0.0.1:0").await.unwrap();
    let uri = format!("tcp://{}", addr);

    // the server hangs up after reading the stranger's metadata
    let stranger = Node::start(test_config()).await.unwrap();
    let _ = stranger.connect(&uri).await;
    let stranger_ref = &stranger;
    let refused = wait_until(DEFAULT_TEST_TIMEOUT, move || async move {
        stranger_ref.peers().await.map(|p| p.is_empty()).unwrap_or(false)
    })
    .await;
    assert!(refused);
    assert!(server.peers().await.unwrap().is_empty());

    let friend = Node::start_with_keys(test_config(), friend).await.unwrap();
    friend.connect(&uri).await.unwrap();
    let server_ref = &server;
    let linked = wait_until(DEFAULT_TEST_TIMEOUT, move || async move {
        server_ref.peers().await.map(|p| p.len() == 1).unwrap_or(false)
    })
    .await;
    assert!(linked);

    shutdown_all(&[server, stranger, friend]).await;
}
