//! Multi-node mesh tests over real loopback sockets.
//!
//! Every test spins up real nodes on ephemeral ports (TCP and UDP share
//! whatever port the OS hands out) and drives them through the public
//! API. Topologies are formed with explicit dials except for the
//! discovery test, which points a node's solicitation target at another
//! node's loopback address instead of the broadcast address.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use weft_node::{Error, Message, Node, NodeConfig, Payload};

/// Poll a condition until it holds or the deadline passes.
macro_rules! wait_until {
    ($secs:expr, $what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs($secs);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }};
}

async fn start(name: &str) -> (Arc<Node>, mpsc::Receiver<Message>) {
    start_with(name, |_| {}).await
}

async fn start_with(
    name: &str,
    tweak: impl FnOnce(&mut NodeConfig),
) -> (Arc<Node>, mpsc::Receiver<Message>) {
    let mut config = NodeConfig::new(name, 0, 0);
    config.msa_timeout = 1;
    config.ttl = 16;
    config.timeout = Duration::from_secs(2);
    tweak(&mut config);
    Node::create(config).await.expect("node should start")
}

fn addr(node: &Node) -> String {
    format!("127.0.0.1:{}", node.port())
}

fn has_edge(mesh: &weft_node::Mesh, a: &str, b: &str) -> bool {
    mesh.get(a).map_or(false, |ns| ns.iter().any(|n| n == b))
        && mesh.get(b).map_or(false, |ns| ns.iter().any(|n| n == a))
}

#[tokio::test]
async fn dial_forms_a_link_and_acks_round_trip() {
    let (a, _ra) = start("a").await;
    let (b, mut rb) = start("b").await;

    a.dial(addr(&b)).await.unwrap();
    wait_until!(5, "a-b edge", has_edge(&a.mesh().await, "a", "b"));
    wait_until!(5, "b-a edge", has_edge(&b.mesh().await, "a", "b"));

    a.send("b", b"ping".to_vec()).await.unwrap();
    let got = rb.recv().await.unwrap();
    assert_eq!(got.source, "a");
    assert_eq!(got.payload, Payload::Unicast(b"ping".to_vec()));

    // The link works both ways over the single stream.
    b.send("a", b"pong".to_vec()).await.unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn dialing_a_connected_peer_is_rejected() {
    let (a, _ra) = start("a").await;
    let (b, _rb) = start("b").await;

    a.dial(addr(&b)).await.unwrap();
    wait_until!(5, "a-b link", a.peer_names().await == vec!["b".to_string()]);

    let err = a.dial(addr(&b)).await.unwrap_err();
    assert!(matches!(err, Error::DuplicatePeer(name) if name == "b"));
    assert_eq!(a.peer_names().await, vec!["b".to_string()]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn simultaneous_dials_leave_exactly_one_link() {
    let (a, _ra) = start("a").await;
    let (b, _rb) = start("b").await;

    let (ra, rb) = tokio::join!(a.dial(addr(&b)), b.dial(addr(&a)));
    assert!(
        ra.is_ok() || rb.is_ok(),
        "at least one dial must survive the tie-break"
    );

    wait_until!(
        5,
        "a single surviving link",
        a.peer_names().await == vec!["b".to_string()]
            && b.peer_names().await == vec!["a".to_string()]
    );

    // Let any loser connection finish tearing down, then re-check that
    // nothing was deregistered by mistake.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.peer_names().await, vec!["b".to_string()]);
    assert_eq!(b.peer_names().await, vec!["a".to_string()]);

    wait_until!(5, "the surviving edge to gossip", {
        has_edge(&a.mesh().await, "a", "b") && has_edge(&b.mesh().await, "a", "b")
    });
    a.send("b", b"still up".to_vec()).await.unwrap();
    b.send("a", b"still up".to_vec()).await.unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn announcements_install_multi_hop_routes() {
    let (a, _ra) = start("a").await;
    let (b, _rb) = start("b").await;
    let (c, mut rc) = start("c").await;

    // Line topology: a - b - c, built from the middle.
    b.dial(addr(&a)).await.unwrap();
    b.dial(addr(&c)).await.unwrap();

    wait_until!(
        10,
        "a to learn a route to c through b",
        a.routes().await.get("c") == Some(&"b".to_string())
    );
    wait_until!(
        10,
        "c to learn a route to a through b",
        c.routes().await.get("a") == Some(&"b".to_string())
    );

    let mesh = a.mesh().await;
    assert!(has_edge(&mesh, "a", "b"));
    assert!(has_edge(&mesh, "b", "c"));
    assert!(!has_edge(&mesh, "a", "c"));

    // The effective network is symmetric wherever it is defined.
    for (node, neighbors) in &mesh {
        for n in neighbors {
            assert!(
                mesh[n].contains(node),
                "edge {}-{} not mirrored in {:?}",
                node,
                n,
                mesh
            );
        }
    }

    // Multi-hop unicast rides the installed route and acks back.
    a.send("c", b"across".to_vec()).await.unwrap();
    let got = rc.recv().await.unwrap();
    assert_eq!(got.source, "a");
    assert_eq!(got.payload, Payload::Unicast(b"across".to_vec()));

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn ttl_exhaustion_drops_the_message_and_times_out_the_ack() {
    let (a, _ra) = start_with("a", |c| c.ttl = 1).await;
    let (b, _rb) = start("b").await;
    let (c, mut rc) = start("c").await;
    let mut b_errors = b.take_errors().expect("error channel");

    b.dial(addr(&a)).await.unwrap();
    b.dial(addr(&c)).await.unwrap();
    wait_until!(
        10,
        "a to learn a route to c",
        a.routes().await.contains_key("c")
    );

    // One unit of budget covers the a-to-b hop only; b drops the forward.
    let err = a.send("c", b"too far".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::AckTimeout(_)));

    let dropped = tokio::time::timeout(Duration::from_secs(5), b_errors.recv())
        .await
        .expect("b should report the expired forward")
        .unwrap();
    assert!(matches!(dropped, Error::TtlExpired { source, .. } if source == "a"));

    assert!(rc.try_recv().is_err(), "c must never see the message");

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn peer_loss_withdraws_routes_and_edges() {
    let (a, _ra) = start("a").await;
    let (b, _rb) = start("b").await;
    let (c, _rc) = start("c").await;

    b.dial(addr(&a)).await.unwrap();
    b.dial(addr(&c)).await.unwrap();
    wait_until!(
        10,
        "full line convergence",
        a.routes().await.contains_key("c") && c.routes().await.contains_key("a")
    );

    b.shutdown().await;

    wait_until!(
        10,
        "a to withdraw everything beyond the dead link",
        {
            let routes = a.routes().await;
            let mesh = a.mesh().await;
            !routes.contains_key("c") && !routes.contains_key("b") && !mesh.contains_key("b")
        }
    );

    a.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_a_ring_exactly_once() {
    let (a, mut ra) = start("a").await;
    let (b, mut rb) = start("b").await;
    let (c, mut rc) = start("c").await;
    let (d, mut rd) = start("d").await;

    // Ring: a - b - c - d - a.
    a.dial(addr(&b)).await.unwrap();
    b.dial(addr(&c)).await.unwrap();
    c.dial(addr(&d)).await.unwrap();
    d.dial(addr(&a)).await.unwrap();

    for node in [&a, &b, &c, &d] {
        wait_until!(
            10,
            "every node to route to all four",
            node.routes().await.len() == 4
        );
    }

    a.broadcast(b"round the ring".to_vec()).await.unwrap();

    for receiver in [&mut rb, &mut rc, &mut rd] {
        let got = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("every other node hears the broadcast")
            .unwrap();
        assert_eq!(got.source, "a");
        assert_eq!(got.payload, Payload::Broadcast(b"round the ring".to_vec()));
    }

    // The flood loops back around the ring; dedup must eat the copies.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rb.try_recv().is_err(), "b heard the broadcast twice");
    assert!(rc.try_recv().is_err(), "c heard the broadcast twice");
    assert!(rd.try_recv().is_err(), "d heard the broadcast twice");
    assert!(ra.try_recv().is_err(), "a delivered its own broadcast");

    for node in [a, b, c, d] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn solicitations_convert_into_links() {
    let (b, _rb) = start("b").await;

    // Point a's solicitation target at b's discovery socket instead of
    // the broadcast address, then let the degree maintainer do the rest:
    // b dials the datagram's source address back.
    let b_addr: std::net::SocketAddr = addr(&b).parse().unwrap();
    let (a, _ra) = start_with("a", |c| {
        c.degree = 1;
        c.broadcast_addr = Some(b_addr);
    })
    .await;

    wait_until!(
        15,
        "the solicited dial to land",
        a.peer_names().await == vec!["b".to_string()]
            && b.peer_names().await == vec!["a".to_string()]
    );
    wait_until!(5, "the edge to gossip", has_edge(&a.mesh().await, "a", "b"));

    a.shutdown().await;
    b.shutdown().await;
}
