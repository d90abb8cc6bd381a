//! Multi-node ring tests.
//!
//! Every node binds its own 127.0.0.0/8 address so several members share
//! one process; maintenance intervals are shortened so convergence happens
//! in test time.

use std::sync::Arc;
use std::time::Duration;

use scrapnet_ring::node::RingWorkers;
use scrapnet_ring::{RingConfig, RingNode};

fn test_config(port: u16) -> RingConfig {
    RingConfig::builder()
        .rpc_port(port)
        .rpc_timeout(Duration::from_millis(300))
        .maintenance_intervals(
            Duration::from_millis(200),
            Duration::from_millis(100),
            Duration::from_millis(150),
        )
        .build()
        .unwrap()
}

async fn start_node(ip: &str, port: u16) -> (Arc<RingNode>, RingWorkers) {
    let node = Arc::new(RingNode::new(ip, test_config(port)).unwrap());
    let workers = node.start().await.unwrap();
    (node, workers)
}

async fn settle() {
    // A few stabilization rounds at the shortened intervals.
    tokio::time::sleep(Duration::from_millis(1500)).await;
}

#[tokio::test]
async fn two_node_join_wires_all_pointers() {
    let (a, wa) = start_node("127.0.21.1", 42101).await;
    a.join(None).await.unwrap();

    let (b, wb) = start_node("127.0.21.2", 42101).await;
    b.join(Some(a.ip())).await.unwrap();

    settle().await;

    assert_eq!(a.successor().await, *b.local());
    assert_eq!(a.predecessor().await, Some(b.local().clone()));
    assert_eq!(b.successor().await, *a.local());
    assert_eq!(b.predecessor().await, Some(a.local().clone()));

    // In a two-ring each node's second predecessor is itself.
    assert_eq!(a.second_predecessor().await, Some(a.local().clone()));
    assert_eq!(b.second_predecessor().await, Some(b.local().clone()));

    a.stop();
    b.stop();
    wa.shutdown();
    wb.shutdown();
}

#[tokio::test]
async fn three_node_ring_converges_and_routes() {
    let ips = ["127.0.22.1", "127.0.22.2", "127.0.22.3"];
    let mut nodes = Vec::new();
    let mut workers = Vec::new();

    for (i, ip) in ips.iter().enumerate() {
        let (node, w) = start_node(ip, 42111).await;
        let contact = if i == 0 { None } else { Some(ips[0]) };
        node.join(contact).await.unwrap();
        workers.push(w);
        nodes.push(node);
        settle().await;
    }

    // Successor pointers form a single cycle over all three members.
    let mut seen = vec![nodes[0].local().clone()];
    let mut current = nodes[0].successor().await;
    while current != *nodes[0].local() {
        assert!(seen.len() <= nodes.len(), "successor cycle does not close");
        seen.push(current.clone());
        let holder = nodes.iter().find(|n| *n.local() == current).unwrap();
        current = holder.successor().await;
    }
    assert_eq!(seen.len(), nodes.len());

    // v.succ.pred == v for every member.
    for node in &nodes {
        let succ = node.successor().await;
        let holder = nodes.iter().find(|n| *n.local() == succ).unwrap();
        assert_eq!(holder.predecessor().await, Some(node.local().clone()));
    }

    // find_succ agrees with the brute-force owner rule at every node.
    let mut ids: Vec<u64> = nodes.iter().map(|n| n.id()).collect();
    ids.sort_unstable();
    let oracle = |key: u64| -> u64 {
        *ids.iter().find(|&&id| id >= key).unwrap_or(&ids[0])
    };

    let mut sample_keys = vec![0, 1, u64::from(u32::MAX)];
    for &id in &ids {
        sample_keys.push(id);
        sample_keys.push(id.wrapping_add(1) % (1 << 32));
    }

    for key in sample_keys {
        let expected = oracle(key);
        for node in &nodes {
            assert_eq!(
                node.find_succ(key).await.id,
                expected,
                "wrong owner for key {key} asked at {}",
                node.local()
            );
        }
    }

    // find_pred returns the node whose successor owns the key.
    for &id in &ids {
        let owner = oracle(id);
        let asked = nodes[0].find_pred(id).await;
        let holder = nodes.iter().find(|n| *n.local() == asked).unwrap();
        assert_eq!(holder.successor().await.id, owner);
    }

    for node in &nodes {
        node.stop();
    }
    for w in workers {
        w.shutdown();
    }
}

#[tokio::test]
async fn predecessor_failure_promotes_pred2() {
    let ips = ["127.0.23.1", "127.0.23.2", "127.0.23.3"];
    let mut nodes = Vec::new();
    let mut workers = Vec::new();

    for (i, ip) in ips.iter().enumerate() {
        let (node, w) = start_node(ip, 42121).await;
        let contact = if i == 0 { None } else { Some(ips[0]) };
        node.join(contact).await.unwrap();
        workers.push(w);
        nodes.push(node);
        settle().await;
    }

    // Pick any member X, kill its predecessor P; R is the survivor.
    let x = Arc::clone(&nodes[0]);
    let p_ref = x.predecessor().await.expect("converged ring has a pred");
    let p_idx = nodes.iter().position(|n| *n.local() == p_ref).unwrap();
    let r_idx = (0..3).find(|&i| i != 0 && i != p_idx).unwrap();
    let r = Arc::clone(&nodes[r_idx]);

    let former_pred2 = x.second_predecessor().await.unwrap();
    assert_eq!(former_pred2, *r.local());

    nodes[p_idx].stop();
    workers.remove(p_idx).shutdown();

    // Within a couple of check-predecessor ticks the ring closes over P.
    tokio::time::sleep(Duration::from_millis(2000)).await;

    assert_eq!(x.predecessor().await, Some(r.local().clone()));
    assert_eq!(r.successor().await, *x.local());
    assert_eq!(x.successor().await, *r.local());
    assert_eq!(r.predecessor().await, Some(x.local().clone()));

    x.stop();
    r.stop();
    for w in workers {
        w.shutdown();
    }
}

#[tokio::test]
async fn survivor_of_two_ring_collapses_to_solo() {
    let (a, wa) = start_node("127.0.24.1", 42131).await;
    a.join(None).await.unwrap();

    let (b, wb) = start_node("127.0.24.2", 42131).await;
    b.join(Some(a.ip())).await.unwrap();

    settle().await;
    assert_eq!(a.successor().await, *b.local());

    b.stop();
    wb.shutdown();

    tokio::time::sleep(Duration::from_millis(1000)).await;

    assert_eq!(a.successor().await, *a.local());
    assert_eq!(a.predecessor().await, None);
    assert_eq!(a.second_predecessor().await, None);

    // A lone survivor still answers lookups for the whole space.
    assert!(a.owns(12345).await);

    a.stop();
    wa.shutdown();
}
