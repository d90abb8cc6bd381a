//! End-to-end replication between two live nodes.
//!
//! Both members run a real RPC listener and a real HTTP server on their own
//! loopback addresses; the replicator on one node must mirror its owned
//! records onto the other through the public replication endpoints.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use scrapnet_api::config::{HttpConfig, ReplicationConfig, ScrapeConfig};
use scrapnet_api::handlers::AppState;
use scrapnet_api::{build_server, ArtifactStore, JwtService, Replicator, Scraper, UserDirectory};
use scrapnet_ring::node::RingWorkers;
use scrapnet_ring::{RingConfig, RingNode};

const RPC_PORT: u16 = 42220;
const HTTP_PORT: u16 = 42221;
const SECRET: &[u8] = b"replication-test-secret-0123456789";

async fn live_node(tmp: &TempDir, ip: &str) -> (AppState, Arc<RingNode>, RingWorkers) {
    let ring_config = RingConfig::builder()
        .rpc_port(RPC_PORT)
        .rpc_timeout(Duration::from_millis(300))
        .maintenance_intervals(
            Duration::from_millis(200),
            Duration::from_millis(100),
            Duration::from_millis(150),
        )
        .build()
        .unwrap();

    let ring = Arc::new(RingNode::new(ip, ring_config).unwrap());
    let workers = ring.start().await.unwrap();

    let state = AppState {
        ring: Arc::clone(&ring),
        store: Arc::new(ArtifactStore::open(tmp.path(), ip).unwrap()),
        users: Arc::new(UserDirectory::new()),
        jwt: JwtService::new(SECRET, 10),
        scraper: Arc::new(Scraper::new(&ScrapeConfig::default()).unwrap()),
        scrape_lock: Arc::new(tokio::sync::Mutex::new(())),
        http_port: HTTP_PORT,
        shutting_down: Arc::new(AtomicBool::new(false)),
    };

    (state, ring, workers)
}

fn http_config(ip: &str) -> HttpConfig {
    HttpConfig {
        host: ip.to_string(),
        port: HTTP_PORT,
        workers: 1,
    }
}

#[actix_web::test]
async fn owned_records_reach_the_neighbor() {
    let tmp_a = TempDir::new().unwrap();
    let tmp_b = TempDir::new().unwrap();

    let (state_a, ring_a, workers_a) = live_node(&tmp_a, "127.0.25.1").await;
    let (state_b, ring_b, workers_b) = live_node(&tmp_b, "127.0.25.2").await;

    ring_a.join(None).await.unwrap();
    ring_b.join(Some(ring_a.ip())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(ring_a.successor().await, *ring_b.local());

    let server_a = build_server(state_a.clone(), &http_config("127.0.25.1")).unwrap();
    let server_b = build_server(state_b.clone(), &http_config("127.0.25.2")).unwrap();
    let handle_a = server_a.handle();
    let handle_b = server_b.handle();
    tokio::spawn(server_a);
    tokio::spawn(server_b);

    // Records living on A. In a two-ring the owned arcs cover the whole
    // keyspace, so everything A holds must reach B.
    state_a
        .store
        .insert("http://mirrored.example/", b"mirrored-zip-bytes")
        .unwrap();
    state_a.users.merge(vec![(
        "frank".to_string(),
        "$2b$04$somestoredhashsomestoredhash".to_string(),
    )]);

    let replication_config = ReplicationConfig {
        interval: Duration::from_secs(1),
        request_timeout: Duration::from_secs(2),
    };
    let replicator = Replicator::new(
        Arc::clone(&ring_a),
        Arc::clone(&state_a.store),
        Arc::clone(&state_a.users),
        &replication_config,
        HTTP_PORT,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    replicator.run_once().await;

    assert_eq!(
        state_b
            .store
            .read("http://mirrored.example/")
            .unwrap()
            .unwrap(),
        b"mirrored-zip-bytes"
    );
    assert!(state_b.users.contains("frank"));

    // A second round finds nothing missing and changes nothing.
    replicator.run_once().await;
    assert_eq!(state_b.store.len(), 1);
    assert_eq!(state_b.users.len(), 1);

    handle_a.stop(false).await;
    handle_b.stop(false).await;
    ring_a.stop();
    ring_b.stop();
    workers_a.shutdown();
    workers_b.shutdown();
}
