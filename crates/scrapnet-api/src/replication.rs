//! Neighbor replication: keep every owned record mirrored on the two
//! adjacent nodes so a single node loss loses no data.
//!
//! The loop is best-effort and pull-free: each round it lists what a
//! neighbor already holds and pushes the difference. A scrape that lands
//! between the listing and the push is caught next round. Replication
//! never runs on the serving path.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use scrapnet_ring::node::NodeRef;
use scrapnet_ring::{between, hash_key, KeyId, RingNode};

use crate::config::ReplicationConfig;
use crate::error::{ApiError, ApiResult};
use crate::storage::ArtifactStore;
use crate::users::UserDirectory;

/// Background replicator for one node.
pub struct Replicator {
    ring: Arc<RingNode>,
    store: Arc<ArtifactStore>,
    users: Arc<UserDirectory>,
    client: reqwest::Client,
    http_port: u16,
    interval: Duration,
    stopping: Arc<AtomicBool>,
}

impl Replicator {
    /// Build a replicator; `stopping` is the node-wide shutdown flag.
    pub fn new(
        ring: Arc<RingNode>,
        store: Arc<ArtifactStore>,
        users: Arc<UserDirectory>,
        config: &ReplicationConfig,
        http_port: u16,
        stopping: Arc<AtomicBool>,
    ) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Internal(format!("replication client: {e}")))?;

        Ok(Self {
            ring,
            store,
            users,
            client,
            http_port,
            interval: config.interval,
            stopping,
        })
    }

    /// Spawn the periodic loop.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                if self.stopping.load(Ordering::SeqCst) {
                    break;
                }
                self.run_once().await;
            }
            debug!("Replication loop stopped");
        })
    }

    /// One replication round across both neighbors.
    pub async fn run_once(&self) {
        let neighbors = self.neighbors().await;
        if neighbors.is_empty() {
            return;
        }

        let pred = self.ring.predecessor().await;
        let pred2 = self.ring.second_predecessor().await;
        let self_id = self.ring.id();

        let owned_urls: Vec<String> = self
            .store
            .urls()
            .into_iter()
            .filter(|url| owned_key(hash_key(url), self_id, pred.as_ref(), pred2.as_ref()))
            .collect();

        let owned_users: Vec<(String, String)> = self
            .users
            .export()
            .into_iter()
            .filter(|(name, _)| owned_key(hash_key(name), self_id, pred.as_ref(), pred2.as_ref()))
            .collect();

        for neighbor in neighbors {
            if let Err(e) = self.sync_neighbor(&neighbor, &owned_urls, &owned_users).await {
                warn!(neighbor, error = %e, "Replication round failed for neighbor");
            }
        }
    }

    /// `{succ, pred} \ {self}`, deduplicated.
    async fn neighbors(&self) -> Vec<String> {
        let mut neighbors = Vec::new();
        let succ = self.ring.successor().await;
        if succ.id != self.ring.id() {
            neighbors.push(succ.ip.clone());
        }
        if let Some(pred) = self.ring.predecessor().await {
            if pred.id != self.ring.id() && pred.id != succ.id {
                neighbors.push(pred.ip);
            }
        }
        neighbors
    }

    async fn sync_neighbor(
        &self,
        neighbor: &str,
        owned_urls: &[String],
        owned_users: &[(String, String)],
    ) -> ApiResult<()> {
        let base = format!("http://{}:{}", neighbor, self.http_port);

        let theirs: HashSet<String> = self
            .client
            .get(format!("{base}/urls"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        for url in owned_urls.iter().filter(|url| !theirs.contains(*url)) {
            let Some(blob) = self.store.read(url)? else {
                warn!(url, "Indexed artifact missing on disk, skipping push");
                continue;
            };

            let part = multipart::Part::bytes(blob)
                .file_name(ArtifactStore::archive_name(url))
                .mime_str("application/octet-stream")?;
            let form = multipart::Form::new()
                .text("url", url.clone())
                .part("content", part);

            let response = self
                .client
                .post(format!("{base}/replicate"))
                .multipart(form)
                .send()
                .await?;

            if response.status().is_success() {
                debug!(url, neighbor, "Artifact replicated");
            } else {
                warn!(url, neighbor, status = %response.status(), "Replication push rejected");
            }
        }

        let their_users: HashSet<(String, String)> = self
            .client
            .get(format!("{base}/users"))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<(String, String)>>()
            .await?
            .into_iter()
            .collect();

        let missing: Vec<(String, String)> = owned_users
            .iter()
            .filter(|pair| !their_users.contains(*pair))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let pushed = missing.len();
            self.client
                .post(format!("{base}/replicate_users"))
                .json(&missing)
                .send()
                .await?
                .error_for_status()?;
            debug!(neighbor, pushed, "User records replicated");
        }

        Ok(())
    }
}

/// The owned set at replication time: the literal union of the
/// `(pred, self]` arc and the pre-staged `(pred2, pred]` arc, with missing
/// endpoints standing in as zero.
fn owned_key(
    key: KeyId,
    self_id: KeyId,
    pred: Option<&NodeRef>,
    pred2: Option<&NodeRef>,
) -> bool {
    let pred_id = pred.map_or(0, |p| p.id);
    let pred2_id = pred2.map_or(0, |p| p.id);
    between(key, pred_id, self_id) || between(key, pred2_id, pred_id)
}
