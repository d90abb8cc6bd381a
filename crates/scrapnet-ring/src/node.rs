//! Ring membership, key routing and the maintenance loops.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RingConfig;
use crate::error::{RingError, RingResult};
use crate::keyspace::{between, finger_start, hash_key, KeyId, M};
use crate::rpc::{self, Dialer, RingRequest, RingResponse};

/// Cap on successor-chain walks. Lookups terminate well before this on any
/// healthy ring; the cap only bounds walks across mid-churn inconsistency.
const MAX_LOOKUP_HOPS: usize = 128;

/// Reference to a node on the ring.
///
/// A plain value: the identifier (derived from the IP) and the IP itself.
/// Two refs are the same node iff their identifiers match. Connections are
/// the [`Dialer`]'s business, never stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRef {
    /// Position on the identifier ring
    pub id: KeyId,
    /// Address the node serves RPCs on
    pub ip: String,
}

impl NodeRef {
    /// Build a ref from an IP, deriving the ring identifier.
    #[must_use]
    pub fn new(ip: impl Into<String>) -> Self {
        let ip = ip.into();
        Self {
            id: hash_key(&ip),
            ip,
        }
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeRef {}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.ip, self.id)
    }
}

/// Predecessor pointers. `pred2` is only ever written together with `pred`,
/// under the same lock.
#[derive(Debug, Default)]
struct Predecessors {
    pred: Option<NodeRef>,
    pred2: Option<NodeRef>,
}

/// A member of the identifier ring.
///
/// Owns the ring pointers and the periodic maintenance that keeps them
/// converged. All remote calls go through the [`Dialer`]; pointer locks
/// are held only long enough to copy or swap a ref, never across a
/// remote call.
pub struct RingNode {
    this: NodeRef,
    config: RingConfig,
    dialer: Dialer,
    succ: Mutex<NodeRef>,
    preds: Mutex<Predecessors>,
    fingers: RwLock<Vec<NodeRef>>,
    next_finger: AtomicUsize,
    running: AtomicBool,
}

impl RingNode {
    /// Create a node for `ip`. The node starts out alone: its own successor,
    /// no predecessor, every finger pointing at itself.
    pub fn new(ip: impl Into<String>, config: RingConfig) -> RingResult<Self> {
        config.validate()?;

        let this = NodeRef::new(ip);
        let dialer = Dialer::new(config.rpc_port, config.rpc_timeout);
        let fingers = vec![this.clone(); M as usize];

        info!(node = %this, "Ring node created");

        Ok(Self {
            succ: Mutex::new(this.clone()),
            this,
            config,
            dialer,
            preds: Mutex::new(Predecessors::default()),
            fingers: RwLock::new(fingers),
            next_finger: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// This node's own ref.
    #[must_use]
    pub fn local(&self) -> &NodeRef {
        &self.this
    }

    /// This node's ring identifier.
    #[must_use]
    pub fn id(&self) -> KeyId {
        self.this.id
    }

    /// This node's IP.
    #[must_use]
    pub fn ip(&self) -> &str {
        &self.this.ip
    }

    /// The dialer this node uses for overlay calls.
    #[must_use]
    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    /// Whether the node is serving.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current successor.
    pub async fn successor(&self) -> NodeRef {
        self.succ.lock().await.clone()
    }

    /// Current predecessor, if known.
    pub async fn predecessor(&self) -> Option<NodeRef> {
        self.preds.lock().await.pred.clone()
    }

    /// Predecessor's predecessor, if known.
    pub async fn second_predecessor(&self) -> Option<NodeRef> {
        self.preds.lock().await.pred2.clone()
    }

    async fn set_successor(&self, node: NodeRef) {
        let mut succ = self.succ.lock().await;
        if *succ != node {
            info!(node = %self.this, succ = %node, "Successor updated");
            *succ = node;
        }
    }

    /// Snapshot of the node's ring pointers.
    pub async fn status(&self) -> RingStatus {
        let succ = self.successor().await;
        let preds = self.preds.lock().await;
        RingStatus {
            id: self.this.id,
            ip: self.this.ip.clone(),
            succ_id: succ.id,
            succ_ip: succ.ip,
            pred_id: preds.pred.as_ref().map(|p| p.id),
            pred2_id: preds.pred2.as_ref().map(|p| p.id),
        }
    }

    // ---- lookup ----------------------------------------------------------

    /// Find the node responsible for `id`.
    ///
    /// Never fails: when no finger qualifies or every candidate is dead, the
    /// successor is the answer and callers act idempotently on a temporarily
    /// wrong owner.
    pub async fn find_succ(&self, id: KeyId) -> NodeRef {
        if id == self.this.id {
            return self.this.clone();
        }

        let succ = self.successor().await;
        if between(id, self.this.id, succ.id) {
            return succ;
        }

        // Closest preceding live finger, scanned from the far end.
        let fingers: Vec<NodeRef> = self.fingers.read().await.clone();
        for finger in fingers.iter().rev() {
            if between(finger.id, self.this.id, id) && self.dialer.ping(&finger.ip).await {
                match self.dialer.find_succ(&finger.ip, id).await {
                    Ok(ip) => return NodeRef::new(ip),
                    Err(e) => {
                        debug!(node = %self.this, finger = %finger, error = %e,
                            "Finger lookup failed, trying next");
                    }
                }
            }
        }

        self.successor().await
    }

    /// Find the node whose successor owns `id`, by walking the successor
    /// chain. Used by failover to re-anchor a lost predecessor.
    pub async fn find_pred(&self, id: KeyId) -> NodeRef {
        let mut node = self.this.clone();
        let mut succ = self.successor().await;

        for _ in 0..MAX_LOOKUP_HOPS {
            if between(id, node.id, succ.id) {
                return node;
            }
            node = succ;
            succ = match self.dialer.get_succ(&node.ip).await {
                Ok(ip) => NodeRef::new(ip),
                Err(e) => {
                    debug!(node = %self.this, at = %node, error = %e,
                        "Successor walk interrupted");
                    return node;
                }
            };
        }

        warn!(node = %self.this, id, "Predecessor walk exceeded hop cap");
        node
    }

    /// Whether this node owns `key` under the successor rule.
    pub async fn owns(&self, key: KeyId) -> bool {
        self.find_succ(key).await.id == self.this.id
    }

    // ---- join and lifecycle ----------------------------------------------

    /// Bind the RPC listener, then spawn the accept loop and the
    /// maintenance tasks.
    pub async fn start(self: &Arc<Self>) -> RingResult<RingWorkers> {
        let listener =
            TcpListener::bind((self.this.ip.as_str(), self.config.rpc_port)).await?;
        self.running.store(true, Ordering::SeqCst);

        info!(node = %self.this, port = self.config.rpc_port, "Ring node serving RPCs");

        let handles = vec![
            tokio::spawn(rpc::serve(
                Arc::clone(self),
                listener,
                self.config.rpc_workers,
            )),
            self.spawn_stabilizer(),
            self.spawn_finger_fixer(),
            self.spawn_predecessor_checker(),
            self.spawn_status_logger(),
        ];

        Ok(RingWorkers { handles })
    }

    /// Join the ring through `contact`, or found a new ring when `contact`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the contact does not answer a ping; the node
    /// stays solo and keeps serving.
    pub async fn join(&self, contact: Option<&str>) -> RingResult<()> {
        let Some(contact_ip) = contact else {
            info!(node = %self.this, "No existing members found, founding a new ring");
            return Ok(());
        };

        let contact = NodeRef::new(contact_ip);
        if !self.dialer.ping(&contact.ip).await {
            return Err(RingError::PeerUnreachable {
                peer: contact.ip,
                reason: "join contact did not answer ping".into(),
            });
        }

        let succ = NodeRef::new(self.dialer.find_succ(&contact.ip, self.this.id).await?);
        self.set_successor(succ.clone()).await;
        info!(node = %self.this, succ = %succ, "Joined ring");

        // Second member joining a solo ring: wire both directions at once
        // instead of waiting for stabilization.
        if let Ok(succ_succ) = self.dialer.get_succ(&succ.ip).await {
            if NodeRef::new(succ_succ) == succ {
                {
                    let mut preds = self.preds.lock().await;
                    preds.pred = Some(succ.clone());
                    preds.pred2 = Some(self.this.clone());
                }
                if let Err(e) = self.dialer.not_alone(&succ.ip, &self.this.ip).await {
                    warn!(node = %self.this, peer = %succ, error = %e,
                        "NotAlone notification failed, stabilization will repair");
                }
            }
        }

        Ok(())
    }

    /// Stop serving. Maintenance loops exit at their next tick; the RPC
    /// accept loop is torn down by [`RingWorkers::shutdown`].
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // ---- RPC handler ------------------------------------------------------

    /// Dispatch one overlay request.
    pub async fn handle(&self, request: RingRequest) -> RingResponse {
        match request {
            RingRequest::FindSucc { id } => RingResponse::Ip {
                ip: self.find_succ(id).await.ip,
            },
            RingRequest::FindPred { id } => RingResponse::Ip {
                ip: self.find_pred(id).await.ip,
            },
            RingRequest::GetSucc => RingResponse::Ip {
                ip: self.successor().await.ip,
            },
            RingRequest::GetPred => RingResponse::OptionalIp {
                ip: self.predecessor().await.map(|p| p.ip),
            },
            RingRequest::UpdatePred { ip } => {
                self.handle_update_pred(ip).await;
                RingResponse::Empty
            }
            RingRequest::UpdateSucc { ip } => {
                self.set_successor(NodeRef::new(ip)).await;
                RingResponse::Empty
            }
            RingRequest::NotAlone { ip } => {
                self.handle_not_alone(ip).await;
                RingResponse::Empty
            }
            RingRequest::Ping => RingResponse::Status { ok: true },
        }
    }

    async fn handle_update_pred(&self, ip: String) {
        let caller = NodeRef::new(ip);
        if caller.id == self.this.id {
            return;
        }

        match self.predecessor().await {
            None => {
                // Fetch the caller's predecessor before taking the lock.
                let callers_pred = self
                    .dialer
                    .get_pred(&caller.ip)
                    .await
                    .ok()
                    .flatten()
                    .map(NodeRef::new);

                let mut preds = self.preds.lock().await;
                if preds.pred.is_none() {
                    info!(node = %self.this, pred = %caller, "Predecessor adopted");
                    preds.pred = Some(caller);
                    preds.pred2 = callers_pred;
                }
            }
            Some(current) => {
                if between(caller.id, current.id, self.this.id)
                    && self.dialer.ping(&caller.ip).await
                {
                    let mut preds = self.preds.lock().await;
                    info!(node = %self.this, pred = %caller, "Predecessor updated");
                    preds.pred2 = preds.pred.take();
                    preds.pred = Some(caller);
                }
            }
        }
    }

    async fn handle_not_alone(&self, ip: String) {
        let caller = NodeRef::new(ip);
        info!(node = %self.this, peer = %caller, "Second member joined");
        self.set_successor(caller.clone()).await;
        let mut preds = self.preds.lock().await;
        preds.pred = Some(caller);
        preds.pred2 = Some(self.this.clone());
    }

    // ---- maintenance ------------------------------------------------------

    /// One stabilization round.
    ///
    /// Adopt the successor's predecessor when it sits between us, then
    /// tell the successor about us and refresh `pred2`.
    pub async fn stabilize(&self) {
        let succ = self.successor().await;
        if succ.id == self.this.id || !self.dialer.ping(&succ.ip).await {
            return;
        }

        if let Ok(Some(ip)) = self.dialer.get_pred(&succ.ip).await {
            let x = NodeRef::new(ip);
            if between(x.id, self.this.id, succ.id) && x.id != succ.id {
                self.set_successor(x).await;
            }
        }

        let succ = self.successor().await;
        if let Err(e) = self.dialer.update_pred(&succ.ip, &self.this.ip).await {
            debug!(node = %self.this, succ = %succ, error = %e, "UpdatePred failed");
        }

        let pred = self.predecessor().await;
        if let Some(pred) = pred {
            if self.dialer.ping(&pred.ip).await {
                if let Ok(grand) = self.dialer.get_pred(&pred.ip).await {
                    let mut preds = self.preds.lock().await;
                    if preds.pred.as_ref() == Some(&pred) {
                        preds.pred2 = grand.map(NodeRef::new);
                    }
                }
            }
        }
    }

    /// Refresh the next finger table entry.
    pub async fn fix_next_finger(&self) {
        let next = (self.next_finger.load(Ordering::Relaxed) + 1) % M as usize;
        self.next_finger.store(next, Ordering::Relaxed);

        let target = finger_start(self.this.id, next as u32);
        let owner = self.find_succ(target).await;

        let mut fingers = self.fingers.write().await;
        if let Some(slot) = fingers.get_mut(next) {
            *slot = owner;
        }
    }

    /// One predecessor liveness check.
    ///
    /// A dead predecessor is replaced by `pred2` when that answers, else by
    /// re-anchoring through our own successor walk. A replacement equal to
    /// ourselves collapses the node back to solo state.
    pub async fn check_predecessor(&self) {
        let Some(pred) = self.predecessor().await else {
            return;
        };
        if self.dialer.ping(&pred.ip).await {
            return;
        }

        info!(node = %self.this, pred = %pred, "Predecessor stopped answering");

        let replacement = match self.second_predecessor().await {
            Some(p2) => {
                if self.dialer.ping(&p2.ip).await {
                    p2
                } else {
                    self.find_pred(p2.id).await
                }
            }
            None => {
                self.collapse_to_solo().await;
                return;
            }
        };

        if replacement.id == self.this.id {
            self.collapse_to_solo().await;
            return;
        }

        let grand = self
            .dialer
            .get_pred(&replacement.ip)
            .await
            .ok()
            .flatten()
            .map(NodeRef::new);

        {
            let mut preds = self.preds.lock().await;
            info!(node = %self.this, pred = %replacement, "Predecessor recovered");
            preds.pred = Some(replacement.clone());
            preds.pred2 = grand;
        }

        // Tell the new predecessor about us right away rather than waiting
        // out a full stabilization round.
        if let Err(e) = self
            .dialer
            .update_succ(&replacement.ip, &self.this.ip)
            .await
        {
            debug!(node = %self.this, pred = %replacement, error = %e, "UpdateSucc failed");
        }
    }

    async fn collapse_to_solo(&self) {
        info!(node = %self.this, "Last peer gone, continuing as lone member");
        self.set_successor(self.this.clone()).await;
        let mut preds = self.preds.lock().await;
        preds.pred = None;
        preds.pred2 = None;
    }

    fn spawn_stabilizer(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.stabilize_interval);
            loop {
                interval.tick().await;
                if !node.is_running() {
                    break;
                }
                node.stabilize().await;
            }
        })
    }

    fn spawn_finger_fixer(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.fix_fingers_interval);
            loop {
                interval.tick().await;
                if !node.is_running() {
                    break;
                }
                node.fix_next_finger().await;
            }
        })
    }

    fn spawn_predecessor_checker(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.check_predecessor_interval);
            loop {
                interval.tick().await;
                if !node.is_running() {
                    break;
                }
                node.check_predecessor().await;
            }
        })
    }

    fn spawn_status_logger(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.status_interval);
            loop {
                interval.tick().await;
                if !node.is_running() {
                    break;
                }
                let status = node.status().await;
                info!(
                    node = %node.this,
                    succ = status.succ_id,
                    pred = ?status.pred_id,
                    "Ring status"
                );
            }
        })
    }
}

/// Snapshot of a node's ring pointers, served on the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingStatus {
    /// Own identifier
    pub id: KeyId,
    /// Own IP
    pub ip: String,
    /// Successor identifier
    pub succ_id: KeyId,
    /// Successor IP
    pub succ_ip: String,
    /// Predecessor identifier, if known
    pub pred_id: Option<KeyId>,
    /// Second predecessor identifier, if known
    pub pred2_id: Option<KeyId>,
}

/// Handles for a started node's background tasks.
pub struct RingWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl RingWorkers {
    /// Abort every background task, including the RPC accept loop. Call
    /// [`RingNode::stop`] first so loops that are mid-iteration exit
    /// cooperatively.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_config() -> RingConfig {
        RingConfig::builder()
            .rpc_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    #[test]
    fn node_ref_equality_is_by_id() {
        let a = NodeRef::new("10.0.0.1");
        let b = NodeRef {
            id: a.id,
            ip: "elsewhere".into(),
        };
        assert_eq!(a, b);
        assert_ne!(a, NodeRef::new("10.0.0.2"));
    }

    #[tokio::test]
    async fn solo_node_owns_every_key() {
        let node = RingNode::new("127.0.0.1", quick_config()).unwrap();
        for key in [0u64, 1, 12345, u64::from(u32::MAX)] {
            assert_eq!(node.find_succ(key).await, *node.local());
            assert!(node.owns(key).await);
        }
    }

    #[tokio::test]
    async fn ping_request_answers_ok() {
        let node = RingNode::new("127.0.0.1", quick_config()).unwrap();
        let response = node.handle(RingRequest::Ping).await;
        assert!(matches!(response, RingResponse::Status { ok: true }));
    }

    #[tokio::test]
    async fn get_pred_is_empty_on_fresh_node() {
        let node = RingNode::new("127.0.0.1", quick_config()).unwrap();
        let response = node.handle(RingRequest::GetPred).await;
        assert!(matches!(response, RingResponse::OptionalIp { ip: None }));
    }

    #[tokio::test]
    async fn not_alone_wires_both_pointers() {
        let node = RingNode::new("127.0.0.1", quick_config()).unwrap();
        node.handle(RingRequest::NotAlone {
            ip: "127.0.0.2".into(),
        })
        .await;

        let peer = NodeRef::new("127.0.0.2");
        assert_eq!(node.successor().await, peer);
        assert_eq!(node.predecessor().await, Some(peer));
        assert_eq!(node.second_predecessor().await, Some(node.local().clone()));
    }

    #[tokio::test]
    async fn update_succ_is_unconditional() {
        let node = RingNode::new("127.0.0.1", quick_config()).unwrap();
        node.handle(RingRequest::UpdateSucc {
            ip: "127.0.0.9".into(),
        })
        .await;
        assert_eq!(node.successor().await, NodeRef::new("127.0.0.9"));
    }

    #[tokio::test]
    async fn update_pred_from_self_is_ignored() {
        let node = RingNode::new("127.0.0.1", quick_config()).unwrap();
        node.handle(RingRequest::UpdatePred {
            ip: "127.0.0.1".into(),
        })
        .await;
        assert_eq!(node.predecessor().await, None);
    }

    #[tokio::test]
    async fn join_with_unreachable_contact_fails_and_stays_solo() {
        let node = RingNode::new("127.0.0.1", quick_config()).unwrap();
        let result = node.join(Some("127.0.0.250")).await;
        assert!(result.is_err());
        assert_eq!(node.successor().await, *node.local());
    }

    #[tokio::test]
    async fn status_reflects_pointers() {
        let node = RingNode::new("127.0.0.1", quick_config()).unwrap();
        let status = node.status().await;
        assert_eq!(status.id, node.id());
        assert_eq!(status.succ_id, node.id());
        assert_eq!(status.pred_id, None);
    }
}
