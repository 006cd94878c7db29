use crate::config::{majority_size, Peer, RaftConfig, QuorumMode};
use crate::error::{ConsensusError, ConsensusErrorCode};
use crate::log_cache::{LogAppendCallback, LogCache};
use crate::opid::OpId;
use crate::routing::RoutingTable;
use crate::rpc::{ConsensusRequest, ConsensusResponse, ReplicateMsg};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Last known status of an exchange with a tracked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// No round of communication yet.
    New,
    /// The last update was transmitted and accepted.
    Ok,
    /// A remote consensus-level error outside the other buckets.
    RemoteError,
    /// Network error or timeout at the RPC layer.
    RpcLayerError,
    /// The remote replica reported itself failed.
    ReplicaFailed,
    /// The remote does not host this replica.
    ReplicaNotFound,
    /// The remote saw a higher term than ours.
    InvalidTerm,
    /// The remote could not prepare any operation from the last batch.
    CannotPrepare,
    /// The remote's log diverged from ours.
    LmpMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    Unknown,
    Healthy,
    Failed,
}

/// Leader-side view of one peer's replication progress.
#[derive(Debug, Clone)]
pub struct TrackedPeer {
    pub peer: Peer,
    /// Next index to send; "nextIndex" in Raft.
    pub next_index: i64,
    /// Last op this peer acked from the current leader; drives
    /// watermark movement.
    pub last_received: OpId,
    pub last_known_committed_index: i64,
    pub last_exchange_status: PeerStatus,
    pub last_communication_time: Instant,
    pub wal_catchup_possible: bool,
    pub last_overall_health: PeerHealth,
    promotion_requested: bool,
    last_seen_term: i64,
}

impl TrackedPeer {
    fn new(peer: Peer, next_index: i64) -> Self {
        Self {
            peer,
            next_index,
            last_received: OpId::MIN,
            last_known_committed_index: 0,
            last_exchange_status: PeerStatus::New,
            last_communication_time: Instant::now(),
            wal_catchup_possible: true,
            last_overall_health: PeerHealth::Unknown,
            promotion_requested: false,
            last_seen_term: 0,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.peer.uuid
    }

    /// Terms reported by one peer may never go backwards.
    fn check_monotonic_terms(&mut self, term: i64) {
        assert!(
            term >= self.last_seen_term,
            "peer {} term went backwards: {} -> {}",
            self.peer.uuid,
            self.last_seen_term,
            term
        );
        self.last_seen_term = term;
    }
}

/// Context propagated through a leadership transfer hand-off.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub original_leader_uuid: String,
    pub is_origin_dead_promotion: bool,
}

/// The interface between the queue and the consensus core.
pub trait QueueObserver: Send + Sync {
    fn notify_commit_index(&self, committed_index: i64);
    fn notify_term_change(&self, term: i64);
    fn notify_failed_follower(&self, uuid: &str, term: i64, reason: &str);
    fn notify_peer_to_promote(&self, uuid: &str);
    fn notify_peer_to_start_election(&self, uuid: &str, transfer: Option<TransferContext>);
    fn notify_peer_health_change(&self);
}

pub type SuccessorFilter = Arc<dyn Fn(&Peer) -> bool + Send + Sync>;

enum Notification {
    CommitIndex(i64),
    TermChange(i64),
    FailedFollower { uuid: String, term: i64, reason: String },
    PeerToPromote(String),
    PeerToStartElection(String, Option<TransferContext>),
    PeerHealthChange,
}

/// Delivers observer notifications on a dedicated thread so the queue
/// lock is never held across observer code.
struct ObserverDispatcher {
    tx: Mutex<Option<mpsc::Sender<Notification>>>,
    observers: Arc<Mutex<Vec<Weak<dyn QueueObserver>>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ObserverDispatcher {
    fn new() -> Self {
        let observers: Arc<Mutex<Vec<Weak<dyn QueueObserver>>>> = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel::<Notification>();
        let worker_observers = Arc::clone(&observers);
        let worker = thread::Builder::new()
            .name("raft-queue-observers".into())
            .spawn(move || {
                while let Ok(notification) = rx.recv() {
                    let targets: Vec<Arc<dyn QueueObserver>> = worker_observers
                        .lock()
                        .iter()
                        .filter_map(Weak::upgrade)
                        .collect();
                    for observer in targets {
                        match &notification {
                            Notification::CommitIndex(index) => observer.notify_commit_index(*index),
                            Notification::TermChange(term) => observer.notify_term_change(*term),
                            Notification::FailedFollower { uuid, term, reason } => {
                                observer.notify_failed_follower(uuid, *term, reason)
                            }
                            Notification::PeerToPromote(uuid) => {
                                observer.notify_peer_to_promote(uuid)
                            }
                            Notification::PeerToStartElection(uuid, transfer) => {
                                observer.notify_peer_to_start_election(uuid, transfer.clone())
                            }
                            Notification::PeerHealthChange => observer.notify_peer_health_change(),
                        }
                    }
                }
            })
            .expect("spawn observer dispatcher");
        Self {
            tx: Mutex::new(Some(tx)),
            observers,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn send(&self, notification: Notification) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(notification);
        }
    }

    fn close(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Leader,
    NonLeader,
}

struct QueueInner {
    mode: Mode,
    current_term: i64,
    /// First index appended in the current term; committed-index
    /// advancement is gated on it (a leader only commits through an op
    /// of its own term).
    first_index_in_current_term: Option<i64>,
    majority_size: usize,
    active_config: Option<RaftConfig>,
    peers: BTreeMap<String, TrackedPeer>,
    all_replicated_index: i64,
    majority_replicated_index: i64,
    committed_index: i64,
    region_durable_index: i64,
    last_idx_appended_to_leader: i64,
    adjust_voter_distribution: bool,
    successor_watch_in_progress: bool,
    designated_successor_uuid: Option<String>,
    successor_filter: Option<SuccessorFilter>,
    transfer_context: Option<TransferContext>,
    successor_watch_peer_notified: bool,
    proxy_failure_threshold: Duration,
    proxy_failure_threshold_lag: i64,
    follower_failed_threshold: Duration,
}

/// A request assembled for one peer, plus its proxy hop if any.
pub struct PeerRequest {
    pub request: ConsensusRequest,
    pub next_hop: Option<String>,
}

/// Leader-side tracker of per-peer replication state and watermarks.
///
/// In LEADER mode the queue tracks every member of the active config and
/// notifies observers as watermarks advance; in NON_LEADER mode it only
/// tracks the local peer and the cache is evicted strictly by local log
/// position.
pub struct PeerQueue {
    local_uuid: String,
    log_cache: Arc<LogCache>,
    routing: Arc<RwLock<RoutingTable>>,
    max_batch_ops: usize,
    proxy_max_hops: i32,
    inner: Mutex<QueueInner>,
    dispatcher: ObserverDispatcher,
}

impl PeerQueue {
    pub fn new(
        local_uuid: impl Into<String>,
        log_cache: Arc<LogCache>,
        routing: Arc<RwLock<RoutingTable>>,
        max_batch_ops: usize,
        proxy_max_hops: i32,
        follower_failed_threshold: Duration,
        proxy_failure_threshold: Duration,
        proxy_failure_threshold_lag: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_uuid: local_uuid.into(),
            log_cache,
            routing,
            max_batch_ops,
            proxy_max_hops,
            inner: Mutex::new(QueueInner {
                mode: Mode::NonLeader,
                current_term: 0,
                first_index_in_current_term: None,
                majority_size: 1,
                active_config: None,
                peers: BTreeMap::new(),
                all_replicated_index: 0,
                majority_replicated_index: 0,
                committed_index: 0,
                region_durable_index: 0,
                last_idx_appended_to_leader: 0,
                adjust_voter_distribution: true,
                successor_watch_in_progress: false,
                designated_successor_uuid: None,
                successor_filter: None,
                transfer_context: None,
                successor_watch_peer_notified: false,
                proxy_failure_threshold,
                proxy_failure_threshold_lag,
                follower_failed_threshold,
            }),
            dispatcher: ObserverDispatcher::new(),
        })
    }

    pub fn register_observer(&self, observer: Weak<dyn QueueObserver>) {
        self.dispatcher.observers.lock().push(observer);
    }

    pub fn unregister_observers(&self) {
        self.dispatcher.observers.lock().clear();
    }

    pub fn close(&self) {
        self.dispatcher.close();
    }

    pub fn log_cache(&self) -> &Arc<LogCache> {
        &self.log_cache
    }

    pub fn last_op_id_in_log(&self) -> OpId {
        self.log_cache.last_op_id()
    }

    pub fn next_op_id(&self) -> OpId {
        let inner = self.inner.lock();
        OpId::new(inner.current_term, self.log_cache.last_op_id().index + 1)
    }

    pub fn committed_index(&self) -> i64 {
        self.inner.lock().committed_index
    }

    pub fn all_replicated_index(&self) -> i64 {
        self.inner.lock().all_replicated_index
    }

    pub fn majority_replicated_index(&self) -> i64 {
        self.inner.lock().majority_replicated_index
    }

    pub fn region_durable_index(&self) -> i64 {
        self.inner.lock().region_durable_index
    }

    pub fn last_idx_appended_to_leader(&self) -> i64 {
        self.inner.lock().last_idx_appended_to_leader
    }

    pub fn is_in_leader_mode(&self) -> bool {
        self.inner.lock().mode == Mode::Leader
    }

    /// True once an op of the current term has been committed.
    pub fn is_committed_index_in_current_term(&self) -> bool {
        let inner = self.inner.lock();
        match inner.first_index_in_current_term {
            Some(first) => inner.committed_index >= first,
            None => false,
        }
    }

    pub fn tracked_peer(&self, uuid: &str) -> Option<TrackedPeer> {
        self.inner.lock().peers.get(uuid).cloned()
    }

    pub fn set_adjust_voter_distribution(&self, adjust: bool) {
        self.inner.lock().adjust_voter_distribution = adjust;
    }

    pub fn adjust_voter_distribution(&self) -> bool {
        self.inner.lock().adjust_voter_distribution
    }

    pub fn set_proxy_failure_threshold(&self, threshold: Duration) {
        self.inner.lock().proxy_failure_threshold = threshold;
    }

    pub fn set_proxy_failure_threshold_lag(&self, lag: i64) {
        self.inner.lock().proxy_failure_threshold_lag = lag;
    }

    /// Switches to LEADER mode: tracked peers are reset to the members
    /// of `active_config` and watermark bookkeeping restarts in
    /// `current_term`.
    pub fn set_leader_mode(
        &self,
        committed_index: i64,
        current_term: i64,
        active_config: &RaftConfig,
    ) {
        let tail = self.log_cache.last_op_id();
        let mut inner = self.inner.lock();
        assert!(
            current_term >= inner.current_term,
            "leader mode term {} below queue term {}",
            current_term,
            inner.current_term
        );
        inner.mode = Mode::Leader;
        if current_term > inner.current_term {
            // A new term starts with no own-term op; a same-term refresh
            // (config change) keeps the commit gate as-is.
            inner.first_index_in_current_term = None;
            inner.current_term = current_term;
        }
        inner.committed_index = committed_index.max(inner.committed_index);
        inner.majority_size = majority_size(active_config.count_voters());
        inner.active_config = Some(active_config.clone());
        inner.successor_watch_in_progress = false;
        inner.successor_watch_peer_notified = false;
        inner.peers.clear();
        for peer in &active_config.peers {
            let mut tracked = TrackedPeer::new(peer.clone(), tail.index + 1);
            if peer.uuid == self.local_uuid {
                tracked.last_received = tail;
                tracked.last_exchange_status = PeerStatus::Ok;
            }
            inner.peers.insert(peer.uuid.clone(), tracked);
        }
        self.check_peers_in_active_config(&inner);
        info!(
            "event=raft_queue_leader_mode term={} committed_index={} peers={}",
            current_term,
            committed_index,
            inner.peers.len()
        );
    }

    /// Switches to NON_LEADER mode: only the local peer stays tracked.
    pub fn set_non_leader_mode(&self, active_config: &RaftConfig) {
        let tail = self.log_cache.last_op_id();
        let mut inner = self.inner.lock();
        inner.mode = Mode::NonLeader;
        inner.active_config = Some(active_config.clone());
        inner.majority_size = majority_size(active_config.count_voters());
        inner.first_index_in_current_term = None;
        inner.successor_watch_in_progress = false;
        inner.peers.clear();
        if let Some(local) = active_config.peer(&self.local_uuid) {
            let mut tracked = TrackedPeer::new(local.clone(), tail.index + 1);
            tracked.last_received = tail;
            inner.peers.insert(local.uuid.clone(), tracked);
        }
        info!("event=raft_queue_non_leader_mode peers={}", inner.peers.len());
    }

    /// LEADER-mode invariant: every tracked peer is in the active
    /// config. A violation is a bug and halts the process.
    fn check_peers_in_active_config(&self, inner: &QueueInner) {
        if inner.mode != Mode::Leader {
            return;
        }
        let config = inner
            .active_config
            .as_ref()
            .expect("leader mode requires an active config");
        for uuid in inner.peers.keys() {
            assert!(
                config.is_member(uuid),
                "tracked peer {uuid} is not in the active config"
            );
        }
    }

    /// Appends pre-assigned messages: places them in the log cache,
    /// starts the durable write, and counts the local peer's ack once
    /// it completes. Ids come from `next_op_id` on the leader or from
    /// the leader's request on a follower.
    pub fn append_operations(
        self: &Arc<Self>,
        msgs: &[Arc<ReplicateMsg>],
        log_append_cb: LogAppendCallback,
    ) {
        assert!(!msgs.is_empty());
        {
            let mut inner = self.inner.lock();
            let last = msgs.last().unwrap().id;
            if last.term > inner.current_term {
                inner.current_term = last.term;
                inner.first_index_in_current_term = Some(msgs[0].id.index);
            } else if last.term == inner.current_term
                && inner.first_index_in_current_term.is_none()
            {
                inner.first_index_in_current_term = Some(msgs[0].id.index);
            }
        }
        self.append_to_cache(msgs, log_append_cb);
    }

    fn append_to_cache(self: &Arc<Self>, msgs: &[Arc<ReplicateMsg>], log_append_cb: LogAppendCallback) {
        let last = msgs.last().unwrap().id;
        let queue = Arc::clone(self);
        self.log_cache.append_batch(
            msgs,
            Box::new(move |result| {
                match &result {
                    Ok(()) => queue.local_peer_append_finished(last),
                    // A failed durable append under an active queue is
                    // unrecoverable.
                    Err(err) => panic!("log append for {last} failed: {err}"),
                }
                log_append_cb(result);
            }),
        );
    }

    /// Synthetic response counting the local peer once its log write is
    /// durable.
    fn local_peer_append_finished(&self, id: OpId) {
        let mut inner = self.inner.lock();
        let local_uuid = self.local_uuid.clone();
        if let Some(local) = inner.peers.get_mut(&local_uuid) {
            if id > local.last_received {
                local.last_received = id;
                local.next_index = id.index + 1;
                local.last_communication_time = Instant::now();
            }
        }
        self.advance_watermarks(&mut inner);
    }

    pub fn truncate_ops_after(&self, index: i64) {
        self.log_cache.truncate_ops_after(index);
    }

    /// Assembles a replication request for `uuid` from its `next_index`.
    pub fn request_for_peer(&self, uuid: &str, read_ops: bool) -> Result<PeerRequest, ConsensusError> {
        let inner = self.inner.lock();
        if inner.mode != Mode::Leader {
            return Err(ConsensusError::illegal_state("queue is not in leader mode"));
        }
        let peer = inner
            .peers
            .get(uuid)
            .ok_or_else(|| ConsensusError::NotFound(format!("peer {uuid} is not tracked")))?;
        let next_index = peer.next_index;
        let dest_region_lag = peer.last_received.index;
        let committed_index = inner.committed_index;
        let all_replicated_index = inner.all_replicated_index;
        let region_durable_index = inner.region_durable_index;
        let caller_term = inner.current_term;
        drop(inner);

        let preceding_id = if next_index <= 1 {
            OpId::MIN
        } else {
            self.log_cache
                .op_at(next_index - 1)
                .map(|m| m.id)
                .ok_or_else(|| {
                    ConsensusError::Incomplete(format!(
                        "op {} needed for peer {uuid} is not in the local log",
                        next_index - 1
                    ))
                })?
        };

        // Resolve the first hop; unhealthy proxy peers are bypassed in
        // favor of direct delivery.
        let mut next_hop = self
            .routing
            .read()
            .next_hop(&self.local_uuid, uuid)
            .map_err(ConsensusError::from)?;
        if next_hop != uuid {
            let inner = self.inner.lock();
            if let Some(proxy_peer) = inner.peers.get(&next_hop) {
                if Self::has_proxy_peer_failed(&inner, proxy_peer, dest_region_lag) {
                    next_hop = uuid.to_string();
                }
            } else {
                next_hop = uuid.to_string();
            }
        }
        let proxied = next_hop != uuid;

        let mut ops: Vec<Arc<ReplicateMsg>> = Vec::new();
        if read_ops {
            let (msgs, _) = self.log_cache.read_ops(next_index - 1, self.max_batch_ops)?;
            ops = if proxied {
                msgs.iter()
                    .map(|m| Arc::new(ReplicateMsg::proxy_placeholder(m.id)))
                    .collect()
            } else {
                msgs
            };
        }

        let request = ConsensusRequest {
            dest_uuid: uuid.to_string(),
            caller_uuid: self.local_uuid.clone(),
            caller_term,
            preceding_id,
            ops,
            committed_index,
            all_replicated_index,
            region_durable_index,
            last_idx_appended_to_leader: self.log_cache.last_op_id().index,
            raft_rpc_token: None,
            proxy_dest_uuid: proxied.then(|| next_hop.clone()),
            proxy_caller_uuid: None,
            proxy_hops_remaining: if proxied { self.proxy_max_hops } else { 0 },
        };
        Ok(PeerRequest {
            request,
            next_hop: proxied.then_some(next_hop),
        })
    }

    fn has_proxy_peer_failed(inner: &QueueInner, proxy_peer: &TrackedPeer, dest_last_received: i64) -> bool {
        if proxy_peer.last_communication_time.elapsed() > inner.proxy_failure_threshold {
            return true;
        }
        dest_last_received - proxy_peer.last_received.index > inner.proxy_failure_threshold_lag
    }

    /// Records an RPC-layer or remote-replica failure for a peer.
    pub fn update_peer_status(&self, uuid: &str, status: PeerStatus, reason: &str) {
        let mut inner = self.inner.lock();
        let threshold = inner.follower_failed_threshold;
        let current_term = inner.current_term;
        let mut notify_health = false;
        let mut notify_failed: Option<String> = None;
        if let Some(peer) = inner.peers.get_mut(uuid) {
            peer.last_exchange_status = status;
            let previous = peer.last_overall_health;
            let health = if peer.last_communication_time.elapsed() > threshold {
                PeerHealth::Failed
            } else {
                previous
            };
            peer.last_overall_health = health;
            if health != previous {
                notify_health = true;
                if health == PeerHealth::Failed {
                    notify_failed = Some(peer.peer.uuid.clone());
                }
            }
        } else {
            warn!("event=raft_queue_status_for_untracked_peer uuid={uuid} status={status:?}");
        }
        drop(inner);
        if let Some(failed) = notify_failed {
            self.dispatcher.send(Notification::FailedFollower {
                uuid: failed,
                term: current_term,
                reason: reason.to_string(),
            });
        }
        if notify_health {
            self.dispatcher.send(Notification::PeerHealthChange);
        }
    }

    /// Ingests a peer's response; returns true when the peer is still
    /// behind and another request should follow immediately.
    pub fn response_from_peer(&self, uuid: &str, response: &ConsensusResponse) -> bool {
        let tail = self.log_cache.last_op_id();
        let mut inner = self.inner.lock();
        let current_term = inner.current_term;
        let Some(peer) = inner.peers.get_mut(uuid) else {
            warn!("event=raft_queue_response_from_untracked_peer uuid={uuid}");
            return false;
        };
        peer.last_communication_time = Instant::now();
        peer.check_monotonic_terms(response.responder_term);

        if response.responder_term > current_term {
            peer.last_exchange_status = PeerStatus::InvalidTerm;
            drop(inner);
            self.dispatcher
                .send(Notification::TermChange(response.responder_term));
            return false;
        }

        if let Some(error) = &response.status.error {
            match error.code {
                ConsensusErrorCode::PrecedingEntryDidntMatch => {
                    peer.last_exchange_status = PeerStatus::LmpMismatch;
                    let follower_tail = response.status.last_received.index + 1;
                    peer.next_index = (peer.next_index - 1).min(follower_tail).max(1);
                    info!(
                        "event=raft_queue_lmp_mismatch peer={} next_index={}",
                        uuid, peer.next_index
                    );
                    return true;
                }
                ConsensusErrorCode::CannotPrepare => {
                    peer.last_exchange_status = PeerStatus::CannotPrepare;
                    return false;
                }
                ConsensusErrorCode::InvalidTerm => {
                    peer.last_exchange_status = PeerStatus::InvalidTerm;
                    return false;
                }
                _ => {
                    peer.last_exchange_status = PeerStatus::RemoteError;
                    return false;
                }
            }
        }

        peer.last_exchange_status = PeerStatus::Ok;
        peer.last_overall_health = PeerHealth::Healthy;
        peer.wal_catchup_possible = true;
        peer.last_received = response.status.last_received_current_leader;
        peer.next_index = peer.last_received.index + 1;
        peer.last_known_committed_index = response.status.last_committed_idx;
        let peer_snapshot = peer.clone();
        let more_pending = peer.last_received.index < tail.index;

        self.promote_if_needed(&mut inner, &peer_snapshot);
        self.check_successor_watch(&mut inner, &peer_snapshot, tail);
        self.advance_watermarks(&mut inner);
        more_pending
    }

    fn promote_if_needed(&self, inner: &mut QueueInner, peer: &TrackedPeer) {
        if peer.peer.is_voter() || !peer.peer.attrs.promote {
            return;
        }
        if peer.last_received.index < inner.committed_index {
            return;
        }
        let entry = inner.peers.get_mut(&peer.peer.uuid).unwrap();
        if entry.promotion_requested {
            return;
        }
        entry.promotion_requested = true;
        info!("event=raft_queue_peer_promotion_ready uuid={}", peer.peer.uuid);
        self.dispatcher
            .send(Notification::PeerToPromote(peer.peer.uuid.clone()));
    }

    fn check_successor_watch(&self, inner: &mut QueueInner, peer: &TrackedPeer, tail: OpId) {
        if !inner.successor_watch_in_progress
            || inner.successor_watch_peer_notified
            || peer.peer.uuid == self.local_uuid
        {
            return;
        }
        if !peer.peer.is_voter() || peer.last_received.index != tail.index {
            return;
        }
        let eligible = match &inner.designated_successor_uuid {
            Some(designated) => *designated == peer.peer.uuid,
            None => inner
                .successor_filter
                .as_ref()
                .map(|filter| filter(&peer.peer))
                .unwrap_or(true),
        };
        if !eligible {
            return;
        }
        inner.successor_watch_peer_notified = true;
        info!(
            "event=raft_queue_successor_caught_up uuid={} index={}",
            peer.peer.uuid, tail.index
        );
        self.dispatcher.send(Notification::PeerToStartElection(
            peer.peer.uuid.clone(),
            inner.transfer_context.clone(),
        ));
    }

    /// Arms the successor watch: observers fire once the designated peer
    /// (or the first caught-up voter passing `filter`) matches the
    /// leader's tail.
    pub fn begin_watch_for_successor(
        &self,
        successor_uuid: Option<String>,
        filter: Option<SuccessorFilter>,
        transfer_context: TransferContext,
    ) {
        let mut inner = self.inner.lock();
        inner.successor_watch_in_progress = true;
        inner.successor_watch_peer_notified = false;
        inner.designated_successor_uuid = successor_uuid;
        inner.successor_filter = filter;
        inner.transfer_context = Some(transfer_context);
    }

    pub fn end_watch_for_successor(&self) {
        let mut inner = self.inner.lock();
        inner.successor_watch_in_progress = false;
        inner.designated_successor_uuid = None;
        inner.successor_filter = None;
        inner.transfer_context = None;
    }

    pub fn watch_for_successor_peer_notified(&self) -> bool {
        self.inner.lock().successor_watch_peer_notified
    }

    /// Follower-side watermark intake, used for metrics and log GC.
    pub fn update_follower_watermarks(
        &self,
        committed_index: i64,
        all_replicated_index: i64,
        region_durable_index: i64,
    ) {
        let mut inner = self.inner.lock();
        if committed_index > inner.committed_index {
            inner.committed_index = committed_index;
        }
        inner.all_replicated_index = all_replicated_index;
        if region_durable_index > inner.region_durable_index {
            inner.region_durable_index = region_durable_index;
        }
        drop(inner);
        // Non-leader cache eviction is strictly by local log position.
        let tail = self.log_cache.last_op_id();
        self.log_cache
            .evict_ops_before(all_replicated_index.min(tail.index));
    }

    pub fn update_last_index_appended_to_leader(&self, last_idx: i64) {
        self.inner.lock().last_idx_appended_to_leader = last_idx;
    }

    /// Sweeps peer health; peers silent past the threshold transition to
    /// failed and are reported once.
    pub fn check_peer_health(&self) {
        let mut inner = self.inner.lock();
        if inner.mode != Mode::Leader {
            return;
        }
        let threshold = inner.follower_failed_threshold;
        let term = inner.current_term;
        let local_uuid = self.local_uuid.clone();
        let mut failed: Vec<String> = Vec::new();
        let mut changed = false;
        for peer in inner.peers.values_mut() {
            if peer.peer.uuid == local_uuid {
                continue;
            }
            let health = if peer.last_communication_time.elapsed() > threshold
                || !peer.wal_catchup_possible
            {
                PeerHealth::Failed
            } else if peer.last_exchange_status == PeerStatus::Ok {
                PeerHealth::Healthy
            } else {
                peer.last_overall_health
            };
            if health != peer.last_overall_health {
                changed = true;
                if health == PeerHealth::Failed {
                    failed.push(peer.peer.uuid.clone());
                }
                peer.last_overall_health = health;
            }
        }
        drop(inner);
        for uuid in failed {
            self.dispatcher.send(Notification::FailedFollower {
                uuid,
                term,
                reason: "no recent communication".to_string(),
            });
        }
        if changed {
            self.dispatcher.send(Notification::PeerHealthChange);
        }
    }

    fn advance_watermarks(&self, inner: &mut QueueInner) {
        if inner.mode != Mode::Leader {
            // Only the local peer is tracked: eviction follows its log
            // position, no quorum math applies.
            return;
        }
        let config = inner.active_config.as_ref().expect("leader mode config").clone();

        inner.all_replicated_index = inner
            .peers
            .values()
            .map(|p| p.last_received.index)
            .min()
            .unwrap_or(0);

        let majority = self.compute_majority_replicated(inner, &config);
        if majority > inner.majority_replicated_index {
            inner.majority_replicated_index = majority;
        }

        let region_durable = self.compute_region_durable(inner, &config);
        if region_durable > inner.region_durable_index {
            inner.region_durable_index = region_durable;
        }

        let mut new_committed = None;
        if let Some(first) = inner.first_index_in_current_term {
            if inner.majority_replicated_index >= first
                && inner.majority_replicated_index > inner.committed_index
            {
                inner.committed_index = inner.majority_replicated_index;
                new_committed = Some(inner.committed_index);
            }
        }

        log::debug!(
            "event=raft_queue_watermarks all_replicated={} majority_replicated={} committed={} region_durable={}",
            inner.all_replicated_index,
            inner.majority_replicated_index,
            inner.committed_index,
            inner.region_durable_index
        );
        let evict_below = inner.all_replicated_index.min(inner.committed_index);
        if let Some(committed) = new_committed {
            self.dispatcher.send(Notification::CommitIndex(committed));
        }
        self.log_cache.evict_ops_before(evict_below);
    }

    /// The majority-replicated index under the active commit rule.
    fn compute_majority_replicated(&self, inner: &QueueInner, config: &RaftConfig) -> i64 {
        match config.commit_rule.mode {
            QuorumMode::Classic => {
                let mut indexes: Vec<i64> = inner
                    .peers
                    .values()
                    .filter(|p| p.peer.is_voter())
                    .map(|p| p.last_received.index)
                    .collect();
                indexes.sort_unstable_by(|a, b| b.cmp(a));
                if indexes.len() < inner.majority_size {
                    return 0;
                }
                indexes[inner.majority_size - 1]
            }
            QuorumMode::SingleRegionDynamic => {
                let leader_region = config
                    .peer(&self.local_uuid)
                    .map(|p| config.quorum_id_of(p))
                    .unwrap_or_default();
                Self::region_watermark(inner, config, &leader_region)
            }
            QuorumMode::StaticDisjunction | QuorumMode::StaticConjunction => {
                let per_predicate: Vec<i64> = config
                    .commit_rule
                    .predicates
                    .iter()
                    .map(|predicate| {
                        let mut region_watermarks: Vec<i64> = predicate
                            .regions
                            .iter()
                            .map(|region| Self::region_watermark(inner, config, region))
                            .collect();
                        region_watermarks.sort_unstable_by(|a, b| b.cmp(a));
                        if region_watermarks.len() < predicate.subset_size {
                            0
                        } else {
                            region_watermarks[predicate.subset_size - 1]
                        }
                    })
                    .collect();
                match config.commit_rule.mode {
                    QuorumMode::StaticDisjunction => {
                        per_predicate.into_iter().max().unwrap_or(0)
                    }
                    _ => per_predicate.into_iter().min().unwrap_or(0),
                }
            }
        }
    }

    /// The index replicated to a majority of one region's expected
    /// voters.
    fn region_watermark(inner: &QueueInner, config: &RaftConfig, region: &str) -> i64 {
        if region.is_empty() {
            return 0;
        }
        let distribution = if inner.adjust_voter_distribution {
            config.effective_voter_distribution()
        } else {
            config.voter_distribution.clone()
        };
        let expected = distribution.get(region).copied().unwrap_or(0).max(0) as usize;
        if expected == 0 {
            return 0;
        }
        let needed = majority_size(expected);
        let mut indexes: Vec<i64> = inner
            .peers
            .values()
            .filter(|p| p.peer.is_voter() && config.quorum_id_of(&p.peer) == region)
            .map(|p| p.last_received.index)
            .collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        if indexes.len() < needed {
            return 0;
        }
        indexes[needed - 1]
    }

    /// Highest index replicated to at least one peer outside the
    /// leader's region.
    fn compute_region_durable(&self, inner: &QueueInner, config: &RaftConfig) -> i64 {
        let leader_region = match config.peer(&self.local_uuid) {
            Some(peer) => peer.region.clone(),
            None => return 0,
        };
        inner
            .peers
            .values()
            .filter(|p| p.peer.region != leader_region)
            .map(|p| p.last_received.index)
            .max()
            .unwrap_or(0)
    }
}

impl Drop for PeerQueue {
    fn drop(&mut self) {
        self.close();
    }
}
