use crate::config::{
    majority_size, MemberType, Peer, RaftConfig, QuorumMode, removed_peer_uuids,
};
use crate::election::flexible::{FlexibleQuorumOptions, FlexibleVoteCounter};
use crate::election::{
    ElectionContext, ElectionDecisionCallback, ElectionMode, ElectionReason, ElectionResult,
    ElectionVote, LeaderElection, MajorityVoteCounter, VoteCounter, VoteInfo,
};
use crate::error::{
    ConfigChangeError, ConsensusError, ConsensusErrorCode, ServerErrorCode,
};
use crate::failure_detector::FailureDetector;
use crate::log_cache::{LogCache, RaftLog};
use crate::metadata::{ConsensusMetadata, FlushPolicy, MetadataStore};
use crate::metrics::ConsensusMetrics;
use crate::opid::OpId;
use crate::options::RaftOptions;
use crate::pending::{PendingRounds, ReplicatedCallback, Round};
use crate::queue::{PeerQueue, QueueObserver, SuccessorFilter, TransferContext};
use crate::routing::{ProxyPolicy, ProxyTopology, RoutingTable};
use crate::rpc::{
    ChangeConfigRecord, ConsensusRequest, ConsensusResponse, ConsensusStatus,
    ConsensusStatusError, OpType, PeerProxyFactory, ReplicateMsg, StartElectionRequest,
    VoteRequest, VoteResponse,
};
use log::{error, info, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, TryLockError, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Host-supplied handler that turns replicated messages into state
/// machine rounds. Invoked with the replica lock held; implementations
/// must defer heavy work.
pub trait RoundHandler: Send + Sync {
    fn start_follower_round(&self, round: Arc<Round>) -> Result<(), ConsensusError>;
    fn start_consensus_only_round(&self, round: Arc<Round>) -> Result<(), ConsensusError>;
    fn finish_consensus_only_round(&self, round: &Arc<Round>);
}

/// Role of this replica within the active config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
    Learner,
    NonParticipant,
}

/// Replica lifecycle. Transitions only move forward:
/// New -> Initialized -> Running -> Stopping -> Stopped -> Shutdown,
/// with Initialized -> Stopping allowed for aborted starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    New,
    Initialized,
    Running,
    Stopping,
    Stopped,
    Shutdown,
}

fn lifecycle_transition_allowed(from: Lifecycle, to: Lifecycle) -> bool {
    use Lifecycle::*;
    matches!(
        (from, to),
        (New, Initialized)
            | (New, Stopping)
            | (Initialized, Running)
            | (Initialized, Stopping)
            | (Running, Stopping)
            | (Stopping, Stopped)
            | (Stopped, Shutdown)
    )
}

/// Types of configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChangeType {
    AddPeer,
    RemovePeer,
    ModifyPeer,
}

/// One membership modification. `peer` is required for ADD_PEER; the
/// `new_*` fields apply to MODIFY_PEER and only the ones present are
/// changed.
#[derive(Debug, Clone)]
pub struct ConfigChangeItem {
    pub change_type: ConfigChangeType,
    pub peer_uuid: String,
    pub peer: Option<Peer>,
    pub new_member_type: Option<MemberType>,
    pub new_attrs_promote: Option<bool>,
    pub new_attrs_replace: Option<bool>,
}

impl ConfigChangeItem {
    pub fn add_peer(peer: Peer) -> Self {
        Self {
            change_type: ConfigChangeType::AddPeer,
            peer_uuid: peer.uuid.clone(),
            peer: Some(peer),
            new_member_type: None,
            new_attrs_promote: None,
            new_attrs_replace: None,
        }
    }

    pub fn remove_peer(uuid: impl Into<String>) -> Self {
        Self {
            change_type: ConfigChangeType::RemovePeer,
            peer_uuid: uuid.into(),
            peer: None,
            new_member_type: None,
            new_attrs_promote: None,
            new_attrs_replace: None,
        }
    }

    pub fn modify_peer(uuid: impl Into<String>) -> Self {
        Self {
            change_type: ConfigChangeType::ModifyPeer,
            peer_uuid: uuid.into(),
            peer: None,
            new_member_type: None,
            new_attrs_promote: None,
            new_attrs_replace: None,
        }
    }

    pub fn with_member_type(mut self, member_type: MemberType) -> Self {
        self.new_member_type = Some(member_type);
        self
    }

    pub fn with_promote(mut self, promote: bool) -> Self {
        self.new_attrs_promote = Some(promote);
        self
    }

    pub fn with_replace(mut self, replace: bool) -> Self {
        self.new_attrs_replace = Some(replace);
        self
    }
}

/// A (bulk) configuration change request: several items, still limited
/// to one VOTER-status modification per request.
#[derive(Debug, Clone, Default)]
pub struct ChangeConfigRequest {
    pub changes: Vec<ConfigChangeItem>,
    /// Compare-and-swap guard against the committed config's opid index.
    pub cas_config_opid_index: Option<i64>,
}

/// Force-install request bypassing replication safety.
#[derive(Debug, Clone)]
pub struct UnsafeChangeConfigRequest {
    pub caller_id: String,
    /// Peers of the committed config retained in the new config.
    pub retained_peer_uuids: Vec<String>,
}

struct ReplicaState {
    lifecycle: Lifecycle,
    cmeta: ConsensusMetadata,
    pending: PendingRounds,
    proxy_policy: ProxyPolicy,
    proxy_topology: ProxyTopology,
    withhold_votes_until: Instant,
    last_received_cur_leader: OpId,
    failed_elections_since_stable_leader: i64,
    failed_elections_candidate_not_in_config: i64,
}

/// Single-shot rendezvous with the durable log append.
struct LogSynchronizer {
    state: Arc<(Mutex<Option<Result<(), ConsensusError>>>, Condvar)>,
}

impl LogSynchronizer {
    fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn callback(&self) -> crate::log_cache::LogAppendCallback {
        let state = Arc::clone(&self.state);
        Box::new(move |result| {
            let (slot, cond) = &*state;
            *slot.lock().unwrap() = Some(result);
            cond.notify_all();
        })
    }

    fn wait(&self, timeout: Duration) -> Option<Result<(), ConsensusError>> {
        let (slot, cond) = &*self.state;
        let mut guard = slot.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = cond.wait_timeout(guard, deadline - now).unwrap();
            guard = next;
        }
        guard.take()
    }
}

/// The deduplicated remainder of a leader request.
struct LeaderRequest {
    preceding_id: OpId,
    messages: Vec<Arc<ReplicateMsg>>,
}

/// The per-replica Raft consensus engine.
///
/// Locking: `update_lock` (U) serializes follower appends and is always
/// taken before `state` (S). S protects config, metadata, and pending
/// coordination; it is never held across peer RPCs, fsync waits, or
/// blocking cache reads. The queue keeps its own internal lock.
pub struct RaftCore {
    options: RaftOptions,
    local_peer: Peer,
    update_lock: Mutex<()>,
    state: Mutex<ReplicaState>,
    queue: Arc<PeerQueue>,
    log_cache: Arc<LogCache>,
    routing: Arc<RwLock<RoutingTable>>,
    proxy_factory: Arc<dyn PeerProxyFactory>,
    round_handler: Arc<dyn RoundHandler>,
    failure_detector: Arc<FailureDetector>,
    failure_detector_election_lock: Mutex<()>,
    metrics: Arc<ConsensusMetrics>,
    leader_transfer_in_progress: AtomicBool,
    transfer_generation: AtomicU64,
    reject_append_entries_for_tests: AtomicBool,
    withhold_votes_for_tests: AtomicBool,
    shutdown_flag: AtomicBool,
    self_ref: Weak<RaftCore>,
}

impl RaftCore {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        options: RaftOptions,
        local_peer: Peer,
        initial_config: RaftConfig,
        metadata_store: Box<dyn MetadataStore>,
        log: Arc<dyn RaftLog>,
        proxy_factory: Arc<dyn PeerProxyFactory>,
        round_handler: Arc<dyn RoundHandler>,
    ) -> Result<Arc<Self>, ConsensusError> {
        let cmeta = ConsensusMetadata::load_or_create(
            metadata_store,
            &initial_config,
            options.max_vote_history_entries,
        )?;
        let log_cache = Arc::new(LogCache::new(log));
        let routing = Arc::new(RwLock::new(RoutingTable::build(
            cmeta.active_config(),
            None,
            options.proxy_policy,
            &ProxyTopology::default(),
        )));
        let queue = PeerQueue::new(
            local_peer.uuid.clone(),
            Arc::clone(&log_cache),
            Arc::clone(&routing),
            options.max_batch_ops,
            options.proxy_max_hops,
            options.follower_unavailable_considered_failed,
            options.proxy_failure_threshold,
            options.proxy_failure_threshold_lag,
        );
        let metrics = Arc::new(ConsensusMetrics::new());
        metrics.set_term(cmeta.current_term());
        let proxy_policy = options.proxy_policy;
        let detector_period = options.failure_detection_period();
        let rng_seed = options.rng_seed;

        let core = Arc::new_cyclic(|weak: &Weak<RaftCore>| {
            let detector_handle = weak.clone();
            let failure_detector = FailureDetector::new(
                detector_period,
                rng_seed,
                Box::new(move || {
                    // Upgrade-or-drop: a tick after the core is gone is
                    // a no-op.
                    if let Some(core) = detector_handle.upgrade() {
                        core.report_failure_detected();
                    }
                }),
            );
            RaftCore {
                options,
                local_peer,
                update_lock: Mutex::new(()),
                state: Mutex::new(ReplicaState {
                    lifecycle: Lifecycle::New,
                    cmeta,
                    pending: PendingRounds::new(0),
                    proxy_policy,
                    proxy_topology: ProxyTopology::default(),
                    withhold_votes_until: Instant::now(),
                    last_received_cur_leader: OpId::MIN,
                    failed_elections_since_stable_leader: 0,
                    failed_elections_candidate_not_in_config: 0,
                }),
                queue,
                log_cache,
                routing,
                proxy_factory,
                round_handler,
                failure_detector,
                failure_detector_election_lock: Mutex::new(()),
                metrics,
                leader_transfer_in_progress: AtomicBool::new(false),
                transfer_generation: AtomicU64::new(0),
                reject_append_entries_for_tests: AtomicBool::new(false),
                withhold_votes_for_tests: AtomicBool::new(false),
                shutdown_flag: AtomicBool::new(false),
                self_ref: weak.clone(),
            }
        });
        Ok(core)
    }

    /// Starts the consensus algorithm: becomes a follower, arms failure
    /// detection, and (for a single-voter config) runs the initial
    /// election.
    pub fn start(self: &Arc<Self>) -> Result<(), ConsensusError> {
        let single_voter = {
            let mut state = self.state.lock().unwrap();
            self.set_lifecycle(&mut state, Lifecycle::Initialized)?;
            self.set_lifecycle(&mut state, Lifecycle::Running)?;
            let observer: Weak<dyn QueueObserver> = self.self_ref.clone();
            self.queue.register_observer(observer);
            state.pending = PendingRounds::new(0);
            self.become_replica(&mut state, None);
            let config = state.cmeta.committed_config();
            config.count_voters() == 1 && config.is_voter(&self.local_peer.uuid)
        };
        info!(
            "event=raft_start uuid={} term={} single_voter={}",
            self.local_peer.uuid,
            self.current_term(),
            single_voter
        );
        if single_voter {
            self.start_election(
                ElectionMode::Normal,
                ElectionContext::new(ElectionReason::InitialSingleNodeElection),
            )?;
        }
        Ok(())
    }

    fn set_lifecycle(
        &self,
        state: &mut ReplicaState,
        to: Lifecycle,
    ) -> Result<(), ConsensusError> {
        if !lifecycle_transition_allowed(state.lifecycle, to) {
            return Err(ConsensusError::illegal_state(format!(
                "illegal lifecycle transition {:?} -> {to:?}",
                state.lifecycle
            )));
        }
        state.lifecycle = to;
        Ok(())
    }

    fn check_running(&self, state: &ReplicaState) -> Result<(), ConsensusError> {
        if state.lifecycle != Lifecycle::Running {
            return Err(ConsensusError::illegal_state(format!(
                "replica is not running (state {:?})",
                state.lifecycle
            )));
        }
        Ok(())
    }

    pub fn peer_uuid(&self) -> &str {
        &self.local_peer.uuid
    }

    pub fn metrics(&self) -> &Arc<ConsensusMetrics> {
        &self.metrics
    }

    pub fn current_term(&self) -> i64 {
        self.state.lock().unwrap().cmeta.current_term()
    }

    pub fn leader_uuid(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .cmeta
            .leader_uuid()
            .map(|s| s.to_string())
    }

    pub fn committed_config(&self) -> RaftConfig {
        self.state.lock().unwrap().cmeta.committed_config().clone()
    }

    pub fn pending_config(&self) -> Option<RaftConfig> {
        self.state.lock().unwrap().cmeta.pending_config().cloned()
    }

    pub fn committed_index(&self) -> i64 {
        self.state.lock().unwrap().pending.committed_index()
    }

    pub fn last_op_id(&self) -> OpId {
        self.log_cache.last_op_id()
    }

    /// Term and index of the last committed operation.
    pub fn last_committed_op_id(&self) -> OpId {
        let state = self.state.lock().unwrap();
        OpId::new(
            state.pending.term_of_last_committed(),
            state.pending.committed_index(),
        )
    }

    pub fn removed_peers(&self) -> Vec<String> {
        self.state.lock().unwrap().cmeta.removed_peers().to_vec()
    }

    pub fn queue(&self) -> &Arc<PeerQueue> {
        &self.queue
    }

    pub(crate) fn options(&self) -> &RaftOptions {
        &self.options
    }

    pub(crate) fn proxy_factory(&self) -> &Arc<dyn PeerProxyFactory> {
        &self.proxy_factory
    }

    pub(crate) fn shared_log_cache(&self) -> &Arc<LogCache> {
        &self.log_cache
    }

    pub(crate) fn next_hop_from_local(&self, dst: &str) -> Result<String, ConsensusError> {
        self.routing
            .read()
            .next_hop(&self.local_peer.uuid, dst)
            .map_err(ConsensusError::from)
    }

    pub fn role(&self) -> RaftRole {
        let state = self.state.lock().unwrap();
        self.role_unlocked(&state)
    }

    fn role_unlocked(&self, state: &ReplicaState) -> RaftRole {
        let config = state.cmeta.active_config();
        match config.peer(&self.local_peer.uuid) {
            None => RaftRole::NonParticipant,
            Some(peer) if !peer.is_voter() => RaftRole::Learner,
            Some(_) => {
                if state.cmeta.leader_uuid() == Some(self.local_peer.uuid.as_str()) {
                    RaftRole::Leader
                } else {
                    RaftRole::Follower
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().lifecycle == Lifecycle::Running
    }

    fn far_future() -> Instant {
        Instant::now() + Duration::from_secs(10 * 365 * 24 * 3600)
    }

    fn rebuild_routing(&self, state: &ReplicaState) {
        let table = RoutingTable::build(
            state.cmeta.active_config(),
            state.cmeta.leader_uuid(),
            state.proxy_policy,
            &state.proxy_topology,
        );
        *self.routing.write() = table;
    }

    /// Enables failure detection for non-leader voters; disables it for
    /// leaders and non-voters.
    fn update_failure_detector_state(&self, state: &ReplicaState, delta: Option<Duration>) {
        let config = state.cmeta.active_config();
        let is_voter = config.is_voter(&self.local_peer.uuid);
        let is_leader = state.cmeta.leader_uuid() == Some(self.local_peer.uuid.as_str());
        if is_voter && !is_leader {
            self.failure_detector.enable(delta);
        } else {
            self.failure_detector.disable();
        }
    }

    // ------------------------------------------------------------------
    // Election driving
    // ------------------------------------------------------------------

    fn report_failure_detected(self: Arc<Self>) {
        // Coalesce stacked elections: if one is already being launched,
        // drop this tick.
        match self.failure_detector_election_lock.try_lock() {
            Ok(_guard) => {
                let mode = if self.options.enable_pre_election {
                    ElectionMode::PreElection
                } else {
                    ElectionMode::Normal
                };
                if let Err(err) = self.start_election(
                    mode,
                    ElectionContext::new(ElectionReason::TimeoutExpired),
                ) {
                    warn!("event=raft_election_trigger_failed error={err}");
                }
            }
            Err(TryLockError::WouldBlock) => {}
            Err(TryLockError::Poisoned(_)) => {
                error!("event=raft_election_lock_poisoned");
            }
        }
    }

    /// Triggers a (pre-)election.
    pub fn start_election(
        self: &Arc<Self>,
        mode: ElectionMode,
        mut context: ElectionContext,
    ) -> Result<(), ConsensusError> {
        let election = {
            let mut state = self.state.lock().unwrap();
            self.check_running(&state)?;

            if !state.cmeta.allow_start_election() {
                warn!("event=raft_election_disallowed uuid={}", self.local_peer.uuid);
                return Ok(());
            }
            if context.source_uuid.is_empty() {
                context.source_uuid = state.cmeta.leader_uuid().unwrap_or("").to_string();
            }
            match self.role_unlocked(&state) {
                RaftRole::Leader => {
                    info!("event=raft_election_skipped reason=already_leader");
                    return Ok(());
                }
                RaftRole::Learner | RaftRole::NonParticipant => {
                    return Err(ConsensusError::illegal_state(
                        "only voting members can start elections",
                    ));
                }
                RaftRole::Follower => {}
            }

            let active_config = state.cmeta.active_config().clone();
            let flexi = self.options.enable_flexi_raft && active_config.commit_rule.is_flexi();
            if flexi && !active_config.commit_rule.use_quorum_id {
                let region = &self.local_peer.region;
                if !active_config
                    .effective_voter_distribution()
                    .contains_key(region)
                {
                    return Err(ConsensusError::illegal_state(format!(
                        "region {region} has no voter distribution; cannot start election"
                    )));
                }
            }

            info!(
                "event=raft_election_triggered mode={mode:?} reason={:?} term={}",
                context.reason,
                state.cmeta.current_term()
            );

            // Snooze so the timer does not immediately re-fire; the
            // election stays interruptible by its own timeout.
            let backoff = self.election_backoff_unlocked(&state);
            self.failure_detector.snooze(Some(backoff));

            if mode != ElectionMode::PreElection {
                // The vote we record next flushes; skip the double
                // fsync on the term advance.
                let next_term = state.cmeta.current_term() + 1;
                state
                    .cmeta
                    .set_current_term(next_term, FlushPolicy::SkipFlush)?;
                self.metrics.set_term(state.cmeta.current_term());
                state.cmeta.set_voted_for(&self.local_peer.uuid)?;
            }

            let mut candidate_term = state.cmeta.current_term();
            if mode == ElectionMode::PreElection {
                candidate_term += 1;
            }

            let self_vote = VoteInfo {
                vote: Some(ElectionVote::Granted),
                last_known_leader: state.cmeta.last_known_leader().clone(),
                last_pruned_term: state.cmeta.last_pruned_term(),
                previous_vote_history: state.cmeta.previous_vote_history(),
                is_candidate_removed: false,
            };
            let mut counter: Box<dyn VoteCounter> = if flexi {
                Box::new(FlexibleVoteCounter::new(
                    self.local_peer.uuid.clone(),
                    candidate_term,
                    state.cmeta.last_known_leader().clone(),
                    active_config.clone(),
                    self.queue.adjust_voter_distribution(),
                    FlexibleQuorumOptions {
                        crowdsource_last_known_leader: self.options.crowdsource_last_known_leader,
                        trust_last_leader_entries: self.options.trust_last_leader_entries,
                        srd_strict_leader_election_quorum: self
                            .options
                            .srd_strict_leader_election_quorum,
                        include_candidate_region: self.options.include_candidate_region,
                        pessimistic_quorum_wait: self.options.pessimistic_quorum_wait,
                    },
                ))
            } else {
                let voters = active_config.count_voters();
                Box::new(MajorityVoteCounter::new(voters, majority_size(voters)))
            };
            let duplicate = counter.register_vote(&self.local_peer.uuid, self_vote)?;
            assert!(!duplicate, "duplicate self-vote");

            let request = VoteRequest {
                dest_uuid: String::new(),
                candidate_uuid: self.local_peer.uuid.clone(),
                candidate_term,
                candidate_last_received: self.log_cache.last_op_id(),
                is_pre_election: mode == ElectionMode::PreElection,
                ignore_live_leader: mode == ElectionMode::ElectEvenIfLeaderAlive,
                candidate_peer: active_config.peer(&self.local_peer.uuid).cloned(),
                raft_rpc_token: state.cmeta.raft_rpc_token().map(|s| s.to_string()),
            };

            let callback_handle = self.self_ref.clone();
            let callback_context = context.clone();
            let decision_cb: ElectionDecisionCallback = Box::new(move |result| {
                if let Some(core) = callback_handle.upgrade() {
                    core.election_callback(callback_context, result);
                }
            });
            LeaderElection::new(
                active_config,
                Arc::clone(&self.proxy_factory),
                request,
                counter,
                self.options.election_timeout,
                decision_cb,
            )
        };
        // Dispatch outside the replica lock.
        election.run();
        Ok(())
    }

    fn election_backoff_unlocked(&self, state: &ReplicaState) -> Duration {
        let failed = state
            .failed_elections_since_stable_leader
            .min(20)
            .max(0) as i32;
        let base = self.options.failure_detection_period();
        let factor = 1.1f64.powi(failed);
        let mut backoff = base.mul_f64(factor);
        if state.failed_elections_candidate_not_in_config > 0 {
            backoff = backoff.mul_f64(self.options.not_in_config_backoff_multiplier);
        }
        backoff.min(self.options.leader_failure_exp_backoff_max)
    }

    fn election_callback(self: Arc<Self>, context: ElectionContext, result: ElectionResult) {
        // The decision arrives on a transport or deadline thread; do the
        // state transition on a detached thread so neither is blocked on
        // the replica lock.
        let core = Arc::clone(&self);
        let spawned = thread::Builder::new()
            .name("raft-election-decision".into())
            .spawn(move || core.do_election_callback(&context, &result));
        if let Err(err) = spawned {
            error!("event=raft_election_callback_spawn_failed error={err}");
        }
    }

    fn do_election_callback(self: &Arc<Self>, context: &ElectionContext, result: &ElectionResult) {
        let election_term = result.vote_request.candidate_term;
        let was_pre_election = result.vote_request.is_pre_election;
        {
            let mut state = self.state.lock().unwrap();
            if self.check_running(&state).is_err() {
                info!(
                    "event=raft_election_callback_ignored term={election_term} reason=not_running"
                );
                return;
            }

            // Snooze on both outcomes: a winner is about to disable the
            // timer, a loser must not re-trigger immediately.
            if result.decision == ElectionVote::Denied && result.is_candidate_removed {
                state.failed_elections_candidate_not_in_config += 1;
            }
            let backoff = self.election_backoff_unlocked(&state);
            self.failure_detector.snooze(Some(backoff));

            if result.decision == ElectionVote::Denied {
                state.failed_elections_since_stable_leader += 1;
                self.metrics
                    .failed_elections_since_stable_leader
                    .store(state.failed_elections_since_stable_leader, Ordering::Relaxed);
                if result.highest_voter_term > state.cmeta.current_term() {
                    if let Err(err) =
                        self.handle_term_advance(&mut state, result.highest_voter_term, FlushPolicy::Flush)
                    {
                        warn!("event=raft_term_advance_failed error={err}");
                    }
                }
                info!(
                    "event=raft_election_lost term={election_term} pre_election={was_pre_election} reason={}",
                    result.message
                );
                return;
            }

            // Pre-elections collect votes for the next term.
            let election_started_in_term = if was_pre_election {
                election_term - 1
            } else {
                election_term
            };
            if election_started_in_term != state.cmeta.current_term() {
                info!(
                    "event=raft_election_decision_defunct term={election_started_in_term} current={}",
                    state.cmeta.current_term()
                );
                return;
            }
            if !state.cmeta.active_config().is_voter(&self.local_peer.uuid) {
                warn!("event=raft_election_won_but_not_voter term={election_term}");
                return;
            }
            if self.role_unlocked(&state) == RaftRole::Leader {
                // Possible pre/real interleaving: a pre-election decided
                // after the real election won. Ignore the pre-election.
                // A second real decision in our own current term has no
                // legal interleaving.
                if was_pre_election {
                    return;
                }
                panic!(
                    "real election callback for term {election_term} while already leader"
                );
            }

            if !was_pre_election {
                info!("event=raft_election_won term={election_term}");
                if let Err(err) = self.become_leader(&mut state) {
                    error!("event=raft_become_leader_failed error={err}");
                }
                return;
            }
        }
        // Won the pre-election: run the real one at the same term.
        info!("event=raft_pre_election_won term={election_term}");
        if let Err(err) = self.start_election(ElectionMode::Normal, context.clone()) {
            warn!("event=raft_election_after_pre_failed error={err}");
        }
    }

    fn become_leader(self: &Arc<Self>, state: &mut ReplicaState) -> Result<(), ConsensusError> {
        info!(
            "event=raft_become_leader uuid={} term={}",
            self.local_peer.uuid,
            state.cmeta.current_term()
        );
        self.failure_detector.disable();
        state.withhold_votes_until = Self::far_future();
        self.end_leader_transfer_period();

        state.cmeta.set_leader_uuid(&self.local_peer.uuid)?;
        state.failed_elections_since_stable_leader = 0;
        state.failed_elections_candidate_not_in_config = 0;
        let active_config = state.cmeta.active_config().clone();
        self.queue.set_leader_mode(
            state.pending.committed_index(),
            state.cmeta.current_term(),
            &active_config,
        );
        self.rebuild_routing(state);

        if self.options.disable_noop {
            return Ok(());
        }
        // Assert leadership with a NO_OP; committing it in this term
        // unlocks config changes and the committed-index gate.
        let round = Round::new(ReplicateMsg::noop(OpId::MIN), None);
        round.bind_term(state.cmeta.current_term());
        self.append_new_round_to_queue(state, &round)
    }

    fn become_replica(&self, state: &mut ReplicaState, fd_delta: Option<Duration>) {
        info!(
            "event=raft_become_replica uuid={} term={}",
            self.local_peer.uuid,
            state.cmeta.current_term()
        );
        state.cmeta.clear_leader();
        self.update_failure_detector_state(state, fd_delta);
        state.withhold_votes_until = Instant::now();
        let active_config = state.cmeta.active_config().clone();
        self.queue.set_non_leader_mode(&active_config);
        self.rebuild_routing(state);
    }

    /// Checks and applies a term advance; steps down first when leader.
    fn handle_term_advance(
        &self,
        state: &mut ReplicaState,
        new_term: i64,
        flush: FlushPolicy,
    ) -> Result<(), ConsensusError> {
        if new_term <= state.cmeta.current_term() {
            return Err(ConsensusError::illegal_state(format!(
                "cannot advance term to {new_term}: current is {}",
                state.cmeta.current_term()
            )));
        }
        if self.role_unlocked(state) == RaftRole::Leader {
            info!(
                "event=raft_step_down uuid={} old_term={} new_term={new_term}",
                self.local_peer.uuid,
                state.cmeta.current_term()
            );
            self.become_replica(state, None);
        } else {
            // The old term's leader is stale; the new term's leader is
            // learned from its first accepted update.
            state.cmeta.clear_leader();
        }
        info!("event=raft_term_advance term={new_term}");
        state.cmeta.set_current_term(new_term, flush)?;
        self.metrics.set_term(new_term);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Leader path
    // ------------------------------------------------------------------

    /// Creates a round for a client payload. Submit it via `replicate`.
    pub fn new_round(&self, msg: ReplicateMsg, cb: Option<ReplicatedCallback>) -> Arc<Round> {
        Round::new(msg, cb)
    }

    /// Leader-side replication entry point: binds the round to the
    /// current term, appends it to the pending set and the queue.
    pub fn replicate(&self, round: &Arc<Round>) -> Result<(), ConsensusError> {
        let _update = self.update_lock.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        self.check_running(&state)?;
        if self.role_unlocked(&state) != RaftRole::Leader {
            return Err(ConsensusError::illegal_state("replica is not leader"));
        }
        if self.leader_transfer_in_progress.load(Ordering::Acquire) {
            return Err(ConsensusError::ServiceUnavailable(
                "leader transfer in progress".to_string(),
            ));
        }
        round.bind_term(state.cmeta.current_term());
        self.append_new_round_to_queue(&mut state, round)
    }

    fn append_new_round_to_queue(
        &self,
        state: &mut ReplicaState,
        round: &Arc<Round>,
    ) -> Result<(), ConsensusError> {
        round.check_bound_term(state.cmeta.current_term())?;
        let id = self.queue.next_op_id();
        let mut msg = (*round.replicate_msg()).clone();
        msg.id = id;
        if msg.op_type == OpType::ChangeConfig {
            // The config-change op takes its own index as the config's
            // opid index.
            if let Some(record) = msg.change_config.as_mut() {
                record.new_config.opid_index = Some(id.index);
            }
        }
        let msg = Arc::new(msg);
        round.set_appended_msg(Arc::clone(&msg));

        self.add_pending_operation(state, round)?;
        self.queue.append_operations(
            std::slice::from_ref(&msg),
            Box::new(move |result| {
                if let Err(err) = result {
                    panic!("leader log append for {id} failed: {err}");
                }
            }),
        );
        Ok(())
    }

    /// Registers a round as pending. Config changes take effect here,
    /// on receipt, before commitment.
    fn add_pending_operation(
        &self,
        state: &mut ReplicaState,
        round: &Arc<Round>,
    ) -> Result<(), ConsensusError> {
        let msg = round.replicate_msg();
        if msg.op_type == OpType::ChangeConfig {
            let record = msg.change_config.as_ref().ok_or_else(|| {
                ConsensusError::invalid_argument("config change op without config record")
            })?;
            let new_config = record.new_config.clone();
            let committed_opid = state
                .cmeta
                .committed_config()
                .opid_index
                .unwrap_or(-1);
            if new_config.opid_index.unwrap_or(-1) > committed_opid {
                state.cmeta.set_pending_config(new_config)?;
                self.rebuild_routing(state);
                self.update_failure_detector_state(state, None);
                // New members must receive replication before the
                // change commits.
                if self.role_unlocked(state) == RaftRole::Leader {
                    let active_config = state.cmeta.active_config().clone();
                    self.queue.set_leader_mode(
                        state.pending.committed_index(),
                        state.cmeta.current_term(),
                        &active_config,
                    );
                }
            }
        }
        state.pending.add(Arc::clone(round))
    }

    /// Completes committed rounds: config-change bookkeeping, handler
    /// notification, and the round callback.
    fn round_replication_finished(
        &self,
        state: &mut ReplicaState,
        round: &Arc<Round>,
        result: Result<(), ConsensusError>,
    ) {
        if round.replicate_msg().is_consensus_only() {
            if round.op_type() == OpType::ChangeConfig {
                self.complete_config_change(state, round, &result);
            }
            if result.is_ok() {
                self.round_handler.finish_consensus_only_round(round);
            }
        }
        round.notify_replication_finished(result);
    }

    fn complete_config_change(
        &self,
        state: &mut ReplicaState,
        round: &Arc<Round>,
        result: &Result<(), ConsensusError>,
    ) {
        let msg = round.replicate_msg();
        let record = msg
            .change_config
            .as_ref()
            .expect("config change op without record");
        let op_id = msg.id;

        if result.is_err() {
            // Abort clears the pending config only when it is the one
            // this round installed.
            let aborted_matches_pending = state
                .cmeta
                .pending_config()
                .and_then(|c| c.opid_index)
                .map(|index| index == op_id.index)
                .unwrap_or(false);
            if aborted_matches_pending {
                info!("event=raft_config_change_aborted opid={op_id}");
                state.cmeta.clear_pending_config();
                self.rebuild_routing(state);
                self.update_failure_detector_state(state, None);
            }
            return;
        }

        let committed_opid = state.cmeta.committed_config().opid_index.unwrap_or(-1);
        if record.new_config.opid_index.unwrap_or(-1) <= committed_opid {
            info!(
                "event=raft_config_change_commit_ignored opid={op_id} committed_opid_index={committed_opid}"
            );
            return;
        }
        let removed = removed_peer_uuids(&record.old_config, &record.new_config);
        if let Err(err) = state.cmeta.set_committed_config(record.new_config.clone()) {
            error!("event=raft_config_commit_failed opid={op_id} error={err}");
            return;
        }
        if self.options.track_removed_peers && !removed.is_empty() {
            state.cmeta.add_removed_peers(&removed);
        }
        self.rebuild_routing(state);
        self.update_failure_detector_state(state, None);
        if self.role_unlocked(state) == RaftRole::Leader {
            let active_config = state.cmeta.active_config().clone();
            self.queue.set_leader_mode(
                state.pending.committed_index(),
                state.cmeta.current_term(),
                &active_config,
            );
        }
    }

    fn advance_committed_unlocked(&self, state: &mut ReplicaState, index: i64) {
        let completed = state.pending.advance_committed_index(index);
        for round in completed {
            self.round_replication_finished(state, &round, Ok(()));
        }
    }

    fn truncate_and_abort_ops_after(&self, state: &mut ReplicaState, truncate_after: i64) {
        let doomed = state.pending.abort_ops_after(truncate_after);
        for round in doomed {
            let id = round.id();
            self.round_replication_finished(
                state,
                &round,
                Err(ConsensusError::Aborted(format!(
                    "op {id} aborted by new leader"
                ))),
            );
        }
        self.queue.truncate_ops_after(truncate_after);
        self.metrics.raft_log_truncations.fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Follower path
    // ------------------------------------------------------------------

    fn check_rpc_token(&self, token: Option<&str>) -> Result<(), ConsensusError> {
        if !self.options.enforce_rpc_token {
            return Ok(());
        }
        let state = self.state.lock().unwrap();
        let ours = state.cmeta.raft_rpc_token();
        if ours != token {
            return Err(ConsensusError::invalid_argument(
                "raft rpc token mismatch".to_string(),
            ));
        }
        Ok(())
    }

    /// AppendEntries: stores the leader's operations and advances the
    /// committed index. Blocks until the accepted ops are durable.
    pub fn update(&self, request: &ConsensusRequest) -> Result<ConsensusResponse, ConsensusError> {
        if self.reject_append_entries_for_tests.load(Ordering::Relaxed) {
            return Err(ConsensusError::illegal_state(
                "append entries rejected for tests",
            ));
        }
        self.check_rpc_token(request.raft_rpc_token.as_deref())?;
        let _update = self.update_lock.lock().unwrap();
        self.update_replica(request)
    }

    fn update_replica(
        &self,
        request: &ConsensusRequest,
    ) -> Result<ConsensusResponse, ConsensusError> {
        // Ordering is crucial: prepares start before the log append; a
        // failed prepare truncates the batch tail; the append must not
        // fail once a prepare succeeded; applies trigger only after both.
        let synchronizer = LogSynchronizer::new();
        let has_messages;
        let response = {
            let mut state = self.state.lock().unwrap();
            self.check_running(&state)?;
            if !state.cmeta.active_config().is_member(&self.local_peer.uuid) {
                info!("event=raft_update_from_non_member uuid={}", self.local_peer.uuid);
            }

            let mut deduped = self.deduplicate_leader_request(&state, request);

            // Out-of-sequence batches are a caller bug, not a state
            // change.
            let mut prev = deduped.preceding_id;
            for msg in &deduped.messages {
                PendingRounds::check_op_in_sequence(prev, msg.id)?;
                prev = msg.id;
            }

            // Term check.
            if request.caller_term < state.cmeta.current_term() {
                let message = format!(
                    "rejecting update from {} for earlier term {} (current {})",
                    request.caller_uuid,
                    request.caller_term,
                    state.cmeta.current_term()
                );
                info!("event=raft_update_invalid_term {message}");
                return Ok(self.consensus_response_error(
                    &state,
                    ConsensusErrorCode::InvalidTerm,
                    message,
                ));
            }
            if request.caller_term > state.cmeta.current_term() {
                self.handle_term_advance(&mut state, request.caller_term, FlushPolicy::Flush)?;
            }

            // Log matching property.
            let mut term_mismatch = false;
            if !state
                .pending
                .is_op_committed_or_pending(deduped.preceding_id, &mut term_mismatch)
            {
                let message = format!(
                    "log matching property violated: preceding {} not found locally (tail {}, {} mismatch)",
                    deduped.preceding_id,
                    self.log_cache.last_op_id(),
                    if term_mismatch { "term" } else { "index" }
                );
                info!("event=raft_update_lmp_mismatch {message}");
                if term_mismatch {
                    // Abort down to the index before the leader's
                    // preceding op: nothing past it can survive.
                    self.truncate_and_abort_ops_after(
                        &mut state,
                        deduped.preceding_id.index - 1,
                    );
                }
                return Ok(self.consensus_response_error(
                    &state,
                    ConsensusErrorCode::PrecedingEntryDidntMatch,
                    message,
                ));
            }

            // A first message that replaces an in-flight suffix aborts
            // it down to the preceding op.
            if let Some(first) = deduped.messages.first() {
                let mut first_term_mismatch = false;
                let known = state
                    .pending
                    .is_op_committed_or_pending(first.id, &mut first_term_mismatch);
                assert!(!known, "deduplicated op {} still pending", first.id);
                if first_term_mismatch {
                    self.truncate_and_abort_ops_after(&mut state, deduped.preceding_id.index);
                }
            }

            // The sender is the effective leader of this term.
            let known_leader = state.cmeta.leader_uuid().map(|s| s.to_string());
            match known_leader {
                Some(leader) if leader != request.caller_uuid => {
                    panic!(
                        "unexpected new leader in same term: had {leader}, got {}",
                        request.caller_uuid
                    );
                }
                Some(_) => {}
                None => {
                    state.cmeta.set_leader_uuid(&request.caller_uuid)?;
                    self.update_failure_detector_state(&state, None);
                    self.rebuild_routing(&state);
                }
            }

            self.failure_detector.snooze(None);
            state.withhold_votes_until =
                Instant::now() + self.options.minimum_election_timeout();
            state.failed_elections_since_stable_leader = 0;
            state.failed_elections_candidate_not_in_config = 0;
            self.queue
                .update_last_index_appended_to_leader(request.last_idx_appended_to_leader);

            // Early apply: commit as much as safely possible before the
            // expensive steps.
            let early_apply_up_to = state
                .pending
                .last_pending_op_id()
                .index
                .min(deduped.preceding_id.index)
                .min(request.committed_index);
            self.advance_committed_unlocked(&mut state, early_apply_up_to);

            // Memory pressure rejects the batch before prepares begin.
            if !deduped.messages.is_empty() {
                if let Some(check) = &self.options.memory_pressure {
                    if let Some(capacity_pct) = check() {
                        self.metrics
                            .follower_memory_pressure_rejections
                            .fetch_add(1, Ordering::Relaxed);
                        return Err(ConsensusError::ServiceUnavailable(format!(
                            "soft memory limit exceeded ({capacity_pct:.2}% of capacity)"
                        )));
                    }
                }
            }

            // Start prepares; stop at the first failure and drop the
            // tail of the batch.
            let mut prepare_failure: Option<ConsensusError> = None;
            let mut prepared = 0usize;
            for msg in &deduped.messages {
                match self.start_follower_round(&mut state, msg) {
                    Ok(()) => prepared += 1,
                    Err(err) => {
                        prepare_failure = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = prepare_failure {
                warn!(
                    "event=raft_update_prepare_failed prepared={prepared} dropped={} error={err}",
                    deduped.messages.len() - prepared
                );
                deduped.messages.truncate(prepared);
                if deduped.messages.is_empty() {
                    let message = format!(
                        "could not prepare a single operation: {err}"
                    );
                    return Ok(self.consensus_response_error(
                        &state,
                        ConsensusErrorCode::CannotPrepare,
                        message,
                    ));
                }
            }

            // Durable append of what survived.
            let last_from_leader = if let Some(last) = deduped.messages.last() {
                self.queue
                    .append_operations(&deduped.messages, synchronizer.callback());
                last.id
            } else {
                deduped.preceding_id
            };

            // Never apply past what this request carried.
            let apply_up_to = last_from_leader.index.min(request.committed_index);
            self.advance_committed_unlocked(&mut state, apply_up_to);
            self.queue.update_follower_watermarks(
                apply_up_to,
                request.all_replicated_index,
                request.region_durable_index,
            );
            state.last_received_cur_leader = last_from_leader;

            has_messages = !deduped.messages.is_empty();
            self.consensus_response_ok(&state)
        };

        // Wait for durability outside the replica lock so commits can
        // flow. Snooze while waiting on our own fsync.
        if has_messages {
            loop {
                match synchronizer.wait(self.options.heartbeat_interval) {
                    Some(result) => {
                        result?;
                        break;
                    }
                    None => self.failure_detector.snooze(None),
                }
            }
        }
        Ok(response)
    }

    /// Drops ops the replica already has, advancing the preceding id
    /// accordingly. Makes `update` idempotent against replays.
    fn deduplicate_leader_request(
        &self,
        state: &ReplicaState,
        request: &ConsensusRequest,
    ) -> LeaderRequest {
        let committed_index = state.pending.committed_index();
        let mut dedup_up_to = self.log_cache.last_op_id().index;
        let mut deduped = LeaderRequest {
            preceding_id: request.preceding_id,
            messages: Vec::new(),
        };
        for msg in &request.ops {
            if msg.id.index <= committed_index {
                deduped.preceding_id = msg.id;
                continue;
            }
            if msg.id.index <= dedup_up_to {
                if let Some(round) = state.pending.pending_by_index(msg.id.index) {
                    if round.id() == msg.id {
                        deduped.preceding_id = msg.id;
                        continue;
                    }
                }
                // Same index, different term: everything from here on is
                // new.
                dedup_up_to = msg.id.index;
            }
            deduped.messages.push(Arc::clone(msg));
        }
        if deduped.messages.len() != request.ops.len() {
            info!(
                "event=raft_update_deduplicated original={} remaining={}",
                request.ops.len(),
                deduped.messages.len()
            );
        }
        deduped
    }

    fn start_follower_round(
        &self,
        state: &mut ReplicaState,
        msg: &Arc<ReplicateMsg>,
    ) -> Result<(), ConsensusError> {
        msg.validate_payload_crc()?;
        let round = Round::from_appended(Arc::clone(msg), None);
        if msg.is_consensus_only() {
            self.round_handler.start_consensus_only_round(Arc::clone(&round))?;
        } else {
            self.round_handler.start_follower_round(Arc::clone(&round))?;
        }
        self.add_pending_operation(state, &round)
    }

    fn consensus_response_ok(&self, state: &ReplicaState) -> ConsensusResponse {
        ConsensusResponse {
            responder_uuid: self.local_peer.uuid.clone(),
            responder_term: state.cmeta.current_term(),
            status: ConsensusStatus {
                last_received: self.log_cache.last_op_id(),
                last_received_current_leader: state.last_received_cur_leader,
                last_committed_idx: state.pending.committed_index(),
                error: None,
            },
        }
    }

    fn consensus_response_error(
        &self,
        state: &ReplicaState,
        code: ConsensusErrorCode,
        message: String,
    ) -> ConsensusResponse {
        let mut response = self.consensus_response_ok(state);
        response.status.error = Some(ConsensusStatusError { code, message });
        response
    }

    // ------------------------------------------------------------------
    // RequestVote
    // ------------------------------------------------------------------

    /// Handles a vote request. `tombstone_last_logged_opid` allows
    /// voting from non-running pre-shutdown states.
    pub fn request_vote(
        &self,
        request: &VoteRequest,
        tombstone_last_logged_opid: Option<OpId>,
    ) -> Result<VoteResponse, ConsensusError> {
        self.check_rpc_token(request.raft_rpc_token.as_deref())?;

        // A vote request racing a live leader's update would just reset
        // the timer and produce a NO after waiting; reply busy instead
        // of starving the RPC handler. Without failure detection there
        // is no retry, so block.
        let _update = if !request.ignore_live_leader {
            match self.update_lock.try_lock() {
                Ok(guard) => Some(guard),
                Err(TryLockError::WouldBlock) => {
                    let state = self.state.lock().unwrap();
                    return Ok(self.vote_response_denied(
                        &state,
                        ConsensusErrorCode::ConsensusBusy,
                        "replica is servicing another vote or update".to_string(),
                    ));
                }
                Err(TryLockError::Poisoned(_)) => {
                    return Err(ConsensusError::illegal_state("update lock poisoned"));
                }
            }
        } else {
            Some(match self.update_lock.lock() {
                Ok(guard) => guard,
                Err(_) => return Err(ConsensusError::illegal_state("update lock poisoned")),
            })
        };

        let mut state = self.state.lock().unwrap();

        let local_last_logged = match state.lifecycle {
            Lifecycle::Shutdown => {
                return Err(ConsensusError::illegal_state("cannot vote while shut down"))
            }
            Lifecycle::Running => self.log_cache.last_op_id(),
            _ => match tombstone_last_logged_opid {
                Some(op) => op,
                None => {
                    return Err(ConsensusError::illegal_state(
                        "must be running to vote when last-logged opid is not known",
                    ))
                }
            },
        };

        let is_candidate_member = state
            .cmeta
            .active_config()
            .is_member(&request.candidate_uuid);
        let is_candidate_removed =
            !is_candidate_member && state.cmeta.is_peer_removed(&request.candidate_uuid);
        if !is_candidate_member {
            info!(
                "event=raft_vote_from_unknown_peer candidate={} removed={is_candidate_removed}",
                request.candidate_uuid
            );
        }

        if self.withhold_votes_for_tests.load(Ordering::Relaxed) {
            let mut response = self.vote_response_denied(
                &state,
                ConsensusErrorCode::VoteWithheld,
                "votes are being withheld for testing".to_string(),
            );
            response.is_candidate_removed = is_candidate_removed;
            return Ok(response);
        }

        // Anti-disruption: a heartbeat from a live leader within the
        // minimum election timeout wins over any candidate.
        if !request.ignore_live_leader && Instant::now() < state.withhold_votes_until {
            let mut response = self.vote_response_denied(
                &state,
                ConsensusErrorCode::LeaderIsAlive,
                format!(
                    "replica is either leader or believes a valid leader to be alive; candidate {}",
                    request.candidate_uuid
                ),
            );
            response.is_candidate_removed = is_candidate_removed;
            return Ok(response);
        }

        if request.candidate_term < state.cmeta.current_term() {
            let mut response = self.vote_response_denied(
                &state,
                ConsensusErrorCode::InvalidTerm,
                format!(
                    "candidate term {} is behind current term {}",
                    request.candidate_term,
                    state.cmeta.current_term()
                ),
            );
            response.is_candidate_removed = is_candidate_removed;
            return Ok(response);
        }

        if request.candidate_term == state.cmeta.current_term()
            && state.cmeta.has_voted_current_term()
        {
            let voted_for = state.cmeta.voted_for().unwrap_or("").to_string();
            let mut response = if voted_for == request.candidate_uuid {
                // Duplicate request: re-grant the same vote.
                self.vote_response_granted(&state)
            } else {
                self.vote_response_denied(
                    &state,
                    ConsensusErrorCode::AlreadyVotedForOther,
                    format!("already voted for {voted_for} in this term"),
                )
            };
            response.is_candidate_removed = is_candidate_removed;
            return Ok(response);
        }

        let mut vote_yes = request.candidate_last_received >= local_last_logged;

        // Flexi-raft lag heuristic: a same-region voter lagging far
        // behind the candidate would stall the no-op commit; withhold.
        if vote_yes {
            if let Some(threshold) = self.options.lag_threshold_for_request_vote {
                if self.options.enable_flexi_raft {
                    let committed = state.cmeta.committed_config();
                    let srd_mode =
                        committed.commit_rule.mode == QuorumMode::SingleRegionDynamic;
                    let candidate_region = request
                        .candidate_peer
                        .as_ref()
                        .map(|p| p.region.clone())
                        .unwrap_or_default();
                    if srd_mode
                        && !candidate_region.is_empty()
                        && candidate_region == self.local_peer.region
                    {
                        let lag =
                            request.candidate_last_received.index - local_last_logged.index;
                        if lag > threshold {
                            let mut response = self.vote_response_denied(
                                &state,
                                ConsensusErrorCode::VoteWithheld,
                                format!(
                                    "votes withheld for excessive lag {lag} > {threshold}"
                                ),
                            );
                            response.is_candidate_removed = is_candidate_removed;
                            return Ok(response);
                        }
                    }
                }
            }
        }

        // Term advance is skipped for pre-elections: the pre-candidate
        // may be probing while the prior term's leader is settling in.
        if !request.is_pre_election && request.candidate_term > state.cmeta.current_term() {
            let flush = if vote_yes {
                // The vote persist below flushes.
                FlushPolicy::SkipFlush
            } else {
                FlushPolicy::Flush
            };
            self.handle_term_advance(&mut state, request.candidate_term, flush)?;
        }

        if !vote_yes {
            let mut response = self.vote_response_denied(
                &state,
                ConsensusErrorCode::LastOpIdTooOld,
                format!(
                    "candidate last-logged {} is behind local {}",
                    request.candidate_last_received, local_last_logged
                ),
            );
            response.is_candidate_removed = is_candidate_removed;
            return Ok(response);
        }

        // Granting: snooze around the durable vote so the fsync latency
        // cannot fire the detector.
        self.failure_detector.snooze(None);
        if !request.is_pre_election {
            state.cmeta.set_voted_for(&request.candidate_uuid)?;
        }
        self.failure_detector.snooze(None);
        info!(
            "event=raft_vote_granted candidate={} term={} pre_election={}",
            request.candidate_uuid,
            request.candidate_term,
            request.is_pre_election
        );
        let mut response = self.vote_response_granted(&state);
        response.is_candidate_removed = is_candidate_removed;
        Ok(response)
    }

    fn vote_response_base(&self, state: &ReplicaState, granted: bool) -> VoteResponse {
        VoteResponse {
            responder_uuid: self.local_peer.uuid.clone(),
            responder_term: state.cmeta.current_term(),
            vote_granted: granted,
            consensus_error: None,
            previous_vote_history: state.cmeta.previous_vote_history(),
            last_pruned_term: state.cmeta.last_pruned_term(),
            last_known_leader: state.cmeta.last_known_leader().clone(),
            is_candidate_removed: false,
        }
    }

    fn vote_response_granted(&self, state: &ReplicaState) -> VoteResponse {
        self.vote_response_base(state, true)
    }

    fn vote_response_denied(
        &self,
        state: &ReplicaState,
        code: ConsensusErrorCode,
        message: String,
    ) -> VoteResponse {
        info!("event=raft_vote_denied code={code:?} reason={message}");
        let mut response = self.vote_response_base(state, false);
        response.consensus_error = Some(ConsensusStatusError { code, message });
        response
    }

    /// A peer asked us to start an election right away (leadership
    /// hand-off).
    pub fn handle_start_election_request(
        self: &Arc<Self>,
        request: &StartElectionRequest,
    ) -> Result<(), ConsensusError> {
        if request.dest_uuid != self.local_peer.uuid {
            return Err(ConsensusError::invalid_argument(format!(
                "start-election request for {} arrived at {}",
                request.dest_uuid, self.local_peer.uuid
            )));
        }
        let mut context = ElectionContext::new(ElectionReason::ExternalRequest);
        context.source_uuid = request.caller_uuid.clone();
        self.start_election(ElectionMode::ElectEvenIfLeaderAlive, context)
    }

    // ------------------------------------------------------------------
    // Peer exchange plumbing (driven by the host transport pump)
    // ------------------------------------------------------------------

    /// Builds the next replication request for a peer.
    pub fn request_for_peer(
        &self,
        uuid: &str,
        read_ops: bool,
    ) -> Result<crate::queue::PeerRequest, ConsensusError> {
        let mut request = self.queue.request_for_peer(uuid, read_ops)?;
        request.request.raft_rpc_token = self
            .state
            .lock()
            .unwrap()
            .cmeta
            .raft_rpc_token()
            .map(|s| s.to_string());
        Ok(request)
    }

    /// Feeds a peer's response back into the queue.
    pub fn handle_peer_response(&self, uuid: &str, response: &ConsensusResponse) -> bool {
        self.queue.response_from_peer(uuid, response)
    }

    // ------------------------------------------------------------------
    // Configuration change
    // ------------------------------------------------------------------

    /// Single-change convenience wrapper around `bulk_change_config`.
    pub fn change_config(
        &self,
        change: ConfigChangeItem,
        cas_config_opid_index: Option<i64>,
        client_cb: Option<ReplicatedCallback>,
    ) -> Result<(), ConfigChangeError> {
        self.bulk_change_config(
            ChangeConfigRequest {
                changes: vec![change],
                cas_config_opid_index,
            },
            client_cb,
        )
    }

    /// Validates and replicates a configuration change. One VOTER-status
    /// modification per request; the new config becomes pending on
    /// receipt.
    pub fn bulk_change_config(
        &self,
        request: ChangeConfigRequest,
        client_cb: Option<ReplicatedCallback>,
    ) -> Result<(), ConfigChangeError> {
        let mut state = self.state.lock().unwrap();
        self.check_running(&state)?;
        if self.role_unlocked(&state) != RaftRole::Leader {
            return Err(ConfigChangeError::new(
                ServerErrorCode::NotTheLeader,
                ConsensusError::illegal_state("replica is not leader"),
            ));
        }
        if self.leader_transfer_in_progress.load(Ordering::Acquire) {
            return Err(ConfigChangeError::new(
                ServerErrorCode::UnknownError,
                ConsensusError::ServiceUnavailable("leader transfer in progress".to_string()),
            ));
        }
        if state.cmeta.has_pending_config() {
            return Err(ConfigChangeError::new(
                ServerErrorCode::UnknownError,
                ConsensusError::illegal_state("a config change is already pending"),
            ));
        }
        // Raft requires a committed op in the leader's own term before
        // any config change.
        if !self.queue.is_committed_index_in_current_term() {
            return Err(ConfigChangeError::new(
                ServerErrorCode::UnknownError,
                ConsensusError::illegal_state(
                    "leader has not yet committed an operation in its own term",
                ),
            ));
        }

        let committed_config = state.cmeta.committed_config().clone();
        if let Some(cas_index) = request.cas_config_opid_index {
            let committed_opid = committed_config.opid_index.unwrap_or(-1);
            if committed_opid != cas_index {
                return Err(ConfigChangeError::new(
                    ServerErrorCode::CasFailed,
                    ConsensusError::illegal_state(format!(
                        "request specified cas_config_opid_index of {cas_index} but the committed config has opid_index of {committed_opid}"
                    )),
                ));
            }
        }

        let new_config = self.build_new_config(&state, &committed_config, &request)?;

        let record = ChangeConfigRecord {
            old_config: committed_config,
            new_config,
        };
        let round = Round::new(ReplicateMsg::change_config(record), client_cb);
        round.bind_term(state.cmeta.current_term());
        self.append_new_round_to_queue(&mut state, &round)
            .map_err(ConfigChangeError::from)?;
        Ok(())
    }

    fn build_new_config(
        &self,
        state: &ReplicaState,
        committed_config: &RaftConfig,
        request: &ChangeConfigRequest,
    ) -> Result<RaftConfig, ConfigChangeError> {
        let invalid = |msg: String| {
            ConfigChangeError::new(
                ServerErrorCode::InvalidConfig,
                ConsensusError::InvalidArgument(msg),
            )
        };
        let mut new_config = committed_config.clone();
        let mut num_voters_modified = 0usize;
        let mut peers_modified: std::collections::BTreeSet<String> =
            std::collections::BTreeSet::new();

        for item in &request.changes {
            if item.peer_uuid.is_empty() {
                return Err(invalid("peer must have a uuid specified".to_string()));
            }
            if !peers_modified.insert(item.peer_uuid.clone()) {
                return Err(invalid(format!(
                    "only one change allowed per peer: {} appears more than once",
                    item.peer_uuid
                )));
            }
            match item.change_type {
                ConfigChangeType::AddPeer => {
                    let peer = item
                        .peer
                        .clone()
                        .ok_or_else(|| invalid("ADD_PEER requires a full peer record".into()))?;
                    if committed_config.is_member(&peer.uuid) {
                        return Err(invalid(format!(
                            "server {} is already a member of the config",
                            peer.uuid
                        )));
                    }
                    if peer.address.is_empty() {
                        return Err(invalid("peer must have an address specified".into()));
                    }
                    let use_quorum_id = committed_config.commit_rule.use_quorum_id;
                    if peer.is_voter() {
                        if self.options.enable_flexi_raft && use_quorum_id {
                            if peer.quorum_id.as_deref().unwrap_or("").is_empty() {
                                return Err(invalid(
                                    "peer must have a non-empty quorum_id in quorum-id mode"
                                        .into(),
                                ));
                            }
                        }
                        num_voters_modified += 1;
                    } else if peer.quorum_id.is_some() {
                        return Err(invalid("non-voter must not have a quorum_id".into()));
                    }
                    if self.options.enable_flexi_raft
                        && use_quorum_id
                        && !self.options.allow_multiple_backed_by_db_per_quorum
                        && peer.backed_by_db
                    {
                        let quorum_id = committed_config.quorum_id_of(&peer);
                        let counts = committed_config.live_voter_counts(true);
                        if counts.get(&quorum_id).copied().unwrap_or(0) >= 1 {
                            return Err(ConfigChangeError::new(
                                ServerErrorCode::InvalidConfig,
                                ConsensusError::AlreadyPresent(format!(
                                    "quorum {quorum_id} already has a db-backed voter"
                                )),
                            ));
                        }
                    }
                    new_config.peers.push(peer);
                }
                ConfigChangeType::RemovePeer => {
                    if item.peer_uuid == self.local_peer.uuid {
                        return Err(invalid(format!(
                            "cannot remove peer {} from the config because it is the leader",
                            item.peer_uuid
                        )));
                    }
                    if !new_config.remove_peer(&item.peer_uuid) {
                        return Err(ConfigChangeError::new(
                            ServerErrorCode::InvalidConfig,
                            ConsensusError::NotFound(format!(
                                "server {} not a member of the config",
                                item.peer_uuid
                            )),
                        ));
                    }
                    if committed_config.is_voter(&item.peer_uuid) {
                        num_voters_modified += 1;
                        self.check_voter_removal_quorum(state, committed_config, &item.peer_uuid)?;
                    }
                }
                ConfigChangeType::ModifyPeer => {
                    let modified = new_config.peer_mut(&item.peer_uuid).ok_or_else(|| {
                        ConfigChangeError::new(
                            ServerErrorCode::InvalidConfig,
                            ConsensusError::NotFound(format!(
                                "server {} not a member of the config",
                                item.peer_uuid
                            )),
                        )
                    })?;
                    let original = modified.clone();
                    if let Some(member_type) = item.new_member_type {
                        if member_type != modified.member_type {
                            num_voters_modified += 1;
                            if item.peer_uuid == self.local_peer.uuid {
                                return Err(invalid(
                                    "cannot modify member type of the leader".into(),
                                ));
                            }
                            modified.member_type = member_type;
                        }
                    }
                    if let Some(promote) = item.new_attrs_promote {
                        modified.attrs.promote = promote;
                    }
                    if let Some(replace) = item.new_attrs_replace {
                        modified.attrs.replace = replace;
                    }
                    if *modified == original {
                        return Err(invalid(
                            "must modify a field when calling MODIFY_PEER".into(),
                        ));
                    }
                }
            }
        }

        if new_config == *committed_config {
            return Err(invalid(
                "requested configuration change does not actually modify the config".into(),
            ));
        }
        if num_voters_modified > 1 {
            return Err(invalid(
                "it is not safe to modify the VOTER status of more than one peer at a time"
                    .into(),
            ));
        }
        new_config.opid_index = None;
        new_config.unsafe_config_change = false;
        Ok(new_config)
    }

    /// In single-region-dynamic mode, removing a voter from the leader's
    /// own region must not drop the region below its expected majority.
    fn check_voter_removal_quorum(
        &self,
        _state: &ReplicaState,
        committed_config: &RaftConfig,
        removed_uuid: &str,
    ) -> Result<(), ConfigChangeError> {
        if !self.options.enable_flexi_raft {
            return Ok(());
        }
        let srd_mode =
            committed_config.commit_rule.mode == QuorumMode::SingleRegionDynamic;
        let Some(removed_peer) = committed_config.peer(removed_uuid) else {
            return Ok(());
        };
        let quorum_id = committed_config.quorum_id_of(removed_peer);
        if srd_mode {
            let leader_quorum = committed_config
                .peer(&self.local_peer.uuid)
                .map(|p| committed_config.quorum_id_of(p))
                .unwrap_or_default();
            if quorum_id != leader_quorum {
                return Ok(());
            }
        }
        let live_counts = committed_config.live_voter_counts(false);
        let current = live_counts.get(&quorum_id).copied().unwrap_or(0);
        let future = current - 1;
        if let Some(&expected) = committed_config.voter_distribution.get(&quorum_id) {
            let quorum = majority_size(expected.max(0) as usize) as i32;
            if future < quorum {
                return Err(ConfigChangeError::new(
                    ServerErrorCode::InvalidConfig,
                    ConsensusError::invalid_argument(format!(
                        "cannot remove a voter in quorum {quorum_id}: future voter count {future} dips below expected majority {quorum}"
                    )),
                ));
            }
        }
        Ok(())
    }

    /// Forces a new config by synthesizing a request from a pseudo
    /// leader at term + 1 and feeding it through the normal update path.
    pub fn unsafe_change_config(
        &self,
        request: &UnsafeChangeConfigRequest,
    ) -> Result<(), ConfigChangeError> {
        if request.caller_id.is_empty() {
            return Err(ConfigChangeError::new(
                ServerErrorCode::InvalidConfig,
                ConsensusError::invalid_argument("caller_id is required"),
            ));
        }
        let (current_term, committed_config, committed_index, all_replicated, preceding_opid) = {
            let state = self.state.lock().unwrap();
            if state.cmeta.has_pending_config() {
                warn!(
                    "event=raft_unsafe_config_change_with_pending pending_opid_index={:?}",
                    state.cmeta.pending_config().and_then(|c| c.opid_index)
                );
            }
            (
                state.cmeta.current_term(),
                state.cmeta.committed_config().clone(),
                state.pending.committed_index(),
                self.queue.all_replicated_index(),
                self.log_cache.last_op_id(),
            )
        };

        let retained: std::collections::BTreeSet<&String> =
            request.retained_peer_uuids.iter().collect();
        for uuid in &request.retained_peer_uuids {
            if !committed_config.is_member(uuid) {
                return Err(ConfigChangeError::new(
                    ServerErrorCode::InvalidConfig,
                    ConsensusError::invalid_argument(format!(
                        "peer {uuid} is not in the committed config on this replica"
                    )),
                ));
            }
        }
        let mut new_config = committed_config.clone();
        new_config
            .peers
            .retain(|p| retained.contains(&p.uuid));
        if !new_config.is_voter(&self.local_peer.uuid) {
            return Err(ConfigChangeError::new(
                ServerErrorCode::InvalidConfig,
                ConsensusError::invalid_argument(
                    "local replica must be a voter in the new config",
                ),
            ));
        }
        new_config.unsafe_config_change = true;
        let new_term = current_term + 1;
        let opid_index = preceding_opid.index + 1;
        new_config.opid_index = Some(opid_index);
        new_config.validate().map_err(|err| {
            ConfigChangeError::new(ServerErrorCode::InvalidConfig, err)
        })?;

        warn!(
            "event=raft_unsafe_config_change caller={} new_term={new_term} opid_index={opid_index}",
            request.caller_id
        );

        let mut msg = ReplicateMsg::change_config(ChangeConfigRecord {
            old_config: committed_config,
            new_config,
        });
        msg.id = OpId::new(new_term, opid_index);
        let consensus_request = ConsensusRequest {
            dest_uuid: self.local_peer.uuid.clone(),
            caller_uuid: request.caller_id.clone(),
            caller_term: new_term,
            preceding_id: preceding_opid,
            ops: vec![Arc::new(msg)],
            committed_index,
            all_replicated_index: all_replicated,
            region_durable_index: 0,
            last_idx_appended_to_leader: opid_index,
            raft_rpc_token: None,
            proxy_dest_uuid: None,
            proxy_caller_uuid: None,
            proxy_hops_remaining: 0,
        };
        let response = self
            .update(&consensus_request)
            .map_err(ConfigChangeError::from)?;
        if let Some(error) = response.status.error {
            return Err(ConfigChangeError::new(
                ServerErrorCode::UnknownError,
                ConsensusError::illegal_state(error.message),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Leadership transfer / step down
    // ------------------------------------------------------------------

    /// Abrupt step-down: advance our own term and become a follower.
    pub fn step_down(&self) -> Result<(), ConsensusError> {
        let mut state = self.state.lock().unwrap();
        self.check_running(&state)?;
        if self.role_unlocked(&state) != RaftRole::Leader {
            info!("event=raft_step_down_rejected reason=not_leader");
            return Err(ConsensusError::illegal_state("not currently leader"));
        }
        info!("event=raft_step_down_requested uuid={}", self.local_peer.uuid);
        let next_term = state.cmeta.current_term() + 1;
        self.handle_term_advance(&mut state, next_term, FlushPolicy::SkipFlush)?;
        // Give another replica a clear run at the election.
        self.failure_detector
            .snooze(Some(self.options.minimum_election_timeout() * 2));
        Ok(())
    }

    /// Graceful transfer: stop accepting writes for one election
    /// timeout while followers catch up; the queue signals the chosen
    /// successor to start an election.
    pub fn transfer_leadership(
        &self,
        new_leader_uuid: Option<String>,
        filter: Option<SuccessorFilter>,
        context: &ElectionContext,
    ) -> Result<(), ConsensusError> {
        let state = self.state.lock().unwrap();
        self.check_running(&state)?;
        if self.role_unlocked(&state) != RaftRole::Leader {
            return Err(ConsensusError::illegal_state("not currently leader"));
        }
        if let Some(uuid) = &new_leader_uuid {
            if *uuid == self.local_peer.uuid {
                return Ok(());
            }
            if !state.cmeta.active_config().is_voter(uuid) {
                return Err(ConsensusError::invalid_argument(format!(
                    "server {uuid} is not a voter in the active config"
                )));
            }
        }
        info!(
            "event=raft_transfer_leadership target={}",
            new_leader_uuid.as_deref().unwrap_or("<any>")
        );
        self.begin_leader_transfer_period(new_leader_uuid, filter, context)
    }

    fn begin_leader_transfer_period(
        &self,
        successor_uuid: Option<String>,
        filter: Option<SuccessorFilter>,
        context: &ElectionContext,
    ) -> Result<(), ConsensusError> {
        if self
            .leader_transfer_in_progress
            .swap(true, Ordering::AcqRel)
        {
            return Err(ConsensusError::ServiceUnavailable(
                "leadership transfer already in progress".to_string(),
            ));
        }
        self.queue
            .begin_watch_for_successor(successor_uuid, filter, context.transfer_context());

        // One-shot transfer-period timer.
        let generation = self.transfer_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let period = self.options.election_timeout;
        let handle = self.self_ref.clone();
        thread::Builder::new()
            .name("raft-transfer-period".into())
            .spawn(move || {
                thread::sleep(period);
                if let Some(core) = handle.upgrade() {
                    if core.transfer_generation.load(Ordering::Acquire) == generation {
                        info!("event=raft_transfer_period_expired");
                        core.end_leader_transfer_period();
                    }
                }
            })
            .map_err(|err| ConsensusError::illegal_state(err.to_string()))?;
        Ok(())
    }

    pub fn end_leader_transfer_period(&self) {
        self.transfer_generation.fetch_add(1, Ordering::AcqRel);
        self.queue.end_watch_for_successor();
        self.leader_transfer_in_progress
            .store(false, Ordering::Release);
    }

    /// Effective only if no successor has been told to start an
    /// election yet.
    pub fn cancel_transfer_leadership(&self) -> Result<(), ConsensusError> {
        let notified = self.queue.watch_for_successor_peer_notified();
        self.end_leader_transfer_period();
        if notified {
            return Err(ConsensusError::illegal_state(
                "transfer cannot be cancelled, a peer was already notified to start an election",
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hot-updatable knobs
    // ------------------------------------------------------------------

    pub fn set_proxy_policy(&self, policy: ProxyPolicy) {
        let mut state = self.state.lock().unwrap();
        state.proxy_policy = policy;
        self.rebuild_routing(&state);
    }

    pub fn proxy_policy(&self) -> ProxyPolicy {
        self.state.lock().unwrap().proxy_policy
    }

    pub fn change_proxy_topology(&self, topology: ProxyTopology) {
        let mut state = self.state.lock().unwrap();
        state.proxy_topology = topology;
        self.rebuild_routing(&state);
    }

    pub fn set_adjust_voter_distribution(&self, adjust: bool) {
        self.queue.set_adjust_voter_distribution(adjust);
    }

    pub fn set_proxy_failure_threshold(&self, threshold: Duration) {
        self.queue.set_proxy_failure_threshold(threshold);
    }

    pub fn set_proxy_failure_threshold_lag(&self, lag: i64) {
        self.queue.set_proxy_failure_threshold_lag(lag);
    }

    pub fn set_allow_start_election(&self, allow: bool) -> Result<(), ConsensusError> {
        self.state
            .lock()
            .unwrap()
            .cmeta
            .set_allow_start_election(allow)
    }

    pub fn set_raft_rpc_token(&self, token: Option<String>) -> Result<(), ConsensusError> {
        self.state.lock().unwrap().cmeta.set_raft_rpc_token(token)
    }

    pub fn clear_removed_peers(&self) {
        self.state.lock().unwrap().cmeta.clear_removed_peers();
    }

    pub fn delete_from_removed_peers(&self, uuids: &[String]) {
        self.state
            .lock()
            .unwrap()
            .cmeta
            .delete_from_removed_peers(uuids);
    }

    pub fn set_reject_append_entries_for_tests(&self, reject: bool) {
        self.reject_append_entries_for_tests
            .store(reject, Ordering::Relaxed);
    }

    pub fn set_withhold_votes_for_tests(&self, withhold: bool) {
        self.withhold_votes_for_tests
            .store(withhold, Ordering::Relaxed);
    }

    /// Advances the term directly; tests only.
    pub fn advance_term_for_tests(&self, new_term: i64) -> Result<(), ConsensusError> {
        let mut state = self.state.lock().unwrap();
        self.handle_term_advance(&mut state, new_term, FlushPolicy::Flush)
    }

    /// Polls until this replica is leader; tests only.
    pub fn wait_until_leader_for_tests(&self, timeout: Duration) -> Result<(), ConsensusError> {
        let deadline = Instant::now() + timeout;
        while self.role() != RaftRole::Leader {
            if Instant::now() >= deadline {
                return Err(ConsensusError::TimedOut(format!(
                    "peer {} is not leader after {timeout:?}",
                    self.local_peer.uuid
                )));
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stops accepting writes; voting may still be allowed afterwards.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(
            state.lifecycle,
            Lifecycle::Stopping | Lifecycle::Stopped | Lifecycle::Shutdown
        ) {
            return;
        }
        let _ = self.set_lifecycle(&mut state, Lifecycle::Stopping);
        self.failure_detector.disable();
        self.end_leader_transfer_period();
        let committed = state.pending.committed_index();
        let doomed = state.pending.abort_ops_after(committed);
        for round in doomed {
            let id = round.id();
            self.round_replication_finished(
                &mut state,
                &round,
                Err(ConsensusError::Aborted(format!(
                    "op {id} aborted: replica stopping"
                ))),
            );
        }
        let _ = self.set_lifecycle(&mut state, Lifecycle::Stopped);
        info!("event=raft_stopped uuid={}", self.local_peer.uuid);
    }

    /// Full shutdown: no further writes or votes.
    pub fn shutdown(&self) {
        if self.shutdown_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        {
            let mut state = self.state.lock().unwrap();
            let _ = self.set_lifecycle(&mut state, Lifecycle::Shutdown);
        }
        self.failure_detector.shutdown();
        self.queue.unregister_observers();
        self.queue.close();
        info!("event=raft_shutdown uuid={}", self.local_peer.uuid);
    }
}

impl QueueObserver for RaftCore {
    fn notify_commit_index(&self, committed_index: i64) {
        let mut state = self.state.lock().unwrap();
        if self.check_running(&state).is_err() {
            return;
        }
        if self.role_unlocked(&state) != RaftRole::Leader {
            return;
        }
        self.advance_committed_unlocked(&mut state, committed_index);
    }

    fn notify_term_change(&self, term: i64) {
        let mut state = self.state.lock().unwrap();
        if self.check_running(&state).is_err() {
            return;
        }
        if term > state.cmeta.current_term() {
            if let Err(err) = self.handle_term_advance(&mut state, term, FlushPolicy::Flush) {
                warn!("event=raft_term_advance_failed term={term} error={err}");
            }
        }
    }

    fn notify_failed_follower(&self, uuid: &str, term: i64, reason: &str) {
        warn!("event=raft_follower_failed uuid={uuid} term={term} reason={reason}");
    }

    fn notify_peer_to_promote(&self, uuid: &str) {
        info!("event=raft_promote_non_voter uuid={uuid}");
        let change = ConfigChangeItem::modify_peer(uuid)
            .with_member_type(MemberType::Voter)
            .with_promote(false);
        if let Err(err) = self.change_config(change, None, None) {
            warn!(
                "event=raft_promote_failed uuid={uuid} code={:?} error={}",
                err.code, err.status
            );
        }
    }

    fn notify_peer_to_start_election(&self, uuid: &str, _transfer: Option<TransferContext>) {
        info!("event=raft_signal_successor uuid={uuid}");
        let peer = {
            let state = self.state.lock().unwrap();
            state.cmeta.active_config().peer(uuid).cloned()
        };
        let Some(peer) = peer else {
            warn!("event=raft_signal_successor_unknown_peer uuid={uuid}");
            return;
        };
        match self.proxy_factory.make_proxy(&peer) {
            Ok(proxy) => {
                let request = StartElectionRequest {
                    dest_uuid: peer.uuid.clone(),
                    caller_uuid: self.local_peer.uuid.clone(),
                };
                let target = peer.uuid.clone();
                proxy.start_election_async(
                    request,
                    Box::new(move |result| {
                        if let Err(err) = result {
                            warn!(
                                "event=raft_signal_successor_failed uuid={target} error={err}"
                            );
                        }
                    }),
                );
            }
            Err(err) => {
                warn!("event=raft_signal_successor_proxy_failed uuid={uuid} error={err}");
            }
        }
    }

    fn notify_peer_health_change(&self) {
        log::debug!("event=raft_peer_health_changed");
    }
}

impl Drop for RaftCore {
    fn drop(&mut self) {
        self.failure_detector.shutdown();
        self.queue.close();
    }
}
