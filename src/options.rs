use crate::routing::ProxyPolicy;
use std::sync::Arc;
use std::time::Duration;

/// Host hook reporting memory pressure: returns `Some(capacity_pct)` when
/// the soft limit is exceeded and follower appends should be rejected.
pub type MemoryPressureFn = Arc<dyn Fn() -> Option<f64> + Send + Sync>;

/// Immutable tunables passed to the core at construction. Fields that
/// are hot-updatable at runtime (proxy policy, thresholds, election
/// gating) are surfaced through setters on `RaftCore` instead.
#[derive(Clone)]
pub struct RaftOptions {
    /// Leader heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before the failure detector fires.
    pub max_missed_heartbeats: u32,
    /// Per-peer RPC timeout used for vote requests; also the election
    /// deadline.
    pub election_timeout: Duration,
    /// Cap on the exponential election backoff.
    pub leader_failure_exp_backoff_max: Duration,
    /// Extra snooze multiplier applied when this replica keeps losing
    /// elections because voters dropped it from their configs.
    pub not_in_config_backoff_multiplier: f64,
    /// Start with a pre-election before every real election.
    pub enable_pre_election: bool,
    /// Region/quorum-aware commit and election rules.
    pub enable_flexi_raft: bool,
    /// Deny votes to a same-region candidate whose log leads ours by
    /// more than this many ops (single-region-dynamic only). `None`
    /// disables the check.
    pub lag_threshold_for_request_vote: Option<i64>,
    /// How long a flexi election waits for the pessimistic quorum before
    /// falling through to vote-history inference.
    pub pessimistic_quorum_wait: Duration,
    /// Merge last-known-leader reports from vote responses.
    pub crowdsource_last_known_leader: bool,
    /// Trust a fully-crowdsourced last known leader even without term
    /// continuity. Kept off; the surface exists but is not relied upon.
    pub trust_last_leader_entries: bool,
    /// Require majority-of-region-majorities for flexi elections.
    pub srd_strict_leader_election_quorum: bool,
    /// Require a majority in the candidate's own region for flexi
    /// elections.
    pub include_candidate_region: bool,
    /// Maximum ops per replication request.
    pub max_batch_ops: usize,
    /// Vote-history entries retained before pruning.
    pub max_vote_history_entries: usize,
    /// Initial routing policy; hot-updatable through the core.
    pub proxy_policy: ProxyPolicy,
    /// Route proxied requests through further intermediate hops.
    pub enable_multi_hop_proxy_routing: bool,
    /// Permit more than one db-backed voter per quorum in ADD_PEER.
    pub allow_multiple_backed_by_db_per_quorum: bool,
    /// Bound on the proxy handler's blocking log-cache read.
    pub proxy_wait_timeout: Duration,
    /// Hops budget stamped on outgoing proxied requests.
    pub proxy_max_hops: i32,
    /// A peer silent for longer than this is reported unhealthy.
    pub follower_unavailable_considered_failed: Duration,
    /// A proxy peer silent for longer than this is bypassed.
    pub proxy_failure_threshold: Duration,
    /// A proxy peer lagging its destination by more than this many ops
    /// is bypassed.
    pub proxy_failure_threshold_lag: i64,
    /// Skip the NO_OP normally asserted at the start of each term.
    pub disable_noop: bool,
    /// Record peers dropped by committed config changes.
    pub track_removed_peers: bool,
    /// Reject incoming consensus RPCs whose token mismatches ours.
    pub enforce_rpc_token: bool,
    /// Memory-pressure probe for follower appends.
    pub memory_pressure: Option<MemoryPressureFn>,
    /// Seed for jitter; fixed seeds make tests deterministic.
    pub rng_seed: u64,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            max_missed_heartbeats: 3,
            election_timeout: Duration::from_millis(1500),
            leader_failure_exp_backoff_max: Duration::from_secs(20),
            not_in_config_backoff_multiplier: 4.0,
            enable_pre_election: true,
            enable_flexi_raft: false,
            lag_threshold_for_request_vote: None,
            pessimistic_quorum_wait: Duration::from_secs(10),
            crowdsource_last_known_leader: true,
            trust_last_leader_entries: false,
            srd_strict_leader_election_quorum: false,
            include_candidate_region: true,
            max_batch_ops: 64,
            max_vote_history_entries: 128,
            proxy_policy: ProxyPolicy::Disable,
            enable_multi_hop_proxy_routing: true,
            allow_multiple_backed_by_db_per_quorum: false,
            proxy_wait_timeout: Duration::from_millis(500),
            proxy_max_hops: 2,
            follower_unavailable_considered_failed: Duration::from_secs(300),
            proxy_failure_threshold: Duration::from_secs(10),
            proxy_failure_threshold_lag: 1000,
            disable_noop: false,
            track_removed_peers: true,
            enforce_rpc_token: false,
            memory_pressure: None,
            rng_seed: 0,
        }
    }
}

impl std::fmt::Debug for RaftOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftOptions")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_missed_heartbeats", &self.max_missed_heartbeats)
            .field("election_timeout", &self.election_timeout)
            .field("enable_pre_election", &self.enable_pre_election)
            .field("enable_flexi_raft", &self.enable_flexi_raft)
            .field("max_batch_ops", &self.max_batch_ops)
            .finish_non_exhaustive()
    }
}

impl RaftOptions {
    /// The base failure-detection period before jitter.
    pub fn failure_detection_period(&self) -> Duration {
        self.heartbeat_interval * self.max_missed_heartbeats
    }

    /// The shortest interval a voter withholds votes after hearing from
    /// a live leader.
    pub fn minimum_election_timeout(&self) -> Duration {
        self.failure_detection_period()
    }
}
