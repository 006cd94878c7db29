pub mod flexible;

use crate::config::RaftConfig;
use crate::error::ConsensusError;
use crate::metadata::{LastKnownLeader, PreviousVote};
use crate::queue::TransferContext;
use crate::rpc::{PeerProxyFactory, VoteRequest, VoteResponse};
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionVote {
    Granted,
    Denied,
}

/// How an election round is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMode {
    /// Voters deny if they believe a leader is alive.
    Normal,
    /// Non-binding probe at term+1; votes are not persisted.
    PreElection,
    /// Voters ignore a live leader; used for leadership hand-off.
    ElectEvenIfLeaderAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionReason {
    InitialSingleNodeElection,
    TimeoutExpired,
    ExternalRequest,
}

/// Context threaded from the election trigger through the decision
/// callback.
#[derive(Debug, Clone)]
pub struct ElectionContext {
    pub reason: ElectionReason,
    /// The leader this election is promoting away from, if known.
    pub source_uuid: String,
    pub is_origin_dead_promotion: bool,
}

impl ElectionContext {
    pub fn new(reason: ElectionReason) -> Self {
        Self {
            reason,
            source_uuid: String::new(),
            is_origin_dead_promotion: reason == ElectionReason::TimeoutExpired,
        }
    }

    pub fn transfer_context(&self) -> TransferContext {
        TransferContext {
            original_leader_uuid: self.source_uuid.clone(),
            is_origin_dead_promotion: self.is_origin_dead_promotion,
        }
    }
}

/// Everything a voter reported along with its vote.
#[derive(Debug, Clone, Default)]
pub struct VoteInfo {
    pub vote: Option<ElectionVote>,
    pub last_known_leader: LastKnownLeader,
    pub last_pruned_term: i64,
    /// Sorted by election term.
    pub previous_vote_history: Vec<PreviousVote>,
    pub is_candidate_removed: bool,
}

impl VoteInfo {
    pub fn granted() -> Self {
        Self {
            vote: Some(ElectionVote::Granted),
            ..Default::default()
        }
    }

    pub fn denied() -> Self {
        Self {
            vote: Some(ElectionVote::Denied),
            ..Default::default()
        }
    }

    fn vote(&self) -> ElectionVote {
        self.vote.expect("vote not set in VoteInfo")
    }
}

/// Common vote bookkeeping shared by the counters: duplicate detection,
/// changed-vote rejection, yes/no tallies.
#[derive(Debug, Default)]
pub(crate) struct VoteLedger {
    votes: BTreeMap<String, VoteInfo>,
    yes_votes: usize,
    no_votes: usize,
    candidate_removed: bool,
}

impl VoteLedger {
    /// Returns true when the vote was an identical duplicate.
    fn record(&mut self, voter_uuid: &str, info: VoteInfo) -> Result<bool, ConsensusError> {
        if let Some(prior) = self.votes.get(voter_uuid) {
            if prior.vote() != info.vote() {
                return Err(ConsensusError::invalid_argument(format!(
                    "peer {voter_uuid} voted a different way twice in the same election"
                )));
            }
            return Ok(true);
        }
        match info.vote() {
            ElectionVote::Granted => self.yes_votes += 1,
            ElectionVote::Denied => {
                self.candidate_removed = self.candidate_removed || info.is_candidate_removed;
                self.no_votes += 1;
            }
        }
        self.votes.insert(voter_uuid.to_string(), info);
        Ok(false)
    }

    pub(crate) fn votes(&self) -> &BTreeMap<String, VoteInfo> {
        &self.votes
    }

    pub(crate) fn yes_votes(&self) -> usize {
        self.yes_votes
    }

    pub(crate) fn no_votes(&self) -> usize {
        self.no_votes
    }
}

/// Aggregates votes into an election decision.
pub trait VoteCounter: Send {
    /// Registers a vote; repeated identical votes return `Ok(true)` and
    /// change nothing, changed votes are an error.
    fn register_vote(&mut self, voter_uuid: &str, info: VoteInfo) -> Result<bool, ConsensusError>;
    fn is_decided(&self) -> bool;
    /// IllegalState while undecided.
    fn decision(&self) -> Result<ElectionVote, ConsensusError>;
    fn total_votes_counted(&self) -> usize;
    fn total_expected_votes(&self) -> usize;
    fn are_all_votes_in(&self) -> bool {
        self.total_votes_counted() == self.total_expected_votes()
    }
    fn is_candidate_removed(&self) -> bool;
}

/// Classic Raft majority counter.
pub struct MajorityVoteCounter {
    ledger: VoteLedger,
    num_voters: usize,
    majority_size: usize,
}

impl MajorityVoteCounter {
    pub fn new(num_voters: usize, majority_size: usize) -> Self {
        assert!(num_voters > 0);
        assert!(majority_size > 0 && majority_size <= num_voters);
        Self {
            ledger: VoteLedger::default(),
            num_voters,
            majority_size,
        }
    }
}

impl VoteCounter for MajorityVoteCounter {
    fn register_vote(&mut self, voter_uuid: &str, info: VoteInfo) -> Result<bool, ConsensusError> {
        if self.ledger.yes_votes + self.ledger.no_votes == self.num_voters
            && !self.ledger.votes.contains_key(voter_uuid)
        {
            return Err(ConsensusError::invalid_argument(format!(
                "vote from {voter_uuid} would exceed the expected {} voters",
                self.num_voters
            )));
        }
        self.ledger.record(voter_uuid, info)
    }

    fn is_decided(&self) -> bool {
        self.ledger.yes_votes >= self.majority_size
            || self.ledger.no_votes > self.num_voters - self.majority_size
    }

    fn decision(&self) -> Result<ElectionVote, ConsensusError> {
        if self.ledger.yes_votes >= self.majority_size {
            return Ok(ElectionVote::Granted);
        }
        if self.ledger.no_votes > self.num_voters - self.majority_size {
            return Ok(ElectionVote::Denied);
        }
        Err(ConsensusError::illegal_state("vote not yet decided"))
    }

    fn total_votes_counted(&self) -> usize {
        self.ledger.yes_votes + self.ledger.no_votes
    }

    fn total_expected_votes(&self) -> usize {
        self.num_voters
    }

    fn is_candidate_removed(&self) -> bool {
        self.ledger.candidate_removed
    }
}

/// Outcome of one election round, delivered to the decision callback
/// exactly once.
#[derive(Debug, Clone)]
pub struct ElectionResult {
    pub vote_request: VoteRequest,
    pub decision: ElectionVote,
    /// Highest term any voter reported; the candidate advances to it on
    /// loss.
    pub highest_voter_term: i64,
    pub message: String,
    pub is_candidate_removed: bool,
}

pub type ElectionDecisionCallback = Box<dyn FnOnce(ElectionResult) + Send>;

struct ElectionState {
    counter: Box<dyn VoteCounter>,
    highest_voter_term: i64,
    result: Option<ElectionResult>,
    responded: bool,
}

/// Drives one (pre-)election: dispatches vote requests to every other
/// voter, aggregates responses, and invokes the decision callback once.
pub struct LeaderElection {
    config: RaftConfig,
    proxy_factory: Arc<dyn PeerProxyFactory>,
    request: VoteRequest,
    timeout: Duration,
    started_at: Instant,
    state: Mutex<ElectionState>,
    decision_callback: Mutex<Option<ElectionDecisionCallback>>,
}

impl LeaderElection {
    pub fn new(
        config: RaftConfig,
        proxy_factory: Arc<dyn PeerProxyFactory>,
        request: VoteRequest,
        counter: Box<dyn VoteCounter>,
        timeout: Duration,
        decision_callback: ElectionDecisionCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            proxy_factory,
            request,
            timeout,
            started_at: Instant::now(),
            state: Mutex::new(ElectionState {
                counter,
                highest_voter_term: 0,
                result: None,
                responded: false,
            }),
            decision_callback: Mutex::new(Some(decision_callback)),
        })
    }

    pub fn election_term(&self) -> i64 {
        self.request.candidate_term
    }

    /// Dispatches the vote requests. The candidate must already have
    /// registered its own vote.
    pub fn run(self: &Arc<Self>) {
        let mut other_voters: Vec<_> = Vec::new();
        for peer in &self.config.peers {
            if peer.uuid == self.request.candidate_uuid || !peer.is_voter() {
                continue;
            }
            other_voters.push(peer.clone());
        }
        {
            let state = self.state.lock().unwrap();
            assert_eq!(
                state.counter.total_votes_counted(),
                1,
                "candidate must vote for itself first"
            );
            assert_eq!(
                state.counter.total_expected_votes(),
                other_voters.len() + 1,
                "voter count mismatch between counter and config"
            );
        }
        info!(
            "event=raft_election_start term={} pre_election={} voters={}",
            self.request.candidate_term,
            self.request.is_pre_election,
            other_voters.len() + 1
        );

        // Possibly already decided (single-voter config).
        self.check_for_decision();

        for peer in other_voters {
            let proxy = match self.proxy_factory.make_proxy(&peer) {
                Ok(proxy) => proxy,
                Err(err) => {
                    warn!(
                        "event=raft_election_proxy_error peer={} error={}",
                        peer.uuid, err
                    );
                    self.record_vote(&peer.uuid, VoteInfo::denied());
                    self.check_for_decision();
                    continue;
                }
            };
            let mut request = self.request.clone();
            request.dest_uuid = peer.uuid.clone();
            let election = Arc::clone(self);
            let voter_uuid = peer.uuid.clone();
            proxy.request_vote_async(
                request,
                Box::new(move |result| election.vote_response_callback(&voter_uuid, result)),
            );
        }

        // The deadline closes out elections that never converge (lost
        // responses, a flexible counter stuck waiting for quorum).
        let election = Arc::clone(self);
        let deadline = self.started_at + self.timeout;
        thread::Builder::new()
            .name("raft-election-deadline".into())
            .spawn(move || {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
                election.finalize_on_deadline();
            })
            .expect("spawn election deadline thread");
    }

    fn vote_response_callback(
        self: &Arc<Self>,
        voter_uuid: &str,
        result: Result<VoteResponse, ConsensusError>,
    ) {
        match result {
            Err(err) => {
                warn!(
                    "event=raft_election_rpc_error peer={voter_uuid} error={err}"
                );
                self.record_vote(voter_uuid, VoteInfo::denied());
            }
            Ok(response) => {
                if response.responder_uuid != voter_uuid {
                    warn!(
                        "event=raft_election_uuid_mismatch expected={voter_uuid} actual={}",
                        response.responder_uuid
                    );
                    self.record_vote(voter_uuid, VoteInfo::denied());
                } else {
                    {
                        let mut state = self.state.lock().unwrap();
                        state.highest_voter_term =
                            state.highest_voter_term.max(response.responder_term);
                    }
                    if !response.vote_granted
                        && response.responder_term > self.request.candidate_term
                    {
                        self.handle_higher_term(&response);
                    } else {
                        let mut history = response.previous_vote_history.clone();
                        history.sort_by_key(|v| v.election_term);
                        let info = VoteInfo {
                            vote: Some(if response.vote_granted {
                                ElectionVote::Granted
                            } else {
                                ElectionVote::Denied
                            }),
                            last_known_leader: response.last_known_leader.clone(),
                            last_pruned_term: response.last_pruned_term,
                            previous_vote_history: history,
                            is_candidate_removed: response.is_candidate_removed,
                        };
                        self.record_vote(voter_uuid, info);
                    }
                }
            }
        }
        self.check_for_decision();
    }

    /// A single response with a higher term finalizes the election as
    /// lost immediately.
    fn handle_higher_term(&self, response: &VoteResponse) {
        let mut state = self.state.lock().unwrap();
        if state.result.is_none() {
            info!(
                "event=raft_election_higher_term term={} voter_term={}",
                self.request.candidate_term, response.responder_term
            );
            state.result = Some(ElectionResult {
                vote_request: self.request.clone(),
                decision: ElectionVote::Denied,
                highest_voter_term: response.responder_term,
                message: format!(
                    "vote denied by peer {} with higher term {}",
                    response.responder_uuid, response.responder_term
                ),
                is_candidate_removed: response.is_candidate_removed,
            });
        }
    }

    pub fn record_vote(&self, voter_uuid: &str, info: VoteInfo) {
        let mut state = self.state.lock().unwrap();
        match state.counter.register_vote(voter_uuid, info) {
            Ok(false) => {}
            Ok(true) => {
                // Duplicate identical vote; log and keep the record as-is.
                info!("event=raft_election_duplicate_vote peer={voter_uuid}");
            }
            Err(err) => {
                warn!("event=raft_election_vote_rejected peer={voter_uuid} error={err}");
            }
        }
    }

    pub fn check_for_decision(self: &Arc<Self>) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            if state.result.is_none() && state.counter.is_decided() {
                let decision = state
                    .counter
                    .decision()
                    .expect("decided counter must yield a decision");
                let message = match decision {
                    ElectionVote::Granted => "achieved required quorum".to_string(),
                    ElectionVote::Denied => "could not achieve required quorum".to_string(),
                };
                info!(
                    "event=raft_election_decided term={} granted={} duration_ms={}",
                    self.request.candidate_term,
                    decision == ElectionVote::Granted,
                    self.started_at.elapsed().as_millis()
                );
                state.result = Some(ElectionResult {
                    vote_request: self.request.clone(),
                    decision,
                    highest_voter_term: state.highest_voter_term,
                    message,
                    is_candidate_removed: decision == ElectionVote::Denied
                        && state.counter.is_candidate_removed(),
                });
            }
            if state.result.is_some() && !state.responded {
                state.responded = true;
                self.decision_callback.lock().unwrap().take()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            let result = self
                .state
                .lock()
                .unwrap()
                .result
                .clone()
                .expect("result present when responding");
            callback(result);
        }
    }

    fn finalize_on_deadline(self: &Arc<Self>) {
        self.check_for_decision();
        let callback = {
            let mut state = self.state.lock().unwrap();
            if state.result.is_none() {
                info!(
                    "event=raft_election_deadline_elapsed term={} votes_counted={}",
                    self.request.candidate_term,
                    state.counter.total_votes_counted()
                );
                state.result = Some(ElectionResult {
                    vote_request: self.request.clone(),
                    decision: ElectionVote::Denied,
                    highest_voter_term: state.highest_voter_term,
                    message: "election deadline elapsed before a decision".to_string(),
                    is_candidate_removed: false,
                });
            }
            if !state.responded {
                state.responded = true;
                self.decision_callback.lock().unwrap().take()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            let result = self
                .state
                .lock()
                .unwrap()
                .result
                .clone()
                .expect("result present when responding");
            callback(result);
        }
    }
}
