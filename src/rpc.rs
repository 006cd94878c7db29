use crate::config::{Peer, RaftConfig};
use crate::error::{ConsensusError, ConsensusErrorCode};
use crate::metadata::{LastKnownLeader, PreviousVote};
use crate::opid::OpId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of a replicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    /// Leadership-assertion marker appended at the start of every term.
    NoOp,
    /// An opaque state-machine payload.
    Write,
    /// A configuration change carrying old and new configs.
    ChangeConfig,
    /// Placeholder in a proxied request, reconstituted downstream.
    ProxyOp,
}

/// Payload of a `ChangeConfig` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConfigRecord {
    pub old_config: RaftConfig,
    pub new_config: RaftConfig,
}

/// A single replicated message. Once appended (id assigned) messages are
/// shared immutably between the queue, log cache, and pending rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateMsg {
    pub id: OpId,
    pub op_type: OpType,
    #[serde(default)]
    pub payload: Vec<u8>,
    /// CRC32 of `payload`; zero/absent disables validation.
    #[serde(default)]
    pub payload_crc32: Option<u32>,
    #[serde(default)]
    pub change_config: Option<ChangeConfigRecord>,
}

impl ReplicateMsg {
    pub fn noop(id: OpId) -> Self {
        Self {
            id,
            op_type: OpType::NoOp,
            payload: Vec::new(),
            payload_crc32: None,
            change_config: None,
        }
    }

    pub fn write(payload: Vec<u8>) -> Self {
        let crc = crc32fast::hash(&payload);
        Self {
            id: OpId::MIN,
            op_type: OpType::Write,
            payload,
            payload_crc32: Some(crc),
            change_config: None,
        }
    }

    pub fn change_config(record: ChangeConfigRecord) -> Self {
        Self {
            id: OpId::MIN,
            op_type: OpType::ChangeConfig,
            payload: Vec::new(),
            payload_crc32: None,
            change_config: Some(record),
        }
    }

    /// Placeholder carrying only the op id of a proxied message.
    pub fn proxy_placeholder(id: OpId) -> Self {
        Self {
            id,
            op_type: OpType::ProxyOp,
            payload: Vec::new(),
            payload_crc32: None,
            change_config: None,
        }
    }

    /// Consensus-only ops are handled by the replica itself rather than
    /// the host state machine.
    pub fn is_consensus_only(&self) -> bool {
        matches!(self.op_type, OpType::NoOp | OpType::ChangeConfig)
    }

    /// Validates the payload checksum, if one is present.
    pub fn validate_payload_crc(&self) -> Result<(), ConsensusError> {
        if let Some(expected) = self.payload_crc32 {
            if expected != 0 {
                let computed = crc32fast::hash(&self.payload);
                if computed != expected {
                    return Err(ConsensusError::Corruption(format!(
                        "payload corruption for {}: crc32 {computed:#x} != {expected:#x}",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// AppendEntries equivalent: leader → follower replication request.
#[derive(Debug, Clone)]
pub struct ConsensusRequest {
    pub dest_uuid: String,
    pub caller_uuid: String,
    pub caller_term: i64,
    pub preceding_id: OpId,
    pub ops: Vec<Arc<ReplicateMsg>>,
    pub committed_index: i64,
    pub all_replicated_index: i64,
    pub region_durable_index: i64,
    pub last_idx_appended_to_leader: i64,
    pub raft_rpc_token: Option<String>,
    /// Set when this request must be relayed through `proxy_dest_uuid`.
    pub proxy_dest_uuid: Option<String>,
    pub proxy_caller_uuid: Option<String>,
    pub proxy_hops_remaining: i32,
}

impl ConsensusRequest {
    pub fn is_proxy_request(&self) -> bool {
        self.proxy_dest_uuid.as_deref().map(|u| !u.is_empty()).unwrap_or(false)
    }
}

/// Error embedded in a response status; transport-level OK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusStatusError {
    pub code: ConsensusErrorCode,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ConsensusStatus {
    /// Tail of the responder's log.
    pub last_received: OpId,
    /// Last op accepted from the current leader.
    pub last_received_current_leader: OpId,
    pub last_committed_idx: i64,
    pub error: Option<ConsensusStatusError>,
}

#[derive(Debug, Clone)]
pub struct ConsensusResponse {
    pub responder_uuid: String,
    pub responder_term: i64,
    pub status: ConsensusStatus,
}

impl ConsensusResponse {
    pub fn has_error(&self) -> bool {
        self.status.error.is_some()
    }
}

/// RequestVote sent by a candidate.
#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub dest_uuid: String,
    pub candidate_uuid: String,
    pub candidate_term: i64,
    /// Tail of the candidate's log.
    pub candidate_last_received: OpId,
    pub is_pre_election: bool,
    pub ignore_live_leader: bool,
    /// The candidate's own peer record, used by region-aware voters.
    pub candidate_peer: Option<Peer>,
    pub raft_rpc_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub responder_uuid: String,
    pub responder_term: i64,
    pub vote_granted: bool,
    pub consensus_error: Option<ConsensusStatusError>,
    /// The voter's full vote history, sorted by term.
    pub previous_vote_history: Vec<PreviousVote>,
    pub last_pruned_term: i64,
    pub last_known_leader: LastKnownLeader,
    /// The voter no longer has the candidate in its config.
    pub is_candidate_removed: bool,
}

/// Request asking a peer to start an election immediately (leadership
/// transfer hand-off).
#[derive(Debug, Clone)]
pub struct StartElectionRequest {
    pub dest_uuid: String,
    pub caller_uuid: String,
}

pub type ConsensusResponseCallback =
    Box<dyn FnOnce(Result<ConsensusResponse, ConsensusError>) + Send>;
pub type VoteResponseCallback = Box<dyn FnOnce(Result<VoteResponse, ConsensusError>) + Send>;
pub type StartElectionCallback = Box<dyn FnOnce(Result<(), ConsensusError>) + Send>;

/// Async handle to one remote peer. Completion callbacks run on the
/// transport's threads; implementations must not invoke them while
/// holding locks the consensus core may take.
pub trait PeerProxy: Send + Sync {
    fn update_consensus_async(&self, request: ConsensusRequest, cb: ConsensusResponseCallback);
    fn request_vote_async(&self, request: VoteRequest, cb: VoteResponseCallback);
    fn start_election_async(&self, request: StartElectionRequest, cb: StartElectionCallback);
}

/// Factory producing proxies from peer records.
pub trait PeerProxyFactory: Send + Sync {
    fn make_proxy(&self, peer: &Peer) -> Result<Arc<dyn PeerProxy>, ConsensusError>;
}
