//! flexraft: a flexible-quorum Raft replication engine.
//!
//! The core implements leader election with pre-voting, log replication
//! with leader-side peer tracking, one-at-a-time configuration change,
//! region-aware ("flexi") commit and election quorums, and multi-hop
//! request proxying. The write-ahead log, the state-machine round
//! handler, and the peer RPC transport are host-supplied through the
//! [`RaftLog`], [`RoundHandler`], and [`PeerProxy`] traits.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod config;
pub mod core;
pub mod election;
pub mod error;
pub mod failure_detector;
pub mod log_cache;
pub mod metadata;
pub mod metrics;
pub mod opid;
pub mod options;
pub mod pending;
pub mod proxy;
pub mod queue;
pub mod routing;
pub mod rpc;

pub use crate::core::{
    ChangeConfigRequest, ConfigChangeItem, ConfigChangeType, Lifecycle, RaftCore, RaftRole,
    RoundHandler, UnsafeChangeConfigRequest,
};
pub use config::{
    majority_size, CommitRule, CommitRulePredicate, MemberType, Peer, PeerAttrs, QuorumMode,
    RaftConfig,
};
pub use election::flexible::{FlexibleQuorumOptions, FlexibleVoteCounter, PotentialNextLeaders};
pub use election::{
    ElectionContext, ElectionMode, ElectionReason, ElectionResult, ElectionVote, LeaderElection,
    MajorityVoteCounter, VoteCounter, VoteInfo,
};
pub use error::{
    ConfigChangeError, ConsensusError, ConsensusErrorCode, ServerErrorCode,
};
pub use failure_detector::FailureDetector;
pub use log_cache::{InMemoryLog, LogAppendCallback, LogCache, RaftLog};
pub use metadata::{
    ConsensusMetadata, ConsensusStateBlob, FileMetadataStore, FlushPolicy, InMemoryMetadataStore,
    LastKnownLeader, MetadataError, MetadataStore, PreviousVote,
};
pub use metrics::ConsensusMetrics;
pub use opid::OpId;
pub use options::{MemoryPressureFn, RaftOptions};
pub use pending::{PendingRounds, ReplicatedCallback, Round};
pub use queue::{
    PeerHealth, PeerQueue, PeerRequest, PeerStatus, QueueObserver, SuccessorFilter, TrackedPeer,
    TransferContext,
};
pub use routing::{ProxyPolicy, ProxyTopology, RoutingError, RoutingTable};
pub use rpc::{
    ChangeConfigRecord, ConsensusRequest, ConsensusResponse, ConsensusResponseCallback,
    ConsensusStatus, ConsensusStatusError, OpType, PeerProxy, PeerProxyFactory, ReplicateMsg,
    StartElectionCallback, StartElectionRequest, VoteRequest, VoteResponse, VoteResponseCallback,
};
