use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide error type. Recoverable failures travel through `Result`;
/// invariant violations (term regression on a tracked peer, log append
/// failure under a live leadership) panic instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("already present: {0}")]
    AlreadyPresent(String),

    #[error("incomplete: {0}")]
    Incomplete(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

impl ConsensusError {
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        ConsensusError::IllegalState(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ConsensusError::InvalidArgument(msg.into())
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, ConsensusError::IllegalState(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ConsensusError::Aborted(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, ConsensusError::TimedOut(_))
    }
}

impl From<std::io::Error> for ConsensusError {
    fn from(err: std::io::Error) -> Self {
        ConsensusError::Io(err.to_string())
    }
}

/// Reason codes carried inside consensus/vote response statuses. The RPC
/// itself stays OK at the transport level so the caller can react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusErrorCode {
    InvalidTerm,
    LastOpIdTooOld,
    AlreadyVotedForOther,
    LeaderIsAlive,
    ConsensusBusy,
    CannotPrepare,
    PrecedingEntryDidntMatch,
    VoteWithheld,
}

/// Server-level error codes surfaced by administrative operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerErrorCode {
    UnknownError,
    InvalidConfig,
    NotTheLeader,
    CasFailed,
    WrongServerUuid,
}

/// A rejected configuration change: server code plus the descriptive
/// status carried alongside it.
#[derive(Debug, Clone, Error)]
#[error("{status}")]
pub struct ConfigChangeError {
    pub code: ServerErrorCode,
    pub status: ConsensusError,
}

impl ConfigChangeError {
    pub fn new(code: ServerErrorCode, status: ConsensusError) -> Self {
        Self { code, status }
    }
}

impl From<ConsensusError> for ConfigChangeError {
    fn from(status: ConsensusError) -> Self {
        ConfigChangeError::new(ServerErrorCode::UnknownError, status)
    }
}
