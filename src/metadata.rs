use crate::config::RaftConfig;
use crate::error::ConsensusError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Whether a metadata mutation must hit disk before returning.
///
/// `SkipFlush` is legal only when an imminent later mutation will flush
/// and the intermediate state is safe to lose on crash (e.g. a term
/// advance immediately followed by recording a vote).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    Flush,
    SkipFlush,
}

/// One entry of the previous-vote history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousVote {
    pub election_term: i64,
    pub candidate_uuid: String,
}

/// The most recent leader this replica ever learned about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastKnownLeader {
    pub uuid: String,
    pub election_term: i64,
}

/// The single durable blob persisted per replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusStateBlob {
    pub current_term: i64,
    pub voted_for: Option<String>,
    pub committed_config: RaftConfig,
    #[serde(default)]
    pub pending_config: Option<RaftConfig>,
    #[serde(default)]
    pub previous_vote_history: Vec<PreviousVote>,
    #[serde(default)]
    pub last_known_leader: LastKnownLeader,
    #[serde(default)]
    pub last_pruned_term: i64,
    #[serde(default)]
    pub removed_peers: Vec<String>,
    #[serde(default)]
    pub raft_rpc_token: Option<String>,
    #[serde(default = "default_allow_start_election")]
    pub allow_start_election: bool,
}

fn default_allow_start_election() -> bool {
    true
}

/// Storage backend for the consensus metadata blob.
pub trait MetadataStore: Send + Sync {
    fn load(&self) -> Result<Option<ConsensusStateBlob>, MetadataError>;
    /// Atomic, synchronous write-through.
    fn persist(&self, blob: &ConsensusStateBlob) -> Result<(), MetadataError>;
}

/// JSON file store with tmp-file + fsync + rename persistence.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    path: PathBuf,
}

impl FileMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetadataStore for FileMetadataStore {
    fn load(&self) -> Result<Option<ConsensusStateBlob>, MetadataError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(MetadataError::Io(err)),
        }
    }

    fn persist(&self, blob: &ConsensusStateBlob) -> Result<(), MetadataError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        let payload = serde_json::to_vec_pretty(blob)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory metadata store for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    blob: parking_lot::Mutex<Option<ConsensusStateBlob>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn load(&self) -> Result<Option<ConsensusStateBlob>, MetadataError> {
        Ok(self.blob.lock().clone())
    }

    fn persist(&self, blob: &ConsensusStateBlob) -> Result<(), MetadataError> {
        *self.blob.lock() = Some(blob.clone());
        Ok(())
    }
}

/// In-memory consensus metadata, write-through to a `MetadataStore`.
/// All mutations are gated behind the replica lock held by the caller.
pub struct ConsensusMetadata {
    store: Box<dyn MetadataStore>,
    current_term: i64,
    voted_for: Option<String>,
    leader_uuid: Option<String>,
    committed_config: RaftConfig,
    pending_config: Option<RaftConfig>,
    previous_vote_history: BTreeMap<i64, PreviousVote>,
    last_known_leader: LastKnownLeader,
    last_pruned_term: i64,
    removed_peers: Vec<String>,
    raft_rpc_token: Option<String>,
    allow_start_election: bool,
    max_vote_history_entries: usize,
}

impl ConsensusMetadata {
    /// Loads metadata from the store, or initializes it from
    /// `initial_config` on first start.
    pub fn load_or_create(
        store: Box<dyn MetadataStore>,
        initial_config: &RaftConfig,
        max_vote_history_entries: usize,
    ) -> Result<Self, ConsensusError> {
        let blob = store.load().map_err(ConsensusError::from)?;
        let blob = match blob {
            Some(blob) => blob,
            None => {
                initial_config.validate()?;
                let blob = ConsensusStateBlob {
                    current_term: 0,
                    voted_for: None,
                    committed_config: initial_config.clone(),
                    pending_config: None,
                    previous_vote_history: Vec::new(),
                    last_known_leader: LastKnownLeader::default(),
                    last_pruned_term: 0,
                    removed_peers: Vec::new(),
                    raft_rpc_token: None,
                    allow_start_election: true,
                };
                store.persist(&blob).map_err(ConsensusError::from)?;
                blob
            }
        };
        let mut history = BTreeMap::new();
        for vote in blob.previous_vote_history {
            history.insert(vote.election_term, vote);
        }
        Ok(Self {
            store,
            current_term: blob.current_term,
            voted_for: blob.voted_for,
            leader_uuid: None,
            committed_config: blob.committed_config,
            pending_config: blob.pending_config,
            previous_vote_history: history,
            last_known_leader: blob.last_known_leader,
            last_pruned_term: blob.last_pruned_term,
            removed_peers: blob.removed_peers,
            raft_rpc_token: blob.raft_rpc_token,
            allow_start_election: blob.allow_start_election,
            max_vote_history_entries,
        })
    }

    pub fn current_term(&self) -> i64 {
        self.current_term
    }

    /// Advances the term, clearing the vote. Rejects non-monotonic terms.
    pub fn set_current_term(
        &mut self,
        term: i64,
        flush: FlushPolicy,
    ) -> Result<(), ConsensusError> {
        if term <= self.current_term {
            return Err(ConsensusError::illegal_state(format!(
                "cannot advance term to {}: current term is {}",
                term, self.current_term
            )));
        }
        self.current_term = term;
        self.voted_for = None;
        if flush == FlushPolicy::Flush {
            self.flush()?;
        }
        Ok(())
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    pub fn has_voted_current_term(&self) -> bool {
        self.voted_for.is_some()
    }

    /// Records the vote for the current term and appends it to the vote
    /// history. Always flushes: the vote must be durable before the
    /// response leaves this replica.
    pub fn set_voted_for(&mut self, uuid: &str) -> Result<(), ConsensusError> {
        if let Some(existing) = &self.voted_for {
            if existing != uuid {
                return Err(ConsensusError::illegal_state(format!(
                    "already voted for {existing} in term {}",
                    self.current_term
                )));
            }
        }
        self.voted_for = Some(uuid.to_string());
        self.previous_vote_history.insert(
            self.current_term,
            PreviousVote {
                election_term: self.current_term,
                candidate_uuid: uuid.to_string(),
            },
        );
        self.prune_vote_history();
        self.flush()
    }

    fn prune_vote_history(&mut self) {
        while self.previous_vote_history.len() > self.max_vote_history_entries {
            if let Some((&term, _)) = self.previous_vote_history.iter().next() {
                self.previous_vote_history.remove(&term);
                if term > self.last_pruned_term {
                    self.last_pruned_term = term;
                }
            }
        }
    }

    pub fn previous_vote_history(&self) -> Vec<PreviousVote> {
        self.previous_vote_history.values().cloned().collect()
    }

    pub fn last_pruned_term(&self) -> i64 {
        self.last_pruned_term
    }

    pub fn leader_uuid(&self) -> Option<&str> {
        self.leader_uuid.as_deref()
    }

    pub fn has_leader(&self) -> bool {
        self.leader_uuid.is_some()
    }

    /// Sets the leader for the current term and records it as the last
    /// known leader; the latter is durable state and is flushed.
    pub fn set_leader_uuid(&mut self, uuid: &str) -> Result<(), ConsensusError> {
        self.leader_uuid = Some(uuid.to_string());
        if !uuid.is_empty() {
            self.last_known_leader = LastKnownLeader {
                uuid: uuid.to_string(),
                election_term: self.current_term,
            };
            self.flush()?;
        }
        Ok(())
    }

    pub fn clear_leader(&mut self) {
        self.leader_uuid = None;
    }

    pub fn last_known_leader(&self) -> &LastKnownLeader {
        &self.last_known_leader
    }

    pub fn committed_config(&self) -> &RaftConfig {
        &self.committed_config
    }

    pub fn has_pending_config(&self) -> bool {
        self.pending_config.is_some()
    }

    pub fn pending_config(&self) -> Option<&RaftConfig> {
        self.pending_config.as_ref()
    }

    /// The active config: pending if one exists, committed otherwise.
    pub fn active_config(&self) -> &RaftConfig {
        self.pending_config.as_ref().unwrap_or(&self.committed_config)
    }

    pub fn set_pending_config(&mut self, config: RaftConfig) -> Result<(), ConsensusError> {
        config.validate()?;
        let committed_index = self.committed_config.opid_index.unwrap_or(-1);
        if config.opid_index.unwrap_or(-1) <= committed_index && !config.unsafe_config_change {
            return Err(ConsensusError::illegal_state(format!(
                "pending config opid index {:?} does not advance past committed {:?}",
                config.opid_index, self.committed_config.opid_index
            )));
        }
        if let Some(pending) = &self.pending_config {
            if !config.unsafe_config_change {
                return Err(ConsensusError::illegal_state(format!(
                    "config change already pending at opid index {:?}",
                    pending.opid_index
                )));
            }
            warn!(
                "event=raft_pending_config_overwritten previous_opid_index={:?}",
                pending.opid_index
            );
        }
        self.pending_config = Some(config);
        Ok(())
    }

    pub fn clear_pending_config(&mut self) {
        self.pending_config = None;
    }

    /// Installs the committed config, clears pending, and flushes.
    pub fn set_committed_config(&mut self, config: RaftConfig) -> Result<(), ConsensusError> {
        config.validate()?;
        info!(
            "event=raft_config_committed opid_index={:?} voters={}",
            config.opid_index,
            config.count_voters()
        );
        self.committed_config = config;
        self.pending_config = None;
        self.flush()
    }

    pub fn removed_peers(&self) -> &[String] {
        &self.removed_peers
    }

    pub fn is_peer_removed(&self, uuid: &str) -> bool {
        self.removed_peers.iter().any(|u| u == uuid)
    }

    pub fn add_removed_peers(&mut self, uuids: &[String]) {
        for uuid in uuids {
            if !self.removed_peers.contains(uuid) {
                self.removed_peers.push(uuid.clone());
            }
        }
    }

    pub fn clear_removed_peers(&mut self) {
        self.removed_peers.clear();
    }

    pub fn delete_from_removed_peers(&mut self, uuids: &[String]) {
        self.removed_peers.retain(|u| !uuids.contains(u));
    }

    pub fn raft_rpc_token(&self) -> Option<&str> {
        self.raft_rpc_token.as_deref()
    }

    pub fn set_raft_rpc_token(&mut self, token: Option<String>) -> Result<(), ConsensusError> {
        self.raft_rpc_token = token;
        self.flush()
    }

    pub fn allow_start_election(&self) -> bool {
        self.allow_start_election
    }

    pub fn set_allow_start_election(&mut self, allow: bool) -> Result<(), ConsensusError> {
        self.allow_start_election = allow;
        self.flush()
    }

    /// Synchronous write-through of the whole blob.
    pub fn flush(&self) -> Result<(), ConsensusError> {
        let blob = ConsensusStateBlob {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            committed_config: self.committed_config.clone(),
            pending_config: self.pending_config.clone(),
            previous_vote_history: self.previous_vote_history.values().cloned().collect(),
            last_known_leader: self.last_known_leader.clone(),
            last_pruned_term: self.last_pruned_term,
            removed_peers: self.removed_peers.clone(),
            raft_rpc_token: self.raft_rpc_token.clone(),
            allow_start_election: self.allow_start_election,
        };
        self.store.persist(&blob).map_err(ConsensusError::from)
    }
}

impl From<MetadataError> for ConsensusError {
    fn from(err: MetadataError) -> Self {
        ConsensusError::Io(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommitRule, Peer};

    fn config() -> RaftConfig {
        RaftConfig::new(
            vec![Peer::voter("a", "a:1", "r1"), Peer::voter("b", "b:1", "r1")],
            CommitRule::classic(),
        )
    }

    fn cmeta() -> ConsensusMetadata {
        ConsensusMetadata::load_or_create(Box::new(InMemoryMetadataStore::new()), &config(), 8)
            .unwrap()
    }

    #[test]
    fn term_is_monotonic_and_clears_vote() {
        let mut meta = cmeta();
        meta.set_current_term(3, FlushPolicy::Flush).unwrap();
        meta.set_voted_for("a").unwrap();
        assert!(meta.set_current_term(3, FlushPolicy::Flush).is_err());
        meta.set_current_term(4, FlushPolicy::SkipFlush).unwrap();
        assert!(!meta.has_voted_current_term());
    }

    #[test]
    fn vote_is_immutable_within_term() {
        let mut meta = cmeta();
        meta.set_current_term(2, FlushPolicy::Flush).unwrap();
        meta.set_voted_for("a").unwrap();
        // Re-granting to the same candidate is fine.
        meta.set_voted_for("a").unwrap();
        assert!(meta.set_voted_for("b").is_err());
    }

    #[test]
    fn vote_history_prunes_oldest_terms() {
        let mut meta = cmeta();
        for term in 1..=12 {
            meta.set_current_term(term, FlushPolicy::SkipFlush).unwrap();
            meta.set_voted_for("a").unwrap();
        }
        let history = meta.previous_vote_history();
        assert_eq!(history.len(), 8);
        assert_eq!(history[0].election_term, 5);
        assert_eq!(meta.last_pruned_term(), 4);
    }

    #[test]
    fn pending_config_requires_advancing_opid_index() {
        let mut meta = cmeta();
        let mut newer = config();
        newer.opid_index = Some(5);
        meta.set_pending_config(newer.clone()).unwrap();
        // A second pending config is refused unless marked unsafe.
        let mut another = config();
        another.opid_index = Some(6);
        assert!(meta.set_pending_config(another).is_err());
        meta.set_committed_config(newer).unwrap();
        assert!(!meta.has_pending_config());
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileMetadataStore::new(dir.path().join("cmeta.json"));
        {
            let mut meta = ConsensusMetadata::load_or_create(Box::new(store.clone()), &config(), 8)
                .unwrap();
            meta.set_current_term(7, FlushPolicy::Flush).unwrap();
            meta.set_voted_for("b").unwrap();
        }
        let reloaded =
            ConsensusMetadata::load_or_create(Box::new(store), &config(), 8).unwrap();
        assert_eq!(reloaded.current_term(), 7);
        assert_eq!(reloaded.voted_for(), Some("b"));
        assert_eq!(reloaded.previous_vote_history().len(), 1);
    }

    #[test]
    fn last_known_leader_tracks_highest_term() {
        let mut meta = cmeta();
        meta.set_current_term(5, FlushPolicy::Flush).unwrap();
        meta.set_leader_uuid("b").unwrap();
        assert_eq!(meta.last_known_leader().uuid, "b");
        assert_eq!(meta.last_known_leader().election_term, 5);
        meta.clear_leader();
        assert_eq!(meta.last_known_leader().uuid, "b");
    }
}
