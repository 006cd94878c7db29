use crate::error::ConsensusError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Whether a peer participates in quorums or only receives replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberType {
    Voter,
    NonVoter,
}

/// Per-peer attributes steering membership automation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAttrs {
    /// Promote this NON_VOTER to VOTER once it has caught up.
    #[serde(default)]
    pub promote: bool,
    /// This peer is marked for replacement.
    #[serde(default)]
    pub replace: bool,
}

/// A member of the Raft configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub uuid: String,
    pub address: String,
    pub region: String,
    #[serde(default)]
    pub quorum_id: Option<String>,
    pub member_type: MemberType,
    #[serde(default)]
    pub attrs: PeerAttrs,
    /// Whether this voter is backed by a durable database instance.
    #[serde(default)]
    pub backed_by_db: bool,
}

impl Peer {
    pub fn voter(uuid: impl Into<String>, address: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            address: address.into(),
            region: region.into(),
            quorum_id: None,
            member_type: MemberType::Voter,
            attrs: PeerAttrs::default(),
            backed_by_db: false,
        }
    }

    pub fn non_voter(
        uuid: impl Into<String>,
        address: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            member_type: MemberType::NonVoter,
            ..Peer::voter(uuid, address, region)
        }
    }

    pub fn is_voter(&self) -> bool {
        self.member_type == MemberType::Voter
    }
}

/// How the commit (and election) quorum is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumMode {
    /// Plain Raft: majority of all voters.
    Classic,
    /// Commit quorum is a majority of the leader's own region; elections
    /// must intersect the last leader's region.
    SingleRegionDynamic,
    /// Commit rule is the OR of per-region-majority predicates.
    StaticDisjunction,
    /// Commit rule is the AND of per-region-majority predicates.
    StaticConjunction,
}

/// One predicate of a static commit rule: at least `subset_size` of
/// `regions` must reach per-region majority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRulePredicate {
    pub regions: Vec<String>,
    pub subset_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRule {
    pub mode: QuorumMode,
    /// Partition voters by explicit `quorum_id` instead of region.
    #[serde(default)]
    pub use_quorum_id: bool,
    #[serde(default)]
    pub predicates: Vec<CommitRulePredicate>,
}

impl CommitRule {
    pub fn classic() -> Self {
        Self {
            mode: QuorumMode::Classic,
            use_quorum_id: false,
            predicates: Vec::new(),
        }
    }

    pub fn single_region_dynamic() -> Self {
        Self {
            mode: QuorumMode::SingleRegionDynamic,
            use_quorum_id: false,
            predicates: Vec::new(),
        }
    }

    pub fn is_flexi(&self) -> bool {
        self.mode != QuorumMode::Classic
    }
}

/// The Raft configuration: membership plus the quorum geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Index of the config-change operation that installed this config.
    /// `None` until stamped at replication time.
    #[serde(default)]
    pub opid_index: Option<i64>,
    pub peers: Vec<Peer>,
    /// Expected voter count per region (or quorum id), used to size
    /// per-region majorities. May lag the live membership.
    #[serde(default)]
    pub voter_distribution: BTreeMap<String, i32>,
    pub commit_rule: CommitRule,
    #[serde(default)]
    pub unsafe_config_change: bool,
}

impl RaftConfig {
    pub fn new(peers: Vec<Peer>, commit_rule: CommitRule) -> Self {
        Self {
            opid_index: None,
            peers,
            voter_distribution: BTreeMap::new(),
            commit_rule,
            unsafe_config_change: false,
        }
    }

    pub fn peer(&self, uuid: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.uuid == uuid)
    }

    pub fn peer_mut(&mut self, uuid: &str) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.uuid == uuid)
    }

    pub fn is_member(&self, uuid: &str) -> bool {
        self.peer(uuid).is_some()
    }

    pub fn is_voter(&self, uuid: &str) -> bool {
        self.peer(uuid).map(Peer::is_voter).unwrap_or(false)
    }

    pub fn count_voters(&self) -> usize {
        self.peers.iter().filter(|p| p.is_voter()).count()
    }

    pub fn voter_uuids(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| p.is_voter())
            .map(|p| p.uuid.clone())
            .collect()
    }

    pub fn remove_peer(&mut self, uuid: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.uuid != uuid);
        self.peers.len() != before
    }

    /// The label a peer is partitioned under: its `quorum_id` when the
    /// commit rule routes by quorum id, its region otherwise.
    pub fn quorum_id_of(&self, peer: &Peer) -> String {
        quorum_id_for_peer(peer, self.commit_rule.use_quorum_id)
    }

    /// Expected per-region voter counts, reconciled with the live voter
    /// list: regions with live voters missing from the declared
    /// distribution are added at their live counts, and declared counts
    /// below the live count are raised to it.
    pub fn effective_voter_distribution(&self) -> BTreeMap<String, i32> {
        let mut distribution = self.voter_distribution.clone();
        let mut live: BTreeMap<String, i32> = BTreeMap::new();
        for peer in self.peers.iter().filter(|p| p.is_voter()) {
            *live.entry(self.quorum_id_of(peer)).or_insert(0) += 1;
        }
        for (region, count) in live {
            let entry = distribution.entry(region).or_insert(0);
            if *entry < count {
                *entry = count;
            }
        }
        distribution.retain(|_, count| *count > 0);
        distribution
    }

    /// Live voter count per region/quorum in this config.
    pub fn live_voter_counts(&self, backed_by_db_only: bool) -> BTreeMap<String, i32> {
        let mut counts: BTreeMap<String, i32> = BTreeMap::new();
        for peer in self.peers.iter().filter(|p| p.is_voter()) {
            if backed_by_db_only && !peer.backed_by_db {
                continue;
            }
            *counts.entry(self.quorum_id_of(peer)).or_insert(0) += 1;
        }
        counts
    }

    /// Structural validation of the config.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            if peer.uuid.is_empty() {
                return Err(ConsensusError::invalid_argument("peer with empty uuid"));
            }
            if !seen.insert(peer.uuid.clone()) {
                return Err(ConsensusError::invalid_argument(format!(
                    "duplicate peer uuid {} in config",
                    peer.uuid
                )));
            }
        }
        if self.count_voters() == 0 {
            return Err(ConsensusError::invalid_argument("config has no voters"));
        }
        if self.commit_rule.is_flexi() {
            let distribution = self.effective_voter_distribution();
            for peer in self.peers.iter().filter(|p| p.is_voter()) {
                let quorum_id = self.quorum_id_of(peer);
                if quorum_id.is_empty() {
                    return Err(ConsensusError::invalid_argument(format!(
                        "voter {} has no region/quorum_id in flexi mode",
                        peer.uuid
                    )));
                }
                if !distribution.contains_key(&quorum_id) {
                    return Err(ConsensusError::invalid_argument(format!(
                        "voter {} in region {} not covered by voter distribution",
                        peer.uuid, quorum_id
                    )));
                }
            }
        }
        match self.commit_rule.mode {
            QuorumMode::StaticDisjunction | QuorumMode::StaticConjunction => {
                if self.commit_rule.predicates.is_empty() {
                    return Err(ConsensusError::invalid_argument(
                        "static commit rule requires at least one predicate",
                    ));
                }
                for predicate in &self.commit_rule.predicates {
                    if predicate.subset_size == 0 || predicate.subset_size > predicate.regions.len()
                    {
                        return Err(ConsensusError::invalid_argument(format!(
                            "predicate subset size {} out of range for {} regions",
                            predicate.subset_size,
                            predicate.regions.len()
                        )));
                    }
                }
            }
            QuorumMode::Classic | QuorumMode::SingleRegionDynamic => {}
        }
        Ok(())
    }
}

/// Raft majority: floor(n/2) + 1.
pub fn majority_size(num_voters: usize) -> usize {
    num_voters / 2 + 1
}

pub(crate) fn quorum_id_for_peer(peer: &Peer, use_quorum_id: bool) -> String {
    if use_quorum_id {
        peer.quorum_id.clone().unwrap_or_default()
    } else {
        peer.region.clone()
    }
}

/// UUIDs present in `old` but absent from `new`.
pub fn removed_peer_uuids(old: &RaftConfig, new: &RaftConfig) -> Vec<String> {
    old.peers
        .iter()
        .filter(|p| !new.is_member(&p.uuid))
        .map(|p| p.uuid.clone())
        .collect()
}
