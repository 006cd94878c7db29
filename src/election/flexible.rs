use super::{ElectionVote, VoteCounter, VoteInfo, VoteLedger};
use crate::config::{majority_size, QuorumMode, RaftConfig};
use crate::error::ConsensusError;
use crate::metadata::LastKnownLeader;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Hard cap on history-walk iterations. The algorithm terminates on its
/// own; the cap guards against future bugs.
const QUORUM_ITERATION_CAP: i64 = 100;

/// Knobs for the region-aware counter.
#[derive(Debug, Clone)]
pub struct FlexibleQuorumOptions {
    pub crowdsource_last_known_leader: bool,
    /// Trust a fully-crowdsourced last known leader without term
    /// continuity. Surface preserved, off by default.
    pub trust_last_leader_entries: bool,
    /// Additionally require majority-of-region-majorities.
    pub srd_strict_leader_election_quorum: bool,
    /// Additionally require a majority in the candidate's own region.
    pub include_candidate_region: bool,
    /// How long to keep waiting for the pessimistic quorum before
    /// falling back to vote-history inference.
    pub pessimistic_quorum_wait: Duration,
}

impl Default for FlexibleQuorumOptions {
    fn default() -> Self {
        Self {
            crowdsource_last_known_leader: true,
            trust_last_leader_entries: false,
            srd_strict_leader_election_quorum: false,
            include_candidate_region: true,
            pessimistic_quorum_wait: Duration::from_secs(10),
        }
    }
}

/// Per-term progress of the history walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PotentialNextLeaders {
    /// Not enough votes or histories yet to reason about this term.
    WaitingForMoreVotes,
    /// Someone may have won `next_term`; these regions could hold them.
    Detected {
        regions: BTreeSet<String>,
        next_term: i64,
    },
    /// Every intermediate term was scanned; the final possible leader
    /// regions.
    AllScanned { regions: BTreeSet<String> },
    Error,
}

type RegionToVoterSet = BTreeMap<String, BTreeSet<String>>;
type UuidTermPair = (String, i64);

/// Region-aware vote counter for flexi-raft. For static modes the
/// decision evaluates the commit-rule predicates over per-region
/// majorities; for single-region-dynamic mode it reasons about the last
/// known leader's region, falling back to the voters' vote histories to
/// bound the set of regions an intervening leader may have come from.
pub struct FlexibleVoteCounter {
    ledger: VoteLedger,
    candidate_uuid: String,
    election_term: i64,
    initial_last_known_leader: LastKnownLeader,
    config: RaftConfig,
    options: FlexibleQuorumOptions,
    created_at: Instant,
    voter_distribution: BTreeMap<String, i32>,
    uuid_to_quorum_id: BTreeMap<String, String>,
    uuid_to_last_pruned_term: BTreeMap<String, i64>,
    yes_vote_count: BTreeMap<String, i32>,
    no_vote_count: BTreeMap<String, i32>,
    num_voters: usize,
}

impl FlexibleVoteCounter {
    pub fn new(
        candidate_uuid: impl Into<String>,
        election_term: i64,
        last_known_leader: LastKnownLeader,
        config: RaftConfig,
        adjust_voter_distribution: bool,
        options: FlexibleQuorumOptions,
    ) -> Self {
        let voter_distribution = if adjust_voter_distribution {
            config.effective_voter_distribution()
        } else {
            config.voter_distribution.clone()
        };
        let mut uuid_to_quorum_id = BTreeMap::new();
        for peer in config.peers.iter().filter(|p| p.is_voter()) {
            uuid_to_quorum_id.insert(peer.uuid.clone(), config.quorum_id_of(peer));
        }
        let mut yes_vote_count = BTreeMap::new();
        let mut no_vote_count = BTreeMap::new();
        for (region, count) in &voter_distribution {
            if adjust_voter_distribution && *count <= 0 {
                continue;
            }
            yes_vote_count.insert(region.clone(), 0);
            no_vote_count.insert(region.clone(), 0);
        }
        let num_voters = uuid_to_quorum_id.len();
        assert!(num_voters > 0, "flexible counter requires voters");
        Self {
            ledger: VoteLedger::default(),
            candidate_uuid: candidate_uuid.into(),
            election_term,
            initial_last_known_leader: last_known_leader,
            config,
            options,
            created_at: Instant::now(),
            voter_distribution,
            uuid_to_quorum_id,
            uuid_to_last_pruned_term: BTreeMap::new(),
            yes_vote_count,
            no_vote_count,
            num_voters,
        }
    }

    fn quorum_id_for_uuid(&self, uuid: &str) -> String {
        self.uuid_to_quorum_id.get(uuid).cloned().unwrap_or_default()
    }

    fn votes_remaining_in_region(&self, region: &str) -> i32 {
        let yes = self.yes_vote_count.get(region).copied().unwrap_or(0);
        let no = self.no_vote_count.get(region).copied().unwrap_or(0);
        let total = self.voter_distribution.get(region).copied().unwrap_or(0);
        total - yes - no
    }

    /// Count voters per region whose history is pruned above `term`.
    fn regional_pruned_counts(&self, term: i64) -> BTreeMap<String, i32> {
        let mut counts = BTreeMap::new();
        for (uuid, &pruned_term) in &self.uuid_to_last_pruned_term {
            if pruned_term > term {
                let region = self.quorum_id_for_uuid(uuid);
                *counts.entry(region).or_insert(0) += 1;
            }
        }
        counts
    }

    fn regional_unpruned_counts(&self, term: i64) -> BTreeMap<String, i32> {
        let mut counts = BTreeMap::new();
        for (uuid, &pruned_term) in &self.uuid_to_last_pruned_term {
            if pruned_term <= term {
                let region = self.quorum_id_for_uuid(uuid);
                *counts.entry(region).or_insert(0) += 1;
            }
        }
        counts
    }

    /// For each region: (majority satisfied, majority still possible).
    fn is_majority_satisfied_in_region(&self, region: &str) -> (bool, bool) {
        if region.is_empty() {
            return (false, false);
        }
        let yes = self.yes_vote_count.get(region).copied().unwrap_or(0);
        let no = self.no_vote_count.get(region).copied().unwrap_or(0);
        let total = self.voter_distribution.get(region).copied().unwrap_or(0);
        let needed = majority_size(total.max(0) as usize) as i32;
        let satisfied = yes >= needed;
        let possible = satisfied || no + needed <= total;
        (satisfied, possible)
    }

    fn is_majority_satisfied_in_all_regions(
        &self,
        regions: &BTreeSet<String>,
    ) -> (bool, bool) {
        assert!(!regions.is_empty());
        let mut satisfied = true;
        let mut possible = true;
        for region in regions {
            let (region_satisfied, region_possible) = self.is_majority_satisfied_in_region(region);
            satisfied = satisfied && region_satisfied;
            possible = possible && region_possible;
        }
        (satisfied, possible)
    }

    fn is_majority_satisfied_in_majority_of_regions(&self) -> (bool, bool) {
        let num_regions = self.voter_distribution.len();
        let needed = majority_size(num_regions);
        let mut satisfied_count = 0;
        let mut possible_count = 0;
        for region in self.voter_distribution.keys() {
            let (satisfied, possible) = self.is_majority_satisfied_in_region(region);
            if satisfied {
                satisfied_count += 1;
            }
            if possible {
                possible_count += 1;
            }
        }
        (satisfied_count >= needed, possible_count >= needed)
    }

    /// Evaluates the static commit-rule predicates: a predicate with
    /// subset size K is satisfied when at least K of its regions reach
    /// per-region majority, and unsatisfiable when fewer than K still
    /// can.
    fn static_quorum_state(&self) -> (bool, bool) {
        assert!(matches!(
            self.config.commit_rule.mode,
            QuorumMode::StaticDisjunction | QuorumMode::StaticConjunction
        ));
        assert!(!self.config.commit_rule.predicates.is_empty());
        let mut states = Vec::new();
        for predicate in &self.config.commit_rule.predicates {
            let mut satisfied_count = 0usize;
            let mut impossible_count = 0usize;
            for region in &predicate.regions {
                let (satisfied, possible) = self.is_majority_satisfied_in_region(region);
                if satisfied {
                    satisfied_count += 1;
                }
                if !possible {
                    impossible_count += 1;
                }
            }
            let satisfied = satisfied_count >= predicate.subset_size;
            let possible =
                predicate.regions.len() - impossible_count >= predicate.subset_size;
            states.push((satisfied, possible));
        }
        match self.config.commit_rule.mode {
            QuorumMode::StaticDisjunction => (
                states.iter().any(|s| s.0),
                states.iter().any(|s| s.1),
            ),
            _ => (
                states.iter().all(|s| s.0),
                states.iter().all(|s| s.1),
            ),
        }
    }

    /// The most comprehensive election quorum: a majority in every
    /// region. Used first; heuristics below apply when regions are down.
    fn is_pessimistic_quorum_satisfied(&self) -> (bool, bool) {
        let regions: BTreeSet<String> = self.voter_distribution.keys().cloned().collect();
        self.is_majority_satisfied_in_all_regions(&regions)
    }

    /// Merge the last-known-leader reports from every responder,
    /// keeping the highest term.
    fn last_known_leader(&self) -> LastKnownLeader {
        let mut best = self.initial_last_known_leader.clone();
        if self.options.crowdsource_last_known_leader {
            for info in self.ledger.votes().values() {
                if info.last_known_leader.election_term > best.election_term {
                    best = info.last_known_leader.clone();
                }
            }
        }
        best
    }

    /// Election intersection rules once the leader regions are known:
    /// majority in every named region, plus the optional strict and
    /// candidate-region requirements.
    fn are_majorities_satisfied(
        &self,
        leader_regions: &BTreeSet<String>,
        candidate_region: &str,
    ) -> (bool, bool) {
        let (mut satisfied, mut possible) =
            self.is_majority_satisfied_in_all_regions(leader_regions);

        if self.options.srd_strict_leader_election_quorum {
            let (strict_satisfied, strict_possible) =
                self.is_majority_satisfied_in_majority_of_regions();
            satisfied = satisfied && strict_satisfied;
            possible = possible && strict_possible;
        }

        if self.options.include_candidate_region && !leader_regions.contains(candidate_region) {
            let (candidate_satisfied, candidate_possible) =
                self.is_majority_satisfied_in_region(candidate_region);
            satisfied = satisfied && candidate_satisfied;
            possible = possible && candidate_possible;
        }

        (satisfied, possible)
    }

    /// Historical-vote variant of the per-region majority check: voters
    /// whose votes have not arrived, or whose histories are pruned, may
    /// still have voted yes.
    fn do_historical_votes_satisfy_majority_in_region(
        &self,
        region: &str,
        votes_received: i32,
        pruned_count: i32,
    ) -> (bool, bool) {
        let total = self.voter_distribution.get(region).copied().unwrap_or(0);
        let needed = majority_size(total.max(0) as usize) as i32;
        let remaining = self.votes_remaining_in_region(region);
        let satisfied = votes_received >= needed;
        let possible = votes_received + remaining + pruned_count >= needed;
        (satisfied, possible)
    }

    /// Whether enough votes and histories have arrived to reason about
    /// terms above `term` in the given regions.
    fn enough_votes_with_sufficient_histories(
        &self,
        term: i64,
        leader_regions: &BTreeSet<String>,
    ) -> bool {
        for region in leader_regions {
            let total = self.voter_distribution.get(region).copied().unwrap_or(0);
            let not_received = self.votes_remaining_in_region(region);
            if not_received >= majority_size(total.max(0) as usize) as i32 {
                debug!(
                    "event=raft_flexi_waiting_votes region={region} votes_missing={not_received}"
                );
                return false;
            }
        }
        let unpruned = self.regional_unpruned_counts(term);
        for region in leader_regions {
            let total = self.voter_distribution.get(region).copied().unwrap_or(0);
            let unpruned_count = unpruned.get(region).copied().unwrap_or(0);
            if unpruned_count < majority_size(total.max(0) as usize) as i32 {
                debug!(
                    "event=raft_flexi_insufficient_history region={region} unpruned={unpruned_count}"
                );
                return false;
            }
        }
        true
    }

    /// Groups, per candidate `(uuid, term)`, the voters from the given
    /// regions whose first vote after `term` went to that candidate.
    /// Also yields the smallest such term.
    fn region_wise_vote_collation(
        &self,
        term: i64,
        leader_regions: &BTreeSet<String>,
    ) -> (BTreeMap<UuidTermPair, RegionToVoterSet>, i64) {
        let mut collation: BTreeMap<UuidTermPair, RegionToVoterSet> = BTreeMap::new();
        let mut min_term = i64::MAX;
        for (uuid, info) in self.ledger.votes() {
            let region = self.quorum_id_for_uuid(uuid);
            if region.is_empty() || !leader_regions.contains(&region) {
                continue;
            }
            // First recorded vote strictly after `term`.
            let Some(vote) = info
                .previous_vote_history
                .iter()
                .find(|v| v.election_term > term)
            else {
                continue;
            };
            min_term = min_term.min(vote.election_term);
            collation
                .entry((vote.candidate_uuid.clone(), vote.election_term))
                .or_default()
                .entry(region)
                .or_default()
                .insert(uuid.clone());
        }
        (collation, min_term)
    }

    /// One step of the history walk: finds the candidates that may have
    /// won the next contested term. A region whose historical votes
    /// confirm a candidate's majority is resolved and drops out of the
    /// accumulator; each potential winner's own region is added instead.
    fn potential_next_leaders(
        &self,
        term: i64,
        leader_regions: &BTreeSet<String>,
    ) -> PotentialNextLeaders {
        if !self.enough_votes_with_sufficient_histories(term, leader_regions) {
            return PotentialNextLeaders::WaitingForMoreVotes;
        }

        let (mut collation, mut min_term) = self.region_wise_vote_collation(term, leader_regions);
        let mut next_leader_regions = leader_regions.clone();
        let mut iterations = 0i64;

        while !collation.is_empty()
            && min_term < self.election_term
            && iterations < QUORUM_ITERATION_CAP
        {
            iterations += 1;
            let pruned_counts = self.regional_pruned_counts(min_term);
            let mut potential_leader_uuids: BTreeSet<String> = BTreeSet::new();

            for ((candidate, vote_term), region_to_voters) in &collation {
                if *vote_term != min_term {
                    continue;
                }
                for leader_region in leader_regions {
                    let votes_received = region_to_voters
                        .get(leader_region)
                        .map(|s| s.len() as i32)
                        .unwrap_or(0);
                    let pruned = pruned_counts.get(leader_region).copied().unwrap_or(0);
                    let (satisfied, possible) = self
                        .do_historical_votes_satisfy_majority_in_region(
                            leader_region,
                            votes_received,
                            pruned,
                        );
                    if satisfied {
                        next_leader_regions.remove(leader_region);
                        potential_leader_uuids.insert(candidate.clone());
                    } else if possible {
                        potential_leader_uuids.insert(candidate.clone());
                    }
                }
            }

            if !potential_leader_uuids.is_empty() {
                for uuid in &potential_leader_uuids {
                    let region = self.quorum_id_for_uuid(uuid);
                    if region.is_empty() {
                        // A potential leader outside our configuration;
                        // no safe intersection exists.
                        warn!("event=raft_flexi_unknown_potential_leader uuid={uuid}");
                        return PotentialNextLeaders::Error;
                    }
                    next_leader_regions.insert(region);
                }
                return PotentialNextLeaders::Detected {
                    regions: next_leader_regions,
                    next_term: min_term,
                };
            }

            // Nobody could have won min_term; advance to the next term
            // present in the histories.
            let old_min_term = min_term;
            let (new_collation, new_min_term) =
                self.region_wise_vote_collation(old_min_term, leader_regions);
            collation = new_collation;
            min_term = new_min_term;
            debug_assert!(min_term > old_min_term);
        }

        PotentialNextLeaders::AllScanned {
            regions: next_leader_regions,
        }
    }

    /// Walks the voters' histories from the last known leader's term to
    /// the election term, tracking the regions an intervening leader
    /// could have come from (resolved regions drop out along the way),
    /// then applies the intersection rules to the final set.
    fn compute_election_result_from_voting_history(
        &self,
        last_known_leader: &LastKnownLeader,
        last_known_leader_region: &str,
        candidate_region: &str,
    ) -> (bool, bool) {
        let mut term = last_known_leader.election_term;
        let mut next_leader_regions: BTreeSet<String> =
            BTreeSet::from([last_known_leader_region.to_string()]);
        let mut explored: BTreeSet<String> = next_leader_regions.clone();
        let mut iterations = 0i64;

        while explored.len() < self.voter_distribution.len()
            && iterations < QUORUM_ITERATION_CAP
        {
            iterations += 1;
            match self.potential_next_leaders(term, &next_leader_regions) {
                PotentialNextLeaders::Detected { regions, next_term } => {
                    debug_assert!(next_term > term);
                    term = next_term;
                    explored.extend(regions.iter().cloned());
                    next_leader_regions = regions;
                    debug!(
                        "event=raft_flexi_history_step next_term={term} regions={}",
                        next_leader_regions.len()
                    );
                }
                PotentialNextLeaders::AllScanned { regions } => {
                    info!(
                        "event=raft_flexi_history_scanned election_term={} regions={}",
                        self.election_term,
                        regions.len()
                    );
                    return self.are_majorities_satisfied(&regions, candidate_region);
                }
                PotentialNextLeaders::Error | PotentialNextLeaders::WaitingForMoreVotes => {
                    return (false, true);
                }
            }
        }

        // Converged to the most pessimistic quorum without an answer.
        (false, true)
    }

    fn dynamic_quorum_state(&self) -> (bool, bool) {
        assert_eq!(self.config.commit_rule.mode, QuorumMode::SingleRegionDynamic);

        let last_known_leader = self.last_known_leader();

        // A leader already exists at or above our term: lose early.
        if self.election_term <= last_known_leader.election_term {
            info!(
                "event=raft_flexi_lost_to_known_leader election_term={} leader_term={}",
                self.election_term, last_known_leader.election_term
            );
            return (false, false);
        }

        let last_leader_region = self.quorum_id_for_uuid(&last_known_leader.uuid);
        let pessimistic = self.is_pessimistic_quorum_satisfied();

        // The pessimistic result stands when it is satisfied, or when we
        // depend on an unknown last-leader region (e.g. bootstrap).
        if pessimistic.0 || last_leader_region.is_empty() {
            return pessimistic;
        }

        let candidate_region = self.quorum_id_for_uuid(&self.candidate_uuid);

        let continuity_not_required = self.options.crowdsource_last_known_leader
            && self.options.trust_last_leader_entries
            && self.are_all_votes_in()
            && !last_known_leader.uuid.is_empty();
        let is_continuous = self.election_term == last_known_leader.election_term + 1;

        if is_continuous || continuity_not_required {
            let regions = BTreeSet::from([last_leader_region]);
            return self.are_majorities_satisfied(&regions, &candidate_region);
        }

        // Discontinuity in terms. Give the pessimistic quorum a bounded
        // window before reasoning from vote histories.
        if pessimistic.1 && self.created_at.elapsed() < self.options.pessimistic_quorum_wait {
            return pessimistic;
        }

        self.compute_election_result_from_voting_history(
            &last_known_leader,
            &last_leader_region,
            &candidate_region,
        )
    }

    fn quorum_state(&self) -> (bool, bool) {
        match self.config.commit_rule.mode {
            QuorumMode::StaticDisjunction | QuorumMode::StaticConjunction => {
                self.static_quorum_state()
            }
            _ => self.dynamic_quorum_state(),
        }
    }
}

impl VoteCounter for FlexibleVoteCounter {
    fn register_vote(&mut self, voter_uuid: &str, info: VoteInfo) -> Result<bool, ConsensusError> {
        if !self.uuid_to_quorum_id.contains_key(voter_uuid) {
            return Err(ConsensusError::invalid_argument(format!(
                "uuid {voter_uuid} not present in config"
            )));
        }
        let last_pruned_term = info.last_pruned_term;
        let vote = info.vote.expect("vote not set");
        let duplicate = self.ledger.record(voter_uuid, info)?;
        if duplicate {
            return Ok(true);
        }
        let quorum_id = self.quorum_id_for_uuid(voter_uuid);
        match vote {
            ElectionVote::Granted => {
                *self.yes_vote_count.entry(quorum_id).or_insert(0) += 1;
            }
            ElectionVote::Denied => {
                *self.no_vote_count.entry(quorum_id).or_insert(0) += 1;
            }
        }
        self.uuid_to_last_pruned_term
            .insert(voter_uuid.to_string(), last_pruned_term);
        Ok(false)
    }

    fn is_decided(&self) -> bool {
        let (satisfied, possible) = self.quorum_state();
        satisfied || !possible
    }

    fn decision(&self) -> Result<ElectionVote, ConsensusError> {
        let (satisfied, possible) = self.quorum_state();
        if satisfied {
            return Ok(ElectionVote::Granted);
        }
        if !possible {
            return Ok(ElectionVote::Denied);
        }
        Err(ConsensusError::illegal_state("vote not yet decided"))
    }

    fn total_votes_counted(&self) -> usize {
        self.ledger.yes_votes() + self.ledger.no_votes()
    }

    fn total_expected_votes(&self) -> usize {
        self.num_voters
    }

    fn is_candidate_removed(&self) -> bool {
        self.ledger.candidate_removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommitRule, CommitRulePredicate, Peer};
    use crate::metadata::PreviousVote;

    fn flexi_config(regions: &[(&str, usize)], mode: QuorumMode) -> RaftConfig {
        let mut peers = Vec::new();
        let mut distribution = BTreeMap::new();
        for (region, count) in regions {
            distribution.insert(region.to_string(), *count as i32);
            for i in 0..*count {
                peers.push(Peer::voter(
                    format!("{region}-{i}"),
                    format!("{region}-{i}:1"),
                    *region,
                ));
            }
        }
        let mut config = RaftConfig::new(
            peers,
            CommitRule {
                mode,
                use_quorum_id: false,
                predicates: Vec::new(),
            },
        );
        config.voter_distribution = distribution;
        config
    }

    fn vote(granted: bool, lkl: LastKnownLeader, history: Vec<PreviousVote>) -> VoteInfo {
        VoteInfo {
            vote: Some(if granted {
                ElectionVote::Granted
            } else {
                ElectionVote::Denied
            }),
            last_known_leader: lkl,
            last_pruned_term: 0,
            previous_vote_history: history,
            is_candidate_removed: false,
        }
    }

    fn lkl(uuid: &str, term: i64) -> LastKnownLeader {
        LastKnownLeader {
            uuid: uuid.to_string(),
            election_term: term,
        }
    }

    fn pv(term: i64, candidate: &str) -> PreviousVote {
        PreviousVote {
            election_term: term,
            candidate_uuid: candidate.to_string(),
        }
    }

    #[test]
    fn static_disjunction_grants_on_any_predicate() {
        let mut config = flexi_config(&[("r1", 3), ("r2", 3)], QuorumMode::StaticDisjunction);
        config.commit_rule.predicates = vec![
            CommitRulePredicate {
                regions: vec!["r1".into()],
                subset_size: 1,
            },
            CommitRulePredicate {
                regions: vec!["r2".into()],
                subset_size: 1,
            },
        ];
        let mut counter = FlexibleVoteCounter::new(
            "r1-0",
            2,
            LastKnownLeader::default(),
            config,
            true,
            FlexibleQuorumOptions::default(),
        );
        counter
            .register_vote("r1-0", vote(true, LastKnownLeader::default(), vec![]))
            .unwrap();
        assert!(!counter.is_decided());
        counter
            .register_vote("r1-1", vote(true, LastKnownLeader::default(), vec![]))
            .unwrap();
        assert!(counter.is_decided());
        assert_eq!(counter.decision().unwrap(), ElectionVote::Granted);
    }

    #[test]
    fn static_conjunction_requires_all_predicates() {
        let mut config = flexi_config(&[("r1", 3), ("r2", 3)], QuorumMode::StaticConjunction);
        config.commit_rule.predicates = vec![
            CommitRulePredicate {
                regions: vec!["r1".into()],
                subset_size: 1,
            },
            CommitRulePredicate {
                regions: vec!["r2".into()],
                subset_size: 1,
            },
        ];
        let mut counter = FlexibleVoteCounter::new(
            "r1-0",
            2,
            LastKnownLeader::default(),
            config,
            true,
            FlexibleQuorumOptions::default(),
        );
        counter
            .register_vote("r1-0", vote(true, LastKnownLeader::default(), vec![]))
            .unwrap();
        counter
            .register_vote("r1-1", vote(true, LastKnownLeader::default(), vec![]))
            .unwrap();
        // r1 majority alone is not enough under conjunction.
        assert!(!counter.is_decided());
        // Two denials in r2 make its majority impossible: decided, lost.
        counter
            .register_vote("r2-0", vote(false, LastKnownLeader::default(), vec![]))
            .unwrap();
        counter
            .register_vote("r2-1", vote(false, LastKnownLeader::default(), vec![]))
            .unwrap();
        assert!(counter.is_decided());
        assert_eq!(counter.decision().unwrap(), ElectionVote::Denied);
    }

    #[test]
    fn dynamic_continuous_term_intersects_leader_region() {
        let config = flexi_config(&[("r1", 3), ("r2", 3)], QuorumMode::SingleRegionDynamic);
        // Last known leader r2-0 at term 4; election at term 5 directly
        // succeeds it.
        let mut counter = FlexibleVoteCounter::new(
            "r1-0",
            5,
            lkl("r2-0", 4),
            config,
            true,
            FlexibleQuorumOptions::default(),
        );
        counter.register_vote("r1-0", vote(true, lkl("r2-0", 4), vec![])).unwrap();
        counter.register_vote("r1-1", vote(true, lkl("r2-0", 4), vec![])).unwrap();
        // Candidate region majority alone is insufficient: needs r2.
        assert!(!counter.is_decided());
        counter.register_vote("r2-0", vote(true, lkl("r2-0", 4), vec![])).unwrap();
        counter.register_vote("r2-1", vote(true, lkl("r2-0", 4), vec![])).unwrap();
        assert!(counter.is_decided());
        assert_eq!(counter.decision().unwrap(), ElectionVote::Granted);
    }

    #[test]
    fn dynamic_loses_early_on_higher_known_leader() {
        let config = flexi_config(&[("r1", 3), ("r2", 3)], QuorumMode::SingleRegionDynamic);
        let mut counter = FlexibleVoteCounter::new(
            "r1-0",
            5,
            lkl("r2-0", 3),
            config,
            true,
            FlexibleQuorumOptions::default(),
        );
        counter.register_vote("r1-0", vote(true, lkl("r2-0", 3), vec![])).unwrap();
        // A responder crowdsources a leader at term 6 >= our term 5.
        counter
            .register_vote("r2-0", vote(false, lkl("r2-1", 6), vec![]))
            .unwrap();
        assert!(counter.is_decided());
        assert_eq!(counter.decision().unwrap(), ElectionVote::Denied);
    }

    #[test]
    fn dynamic_pessimistic_quorum_wins_everywhere() {
        let config = flexi_config(&[("r1", 1), ("r2", 1), ("r3", 1)], QuorumMode::SingleRegionDynamic);
        let mut counter = FlexibleVoteCounter::new(
            "r1-0",
            7,
            lkl("r2-0", 2),
            config,
            true,
            FlexibleQuorumOptions::default(),
        );
        for uuid in ["r1-0", "r2-0", "r3-0"] {
            counter
                .register_vote(uuid, vote(true, lkl("r2-0", 2), vec![]))
                .unwrap();
        }
        assert!(counter.is_decided());
        assert_eq!(counter.decision().unwrap(), ElectionVote::Granted);
    }

    // The analysis-paralysis case: a term gap between the last known
    // leader and the election, resolved through voters' histories.
    #[test]
    fn dynamic_gap_requires_majorities_in_potential_leader_regions() {
        let options = FlexibleQuorumOptions {
            pessimistic_quorum_wait: Duration::ZERO,
            ..FlexibleQuorumOptions::default()
        };
        let config = flexi_config(&[("r1", 3), ("r2", 3), ("r3", 3)], QuorumMode::SingleRegionDynamic);
        let leader = lkl("r2-0", 4);
        // Candidate r1-0 at term 7; last known leader at term 4 (gap).
        let mut counter = FlexibleVoteCounter::new(
            "r1-0",
            7,
            leader.clone(),
            config,
            true,
            options,
        );
        // At term 5, a majority of r2 (the then-required intersection
        // region) confirms its votes went to r3-0: r2 is resolved and
        // drops out, and r3 becomes the potential leader region. The
        // split term-6 votes change nothing beyond that.
        // r1 voters grant; r2 voters grant; r3 voters deny (so the
        // candidate lacks the r3 majority it now needs).
        counter
            .register_vote("r1-0", vote(true, leader.clone(), vec![]))
            .unwrap();
        counter
            .register_vote("r1-1", vote(true, leader.clone(), vec![]))
            .unwrap();
        counter
            .register_vote("r1-2", vote(true, leader.clone(), vec![]))
            .unwrap();
        counter
            .register_vote(
                "r2-0",
                vote(true, leader.clone(), vec![pv(5, "r3-0"), pv(6, "r1-1")]),
            )
            .unwrap();
        counter
            .register_vote(
                "r2-1",
                vote(true, leader.clone(), vec![pv(5, "r3-0"), pv(6, "r1-2")]),
            )
            .unwrap();
        counter
            .register_vote("r2-2", vote(true, leader.clone(), vec![pv(6, "r2-1")]))
            .unwrap();
        counter
            .register_vote("r3-0", vote(false, leader.clone(), vec![]))
            .unwrap();
        counter
            .register_vote("r3-1", vote(false, leader.clone(), vec![]))
            .unwrap();
        counter
            .register_vote("r3-2", vote(false, leader, vec![]))
            .unwrap();
        // All votes are in; r3's majority is impossible, and r3 is a
        // potential leader region: the election is decidedly lost.
        assert!(counter.is_decided());
        assert_eq!(counter.decision().unwrap(), ElectionVote::Denied);
    }

    #[test]
    fn history_walk_terminates_under_iteration_cap() {
        let options = FlexibleQuorumOptions {
            pessimistic_quorum_wait: Duration::ZERO,
            ..FlexibleQuorumOptions::default()
        };
        let config = flexi_config(&[("r1", 3), ("r2", 3)], QuorumMode::SingleRegionDynamic);
        let leader = lkl("r2-0", 1);
        let mut counter =
            FlexibleVoteCounter::new("r1-0", 500, leader.clone(), config, true, options);
        // Long alternating histories with no term ever reaching a
        // majority: the walk must still converge to a decision state.
        let mut history_a = Vec::new();
        let mut history_b = Vec::new();
        for term in 2..400 {
            if term % 2 == 0 {
                history_a.push(pv(term, "r1-1"));
            } else {
                history_b.push(pv(term, "r2-1"));
            }
        }
        counter
            .register_vote("r2-0", vote(true, leader.clone(), history_a))
            .unwrap();
        counter
            .register_vote("r2-1", vote(true, leader.clone(), history_b))
            .unwrap();
        counter
            .register_vote("r2-2", vote(true, leader.clone(), vec![]))
            .unwrap();
        counter
            .register_vote("r1-0", vote(true, leader.clone(), vec![]))
            .unwrap();
        // Two denials in the candidate's own region make its required
        // majority impossible, so the walk must conclude with a loss
        // rather than hang.
        counter
            .register_vote("r1-1", vote(false, leader.clone(), vec![]))
            .unwrap();
        counter
            .register_vote("r1-2", vote(false, leader, vec![]))
            .unwrap();
        assert!(counter.is_decided());
        assert_eq!(counter.decision().unwrap(), ElectionVote::Denied);
    }

    #[test]
    fn randomized_histories_always_terminate() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha20Rng;
        let mut rng = ChaCha20Rng::seed_from_u64(17);
        let voters: Vec<String> = (1..=3)
            .flat_map(|r| (0..3).map(move |i| format!("r{r}-{i}")))
            .collect();
        for _ in 0..50 {
            let options = FlexibleQuorumOptions {
                pessimistic_quorum_wait: Duration::ZERO,
                ..FlexibleQuorumOptions::default()
            };
            let config = flexi_config(
                &[("r1", 3), ("r2", 3), ("r3", 3)],
                QuorumMode::SingleRegionDynamic,
            );
            let leader = lkl("r2-0", 1);
            let mut counter =
                FlexibleVoteCounter::new("r1-0", 40, leader.clone(), config, true, options);
            for uuid in &voters {
                let mut history = Vec::new();
                let mut term = 2;
                while term < 40 {
                    if rng.gen_bool(0.4) {
                        let candidate = &voters[rng.gen_range(0..voters.len())];
                        history.push(pv(term, candidate));
                    }
                    term += rng.gen_range(1..4);
                }
                let granted = rng.gen_bool(0.5);
                counter
                    .register_vote(uuid, vote(granted, leader.clone(), history))
                    .unwrap();
            }
            // Every vote is in: the history walk must settle on a final
            // quorum state without exhausting the iteration cap.
            let _ = counter.is_decided();
            let _ = counter.decision();
        }
    }
}
