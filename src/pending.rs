use crate::error::ConsensusError;
use crate::opid::OpId;
use crate::rpc::{OpType, ReplicateMsg};
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

pub type ReplicatedCallback = Box<dyn FnOnce(Result<(), ConsensusError>) + Send>;

const UNBOUND_TERM: i64 = -1;

/// One in-flight replicated operation, shared between the leader-side
/// queue and the apply pipeline. The callback fires exactly once, with
/// `Ok` on commit or `Aborted` when a new leader supersedes the round.
pub struct Round {
    replicate: Mutex<Arc<ReplicateMsg>>,
    bound_term: AtomicI64,
    replicated_cb: Mutex<Option<ReplicatedCallback>>,
}

impl Round {
    pub fn new(msg: ReplicateMsg, cb: Option<ReplicatedCallback>) -> Arc<Self> {
        Arc::new(Self {
            replicate: Mutex::new(Arc::new(msg)),
            bound_term: AtomicI64::new(UNBOUND_TERM),
            replicated_cb: Mutex::new(cb),
        })
    }

    pub fn from_appended(msg: Arc<ReplicateMsg>, cb: Option<ReplicatedCallback>) -> Arc<Self> {
        Arc::new(Self {
            replicate: Mutex::new(msg),
            bound_term: AtomicI64::new(UNBOUND_TERM),
            replicated_cb: Mutex::new(cb),
        })
    }

    pub fn replicate_msg(&self) -> Arc<ReplicateMsg> {
        Arc::clone(&self.replicate.lock().unwrap())
    }

    /// Replaces the message once the final op id is assigned at append.
    pub fn set_appended_msg(&self, msg: Arc<ReplicateMsg>) {
        *self.replicate.lock().unwrap() = msg;
    }

    pub fn id(&self) -> OpId {
        self.replicate.lock().unwrap().id
    }

    pub fn op_type(&self) -> OpType {
        self.replicate.lock().unwrap().op_type
    }

    pub fn set_replicated_callback(&self, cb: ReplicatedCallback) {
        *self.replicated_cb.lock().unwrap() = Some(cb);
    }

    /// Binds the round to the term it was submitted in.
    pub fn bind_term(&self, term: i64) {
        let previous = self.bound_term.swap(term, Ordering::SeqCst);
        debug_assert_eq!(previous, UNBOUND_TERM, "round bound twice");
    }

    /// Detects the submit-in-term-T, replicate-in-term-T' race: a round
    /// bound to an earlier term must not be replicated.
    pub fn check_bound_term(&self, current_term: i64) -> Result<(), ConsensusError> {
        let bound = self.bound_term.load(Ordering::SeqCst);
        if bound != UNBOUND_TERM && bound != current_term {
            return Err(ConsensusError::Aborted(format!(
                "round bound to term {bound} but current term is {current_term}"
            )));
        }
        Ok(())
    }

    /// Invokes the replicated callback; later calls are no-ops.
    pub fn notify_replication_finished(&self, result: Result<(), ConsensusError>) {
        if let Some(cb) = self.replicated_cb.lock().unwrap().take() {
            cb(result);
        }
    }
}

impl std::fmt::Debug for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Round")
            .field("id", &self.id())
            .field("op_type", &self.op_type())
            .field("bound_term", &self.bound_term.load(Ordering::SeqCst))
            .finish()
    }
}

/// Ordered set of in-flight rounds plus the committed index up to which
/// rounds have been applied.
pub struct PendingRounds {
    pending: BTreeMap<i64, Arc<Round>>,
    committed_index: i64,
    term_of_last_committed: i64,
}

impl PendingRounds {
    pub fn new(committed_index: i64) -> Self {
        Self {
            pending: BTreeMap::new(),
            committed_index,
            term_of_last_committed: 0,
        }
    }

    pub fn committed_index(&self) -> i64 {
        self.committed_index
    }

    pub fn term_of_last_committed(&self) -> i64 {
        self.term_of_last_committed
    }

    pub fn last_pending_op_id(&self) -> OpId {
        self.pending
            .values()
            .next_back()
            .map(|r| r.id())
            .unwrap_or(OpId::MIN)
    }

    pub fn pending_by_index(&self, index: i64) -> Option<Arc<Round>> {
        self.pending.get(&index).cloned()
    }

    /// Requires `cur` to directly follow `prev`: same or higher term,
    /// index exactly one past.
    pub fn check_op_in_sequence(prev: OpId, cur: OpId) -> Result<(), ConsensusError> {
        if cur.term < prev.term {
            return Err(ConsensusError::Corruption(format!(
                "op term regression: {cur} follows {prev}"
            )));
        }
        if cur.index != prev.index + 1 {
            return Err(ConsensusError::Corruption(format!(
                "op index gap: {cur} follows {prev}"
            )));
        }
        Ok(())
    }

    /// Adds a round. The index must extend the pending tail by one, or
    /// replace an existing index with a higher term (a new leader
    /// overwriting an uncommitted suffix).
    pub fn add(&mut self, round: Arc<Round>) -> Result<(), ConsensusError> {
        let id = round.id();
        if let Some(existing) = self.pending.get(&id.index) {
            let existing_id = existing.id();
            if id.term <= existing_id.term {
                return Err(ConsensusError::illegal_state(format!(
                    "pending op {existing_id} cannot be replaced by {id}"
                )));
            }
        } else {
            let tail = self.last_pending_op_id();
            if tail != OpId::MIN && id.index != tail.index + 1 {
                return Err(ConsensusError::illegal_state(format!(
                    "op {id} does not follow pending tail {tail}"
                )));
            }
        }
        self.pending.insert(id.index, round);
        Ok(())
    }

    /// Whether `op` is already committed locally or sits in the pending
    /// set with a matching term. `term_mismatch` is set when the index is
    /// known but under a different term.
    pub fn is_op_committed_or_pending(&self, op: OpId, term_mismatch: &mut bool) -> bool {
        *term_mismatch = false;
        if op == OpId::MIN {
            return true;
        }
        if op.index <= self.committed_index {
            return true;
        }
        match self.pending.get(&op.index) {
            Some(round) if round.id().term == op.term => true,
            Some(_) => {
                *term_mismatch = true;
                false
            }
            None => false,
        }
    }

    /// Advances the committed index. Returns the rounds in `(old, new]`
    /// in ascending order; the caller completes them (their callbacks
    /// must run with the replica lock held, so completion belongs to
    /// the owner of that lock). Monotonic; equal/lower is a no-op.
    pub fn advance_committed_index(&mut self, new_index: i64) -> Vec<Arc<Round>> {
        if new_index <= self.committed_index {
            return Vec::new();
        }
        let range: Vec<i64> = self
            .pending
            .range(..=new_index)
            .map(|(&i, _)| i)
            .collect();
        let mut committed = Vec::with_capacity(range.len());
        for index in range {
            let round = self.pending.remove(&index).unwrap();
            self.term_of_last_committed = round.id().term;
            committed.push(round);
        }
        self.committed_index = new_index;
        committed
    }

    /// Removes every pending round with index greater than `index`.
    /// Returns them in descending order for the caller to abort.
    pub fn abort_ops_after(&mut self, index: i64) -> Vec<Arc<Round>> {
        let doomed: Vec<i64> = self
            .pending
            .range(index + 1..)
            .rev()
            .map(|(&i, _)| i)
            .collect();
        if doomed.is_empty() {
            return Vec::new();
        }
        info!(
            "event=raft_pending_abort after_index={} count={}",
            index,
            doomed.len()
        );
        if index < self.committed_index {
            warn!(
                "event=raft_pending_abort_below_committed index={} committed_index={}",
                index, self.committed_index
            );
        }
        doomed
            .into_iter()
            .map(|i| self.pending.remove(&i).unwrap())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn round(term: i64, index: i64) -> Arc<Round> {
        Round::from_appended(Arc::new(ReplicateMsg::noop(OpId::new(term, index))), None)
    }

    fn round_with_flag(term: i64, index: i64, oks: Arc<AtomicUsize>, aborts: Arc<AtomicUsize>) -> Arc<Round> {
        Round::from_appended(
            Arc::new(ReplicateMsg::noop(OpId::new(term, index))),
            Some(Box::new(move |result| match result {
                Ok(()) => {
                    oks.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    assert!(err.is_aborted());
                    aborts.fetch_add(1, Ordering::SeqCst);
                }
            })),
        )
    }

    #[test]
    fn add_requires_consecutive_indexes() {
        let mut pending = PendingRounds::new(0);
        pending.add(round(1, 1)).unwrap();
        pending.add(round(1, 2)).unwrap();
        assert!(pending.add(round(1, 4)).is_err());
    }

    #[test]
    fn higher_term_replaces_same_index() {
        let mut pending = PendingRounds::new(0);
        pending.add(round(1, 1)).unwrap();
        pending.add(round(2, 1)).unwrap();
        assert!(pending.add(round(2, 1)).is_err());
        assert_eq!(pending.pending_by_index(1).unwrap().id().term, 2);
    }

    #[test]
    fn advance_returns_rounds_in_order_and_fires_once() {
        let oks = Arc::new(AtomicUsize::new(0));
        let aborts = Arc::new(AtomicUsize::new(0));
        let mut pending = PendingRounds::new(0);
        for i in 1..=3 {
            pending
                .add(round_with_flag(1, i, Arc::clone(&oks), Arc::clone(&aborts)))
                .unwrap();
        }
        let committed = pending.advance_committed_index(2);
        assert_eq!(
            committed.iter().map(|r| r.id().index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        for round in &committed {
            round.notify_replication_finished(Ok(()));
            // A second completion is a no-op.
            round.notify_replication_finished(Ok(()));
        }
        assert_eq!(oks.load(Ordering::SeqCst), 2);
        assert_eq!(pending.committed_index(), 2);
        // Re-advancing to a lower index is a no-op.
        assert!(pending.advance_committed_index(1).is_empty());
        assert_eq!(pending.committed_index(), 2);
    }

    #[test]
    fn abort_returns_rounds_in_descending_order() {
        let oks = Arc::new(AtomicUsize::new(0));
        let aborts = Arc::new(AtomicUsize::new(0));
        let mut pending = PendingRounds::new(0);
        for i in 1..=4 {
            pending
                .add(round_with_flag(1, i, Arc::clone(&oks), Arc::clone(&aborts)))
                .unwrap();
        }
        let doomed = pending.abort_ops_after(1);
        assert_eq!(
            doomed.iter().map(|r| r.id().index).collect::<Vec<_>>(),
            vec![4, 3, 2]
        );
        for round in &doomed {
            let id = round.id();
            round.notify_replication_finished(Err(ConsensusError::Aborted(format!(
                "op {id} aborted by new leader"
            ))));
        }
        assert_eq!(aborts.load(Ordering::SeqCst), 3);
        assert_eq!(pending.pending_count(), 1);
    }

    #[test]
    fn sequence_check_enforces_term_monotonicity() {
        PendingRounds::check_op_in_sequence(OpId::new(1, 5), OpId::new(1, 6)).unwrap();
        PendingRounds::check_op_in_sequence(OpId::new(1, 5), OpId::new(3, 6)).unwrap();
        assert!(PendingRounds::check_op_in_sequence(OpId::new(2, 5), OpId::new(1, 6)).is_err());
        assert!(PendingRounds::check_op_in_sequence(OpId::new(1, 5), OpId::new(1, 7)).is_err());
    }

    #[test]
    fn committed_or_pending_detects_term_mismatch() {
        let mut pending = PendingRounds::new(3);
        pending.add(round(2, 4)).unwrap();
        let mut mismatch = false;
        assert!(pending.is_op_committed_or_pending(OpId::new(1, 2), &mut mismatch));
        assert!(pending.is_op_committed_or_pending(OpId::new(2, 4), &mut mismatch));
        assert!(!pending.is_op_committed_or_pending(OpId::new(3, 4), &mut mismatch));
        assert!(mismatch);
        assert!(!pending.is_op_committed_or_pending(OpId::new(2, 5), &mut mismatch));
        assert!(!mismatch);
    }
}
