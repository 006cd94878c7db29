use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// `(term, index)` pair identifying a single replicated operation.
///
/// The total order is lexicographic: terms dominate, indexes break ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub term: i64,
    pub index: i64,
}

impl OpId {
    /// Sentinel ordered before every real operation.
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    pub fn new(term: i64, index: i64) -> Self {
        Self { term, index }
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.term
            .cmp(&other.term)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}
