use crate::error::ConsensusError;
use crate::opid::OpId;
use crate::rpc::ReplicateMsg;
use log::debug;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub type LogAppendCallback = Box<dyn FnOnce(Result<(), ConsensusError>) + Send>;

/// The durable write-ahead log, supplied by the host. Appends complete
/// asynchronously; the callback fires once the batch is durable.
pub trait RaftLog: Send + Sync {
    fn append_batch(&self, msgs: &[Arc<ReplicateMsg>], cb: LogAppendCallback);
    /// Removes every op with index greater than `index`. Returns the
    /// truncation point if anything was removed.
    fn truncate_ops_after(&self, index: i64) -> Option<i64>;
    fn read_ops_after(&self, after_index: i64, max_ops: usize) -> Vec<Arc<ReplicateMsg>>;
    fn op_at(&self, index: i64) -> Option<Arc<ReplicateMsg>>;
    fn last_op_id(&self) -> OpId;
}

/// Fully in-memory log used by tests and embedded setups. Appends are
/// durable the moment they land, so callbacks run inline.
#[derive(Default)]
pub struct InMemoryLog {
    ops: Mutex<BTreeMap<i64, Arc<ReplicateMsg>>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftLog for InMemoryLog {
    fn append_batch(&self, msgs: &[Arc<ReplicateMsg>], cb: LogAppendCallback) {
        {
            let mut ops = self.ops.lock().unwrap();
            for msg in msgs {
                ops.insert(msg.id.index, Arc::clone(msg));
            }
        }
        cb(Ok(()));
    }

    fn truncate_ops_after(&self, index: i64) -> Option<i64> {
        let mut ops = self.ops.lock().unwrap();
        let doomed: Vec<i64> = ops.range(index + 1..).map(|(&i, _)| i).collect();
        if doomed.is_empty() {
            return None;
        }
        for i in &doomed {
            ops.remove(i);
        }
        Some(index)
    }

    fn read_ops_after(&self, after_index: i64, max_ops: usize) -> Vec<Arc<ReplicateMsg>> {
        let ops = self.ops.lock().unwrap();
        ops.range(after_index + 1..)
            .take(max_ops)
            .map(|(_, msg)| Arc::clone(msg))
            .collect()
    }

    fn op_at(&self, index: i64) -> Option<Arc<ReplicateMsg>> {
        self.ops.lock().unwrap().get(&index).cloned()
    }

    fn last_op_id(&self) -> OpId {
        let ops = self.ops.lock().unwrap();
        ops.values().next_back().map(|m| m.id).unwrap_or(OpId::MIN)
    }
}

struct CacheInner {
    ops: BTreeMap<i64, Arc<ReplicateMsg>>,
    last_appended: OpId,
}

/// Read-through cache in front of the `RaftLog`, shared between the
/// leader queue (writer) and the proxy handler (blocking reader).
pub struct LogCache {
    log: Arc<dyn RaftLog>,
    inner: Mutex<CacheInner>,
    appended: Condvar,
}

impl LogCache {
    pub fn new(log: Arc<dyn RaftLog>) -> Self {
        let last_appended = log.last_op_id();
        Self {
            log,
            inner: Mutex::new(CacheInner {
                ops: BTreeMap::new(),
                last_appended,
            }),
            appended: Condvar::new(),
        }
    }

    pub fn last_op_id(&self) -> OpId {
        self.inner.lock().unwrap().last_appended
    }

    /// Caches the batch, wakes blocked readers, and hands the batch to
    /// the durable log. Indexes must be contiguous with the tail.
    pub fn append_batch(&self, msgs: &[Arc<ReplicateMsg>], cb: LogAppendCallback) {
        assert!(!msgs.is_empty(), "empty append batch");
        {
            let mut inner = self.inner.lock().unwrap();
            for msg in msgs {
                inner.ops.insert(msg.id.index, Arc::clone(msg));
            }
            inner.last_appended = msgs.last().unwrap().id;
        }
        self.appended.notify_all();
        self.log.append_batch(msgs, cb);
    }

    /// Truncates the cache and the log after `index`; the tail op id
    /// moves back accordingly.
    pub fn truncate_ops_after(&self, index: i64) -> Option<i64> {
        let truncated = {
            let mut inner = self.inner.lock().unwrap();
            let doomed: Vec<i64> = inner.ops.range(index + 1..).map(|(&i, _)| i).collect();
            for i in &doomed {
                inner.ops.remove(i);
            }
            let new_tail = if index <= 0 {
                OpId::MIN
            } else if let Some(msg) = inner.ops.get(&index) {
                msg.id
            } else {
                self.log.op_at(index).map(|m| m.id).unwrap_or(OpId::MIN)
            };
            inner.last_appended = new_tail;
            !doomed.is_empty()
        };
        let log_truncated = self.log.truncate_ops_after(index);
        if truncated {
            debug!("event=raft_log_cache_truncate after_index={index}");
            Some(index)
        } else {
            log_truncated
        }
    }

    pub fn op_at(&self, index: i64) -> Option<Arc<ReplicateMsg>> {
        if index <= 0 {
            return None;
        }
        if let Some(msg) = self.inner.lock().unwrap().ops.get(&index) {
            return Some(Arc::clone(msg));
        }
        self.log.op_at(index)
    }

    /// Whether the exact `(term, index)` op is present locally.
    pub fn has_op(&self, op: OpId) -> bool {
        if op == OpId::MIN {
            return true;
        }
        self.op_at(op.index).map(|m| m.id == op).unwrap_or(false)
    }

    /// Reads up to `max_ops` messages after `after_index`, plus the op id
    /// immediately preceding the returned range.
    pub fn read_ops(
        &self,
        after_index: i64,
        max_ops: usize,
    ) -> Result<(Vec<Arc<ReplicateMsg>>, OpId), ConsensusError> {
        let preceding = if after_index <= 0 {
            OpId::MIN
        } else {
            self.op_at(after_index)
                .map(|m| m.id)
                .ok_or_else(|| {
                    ConsensusError::Incomplete(format!(
                        "op at index {after_index} not found in local log"
                    ))
                })?
        };
        let cached: Vec<Arc<ReplicateMsg>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .ops
                .range(after_index + 1..)
                .take(max_ops)
                .map(|(_, msg)| Arc::clone(msg))
                .collect()
        };
        // Serve from the cache only when it still holds the head of the
        // requested range; evicted prefixes fall back to the log.
        let head_cached = cached
            .first()
            .map(|m| m.id.index == after_index + 1)
            .unwrap_or(false);
        let msgs = if head_cached {
            cached
        } else {
            self.log.read_ops_after(after_index, max_ops)
        };
        Ok((msgs, preceding))
    }

    /// Blocking variant of `read_ops`: waits until the op following
    /// `after_index` lands, up to `timeout`. Used by the proxy path.
    pub fn blocking_read_ops(
        &self,
        after_index: i64,
        max_ops: usize,
        timeout: Duration,
    ) -> Result<(Vec<Arc<ReplicateMsg>>, OpId), ConsensusError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.last_appended.index <= after_index {
            let now = Instant::now();
            if now >= deadline {
                return Err(ConsensusError::TimedOut(format!(
                    "waited {timeout:?} for op after index {after_index}"
                )));
            }
            let (guard, _) = self
                .appended
                .wait_timeout(inner, deadline - now)
                .map_err(|_| ConsensusError::illegal_state("log cache lock poisoned"))?;
            inner = guard;
        }
        drop(inner);
        self.read_ops(after_index, max_ops)
    }

    /// Drops cached entries strictly below `index`; the durable log keeps
    /// them. Driven by the all-replicated watermark.
    pub fn evict_ops_before(&self, index: i64) {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<i64> = inner.ops.range(..index).map(|(&i, _)| i).collect();
        for i in doomed {
            inner.ops.remove(&i);
        }
    }
}
