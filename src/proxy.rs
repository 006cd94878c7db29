use crate::core::RaftCore;
use crate::error::ConsensusError;
use crate::metrics::ConsensusMetrics;
use crate::rpc::{ConsensusRequest, ConsensusResponse, OpType, ReplicateMsg};
use log::{info, warn};
use std::sync::{mpsc, Arc};

impl RaftCore {
    /// Whether a request is addressed to this node as a relay rather
    /// than as its final destination.
    pub fn is_proxy_request(&self, request: &ConsensusRequest) -> bool {
        request.is_proxy_request()
    }

    /// Relays a proxied replication request: reconstitutes `ProxyOp`
    /// placeholders from the local log cache when this node is the last
    /// hop, or forwards them to the next hop otherwise. Blocks until the
    /// downstream peer responds.
    pub fn handle_proxy_request(
        &self,
        request: &ConsensusRequest,
    ) -> Result<ConsensusResponse, ConsensusError> {
        ConsensusMetrics::incr(&self.metrics().proxy_requests_received);

        let active_config = {
            // Snapshot the config so routing decisions are stable for
            // the rest of the call.
            self.active_config_for_proxy()?
        };

        let proxy_dest = request.proxy_dest_uuid.as_deref().unwrap_or("");
        if proxy_dest != self.peer_uuid() {
            return Err(ConsensusError::invalid_argument(format!(
                "wrong proxy destination: local uuid {}, requested {proxy_dest}",
                self.peer_uuid()
            )));
        }
        if request.dest_uuid == self.peer_uuid() {
            return Err(ConsensusError::invalid_argument(
                "proxy and destination must be different",
            ));
        }
        if request.proxy_hops_remaining < 1 {
            ConsensusMetrics::incr(&self.metrics().proxy_requests_hops_exhausted);
            return Err(ConsensusError::Incomplete(
                "proxy hops remaining exhausted (possible routing loop?)".to_string(),
            ));
        }

        let mut downstream = ConsensusRequest {
            dest_uuid: request.dest_uuid.clone(),
            caller_uuid: request.caller_uuid.clone(),
            caller_term: request.caller_term,
            preceding_id: request.preceding_id,
            ops: Vec::new(),
            committed_index: request.committed_index,
            all_replicated_index: request.all_replicated_index,
            region_durable_index: request.region_durable_index,
            last_idx_appended_to_leader: request.last_idx_appended_to_leader,
            raft_rpc_token: request.raft_rpc_token.clone(),
            proxy_dest_uuid: None,
            proxy_caller_uuid: Some(self.peer_uuid().to_string()),
            proxy_hops_remaining: request.proxy_hops_remaining - 1,
        };

        let next_uuid = if self.options().enable_multi_hop_proxy_routing {
            match self.next_hop_from_local(&request.dest_uuid) {
                Ok(uuid) => uuid,
                Err(err) => {
                    ConsensusMetrics::incr(&self.metrics().proxy_requests_unknown_dest);
                    return Err(err);
                }
            }
        } else {
            request.dest_uuid.clone()
        };

        if next_uuid != request.dest_uuid {
            // Further proxying: forward the placeholders unchanged.
            downstream.proxy_dest_uuid = Some(next_uuid.clone());
            downstream.ops = request.ops.clone();
            info!(
                "event=raft_proxy_forward dest={} via={next_uuid} ops={}",
                request.dest_uuid,
                downstream.ops.len()
            );
        } else {
            downstream.ops = self.reconstitute_proxy_ops(request)?;
        }

        let next_peer = active_config.peer(&next_uuid).ok_or_else(|| {
            ConsensusError::NotFound(format!(
                "unable to proxy to {next_uuid}: not in the active config"
            ))
        })?;
        let proxy = self.proxy_factory().make_proxy(next_peer)?;

        // Single-shot latch bridging the async transport back to this
        // worker.
        let (tx, rx) = mpsc::channel();
        proxy.update_consensus_async(
            downstream,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let response = rx
            .recv_timeout(self.options().election_timeout)
            .map_err(|_| {
                ConsensusError::TimedOut(format!(
                    "no response from downstream peer {next_uuid}"
                ))
            })??;
        ConsensusMetrics::incr(&self.metrics().proxy_requests_success);
        Ok(response)
    }

    /// Turns `ProxyOp` placeholders back into full messages from the
    /// local log cache. On read timeout the request degrades to an empty
    /// heartbeat so the destination does not start an election.
    fn reconstitute_proxy_ops(
        &self,
        request: &ConsensusRequest,
    ) -> Result<Vec<Arc<ReplicateMsg>>, ConsensusError> {
        if request.ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut first_op_index = 0;
        for (i, msg) in request.ops.iter().enumerate() {
            if msg.op_type != OpType::ProxyOp {
                return Err(ConsensusError::invalid_argument(format!(
                    "proxy expected a placeholder but received op {} of type {:?}",
                    msg.id, msg.op_type
                )));
            }
            if i == 0 {
                first_op_index = msg.id.index;
            } else if msg.id.index != first_op_index + i as i64 {
                return Err(ConsensusError::invalid_argument(format!(
                    "proxy requires consecutive indexes in a batch, received {} after index {}",
                    msg.id,
                    first_op_index + i as i64 - 1
                )));
            }
        }

        let read = self.shared_log_cache().blocking_read_ops(
            first_op_index - 1,
            request.ops.len(),
            self.options().proxy_wait_timeout,
        );
        let messages = match read {
            Ok((messages, _)) => messages,
            Err(err) if err.is_timed_out() => {
                ConsensusMetrics::incr(&self.metrics().proxy_requests_log_read_timeout);
                warn!(
                    "event=raft_proxy_degraded_to_heartbeat first_index={first_op_index} error={err}"
                );
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        // A shorter-than-requested batch is tolerated; mismatched ids
        // are not.
        let mut ops = Vec::with_capacity(messages.len().min(request.ops.len()));
        for (placeholder, message) in request.ops.iter().zip(messages.iter()) {
            if placeholder.id != message.id {
                return Err(ConsensusError::illegal_state(format!(
                    "log cache returned op {} where the request named {}",
                    message.id, placeholder.id
                )));
            }
            ops.push(Arc::clone(message));
        }
        Ok(ops)
    }
}

// Narrow internal accessors for the proxy path, kept here so the core
// module's fields stay private.
impl RaftCore {
    fn active_config_for_proxy(&self) -> Result<crate::config::RaftConfig, ConsensusError> {
        if !self.is_running() {
            return Err(ConsensusError::illegal_state("replica is not running"));
        }
        Ok(self
            .pending_config()
            .unwrap_or_else(|| self.committed_config()))
    }
}
