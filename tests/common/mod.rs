//! In-process cluster harness: a loopback transport delivering RPCs to
//! sibling cores on detached threads, plus a recording round handler.

use flexraft::{
    ConsensusError, ConsensusRequest, ConsensusResponse, ConsensusResponseCallback, InMemoryLog,
    InMemoryMetadataStore, OpId, Peer, PeerProxy, PeerProxyFactory, RaftConfig, RaftCore,
    RaftOptions, RoundHandler, Round, StartElectionCallback, StartElectionRequest, VoteRequest,
    VoteResponseCallback,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Shared registry the loopback proxies resolve their targets from.
#[derive(Default)]
pub struct ClusterRegistry {
    cores: Mutex<HashMap<String, Arc<RaftCore>>>,
}

impl ClusterRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, core: Arc<RaftCore>) {
        self.cores
            .lock()
            .unwrap()
            .insert(core.peer_uuid().to_string(), core);
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<RaftCore>> {
        self.cores.lock().unwrap().get(uuid).cloned()
    }
}

pub struct LoopbackProxy {
    registry: Arc<ClusterRegistry>,
    target_uuid: String,
}

impl PeerProxy for LoopbackProxy {
    fn update_consensus_async(&self, request: ConsensusRequest, cb: ConsensusResponseCallback) {
        let registry = Arc::clone(&self.registry);
        let target_uuid = self.target_uuid.clone();
        thread::spawn(move || {
            let result = match registry.get(&target_uuid) {
                Some(core) => {
                    if core.is_proxy_request(&request) {
                        core.handle_proxy_request(&request)
                    } else {
                        core.update(&request)
                    }
                }
                None => Err(ConsensusError::Io(format!("peer {target_uuid} unreachable"))),
            };
            cb(result);
        });
    }

    fn request_vote_async(&self, request: VoteRequest, cb: VoteResponseCallback) {
        let registry = Arc::clone(&self.registry);
        let target_uuid = self.target_uuid.clone();
        thread::spawn(move || {
            let result = match registry.get(&target_uuid) {
                Some(core) => core.request_vote(&request, None),
                None => Err(ConsensusError::Io(format!("peer {target_uuid} unreachable"))),
            };
            cb(result);
        });
    }

    fn start_election_async(&self, request: StartElectionRequest, cb: StartElectionCallback) {
        let registry = Arc::clone(&self.registry);
        let target_uuid = self.target_uuid.clone();
        thread::spawn(move || {
            let result = match registry.get(&target_uuid) {
                Some(core) => core.handle_start_election_request(&request),
                None => Err(ConsensusError::Io(format!("peer {target_uuid} unreachable"))),
            };
            cb(result);
        });
    }
}

pub struct LoopbackProxyFactory {
    registry: Arc<ClusterRegistry>,
}

impl LoopbackProxyFactory {
    pub fn new(registry: Arc<ClusterRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }
}

impl PeerProxyFactory for LoopbackProxyFactory {
    fn make_proxy(&self, peer: &Peer) -> Result<Arc<dyn PeerProxy>, ConsensusError> {
        Ok(Arc::new(LoopbackProxy {
            registry: Arc::clone(&self.registry),
            target_uuid: peer.uuid.clone(),
        }))
    }
}

/// Records every round it is handed; always succeeds.
#[derive(Default)]
pub struct RecordingRoundHandler {
    pub started: Mutex<Vec<OpId>>,
    pub finished: Mutex<Vec<OpId>>,
}

impl RecordingRoundHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl RoundHandler for RecordingRoundHandler {
    fn start_follower_round(&self, round: Arc<Round>) -> Result<(), ConsensusError> {
        self.started.lock().unwrap().push(round.id());
        Ok(())
    }

    fn start_consensus_only_round(&self, round: Arc<Round>) -> Result<(), ConsensusError> {
        self.started.lock().unwrap().push(round.id());
        Ok(())
    }

    fn finish_consensus_only_round(&self, round: &Arc<Round>) {
        self.finished.lock().unwrap().push(round.id());
    }
}

/// Options keeping background timers out of the way so tests drive all
/// transitions explicitly.
pub fn quiet_options() -> RaftOptions {
    RaftOptions {
        heartbeat_interval: Duration::from_secs(60),
        max_missed_heartbeats: 3,
        election_timeout: Duration::from_secs(3),
        rng_seed: 42,
        ..RaftOptions::default()
    }
}

pub struct TestNode {
    pub core: Arc<RaftCore>,
    pub handler: Arc<RecordingRoundHandler>,
}

/// Builds and starts one core against the shared registry.
pub fn start_node(
    registry: &Arc<ClusterRegistry>,
    options: RaftOptions,
    local: &Peer,
    config: &RaftConfig,
) -> TestNode {
    let handler = RecordingRoundHandler::new();
    let core = RaftCore::create(
        options,
        local.clone(),
        config.clone(),
        Box::new(InMemoryMetadataStore::new()),
        Arc::new(InMemoryLog::new()),
        LoopbackProxyFactory::new(Arc::clone(registry)),
        Arc::clone(&handler) as Arc<dyn RoundHandler>,
    )
    .expect("create core");
    registry.register(Arc::clone(&core));
    core.start().expect("start core");
    TestNode { core, handler }
}

/// One replication exchange from the leader to `peer_uuid`, routed the
/// same way the production pump would route it (including proxying).
pub fn pump_peer(
    registry: &Arc<ClusterRegistry>,
    leader: &Arc<RaftCore>,
    peer_uuid: &str,
) -> Result<ConsensusResponse, ConsensusError> {
    let peer_request = leader.request_for_peer(peer_uuid, true)?;
    let first_hop = peer_request
        .next_hop
        .clone()
        .unwrap_or_else(|| peer_uuid.to_string());
    let target = registry
        .get(&first_hop)
        .ok_or_else(|| ConsensusError::Io(format!("peer {first_hop} unreachable")))?;
    let response = if peer_request.request.is_proxy_request() {
        target.handle_proxy_request(&peer_request.request)?
    } else {
        target.update(&peer_request.request)?
    };
    leader.handle_peer_response(peer_uuid, &response);
    Ok(response)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
