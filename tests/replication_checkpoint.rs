mod common;

use common::{pump_peer, quiet_options, start_node, wait_for, ClusterRegistry};
use flexraft::{
    CommitRule, ConsensusError, ConsensusErrorCode, ConsensusRequest, ElectionContext,
    ElectionMode, ElectionReason, OpId, Peer, RaftConfig, ReplicateMsg,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn cluster_config() -> (Vec<Peer>, RaftConfig) {
    let peers = vec![
        Peer::voter("a", "a:1", "r1"),
        Peer::voter("b", "b:1", "r1"),
        Peer::voter("c", "c:1", "r1"),
    ];
    let config = RaftConfig::new(peers.clone(), CommitRule::classic());
    (peers, config)
}

fn elect(nodes: &[common::TestNode], registry: &Arc<ClusterRegistry>, leader: usize) {
    nodes[leader]
        .core
        .start_election(
            ElectionMode::Normal,
            ElectionContext::new(ElectionReason::ExternalRequest),
        )
        .unwrap();
    nodes[leader]
        .core
        .wait_until_leader_for_tests(Duration::from_secs(5))
        .unwrap();
    for node in nodes {
        if node.core.peer_uuid() != nodes[leader].core.peer_uuid() {
            pump_peer(registry, &nodes[leader].core, node.core.peer_uuid()).unwrap();
        }
    }
}

#[test]
fn three_voter_happy_path_commits_and_replicates_everywhere() {
    let registry = ClusterRegistry::new();
    let (peers, config) = cluster_config();
    let nodes: Vec<_> = peers
        .iter()
        .map(|p| start_node(&registry, quiet_options(), p, &config))
        .collect();
    elect(&nodes, &registry, 0);
    let leader = &nodes[0].core;

    let committed = Arc::new(AtomicUsize::new(0));
    let committed_flag = Arc::clone(&committed);
    let round = leader.new_round(
        ReplicateMsg::write(b"payload-1".to_vec()),
        Some(Box::new(move |result| {
            result.unwrap();
            committed_flag.fetch_add(1, Ordering::SeqCst);
        })),
    );
    leader.replicate(&round).unwrap();
    let op_id = round.id();
    assert_eq!(op_id.term, 1);

    // First exchange replicates; the leader's majority then commits.
    pump_peer(&registry, leader, "b").unwrap();
    assert!(wait_for(
        || leader.committed_index() >= op_id.index,
        Duration::from_secs(5)
    ));
    assert!(wait_for(
        || committed.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));

    // After the remaining follower acks, everything is everywhere.
    pump_peer(&registry, leader, "c").unwrap();
    assert_eq!(leader.queue().all_replicated_index(), op_id.index);
    // A further heartbeat carries the committed index to followers.
    pump_peer(&registry, leader, "b").unwrap();
    assert!(wait_for(
        || nodes[1].core.committed_index() >= op_id.index,
        Duration::from_secs(5)
    ));
    // The follower handed the payload to its round handler.
    assert!(nodes[1]
        .handler
        .started
        .lock()
        .unwrap()
        .contains(&op_id));
}

#[test]
fn log_matching_mismatch_truncates_and_recovers() {
    let registry = ClusterRegistry::new();
    let peer = Peer::voter("f", "f:1", "r1");
    let leader_peer = Peer::voter("l", "l:1", "r1");
    let config = RaftConfig::new(vec![leader_peer, peer.clone()], CommitRule::classic());
    let node = start_node(&registry, quiet_options(), &peer, &config);

    let base = |ops: Vec<ReplicateMsg>, preceding: OpId, term: i64, committed: i64| {
        ConsensusRequest {
            dest_uuid: "f".to_string(),
            caller_uuid: "l".to_string(),
            caller_term: term,
            preceding_id: preceding,
            ops: ops.into_iter().map(Arc::new).collect(),
            committed_index: committed,
            all_replicated_index: 0,
            region_durable_index: 0,
            last_idx_appended_to_leader: 0,
            raft_rpc_token: None,
            proxy_dest_uuid: None,
            proxy_caller_uuid: None,
            proxy_hops_remaining: 0,
        }
    };
    let op = |term: i64, index: i64| {
        let mut msg = ReplicateMsg::write(format!("op-{term}-{index}").into_bytes());
        msg.id = OpId::new(term, index);
        msg
    };

    // Term 2: ops (2,1) and (2,2) land.
    let response = node
        .core
        .update(&base(vec![op(2, 1), op(2, 2)], OpId::MIN, 2, 0))
        .unwrap();
    assert!(!response.has_error());
    assert_eq!(response.status.last_received, OpId::new(2, 2));

    // A new leader at term 3 claims a preceding op (3,2) we do not
    // have: the append is refused and the conflicting suffix dropped.
    let response = node
        .core
        .update(&base(vec![op(3, 3)], OpId::new(3, 2), 3, 1))
        .unwrap();
    let error = response.status.error.expect("mismatch expected");
    assert_eq!(error.code, ConsensusErrorCode::PrecedingEntryDidntMatch);
    assert_eq!(node.core.last_op_id(), OpId::new(2, 1));

    // Retry from the shared prefix: (2,1) matches, (3,2) overwrites.
    let response = node
        .core
        .update(&base(vec![op(3, 2), op(3, 3)], OpId::new(2, 1), 3, 1))
        .unwrap();
    assert!(!response.has_error());
    assert_eq!(response.status.last_received, OpId::new(3, 3));
    assert_eq!(response.status.last_committed_idx, 1);
}

#[test]
fn replaying_acked_entries_advances_nothing() {
    let registry = ClusterRegistry::new();
    let peer = Peer::voter("f", "f:1", "r1");
    let leader_peer = Peer::voter("l", "l:1", "r1");
    let config = RaftConfig::new(vec![leader_peer, peer.clone()], CommitRule::classic());
    let node = start_node(&registry, quiet_options(), &peer, &config);

    let mut msg = ReplicateMsg::write(b"idempotent".to_vec());
    msg.id = OpId::new(1, 1);
    let request = ConsensusRequest {
        dest_uuid: "f".to_string(),
        caller_uuid: "l".to_string(),
        caller_term: 1,
        preceding_id: OpId::MIN,
        ops: vec![Arc::new(msg)],
        committed_index: 0,
        all_replicated_index: 0,
        region_durable_index: 0,
        last_idx_appended_to_leader: 1,
        raft_rpc_token: None,
        proxy_dest_uuid: None,
        proxy_caller_uuid: None,
        proxy_hops_remaining: 0,
    };
    let first = node.core.update(&request).unwrap();
    let replay = node.core.update(&request).unwrap();
    assert_eq!(first.status.last_received, replay.status.last_received);
    assert_eq!(node.core.last_op_id(), OpId::new(1, 1));
    // The round handler saw the op exactly once.
    assert_eq!(
        node.handler
            .started
            .lock()
            .unwrap()
            .iter()
            .filter(|id| **id == OpId::new(1, 1))
            .count(),
        1
    );
}

#[test]
fn aborted_rounds_surface_aborted_errors() {
    let registry = ClusterRegistry::new();
    let peer = Peer::voter("f", "f:1", "r1");
    let leader_peer = Peer::voter("l", "l:1", "r1");
    let config = RaftConfig::new(vec![leader_peer, peer.clone()], CommitRule::classic());
    let node = start_node(&registry, quiet_options(), &peer, &config);

    let op = |term: i64, index: i64| {
        let mut msg = ReplicateMsg::write(vec![index as u8]);
        msg.id = OpId::new(term, index);
        Arc::new(msg)
    };
    let request = |ops: Vec<Arc<ReplicateMsg>>, preceding: OpId, term: i64| ConsensusRequest {
        dest_uuid: "f".to_string(),
        caller_uuid: "l".to_string(),
        caller_term: term,
        preceding_id: preceding,
        ops,
        committed_index: 0,
        all_replicated_index: 0,
        region_durable_index: 0,
        last_idx_appended_to_leader: 0,
        raft_rpc_token: None,
        proxy_dest_uuid: None,
        proxy_caller_uuid: None,
        proxy_hops_remaining: 0,
    };

    node.core
        .update(&request(vec![op(1, 1), op(1, 2), op(1, 3)], OpId::MIN, 1))
        .unwrap();
    // A term-3 leader whose preceding (3,1) conflicts with ours: ops
    // after index 0 are aborted before the refusal is sent.
    let response = node
        .core
        .update(&request(Vec::new(), OpId::new(3, 1), 3))
        .unwrap();
    assert!(response.has_error());
    assert_eq!(node.core.last_op_id(), OpId::MIN);
    assert_eq!(node.core.committed_index(), 0);
}

#[test]
fn memory_pressure_rejects_appends() {
    let registry = ClusterRegistry::new();
    let peer = Peer::voter("f", "f:1", "r1");
    let leader_peer = Peer::voter("l", "l:1", "r1");
    let config = RaftConfig::new(vec![leader_peer, peer.clone()], CommitRule::classic());
    let pressure = Arc::new(Mutex::new(None::<f64>));
    let probe = Arc::clone(&pressure);
    let options = flexraft::RaftOptions {
        memory_pressure: Some(Arc::new(move || *probe.lock().unwrap())),
        ..quiet_options()
    };
    let node = start_node(&registry, options, &peer, &config);

    *pressure.lock().unwrap() = Some(97.5);
    let mut msg = ReplicateMsg::write(b"too big".to_vec());
    msg.id = OpId::new(1, 1);
    let request = ConsensusRequest {
        dest_uuid: "f".to_string(),
        caller_uuid: "l".to_string(),
        caller_term: 1,
        preceding_id: OpId::MIN,
        ops: vec![Arc::new(msg)],
        committed_index: 0,
        all_replicated_index: 0,
        region_durable_index: 0,
        last_idx_appended_to_leader: 1,
        raft_rpc_token: None,
        proxy_dest_uuid: None,
        proxy_caller_uuid: None,
        proxy_hops_remaining: 0,
    };
    let err = node.core.update(&request).unwrap_err();
    assert!(matches!(err, ConsensusError::ServiceUnavailable(_)));
    // Status-only requests still flow under pressure.
    *pressure.lock().unwrap() = None;
    assert!(node.core.update(&request).is_ok());
}
