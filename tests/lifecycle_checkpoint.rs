mod common;

use common::{pump_peer, quiet_options, start_node, wait_for, ClusterRegistry};
use flexraft::{
    CommitRule, ConsensusError, ElectionContext, ElectionMode, ElectionReason, FileMetadataStore,
    InMemoryLog, Peer, RaftConfig, RaftCore, RaftRole, ReplicateMsg,
};
use std::sync::Arc;
use std::time::Duration;

fn cluster() -> (Vec<Peer>, RaftConfig) {
    let peers = vec![
        Peer::voter("a", "a:1", "r1"),
        Peer::voter("b", "b:1", "r1"),
        Peer::voter("c", "c:1", "r1"),
    ];
    let config = RaftConfig::new(peers.clone(), CommitRule::classic());
    (peers, config)
}

fn elect_first(registry: &Arc<ClusterRegistry>, nodes: &[common::TestNode]) {
    nodes[0]
        .core
        .start_election(
            ElectionMode::Normal,
            ElectionContext::new(ElectionReason::ExternalRequest),
        )
        .unwrap();
    nodes[0]
        .core
        .wait_until_leader_for_tests(Duration::from_secs(5))
        .unwrap();
    for node in &nodes[1..] {
        pump_peer(registry, &nodes[0].core, node.core.peer_uuid()).unwrap();
    }
}

#[test]
fn transfer_leadership_hands_off_to_designated_successor() {
    let registry = ClusterRegistry::new();
    let (peers, config) = cluster();
    let nodes: Vec<_> = peers
        .iter()
        .map(|p| start_node(&registry, quiet_options(), p, &config))
        .collect();
    elect_first(&registry, &nodes);
    let leader = &nodes[0].core;

    leader
        .transfer_leadership(
            Some("c".to_string()),
            None,
            &ElectionContext::new(ElectionReason::ExternalRequest),
        )
        .unwrap();
    // Writes are refused during the transfer period.
    let round = leader.new_round(ReplicateMsg::write(b"blocked".to_vec()), None);
    let err = leader.replicate(&round).unwrap_err();
    assert!(matches!(err, ConsensusError::ServiceUnavailable(_)));

    // c catches up; the queue signals it to start an election, which it
    // wins even though the old leader is alive.
    pump_peer(&registry, leader, "c").unwrap();
    nodes[2]
        .core
        .wait_until_leader_for_tests(Duration::from_secs(5))
        .expect("designated successor takes over");
    assert!(wait_for(
        || nodes[0].core.role() == RaftRole::Follower,
        Duration::from_secs(5)
    ));
}

#[test]
fn transfer_to_non_voter_is_rejected() {
    let registry = ClusterRegistry::new();
    let (peers, config) = cluster();
    let nodes: Vec<_> = peers
        .iter()
        .map(|p| start_node(&registry, quiet_options(), p, &config))
        .collect();
    elect_first(&registry, &nodes);

    let err = nodes[0]
        .core
        .transfer_leadership(
            Some("zz".to_string()),
            None,
            &ElectionContext::new(ElectionReason::ExternalRequest),
        )
        .unwrap_err();
    assert!(matches!(err, ConsensusError::InvalidArgument(_)));
}

#[test]
fn cancel_transfer_before_notification_restores_writes() {
    let registry = ClusterRegistry::new();
    let (peers, config) = cluster();
    let nodes: Vec<_> = peers
        .iter()
        .map(|p| start_node(&registry, quiet_options(), p, &config))
        .collect();
    elect_first(&registry, &nodes);
    let leader = &nodes[0].core;

    leader
        .transfer_leadership(
            Some("c".to_string()),
            None,
            &ElectionContext::new(ElectionReason::ExternalRequest),
        )
        .unwrap();
    // No successor was notified yet: cancellation succeeds.
    leader.cancel_transfer_leadership().unwrap();
    let round = leader.new_round(ReplicateMsg::write(b"unblocked".to_vec()), None);
    leader.replicate(&round).unwrap();
    assert_eq!(leader.role(), RaftRole::Leader);
}

#[test]
fn step_down_leaves_the_term_and_leadership() {
    let registry = ClusterRegistry::new();
    let (peers, config) = cluster();
    let nodes: Vec<_> = peers
        .iter()
        .map(|p| start_node(&registry, quiet_options(), p, &config))
        .collect();
    elect_first(&registry, &nodes);

    let term_before = nodes[0].core.current_term();
    nodes[0].core.step_down().unwrap();
    assert_eq!(nodes[0].core.role(), RaftRole::Follower);
    assert_eq!(nodes[0].core.current_term(), term_before + 1);
    // A non-leader cannot step down.
    assert!(nodes[1].core.step_down().is_err());
}

#[test]
fn stopped_replica_rejects_writes_and_updates() {
    let registry = ClusterRegistry::new();
    let peer = Peer::voter("solo", "solo:1", "r1");
    let config = RaftConfig::new(vec![peer.clone()], CommitRule::classic());
    let node = start_node(&registry, quiet_options(), &peer, &config);
    node.core
        .wait_until_leader_for_tests(Duration::from_secs(5))
        .unwrap();

    node.core.stop();
    let round = node.core.new_round(ReplicateMsg::write(b"late".to_vec()), None);
    assert!(node.core.replicate(&round).is_err());
    node.core.shutdown();
    // Shutdown is idempotent.
    node.core.shutdown();
}

#[test]
fn metadata_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let store_path = dir.path().join("cmeta.json");
    let registry = ClusterRegistry::new();
    let (peers, config) = cluster();

    {
        let handler = common::RecordingRoundHandler::new();
        let core = RaftCore::create(
            quiet_options(),
            peers[0].clone(),
            config.clone(),
            Box::new(FileMetadataStore::new(&store_path)),
            Arc::new(InMemoryLog::new()),
            common::LoopbackProxyFactory::new(Arc::clone(&registry)),
            handler,
        )
        .unwrap();
        registry.register(Arc::clone(&core));
        core.start().unwrap();
        core.advance_term_for_tests(9).unwrap();
        core.shutdown();
    }

    // A fresh instance on the same store resumes at the durable term.
    let handler = common::RecordingRoundHandler::new();
    let core = RaftCore::create(
        quiet_options(),
        peers[0].clone(),
        config,
        Box::new(FileMetadataStore::new(&store_path)),
        Arc::new(InMemoryLog::new()),
        common::LoopbackProxyFactory::new(Arc::clone(&registry)),
        handler,
    )
    .unwrap();
    assert_eq!(core.current_term(), 9);
}
