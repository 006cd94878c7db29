mod common;

use common::{pump_peer, quiet_options, start_node, wait_for, ClusterRegistry};
use flexraft::{
    ChangeConfigRequest, CommitRule, ConfigChangeItem, ElectionContext, ElectionMode,
    ElectionReason, MemberType, Peer, RaftConfig, RaftRole, ServerErrorCode,
};
use std::sync::Arc;
use std::time::Duration;

fn two_voter_cluster(
    registry: &Arc<ClusterRegistry>,
) -> (Vec<common::TestNode>, Vec<Peer>, RaftConfig) {
    let peers = vec![Peer::voter("a", "a:1", "r1"), Peer::voter("b", "b:1", "r1")];
    let config = RaftConfig::new(peers.clone(), CommitRule::classic());
    let nodes: Vec<_> = peers
        .iter()
        .map(|p| start_node(registry, quiet_options(), p, &config))
        .collect();
    (nodes, peers, config)
}

fn elect_and_settle(registry: &Arc<ClusterRegistry>, nodes: &[common::TestNode], leader: usize) {
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
    // Replicate the no-op everywhere so the leader has a committed op
    // in its own term.
    for node in nodes {
        if node.core.peer_uuid() != nodes[leader].core.peer_uuid() {
            pump_peer(registry, &nodes[leader].core, node.core.peer_uuid()).unwrap();
        }
    }
    let committed = nodes[leader].core.last_op_id().index;
    assert!(wait_for(
        || nodes[leader].core.committed_index() >= committed,
        Duration::from_secs(5)
    ));
}

#[test]
fn add_peer_becomes_pending_then_committed() {
    let registry = ClusterRegistry::new();
    let (nodes, _, _) = two_voter_cluster(&registry);
    elect_and_settle(&registry, &nodes, 0);
    let leader = &nodes[0].core;

    leader
        .change_config(
            ConfigChangeItem::add_peer(Peer::non_voter("c", "c:1", "r1")),
            None,
            None,
        )
        .unwrap();
    // Takes effect on receipt.
    let pending = leader.pending_config().expect("pending config");
    assert!(pending.is_member("c"));
    assert_eq!(leader.role(), RaftRole::Leader);

    // Replication to b commits the change.
    pump_peer(&registry, leader, "b").unwrap();
    assert!(wait_for(
        || leader.pending_config().is_none(),
        Duration::from_secs(5)
    ));
    let committed = leader.committed_config();
    assert!(committed.is_member("c"));
    assert!(committed.opid_index.is_some());
}

#[test]
fn stale_cas_index_is_rejected_with_cas_failed() {
    let registry = ClusterRegistry::new();
    let (nodes, _, _) = two_voter_cluster(&registry);
    elect_and_settle(&registry, &nodes, 0);
    let leader = &nodes[0].core;

    let original_opid_index = leader.committed_config().opid_index.unwrap_or(-1);

    leader
        .change_config(
            ConfigChangeItem::add_peer(Peer::non_voter("c", "c:1", "r1")),
            Some(original_opid_index),
            None,
        )
        .unwrap();
    pump_peer(&registry, leader, "b").unwrap();
    assert!(wait_for(
        || leader.pending_config().is_none(),
        Duration::from_secs(5)
    ));

    // The same CAS index is now stale: the race loser gets CAS_FAILED
    // and an illegal-state status.
    let err = leader
        .change_config(
            ConfigChangeItem::add_peer(Peer::non_voter("d", "d:1", "r1")),
            Some(original_opid_index),
            None,
        )
        .unwrap_err();
    assert_eq!(err.code, ServerErrorCode::CasFailed);
    assert!(err.status.is_illegal_state());
}

#[test]
fn config_change_requires_committed_op_in_own_term() {
    let registry = ClusterRegistry::new();
    let (nodes, _, _) = two_voter_cluster(&registry);
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
    // The no-op has not been acked by b yet: no committed op in this
    // term, so config changes are refused.
    let err = nodes[0]
        .core
        .change_config(
            ConfigChangeItem::add_peer(Peer::non_voter("c", "c:1", "r1")),
            None,
            None,
        )
        .unwrap_err();
    assert!(err.status.is_illegal_state());
}

#[test]
fn bulk_change_rejects_two_voter_modifications() {
    let registry = ClusterRegistry::new();
    let (nodes, _, _) = two_voter_cluster(&registry);
    elect_and_settle(&registry, &nodes, 0);

    let err = nodes[0]
        .core
        .bulk_change_config(
            ChangeConfigRequest {
                changes: vec![
                    ConfigChangeItem::add_peer(Peer::voter("c", "c:1", "r1")),
                    ConfigChangeItem::add_peer(Peer::voter("d", "d:1", "r1")),
                ],
                cas_config_opid_index: None,
            },
            None,
        )
        .unwrap_err();
    assert_eq!(err.code, ServerErrorCode::InvalidConfig);
}

#[test]
fn leader_cannot_remove_or_demote_itself() {
    let registry = ClusterRegistry::new();
    let (nodes, _, _) = two_voter_cluster(&registry);
    elect_and_settle(&registry, &nodes, 0);
    let leader = &nodes[0].core;

    let err = leader
        .change_config(ConfigChangeItem::remove_peer("a"), None, None)
        .unwrap_err();
    assert_eq!(err.code, ServerErrorCode::InvalidConfig);

    let err = leader
        .change_config(
            ConfigChangeItem::modify_peer("a").with_member_type(MemberType::NonVoter),
            None,
            None,
        )
        .unwrap_err();
    assert_eq!(err.code, ServerErrorCode::InvalidConfig);
}

#[test]
fn second_change_rejected_while_one_is_pending() {
    let registry = ClusterRegistry::new();
    let (nodes, _, _) = two_voter_cluster(&registry);
    elect_and_settle(&registry, &nodes, 0);
    let leader = &nodes[0].core;

    leader
        .change_config(
            ConfigChangeItem::add_peer(Peer::non_voter("c", "c:1", "r1")),
            None,
            None,
        )
        .unwrap();
    assert!(leader.pending_config().is_some());
    let err = leader
        .change_config(
            ConfigChangeItem::add_peer(Peer::non_voter("d", "d:1", "r1")),
            None,
            None,
        )
        .unwrap_err();
    assert!(err.status.is_illegal_state());
}

#[test]
fn unsafe_change_config_force_installs_a_smaller_config() {
    let registry = ClusterRegistry::new();
    let peers = vec![
        Peer::voter("a", "a:1", "r1"),
        Peer::voter("b", "b:1", "r1"),
        Peer::voter("c", "c:1", "r1"),
    ];
    let config = RaftConfig::new(peers.clone(), CommitRule::classic());
    let node = start_node(&registry, quiet_options(), &peers[0], &config);
    let term_before = node.core.current_term();

    // b and c are gone; force a single-node config through the update
    // path as a pseudo-leader from a higher term.
    node.core
        .unsafe_change_config(&flexraft::UnsafeChangeConfigRequest {
            caller_id: "recovery-tool".to_string(),
            retained_peer_uuids: vec!["a".to_string()],
        })
        .unwrap();

    let pending = node.core.pending_config().expect("forced config pending");
    assert!(pending.unsafe_config_change);
    assert_eq!(pending.peers.len(), 1);
    assert!(node.core.current_term() > term_before);

    // Alone in the new config, a can now elect itself and commit.
    node.core
        .start_election(
            ElectionMode::Normal,
            ElectionContext::new(ElectionReason::ExternalRequest),
        )
        .unwrap();
    node.core
        .wait_until_leader_for_tests(Duration::from_secs(5))
        .expect("single retained voter wins");
}

#[test]
fn promotion_notification_promotes_caught_up_non_voter() {
    let registry = ClusterRegistry::new();
    let (nodes, _, _) = two_voter_cluster(&registry);
    elect_and_settle(&registry, &nodes, 0);
    let leader = &nodes[0].core;

    let mut candidate = Peer::non_voter("c", "c:1", "r1");
    candidate.attrs.promote = true;
    leader
        .change_config(ConfigChangeItem::add_peer(candidate), None, None)
        .unwrap();
    pump_peer(&registry, leader, "b").unwrap();
    assert!(wait_for(
        || leader.pending_config().is_none(),
        Duration::from_secs(5)
    ));

    // Bring up c and let it catch up; the queue then asks the core to
    // promote it, which replicates a MODIFY_PEER.
    let new_config = leader.committed_config();
    start_node(&registry, quiet_options(), new_config.peer("c").unwrap(), &new_config);
    assert!(wait_for(
        || {
            let _ = pump_peer(&registry, leader, "c");
            let _ = pump_peer(&registry, leader, "b");
            leader.committed_config().is_voter("c")
        },
        Duration::from_secs(10)
    ));
}
