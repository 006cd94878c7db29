use crate::config::RaftConfig;
use crate::error::ConsensusError;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// How replication traffic is routed from the leader to followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyPolicy {
    /// Every destination is reached directly.
    Disable,
    /// Cross-region traffic from the leader funnels through one proxy
    /// peer per region.
    SimpleRegion,
    /// Routes follow an explicitly configured proxy topology.
    Durable,
}

/// Explicit proxy edges for the durable policy: destination → the peer
/// that relays to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTopology {
    pub edges: BTreeMap<String, String>,
}

/// Next-hop table for the current leader/config/policy. Rebuilt whenever
/// any of the three changes; read-shared between the queue and the proxy
/// handler.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    policy: ProxyPolicy,
    leader_uuid: Option<String>,
    topology: ProxyTopology,
    /// dst uuid → next hop from the leader.
    leader_hops: BTreeMap<String, String>,
    members: Vec<String>,
}

impl RoutingTable {
    pub fn build(
        config: &RaftConfig,
        leader_uuid: Option<&str>,
        policy: ProxyPolicy,
        topology: &ProxyTopology,
    ) -> Self {
        let members: Vec<String> = config.peers.iter().map(|p| p.uuid.clone()).collect();
        let mut leader_hops = BTreeMap::new();
        match policy {
            ProxyPolicy::Disable => {}
            ProxyPolicy::SimpleRegion => {
                if let Some(leader) = leader_uuid {
                    if let Some(leader_peer) = config.peer(leader) {
                        // Lowest-uuid member of each remote region relays
                        // for the rest of that region.
                        let mut region_proxy: BTreeMap<String, String> = BTreeMap::new();
                        for peer in &config.peers {
                            if peer.region == leader_peer.region {
                                continue;
                            }
                            region_proxy
                                .entry(peer.region.clone())
                                .and_modify(|proxy| {
                                    if peer.uuid < *proxy {
                                        *proxy = peer.uuid.clone();
                                    }
                                })
                                .or_insert_with(|| peer.uuid.clone());
                        }
                        for peer in &config.peers {
                            if peer.region == leader_peer.region {
                                continue;
                            }
                            let proxy = &region_proxy[&peer.region];
                            if *proxy != peer.uuid {
                                leader_hops.insert(peer.uuid.clone(), proxy.clone());
                            }
                        }
                    }
                }
            }
            ProxyPolicy::Durable => {
                for (dst, via) in &topology.edges {
                    if config.is_member(dst) && config.is_member(via) && dst != via {
                        leader_hops.insert(dst.clone(), via.clone());
                    }
                }
            }
        }
        info!(
            "event=raft_routing_rebuild policy={:?} leader={} proxied_destinations={}",
            policy,
            leader_uuid.unwrap_or("-"),
            leader_hops.len()
        );
        Self {
            policy,
            leader_uuid: leader_uuid.map(|s| s.to_string()),
            topology: topology.clone(),
            leader_hops,
            members,
        }
    }

    pub fn policy(&self) -> ProxyPolicy {
        self.policy
    }

    pub fn topology(&self) -> &ProxyTopology {
        &self.topology
    }

    /// Next hop on the path from `src` to `dst`. Repeated application
    /// terminates at `dst` within the member count.
    pub fn next_hop(&self, src: &str, dst: &str) -> Result<String, RoutingError> {
        if !self.members.iter().any(|m| m == dst) {
            return Err(RoutingError::UnknownDestination {
                dst: dst.to_string(),
            });
        }
        if src == dst {
            return Ok(dst.to_string());
        }
        // Only the first hop away from the leader may be indirect; every
        // later hop (and every non-leader source) delivers directly.
        let from_leader = self.leader_uuid.as_deref() == Some(src);
        if !from_leader {
            return Ok(dst.to_string());
        }
        match self.leader_hops.get(dst) {
            Some(via) if via != src => Ok(via.clone()),
            _ => Ok(dst.to_string()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("unknown destination {dst}")]
    UnknownDestination { dst: String },
}

impl From<RoutingError> for ConsensusError {
    fn from(err: RoutingError) -> Self {
        ConsensusError::NotFound(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommitRule, Peer};

    fn config() -> RaftConfig {
        RaftConfig::new(
            vec![
                Peer::voter("a1", "a1:1", "r1"),
                Peer::voter("b1", "b1:1", "r2"),
                Peer::voter("b2", "b2:1", "r2"),
                Peer::voter("c1", "c1:1", "r3"),
            ],
            CommitRule::classic(),
        )
    }

    #[test]
    fn disabled_policy_routes_directly() {
        let table = RoutingTable::build(
            &config(),
            Some("a1"),
            ProxyPolicy::Disable,
            &ProxyTopology::default(),
        );
        assert_eq!(table.next_hop("a1", "b2").unwrap(), "b2");
    }

    #[test]
    fn simple_region_funnels_through_one_peer_per_region() {
        let table = RoutingTable::build(
            &config(),
            Some("a1"),
            ProxyPolicy::SimpleRegion,
            &ProxyTopology::default(),
        );
        // b1 is the r2 relay (lowest uuid); b2 is reached through it.
        assert_eq!(table.next_hop("a1", "b1").unwrap(), "b1");
        assert_eq!(table.next_hop("a1", "b2").unwrap(), "b1");
        // From the relay the delivery is direct.
        assert_eq!(table.next_hop("b1", "b2").unwrap(), "b2");
        // Single-member remote region is direct.
        assert_eq!(table.next_hop("a1", "c1").unwrap(), "c1");
    }

    #[test]
    fn durable_policy_follows_explicit_edges() {
        let topology = ProxyTopology {
            edges: BTreeMap::from([("c1".to_string(), "b1".to_string())]),
        };
        let table =
            RoutingTable::build(&config(), Some("a1"), ProxyPolicy::Durable, &topology);
        assert_eq!(table.next_hop("a1", "c1").unwrap(), "b1");
        assert_eq!(table.next_hop("b1", "c1").unwrap(), "c1");
        assert_eq!(table.next_hop("a1", "b2").unwrap(), "b2");
    }

    #[test]
    fn unknown_destination_is_an_error() {
        let table = RoutingTable::build(
            &config(),
            Some("a1"),
            ProxyPolicy::Disable,
            &ProxyTopology::default(),
        );
        assert!(matches!(
            table.next_hop("a1", "zz"),
            Err(RoutingError::UnknownDestination { .. })
        ));
    }

    #[test]
    fn every_route_terminates_within_member_count() {
        let topology = ProxyTopology {
            edges: BTreeMap::from([
                ("c1".to_string(), "b1".to_string()),
                ("b2".to_string(), "b1".to_string()),
            ]),
        };
        let config = config();
        let table = RoutingTable::build(&config, Some("a1"), ProxyPolicy::Durable, &topology);
        for dst in ["b1", "b2", "c1"] {
            let mut hops = 0;
            let mut at = "a1".to_string();
            while at != dst {
                at = table.next_hop(&at, dst).unwrap();
                hops += 1;
                assert!(hops <= config.peers.len(), "routing loop towards {dst}");
            }
        }
    }
}
