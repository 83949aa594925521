//! Rank-to-node mapping and per-node proxy election.

use std::sync::Arc;

use bytes::Bytes;
use rankwire::Communicator;

use crate::{ShuffleError, ShuffleResult};

/// Node layouts for the synthetic provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticLayout {
    /// Rank `r` lives on node `r / procs_per_node`.
    Contiguous,
    /// Ranks deal out across nodes round-robin, with the short final node
    /// filled last when the world does not divide evenly.
    RoundRobin,
}

/// The process-to-node map of one world, plus each node's proxy (its lowest
/// rank). Outputs are deterministic for a given input: running discovery
/// twice yields identical maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    node_of_rank: Vec<usize>,
    ranks_on_node: Vec<Vec<usize>>,
    proxy_of_node: Vec<usize>,
    my_node: usize,
}

impl Topology {
    /// Dynamic provider: every rank publishes its locality identifier, an
    /// all-gather distributes them, and node indices follow the first
    /// occurrence within the sorted identifier sequence.
    pub async fn discover(comm: &Arc<dyn Communicator>) -> ShuffleResult<Self> {
        let name = comm.locality();
        let gathered = comm
            .all_gather(Bytes::from(name.into_bytes()))
            .await
            .map_err(ShuffleError::TopologyUnavailable)?;
        let names: Vec<String> =
            gathered.iter().map(|raw| String::from_utf8_lossy(raw).into_owned()).collect();
        Ok(Self::from_localities(comm.rank(), &names))
    }

    /// Builds the map from already-gathered locality names.
    pub fn from_localities(rank: usize, names: &[String]) -> Self {
        let mut unique: Vec<&String> = names.iter().collect();
        unique.sort();
        unique.dedup();
        let node_of_rank = names
            .iter()
            .map(|name| unique.binary_search(&name).expect("name is in the unique set"))
            .collect();
        Self::from_node_map(rank, node_of_rank)
    }

    /// Static provider for tests and drivers: `procs_per_node` ranks per
    /// node under the chosen layout, final short node handled explicitly.
    pub fn synthetic(
        size: usize,
        rank: usize,
        procs_per_node: usize,
        layout: SyntheticLayout,
    ) -> ShuffleResult<Self> {
        if procs_per_node == 0 {
            return Err(ShuffleError::InvalidConfig("procs_per_node must be at least 1".to_owned()));
        }
        if rank >= size {
            return Err(ShuffleError::InvalidConfig(format!(
                "rank {rank} outside world of {size}"
            )));
        }
        let nodes = size.div_ceil(procs_per_node);
        let node_of_rank = match layout {
            SyntheticLayout::Contiguous => (0..size).map(|r| r / procs_per_node).collect(),
            SyntheticLayout::RoundRobin => {
                let remainder = size % procs_per_node;
                let full = size / procs_per_node;
                (0..size)
                    .map(|r| {
                        if r < remainder * nodes {
                            r % nodes
                        } else {
                            (r - remainder * nodes) % full
                        }
                    })
                    .collect()
            }
        };
        Ok(Self::from_node_map(rank, node_of_rank))
    }

    fn from_node_map(rank: usize, node_of_rank: Vec<usize>) -> Self {
        let nodes = node_of_rank.iter().copied().max().map_or(0, |max| max + 1);
        let mut ranks_on_node = vec![Vec::new(); nodes];
        for (r, &node) in node_of_rank.iter().enumerate() {
            ranks_on_node[node].push(r);
        }
        let proxy_of_node = ranks_on_node
            .iter()
            .map(|ranks| *ranks.first().expect("every node has at least one rank"))
            .collect();
        let my_node = node_of_rank[rank];
        Topology { node_of_rank, ranks_on_node, proxy_of_node, my_node }
    }

    /// World size.
    pub fn size(&self) -> usize {
        self.node_of_rank.len()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.ranks_on_node.len()
    }

    /// The node this rank lives on.
    pub fn my_node(&self) -> usize {
        self.my_node
    }

    /// Node hosting `rank`.
    pub fn node_of(&self, rank: usize) -> usize {
        self.node_of_rank[rank]
    }

    /// Ranks on `node`, ascending.
    pub fn ranks_on_node(&self, node: usize) -> &[usize] {
        &self.ranks_on_node[node]
    }

    /// The proxy (lowest rank) of `node`.
    pub fn proxy_of_node(&self, node: usize) -> usize {
        self.proxy_of_node[node]
    }

    /// All node proxies, in node order.
    pub fn proxies(&self) -> &[usize] {
        &self.proxy_of_node
    }

    /// The size of the first node, used as the nominal stripe width by
    /// node-striped schedules.
    pub fn nominal_node_size(&self) -> usize {
        self.ranks_on_node[0].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_assigns_blocks() {
        let topo = Topology::synthetic(8, 3, 2, SyntheticLayout::Contiguous).unwrap();
        assert_eq!(4, topo.node_count());
        assert_eq!(1, topo.my_node());
        assert_eq!(vec![0, 0, 1, 1, 2, 2, 3, 3], (0..8).map(|r| topo.node_of(r)).collect::<Vec<_>>());
        assert_eq!(&[0, 2, 4, 6], topo.proxies());
    }

    #[test]
    fn contiguous_short_final_node() {
        let topo = Topology::synthetic(7, 6, 3, SyntheticLayout::Contiguous).unwrap();
        assert_eq!(3, topo.node_count());
        assert_eq!(&[6], topo.ranks_on_node(2));
        assert_eq!(3, topo.ranks_on_node(0).len());
    }

    #[test]
    fn round_robin_deals_out_ranks() {
        let topo = Topology::synthetic(8, 0, 2, SyntheticLayout::RoundRobin).unwrap();
        assert_eq!(4, topo.node_count());
        // Ranks 0..4 take one node each, 4..8 deal out again.
        assert_eq!(vec![0, 1, 2, 3, 0, 1, 2, 3], (0..8).map(|r| topo.node_of(r)).collect::<Vec<_>>());
        assert_eq!(&[0, 1, 2, 3], topo.proxies());
    }

    #[test]
    fn round_robin_keeps_final_node_short() {
        let topo = Topology::synthetic(10, 0, 4, SyntheticLayout::RoundRobin).unwrap();
        let sizes: Vec<usize> = (0..topo.node_count()).map(|n| topo.ranks_on_node(n).len()).collect();
        assert_eq!(vec![4, 4, 2], sizes);
    }

    #[test]
    fn localities_index_by_sorted_first_occurrence() {
        let names: Vec<String> =
            ["beta", "alpha", "beta", "alpha"].iter().map(|s| (*s).to_owned()).collect();
        let topo = Topology::from_localities(0, &names);
        // "alpha" sorts first, so ranks 1 and 3 form node 0.
        assert_eq!(vec![1, 0, 1, 0], (0..4).map(|r| topo.node_of(r)).collect::<Vec<_>>());
        assert_eq!(&[1, 0], topo.proxies());
    }

    #[test]
    fn discovery_is_idempotent() {
        let names: Vec<String> = (0..6).map(|r| format!("node{}", r / 3)).collect();
        assert_eq!(Topology::from_localities(2, &names), Topology::from_localities(2, &names));
    }
}
