//! Local-aggregator election and rank-to-aggregator binding.
//!
//! The global aggregator list is extended into a *local* aggregator set with
//! at most `co` members per node, and every rank is bound to exactly one
//! local aggregator on its own node. Local aggregators act as intra-node
//! proxies: their *clients* delegate the inter-node leg of a shuffle to
//! them.

use crate::topology::Topology;
use crate::{ShuffleError, ShuffleResult};

/// How a node's local aggregator slots are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Local aggregators sit at evenly spread positions inside the node,
    /// mirroring the stride election at node level.
    Spread,
    /// Global aggregators resident on the node claim slots first; remaining
    /// slots fill with the node's other ranks in rank order.
    Cover,
}

/// The aggregator sets of one round and the client binding between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    global: Vec<usize>,
    local: Vec<usize>,
    bind: Vec<usize>,
    /// Client groups, parallel to `local`; each group lists the ranks bound
    /// to that aggregator, ascending, including the aggregator itself.
    clients: Vec<Vec<usize>>,
}

impl Binding {
    /// The sorted global aggregator list.
    pub fn global(&self) -> &[usize] {
        &self.global
    }

    /// The sorted local aggregator list.
    pub fn local(&self) -> &[usize] {
        &self.local
    }

    /// The local aggregator `rank` delegates to. `bind(a) == a` for every
    /// local aggregator `a`.
    pub fn bind_of(&self, rank: usize) -> usize {
        self.bind[rank]
    }

    /// Whether `rank` is a global aggregator.
    pub fn is_global(&self, rank: usize) -> bool {
        self.global.binary_search(&rank).is_ok()
    }

    /// Whether `rank` is a local aggregator.
    pub fn is_local(&self, rank: usize) -> bool {
        self.local.binary_search(&rank).is_ok()
    }

    /// Position of `rank` within the sorted local aggregator list.
    pub fn local_index(&self, rank: usize) -> Option<usize> {
        self.local.binary_search(&rank).ok()
    }

    /// The clients of local aggregator `rank`, ascending.
    pub fn clients_of(&self, rank: usize) -> Option<&[usize]> {
        self.local_index(rank).map(|index| self.clients[index].as_slice())
    }

    /// Whether every global aggregator is also a local aggregator. Cover
    /// mode guarantees this whenever `co` is at least the per-node resident
    /// count; spread mode need not.
    pub fn globals_covered(&self) -> bool {
        self.global.iter().all(|&g| self.is_local(g))
    }
}

/// Extends `global` into the local aggregator set and binds every rank to
/// one local aggregator on its own node.
///
/// Per node with `p` ranks, `k = min(co, p)` local aggregators are chosen by
/// `mode`, then the node's ranks partition into `k` contiguous groups of
/// `⌈p/k⌉` (the first `p mod k` groups) or `⌊p/k⌋` members. The scan skips
/// ranks that are other local aggregators (they belong to their own group)
/// and force-adds the group's own aggregator at the last slot if it has not
/// appeared yet, so every aggregator always lands in the group it
/// represents.
pub fn bind_local(
    topology: &Topology,
    global: &[usize],
    co: usize,
    mode: BindMode,
) -> ShuffleResult<Binding> {
    let size = topology.size();
    if co == 0 {
        return Err(ShuffleError::InvalidConfig("local aggregator cap must be at least 1".to_owned()));
    }
    if global.is_empty() || global.windows(2).any(|w| w[0] >= w[1]) || global[global.len() - 1] >= size
    {
        return Err(ShuffleError::InvalidConfig(
            "global aggregator list must be non-empty, strictly sorted, and in range".to_owned(),
        ));
    }

    let mut bind = vec![usize::MAX; size];
    let mut local = Vec::new();
    for node in 0..topology.node_count() {
        let node_ranks = topology.ranks_on_node(node);
        let p = node_ranks.len();
        let k = co.min(p);
        let node_aggs = match mode {
            BindMode::Spread => {
                let remainder = p % k;
                let floor = p / k;
                let ceil = if remainder > 0 { floor + 1 } else { floor };
                (0..k)
                    .map(|j| {
                        if j < remainder {
                            node_ranks[ceil * j]
                        } else {
                            node_ranks[ceil * remainder + floor * (j - remainder)]
                        }
                    })
                    .collect::<Vec<usize>>()
            }
            BindMode::Cover => {
                let mut chosen: Vec<usize> = node_ranks
                    .iter()
                    .copied()
                    .filter(|r| global.binary_search(r).is_ok())
                    .collect();
                chosen.truncate(k);
                for &rank in node_ranks {
                    if chosen.len() == k {
                        break;
                    }
                    if !chosen.contains(&rank) {
                        chosen.push(rank);
                    }
                }
                chosen
            }
        };

        let is_node_agg = |rank: usize| node_aggs.contains(&rank);
        let remainder = p % k;
        let floor = p / k;
        let ceil = if remainder > 0 { floor + 1 } else { floor };
        let mut base = 0;
        for (j, &agg) in node_aggs.iter().enumerate() {
            let group = if j < remainder { ceil } else { floor };
            let mut seated = false;
            for slot in 0..group {
                if slot == group - 1 && !seated {
                    // Reserved seat: the aggregator takes its own last slot.
                    bind[agg] = agg;
                    break;
                }
                while is_node_agg(node_ranks[base]) && node_ranks[base] != agg {
                    base += 1;
                }
                if is_node_agg(node_ranks[base]) {
                    seated = true;
                }
                bind[node_ranks[base]] = agg;
                base += 1;
            }
        }
        local.extend_from_slice(&node_aggs);
    }

    local.sort_unstable();
    debug_assert!(bind.iter().all(|&a| a != usize::MAX), "every rank bound");
    let clients = local
        .iter()
        .map(|&agg| (0..size).filter(|&r| bind[r] == agg).collect())
        .collect();
    let binding = Binding { global: global.to_vec(), local, bind, clients };
    tracing::debug!(local = ?binding.local, "bound local aggregators");
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{SyntheticLayout, Topology};

    fn topo(size: usize, per_node: usize) -> Topology {
        Topology::synthetic(size, 0, per_node, SyntheticLayout::Contiguous).unwrap()
    }

    fn check_partition(binding: &Binding, size: usize) {
        let mut seen = vec![false; size];
        for &agg in binding.local() {
            for &client in binding.clients_of(agg).unwrap() {
                assert!(!seen[client], "rank {client} bound twice");
                seen[client] = true;
                assert_eq!(agg, binding.bind_of(client));
            }
        }
        assert!(seen.into_iter().all(|bound| bound), "every rank bound exactly once");
    }

    #[test]
    fn cover_mode_extends_resident_globals() {
        // One node of 8, cap 3, globals {1, 4}: rank 0 fills the third slot.
        let binding = bind_local(&topo(8, 8), &[1, 4], 3, BindMode::Cover).unwrap();
        assert_eq!(&[0, 1, 4], binding.local());
        assert!(binding.globals_covered());
        assert_eq!(1, binding.bind_of(1));
        assert_eq!(4, binding.bind_of(4));
        assert_eq!(0, binding.bind_of(0));
        // Groups are {ceil, ceil, floor} = {3, 3, 2}.
        let mut sizes: Vec<usize> =
            binding.local().iter().map(|&a| binding.clients_of(a).unwrap().len()).collect();
        sizes.sort_unstable();
        assert_eq!(vec![2, 3, 3], sizes);
        check_partition(&binding, 8);
    }

    #[test]
    fn spread_mode_places_by_node_stride() {
        // Two nodes of 4, cap 2: node strides place aggregators at local
        // offsets 0 and 2.
        let binding = bind_local(&topo(8, 4), &[0, 4], 2, BindMode::Spread).unwrap();
        assert_eq!(&[0, 2, 4, 6], binding.local());
        check_partition(&binding, 8);
        for &agg in binding.local() {
            assert_eq!(agg, binding.bind_of(agg));
            assert_eq!(2, binding.clients_of(agg).unwrap().len());
        }
    }

    #[test]
    fn cap_larger_than_node_saturates() {
        let binding = bind_local(&topo(4, 2), &[0, 1, 2, 3], 8, BindMode::Cover).unwrap();
        assert_eq!(&[0, 1, 2, 3], binding.local());
        check_partition(&binding, 4);
    }

    #[test]
    fn reserved_seat_survives_adjacent_aggregators() {
        // One node of 6, globals {0, 1}: both sit at the front, so the
        // scan must skip rank 1 while filling rank 0's group.
        let binding = bind_local(&topo(6, 6), &[0, 1], 2, BindMode::Cover).unwrap();
        assert_eq!(&[0, 1], binding.local());
        assert_eq!(0, binding.bind_of(0));
        assert_eq!(1, binding.bind_of(1));
        check_partition(&binding, 6);
        assert_eq!(3, binding.clients_of(0).unwrap().len());
        assert_eq!(3, binding.clients_of(1).unwrap().len());
    }

    #[test]
    fn zero_cap_rejected() {
        assert!(bind_local(&topo(4, 2), &[0], 0, BindMode::Cover).is_err());
    }

    #[test]
    fn unsorted_globals_rejected() {
        assert!(bind_local(&topo(4, 2), &[2, 1], 1, BindMode::Cover).is_err());
    }
}
