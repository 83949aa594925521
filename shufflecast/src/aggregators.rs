//! Global aggregator election.

use crate::topology::Topology;
use crate::{ShuffleError, ShuffleResult};

/// Placement policies for the global aggregator list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPolicy {
    /// The first `K` ranks.
    Contiguous,
    /// Evenly spread home positions respecting the `N mod K` remainder
    /// partition.
    Stride,
    /// Stride, then every rank rotated by a fixed offset modulo `N`; used
    /// to probe mapping sensitivity.
    ShiftedStride(usize),
    /// One process per node per rotation, advancing one intra-node index at
    /// each full rotation.
    NodeRoundRobin,
}

impl ElectionPolicy {
    /// Short name used in reports.
    pub fn name(&self) -> &'static str {
        match self {
            ElectionPolicy::Contiguous => "contiguous",
            ElectionPolicy::Stride => "stride",
            ElectionPolicy::ShiftedStride(_) => "shifted-stride",
            ElectionPolicy::NodeRoundRobin => "node-round-robin",
        }
    }
}

/// The stride home positions: `⌈N/K⌉·m` for `m < N mod K`, continuing with
/// stride `⌊N/K⌋`. Also the rotation anchors of the balanced schedules.
pub fn stride_positions(size: usize, count: usize) -> Vec<usize> {
    let remainder = size % count;
    let floor = size / count;
    let ceil = if remainder > 0 { floor + 1 } else { floor };
    (0..count)
        .map(|m| {
            if m < remainder {
                ceil * m
            } else {
                ceil * remainder + floor * (m - remainder)
            }
        })
        .collect()
}

/// Elects `count` aggregator ranks out of `0..size` under `policy`. The
/// result is canonicalized ascending regardless of policy so downstream
/// consumers see one ordering.
pub fn elect(
    size: usize,
    count: usize,
    topology: &Topology,
    policy: ElectionPolicy,
) -> ShuffleResult<Vec<usize>> {
    if count == 0 || count > size {
        return Err(ShuffleError::InvalidConfig(format!(
            "aggregator count {count} outside 1..={size}"
        )));
    }
    let mut elected = match policy {
        ElectionPolicy::Contiguous => (0..count).collect(),
        ElectionPolicy::Stride => stride_positions(size, count),
        ElectionPolicy::ShiftedStride(offset) => {
            let mut list: Vec<usize> =
                stride_positions(size, count).into_iter().map(|r| (r + offset) % size).collect();
            list.sort_unstable();
            list
        }
        ElectionPolicy::NodeRoundRobin => {
            let mut list = Vec::with_capacity(count);
            let mut depth = 0;
            while list.len() < count {
                for node in 0..topology.node_count() {
                    if let Some(&rank) = topology.ranks_on_node(node).get(depth) {
                        list.push(rank);
                        if list.len() == count {
                            break;
                        }
                    }
                }
                depth += 1;
            }
            list.sort_unstable();
            list
        }
    };
    elected.dedup();
    debug_assert_eq!(count, elected.len());
    tracing::debug!(policy = policy.name(), aggregators = ?elected, "elected aggregators");
    Ok(elected)
}

/// Re-permutes an aggregator list so consecutive entries rotate across
/// nodes, spreading consecutive schedule turns over distinct NICs.
pub fn interleave_across_nodes(list: &mut [usize], topology: &Topology) {
    let nodes = topology.node_count();
    let mut per_node: Vec<Vec<usize>> = vec![Vec::new(); nodes];
    for &rank in list.iter() {
        per_node[topology.node_of(rank)].push(rank);
    }
    let mut cursor = vec![0usize; nodes];
    let mut node = 0;
    for slot in list.iter_mut() {
        while cursor[node] == per_node[node].len() {
            node = (node + 1) % nodes;
        }
        *slot = per_node[node][cursor[node]];
        cursor[node] += 1;
        node = (node + 1) % nodes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::SyntheticLayout;

    fn topo(size: usize, per_node: usize) -> Topology {
        Topology::synthetic(size, 0, per_node, SyntheticLayout::Contiguous).unwrap()
    }

    #[test]
    fn stride_respects_remainder_partition() {
        // N=10, K=4: remainder 2, ceiling 3, floor 2.
        assert_eq!(vec![0, 3, 6, 8], stride_positions(10, 4));
        // Even split.
        assert_eq!(vec![0, 4, 8, 12], stride_positions(16, 4));
        assert_eq!(vec![0, 8], stride_positions(16, 2));
    }

    #[test]
    fn contiguous_takes_prefix() {
        assert_eq!(vec![0, 1, 2], elect(8, 3, &topo(8, 2), ElectionPolicy::Contiguous).unwrap());
    }

    #[test]
    fn shifted_stride_rotates_and_sorts() {
        let list = elect(8, 4, &topo(8, 2), ElectionPolicy::ShiftedStride(3)).unwrap();
        assert_eq!(vec![1, 3, 5, 7], list);
    }

    #[test]
    fn node_round_robin_covers_nodes_first() {
        // 8 ranks, 4 nodes of 2: first rotation picks one rank per node.
        let list = elect(8, 4, &topo(8, 2), ElectionPolicy::NodeRoundRobin).unwrap();
        assert_eq!(vec![0, 2, 4, 6], list);
        // Six aggregators: second rotation starts adding second ranks.
        let list = elect(8, 6, &topo(8, 2), ElectionPolicy::NodeRoundRobin).unwrap();
        assert_eq!(vec![0, 1, 2, 3, 4, 6], list);
    }

    #[test]
    fn zero_or_oversized_count_rejected() {
        assert!(elect(8, 0, &topo(8, 2), ElectionPolicy::Contiguous).is_err());
        assert!(elect(8, 9, &topo(8, 2), ElectionPolicy::Contiguous).is_err());
    }

    #[test]
    fn interleave_rotates_across_nodes() {
        let topology = topo(8, 4);
        let mut list = vec![0, 1, 4, 5];
        interleave_across_nodes(&mut list, &topology);
        assert_eq!(vec![0, 4, 1, 5], list);
    }
}
