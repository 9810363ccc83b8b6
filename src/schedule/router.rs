//! Stream routing on the connectivity graph.
//!
//! Single-hop streams go through directly. Multi-hop streams get a BFS
//! primary path (bounded by `maxHops`); spatial redundancy searches
//! alternatives by DFS up to `pathLen + MORE_HOPS` and prefers a
//! node-disjoint one, downgrading to temporal redundancy when the primary
//! path is the only path.

use log::debug;

use crate::stream::collection::MasterStreamInfo;
use crate::stream::Redundancy;
use crate::uplink::NetworkGraph;

use super::ScheduleElement;

/// Extra hops allowed to a redundant path over the primary one.
const MORE_HOPS: usize = 1;

pub struct Router<'a> {
    graph: &'a NetworkGraph,
    max_hops: usize,
}

impl<'a> Router<'a> {
    pub fn new(graph: &'a NetworkGraph, max_hops: usize) -> Self {
        Self { graph, max_hops }
    }

    /// Route every stream into transmission blocks: one block per
    /// (possibly redundant) path instance, in scheduling order.
    pub fn run(&self, streams: &[MasterStreamInfo]) -> Vec<Vec<ScheduleElement>> {
        let mut routed = Vec::new();
        for stream in streams {
            self.route_stream(stream, &mut routed);
        }
        routed
    }

    fn route_stream(&self, stream: &MasterStreamInfo, routed: &mut Vec<Vec<ScheduleElement>>) {
        let src = stream.id.src;
        let dst = stream.id.dst;

        if self.graph.has_edge(src, dst) {
            // Single hop: spatial redundancy is meaningless, downgrade.
            let mut params = stream.params;
            params.redundancy = match params.redundancy {
                Redundancy::DoubleSpatial => Redundancy::Double,
                Redundancy::TripleSpatial => Redundancy::Triple,
                other => other,
            };
            let block = vec![ScheduleElement::single_hop(stream.id, params)];
            for _ in 0..params.redundancy.multiplier() {
                routed.push(block.clone());
            }
            return;
        }

        let Some(path) = self.breadth_first_search(src, dst) else {
            debug!("[SC] no path for stream {}", stream.id);
            return;
        };
        if path.len() - 1 > self.max_hops {
            debug!(
                "[SC] path of {} hops exceeds maxHops for stream {}",
                path.len() - 1,
                stream.id
            );
            return;
        }

        let mut params = stream.params;
        let mut secondary = None;
        if params.redundancy.is_spatial() {
            let limit = (path.len() - 1) + MORE_HOPS;
            let mut extra_paths = self.depth_first_search(src, dst, limit);
            extra_paths.retain(|p| *p != path);
            if extra_paths.is_empty() {
                debug!("[SC] single path only, downgrading spatial redundancy");
                params.redundancy = match params.redundancy {
                    Redundancy::DoubleSpatial => Redundancy::Double,
                    Redundancy::TripleSpatial => Redundancy::Triple,
                    other => other,
                };
            } else {
                // Prefer node-disjoint alternatives, shortest first.
                let independent = find_independent_paths(&extra_paths, &path);
                let pool = if independent.is_empty() {
                    &extra_paths
                } else {
                    &independent
                };
                secondary = pool.iter().min_by_key(|p| p.len()).cloned();
            }
        }

        let primary_block = path_to_schedule(&path, stream, params);
        // Primary path copies (temporal redundancy).
        let primary_copies = match params.redundancy {
            Redundancy::None | Redundancy::DoubleSpatial => 1,
            Redundancy::Double | Redundancy::TripleSpatial => 2,
            Redundancy::Triple => 3,
        };
        for _ in 0..primary_copies {
            routed.push(primary_block.clone());
        }
        if let Some(secondary_path) = secondary {
            routed.push(path_to_schedule(&secondary_path, stream, params));
        }
    }

    fn breadth_first_search(&self, root: u8, dest: u8) -> Option<Vec<u8>> {
        if !self.graph.has_node(root) || !self.graph.has_node(dest) {
            return None;
        }
        let mut visited = std::collections::BTreeSet::new();
        let mut parent_of = std::collections::BTreeMap::new();
        let mut open = std::collections::VecDeque::new();
        visited.insert(root);
        open.push_back(root);
        while let Some(node) = open.pop_front() {
            if node == dest {
                return Some(construct_path(node, root, &parent_of));
            }
            for child in self.graph.neighbors(node) {
                if visited.insert(child) {
                    parent_of.insert(child, node);
                    open.push_back(child);
                }
            }
        }
        None
    }

    /// Every simple path from `src` to `dst` of at most `limit` hops.
    fn depth_first_search(&self, src: u8, dst: u8, limit: usize) -> Vec<Vec<u8>> {
        let mut visited = std::collections::BTreeSet::new();
        let mut path = Vec::new();
        let mut all_paths = Vec::new();
        self.dfs_run(src, dst, limit, &mut visited, &mut path, &mut all_paths);
        all_paths
    }

    fn dfs_run(
        &self,
        node: u8,
        target: u8,
        limit: usize,
        visited: &mut std::collections::BTreeSet<u8>,
        path: &mut Vec<u8>,
        all_paths: &mut Vec<Vec<u8>>,
    ) {
        visited.insert(node);
        path.push(node);
        if node == target {
            all_paths.push(path.clone());
        } else if path.len() <= limit {
            for child in self.graph.neighbors(node) {
                if !visited.contains(&child) {
                    self.dfs_run(child, target, limit, visited, path, all_paths);
                }
            }
        }
        path.pop();
        visited.remove(&node);
    }
}

fn construct_path(
    mut node: u8,
    root: u8,
    parent_of: &std::collections::BTreeMap<u8, u8>,
) -> Vec<u8> {
    let mut path = vec![node];
    while node != root {
        node = parent_of[&node];
        path.push(node);
    }
    path.reverse();
    path
}

/// A path like `0 1 2 3` becomes the transmissions `0->1 1->2 2->3`.
fn path_to_schedule(
    path: &[u8],
    stream: &MasterStreamInfo,
    params: crate::stream::StreamParameters,
) -> Vec<ScheduleElement> {
    path.windows(2)
        .map(|pair| ScheduleElement::multi_hop(stream.id, params, pair[0], pair[1]))
        .collect()
}

/// Paths with no intermediate node in common with the primary path.
fn find_independent_paths(paths: &[Vec<u8>], primary: &[u8]) -> Vec<Vec<u8>> {
    let forbidden: std::collections::BTreeSet<u8> = primary[1..primary.len() - 1]
        .iter()
        .copied()
        .collect();
    paths
        .iter()
        .filter(|p| p.iter().all(|n| !forbidden.contains(n)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::collection::MasterStreamStatus;
    use crate::stream::{Direction, Period, StreamId, StreamParameters};

    fn stream(src: u8, dst: u8, redundancy: Redundancy) -> MasterStreamInfo {
        MasterStreamInfo {
            id: StreamId::new(src, dst, 0, 1),
            params: StreamParameters::new(redundancy, Period::P2, 16, Direction::Tx),
            status: MasterStreamStatus::Accepted,
        }
    }

    fn line_graph() -> NetworkGraph {
        // 0 - 1 - 2
        let mut g = NetworkGraph::new(8);
        g.add_edge(0, 1);
        g.add_edge(1, 2);
        g
    }

    fn diamond_graph() -> NetworkGraph {
        // 0 - 1 - 3 and 0 - 2 - 3
        let mut g = NetworkGraph::new(8);
        g.add_edge(0, 1);
        g.add_edge(1, 3);
        g.add_edge(0, 2);
        g.add_edge(2, 3);
        g
    }

    #[test]
    fn single_hop_stream_routes_directly() {
        let g = line_graph();
        let router = Router::new(&g, 4);
        let routed = router.run(&[stream(0, 1, Redundancy::None)]);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].len(), 1);
        assert_eq!((routed[0][0].tx, routed[0][0].rx), (0, 1));
    }

    #[test]
    fn temporal_redundancy_copies_the_block() {
        let g = line_graph();
        let router = Router::new(&g, 4);
        let routed = router.run(&[stream(0, 1, Redundancy::Triple)]);
        assert_eq!(routed.len(), 3);
        assert_eq!(routed[0], routed[2]);
    }

    #[test]
    fn multi_hop_stream_becomes_transmission_chain() {
        let g = line_graph();
        let router = Router::new(&g, 4);
        let routed = router.run(&[stream(0, 2, Redundancy::None)]);
        assert_eq!(routed.len(), 1);
        let hops: Vec<(u8, u8)> = routed[0].iter().map(|e| (e.tx, e.rx)).collect();
        assert_eq!(hops, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn max_hops_rejects_long_paths() {
        let g = line_graph();
        let router = Router::new(&g, 1);
        let routed = router.run(&[stream(0, 2, Redundancy::None)]);
        assert!(routed.is_empty());
    }

    #[test]
    fn unreachable_stream_not_routed() {
        let g = line_graph();
        let router = Router::new(&g, 4);
        let routed = router.run(&[stream(0, 5, Redundancy::None)]);
        assert!(routed.is_empty());
    }

    #[test]
    fn spatial_redundancy_uses_disjoint_path() {
        let g = diamond_graph();
        let router = Router::new(&g, 4);
        let routed = router.run(&[stream(0, 3, Redundancy::DoubleSpatial)]);
        assert_eq!(routed.len(), 2);
        let primary_mid = routed[0][0].rx;
        let secondary_mid = routed[1][0].rx;
        assert_ne!(primary_mid, secondary_mid);
    }

    #[test]
    fn spatial_downgrades_to_temporal_on_single_path() {
        // 0 - 1 - 2 has exactly one path.
        let g = line_graph();
        let router = Router::new(&g, 4);
        let routed = router.run(&[stream(0, 2, Redundancy::DoubleSpatial)]);
        // Downgraded to DOUBLE: the same path twice.
        assert_eq!(routed.len(), 2);
        assert_eq!(routed[0], routed[1]);
        assert_eq!(routed[0][0].params.redundancy, Redundancy::Double);
    }

    #[test]
    fn triple_spatial_is_two_primary_plus_secondary() {
        let g = diamond_graph();
        let router = Router::new(&g, 4);
        let routed = router.run(&[stream(0, 3, Redundancy::TripleSpatial)]);
        assert_eq!(routed.len(), 3);
        assert_eq!(routed[0], routed[1]);
        assert_ne!(routed[0], routed[2]);
    }
}
