//! Neighbor table: link quality tracking and predecessor choice.
//!
//! Each potential neighbor carries a status (Unknown, Weak, Strong), an
//! EMA-filtered RSSI and a counter serving both as removal timeout and as
//! insertion frequency filter. Predecessors (neighbors with a strictly
//! smaller hop) are kept in a max-heap by RSSI so the best parent for
//! uplink forwarding is always at the front; a node flagged as a bad
//! assignee has its priority artificially lowered.

use crate::config::NetworkConfig;

use super::topology::TopologyElement;

/// Priority penalty applied to predecessors flagged as bad assignees.
const BAD_ASSIGNEE_PENALTY: i16 = 128;

/// Link classification of a potential neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NeighborStatus {
    /// Absent from both topologies.
    #[default]
    Unknown,
    /// Present in the weak topology only.
    Weak,
    /// Present in both topologies.
    Strong,
}

/// Fixed-point EMA parameters: one = 16, alpha = 0.75.
const EMA_ONE: i16 = 16;
const EMA_ALPHA: i16 = 12;

/// Hysteresis thresholds for unknown links turning weak.
const UNKNOWN_NEIGHBOR_THRESHOLD: u16 = 11;
const UNKNOWN_NEIGHBOR_INCREMENT: u16 = 5;
const UNKNOWN_NEIGHBOR_DECREMENT: u16 = 1;

#[derive(Debug, Clone, Copy, Default)]
struct Neighbor {
    status: NeighborStatus,
    /// EMA accumulator, RSSI times [`EMA_ONE`].
    avg_rssi: i16,
    /// Removal timeout for known links, frequency counter for unknown.
    freq_timeout_ctr: u16,
}

impl Neighbor {
    fn avg_rssi(&self) -> i16 {
        self.avg_rssi / EMA_ONE
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn update_ema(&mut self, rssi: i16) {
        self.avg_rssi = self.avg_rssi * EMA_ALPHA / EMA_ONE + (EMA_ONE - EMA_ALPHA) * rssi;
    }
}

pub struct NeighborTable {
    use_weak: bool,
    strong_timeout: u16,
    weak_timeout: u16,
    min_strong_rssi: i16,
    min_weak_rssi: i16,
    my_id: u8,
    my_hop: u8,
    bad_assignee: bool,
    my_topology: TopologyElement,
    neighbors: Vec<Neighbor>,
    /// `(node, priority RSSI, removal timeout)`, best predecessor first.
    predecessors: Vec<(u8, i16, u16)>,
}

impl NeighborTable {
    pub fn new(config: &NetworkConfig, my_id: u8, my_hop: u8) -> Self {
        Self {
            use_weak: config.use_weak_topologies,
            strong_timeout: config.max_rounds_unavailable_becomes_dead,
            weak_timeout: config.max_rounds_weak_link_becomes_dead,
            min_strong_rssi: config.min_neighbor_rssi,
            min_weak_rssi: config.min_weak_neighbor_rssi,
            my_id,
            my_hop,
            bad_assignee: my_id != 0,
            my_topology: TopologyElement::new(my_id, config.max_nodes, config.use_weak_topologies),
            neighbors: vec![Neighbor::default(); config.max_nodes as usize],
            predecessors: Vec::new(),
        }
    }

    /// Reset after a resync put us at a different hop.
    pub fn clear(&mut self, new_hop: u8) {
        self.my_topology.clear();
        self.predecessors.clear();
        self.my_hop = new_hop;
        self.bad_assignee = self.my_id != 0;
        for n in &mut self.neighbors {
            n.reset();
        }
    }

    pub fn my_topology_element(&self) -> &TopologyElement {
        &self.my_topology
    }

    pub fn has_predecessor(&self) -> bool {
        !self.predecessors.is_empty()
    }

    pub fn best_predecessor(&self) -> Option<u8> {
        self.predecessors.first().map(|p| p.0)
    }

    pub fn best_predecessor_is_bad(&self) -> bool {
        self.predecessors
            .first()
            .is_some_and(|p| p.1 < self.min_strong_rssi)
    }

    pub fn is_bad_assignee(&self) -> bool {
        self.bad_assignee
    }

    pub fn neighbor_status(&self, node: u8) -> NeighborStatus {
        self.neighbors[node as usize].status
    }

    /// Update after receiving `current_node`'s uplink.
    pub fn received_message(
        &mut self,
        current_node: u8,
        current_hop: u8,
        rssi: i16,
        bad: bool,
        sender_topology: &TopologyElement,
    ) {
        let hears_us = sender_topology.neighbors().get(self.my_id as usize);
        self.update_link_quality(current_node, rssi, hears_us);

        // Track predecessors for uplink forwarding. The master is a
        // predecessor of every node that hears it.
        if current_node == 0 || current_hop < self.my_hop {
            let priority = if bad { rssi - BAD_ASSIGNEE_PENALTY } else { rssi };
            self.add_predecessor(current_node, priority);
        } else {
            // The node may have desynced and rejoined deeper in the tree.
            self.remove_predecessor(current_node, true);
        }

        self.update_bad_assignee();
    }

    /// Update after missing `current_node`'s uplink slot.
    pub fn missed_message(&mut self, current_node: u8) {
        let idx = current_node as usize;
        let n = &mut self.neighbors[idx];
        match n.status {
            NeighborStatus::Strong | NeighborStatus::Weak => {
                if n.freq_timeout_ctr <= 1 {
                    n.reset();
                    self.my_topology.remove_node(current_node);
                    self.my_topology.weak_remove_node(current_node);
                } else {
                    n.freq_timeout_ctr -= 1;
                }
            }
            NeighborStatus::Unknown => {
                n.freq_timeout_ctr = n.freq_timeout_ctr.saturating_sub(UNKNOWN_NEIGHBOR_DECREMENT);
            }
        }
        self.remove_predecessor(current_node, false);
        self.update_bad_assignee();
    }

    fn update_link_quality(&mut self, node: u8, rssi: i16, hears_us: bool) {
        let strong_timeout = self.strong_timeout;
        let weak_timeout = self.weak_timeout;
        let min_strong = self.min_strong_rssi;
        let min_weak = self.min_weak_rssi;
        let use_weak = self.use_weak;

        let n = &mut self.neighbors[node as usize];
        match n.status {
            NeighborStatus::Strong => {
                n.update_ema(rssi);
                n.freq_timeout_ctr = strong_timeout;
            }
            NeighborStatus::Weak => {
                n.update_ema(rssi);
                if n.avg_rssi() >= min_strong || hears_us {
                    n.status = NeighborStatus::Strong;
                    n.freq_timeout_ctr = strong_timeout;
                    self.my_topology.add_node(node);
                } else {
                    n.freq_timeout_ctr = weak_timeout;
                }
            }
            NeighborStatus::Unknown => {
                if rssi >= min_strong || hears_us {
                    // Corroboration: a link the peer sees is a real link.
                    n.status = NeighborStatus::Strong;
                    n.avg_rssi = rssi * EMA_ONE;
                    n.freq_timeout_ctr = strong_timeout;
                    self.my_topology.add_node(node);
                    if use_weak {
                        self.my_topology.weak_add_node(node);
                    }
                } else if use_weak && rssi >= min_weak {
                    // Low-RSSI sightings accumulate before the link is
                    // believed.
                    n.freq_timeout_ctr += UNKNOWN_NEIGHBOR_INCREMENT;
                    if n.freq_timeout_ctr >= UNKNOWN_NEIGHBOR_THRESHOLD {
                        n.status = NeighborStatus::Weak;
                        n.avg_rssi = rssi * EMA_ONE;
                        n.freq_timeout_ctr = weak_timeout;
                        self.my_topology.weak_add_node(node);
                    }
                }
            }
        }
    }

    fn update_bad_assignee(&mut self) {
        // The master is never a bad assignee; everyone else is while they
        // have no predecessor or only a bad one.
        self.bad_assignee = if self.my_id == 0 {
            false
        } else if !self.has_predecessor() {
            true
        } else {
            self.best_predecessor_is_bad()
        };
    }

    fn add_predecessor(&mut self, node: u8, priority: i16) {
        self.remove_predecessor(node, true);
        self.predecessors.push((node, priority, self.strong_timeout));
        // Highest priority first.
        self.predecessors.sort_by(|a, b| b.1.cmp(&a.1));
    }

    fn remove_predecessor(&mut self, node: u8, force: bool) {
        if let Some(pos) = self.predecessors.iter().position(|p| p.0 == node) {
            if force {
                self.predecessors.remove(pos);
            } else {
                self.predecessors[pos].2 = self.predecessors[pos].2.saturating_sub(1);
                if self.predecessors[pos].2 == 0 {
                    self.predecessors.remove(pos);
                }
            }
        }
    }

}
