//! Centralized schedule computation (master only).
//!
//! The scheduler thread sleeps on a condition variable and wakes when the
//! stream collection or the connectivity graph changed, or a resend was
//! requested. Each round works exclusively on snapshots: established
//! streams are rescheduled from scratch only when the graph changed or a
//! stream disappeared; newly accepted streams (longest period first) are
//! routed and appended to the running schedule.
//!
//! Slot assignment walks candidate offsets in order, skipping reserved
//! control slots and rejecting unicity and interference conflicts; the
//! schedule length grows to the lcm of the period mix.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, info};

use crate::config::NetworkConfig;
use crate::stream::collection::{MasterStreamStatus, StreamCollection};
use crate::uplink::graph::Link;
use crate::uplink::{NetworkGraph, NetworkTopology};
use crate::util::lcm;

use super::router::Router;
use super::ScheduleElement;

/// A complete schedule: the routed transmissions, a strictly monotonic id,
/// and the length in tiles (always a multiple of the superframe size).
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub elements: Vec<ScheduleElement>,
    pub id: u32,
    pub tiles: u32,
}

struct SchedulerState {
    schedule: Schedule,
    /// A schedule exists that the distribution has not yet applied; no
    /// new computation may start until it has, or activation alignment
    /// would break.
    schedule_not_applied: bool,
    stop: bool,
}

pub struct ScheduleComputation {
    config: Arc<NetworkConfig>,
    collection: Arc<StreamCollection>,
    topology: Arc<NetworkTopology>,
    slots_per_tile: usize,
    /// Control slots at the head of a downlink/uplink tile.
    downlink_ctrl_slots: usize,
    uplink_ctrl_slots: usize,
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

impl ScheduleComputation {
    pub fn new(
        config: Arc<NetworkConfig>,
        collection: Arc<StreamCollection>,
        topology: Arc<NetworkTopology>,
        slots_per_tile: usize,
        data_slots_in_downlink_tile: usize,
        data_slots_in_uplink_tile: usize,
    ) -> Self {
        Self {
            config: config.clone(),
            collection,
            topology,
            slots_per_tile,
            downlink_ctrl_slots: slots_per_tile - data_slots_in_downlink_tile,
            uplink_ctrl_slots: slots_per_tile - data_slots_in_uplink_tile,
            state: Mutex::new(SchedulerState {
                schedule: Schedule {
                    elements: Vec::new(),
                    id: 0,
                    tiles: config.control_superframe.size() as u32,
                },
                schedule_not_applied: false,
                stop: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Spawn the scheduler thread.
    pub fn start_thread(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let this = self.clone();
        thread::Builder::new()
            .name("tdmh-scheduler".into())
            .spawn(move || this.run())
            .expect("scheduler thread")
    }

    /// Wake the scheduler; called from the downlink phase once per
    /// control superframe.
    pub fn begin_scheduling(&self) {
        self.wakeup.notify_one();
    }

    pub fn stop(&self) {
        self.state.lock().unwrap().stop = true;
        self.wakeup.notify_all();
    }

    /// Latest schedule, for the distribution phase.
    pub fn schedule(&self) -> Schedule {
        self.state.lock().unwrap().schedule.clone()
    }

    pub fn schedule_id(&self) -> u32 {
        self.state.lock().unwrap().schedule.id
    }

    /// The distribution applied the current schedule; computation may
    /// proceed again.
    pub fn schedule_applied(&self) {
        self.state.lock().unwrap().schedule_not_applied = false;
        self.wakeup.notify_one();
    }

    fn run(&self) {
        info!("[SC] scheduler thread running");
        let mut graph = NetworkGraph::new(self.config.max_nodes);
        let mut weak_graph = NetworkGraph::new(self.config.max_nodes);
        loop {
            let mut force_resend = false;
            {
                let mut st = self.state.lock().unwrap();
                loop {
                    if st.stop {
                        return;
                    }
                    // A computed schedule must be applied before the next
                    // computation, or getActivationTile cannot align it.
                    if !st.schedule_not_applied {
                        if self.topology.was_modified() {
                            break;
                        }
                        let op = self.collection.take_operation();
                        if op.resend && !op.reschedule {
                            force_resend = true;
                            break;
                        }
                        if op.reschedule {
                            if op.resend {
                                force_resend = true;
                            }
                            break;
                        }
                    }
                    st = self.wakeup.wait(st).unwrap();
                }
            }

            if force_resend && !self.topology.was_modified() && !self.collection.was_modified() {
                // Resend only: republish the same elements under a fresh
                // id so the distribution floods them again.
                let mut st = self.state.lock().unwrap();
                st.schedule.id += 1;
                st.schedule_not_applied = true;
                info!("[SC] resending schedule as id {}", st.schedule.id);
                continue;
            }

            let snapshot = self.collection.snapshot();
            let graph_changed = self.topology.update_scheduler_graph(&mut graph, &mut weak_graph);

            // Garbage-collect subgraphs the master cannot reach.
            if graph.has_unreachable_nodes() && graph.remove_unreachable_nodes() {
                let wrote_back = self.topology.write_back_graph(&graph);
                debug!("[SC] unreachable nodes removed, wrote back: {wrote_back}");
            }

            let current = self.schedule();
            let mut schedule_changed = false;
            let mut new_schedule;
            if graph_changed || snapshot.was_removed() {
                // Reschedule the established streams from scratch.
                let established = snapshot.streams_with_status(MasterStreamStatus::Established);
                debug!("[SC] rescheduling {} established streams", established.len());
                new_schedule = Schedule {
                    elements: Vec::new(),
                    id: current.id + 1,
                    tiles: self.config.control_superframe.size() as u32,
                };
                self.route_and_schedule(&graph, &weak_graph, established, &mut new_schedule);
                schedule_changed = true;
            } else {
                new_schedule = Schedule {
                    elements: current.elements.clone(),
                    id: current.id + 1,
                    tiles: current.tiles,
                };
            }
            if snapshot.was_added() {
                // Longest period first: the hardest streams to place go
                // while the schedule is emptiest.
                let mut accepted = snapshot.streams_with_status(MasterStreamStatus::Accepted);
                accepted.sort_by(|a, b| b.params.period.tiles().cmp(&a.params.period.tiles()));
                debug!("[SC] scheduling {} accepted streams", accepted.len());
                self.route_and_schedule(&graph, &weak_graph, accepted, &mut new_schedule);
                schedule_changed = true;
            }

            if schedule_changed {
                let changes = snapshot.stream_changes(&new_schedule.elements);
                self.collection.apply_changes(&changes);
                let used: BTreeSet<Link> = new_schedule
                    .elements
                    .iter()
                    .map(|e| order_link(e.tx, e.rx))
                    .collect();
                info!(
                    "[SC] schedule {} ready: {} transmissions over {} tiles",
                    new_schedule.id,
                    new_schedule.elements.len(),
                    new_schedule.tiles
                );
                {
                    let mut st = self.state.lock().unwrap();
                    st.schedule = new_schedule;
                    st.schedule_not_applied = true;
                }
                self.topology.used_links_changed(used);
            } else if force_resend {
                let mut st = self.state.lock().unwrap();
                st.schedule.id += 1;
                st.schedule_not_applied = true;
                self.topology.used_links_unchanged();
            } else {
                self.topology.used_links_unchanged();
            }
        }
    }

    /// Route the given streams and place their transmissions, appending
    /// to `schedule`. Streams that cannot be scheduled are simply left
    /// out; the snapshot comparison turns that into REJECT elements.
    fn route_and_schedule(
        &self,
        graph: &NetworkGraph,
        weak_graph: &NetworkGraph,
        streams: Vec<crate::stream::collection::MasterStreamInfo>,
        schedule: &mut Schedule,
    ) {
        if streams.is_empty() {
            return;
        }
        let router = Router::new(graph, self.config.max_hops as usize);
        let routed = router.run(&streams);
        for block in routed {
            self.schedule_block(graph, weak_graph, &block, schedule);
        }
    }

    /// Place one transmission block (a path instance), all or nothing.
    fn schedule_block(
        &self,
        graph: &NetworkGraph,
        weak_graph: &NetworkGraph,
        block: &[ScheduleElement],
        schedule: &mut Schedule,
    ) {
        let saved_len = schedule.elements.len();
        let saved_tiles = schedule.tiles;
        let mut last_offset: u32 = 0;

        for transmission in block {
            // The link must still exist in the snapshot graph.
            if !graph.has_edge(transmission.tx, transmission.rx) {
                debug!(
                    "[SC] {}-{} not connected, dropping block",
                    transmission.tx, transmission.rx
                );
                schedule.elements.truncate(saved_len);
                schedule.tiles = saved_tiles;
                return;
            }
            let max_offset = transmission.period_tiles() * self.slots_per_tile as u32 - 1;
            let mut placed = false;
            for offset in last_offset..max_offset {
                if !self.is_data_slot(offset, transmission.period_tiles()) {
                    continue;
                }
                if self.conflicts(graph, weak_graph, &schedule.elements, transmission, offset) {
                    continue;
                }
                let mut scheduled = *transmission;
                scheduled.offset = offset;
                schedule.elements.push(scheduled);
                schedule.tiles = lcm(schedule.tiles, transmission.period_tiles());
                // Sequentiality: the next hop of this stream must come
                // strictly later.
                last_offset = offset + 1;
                placed = true;
                break;
            }
            if !placed {
                debug!(
                    "[SC] no free slot for {}->{}, dropping block",
                    transmission.tx, transmission.rx
                );
                schedule.elements.truncate(saved_len);
                schedule.tiles = saved_tiles;
                return;
            }
        }
    }

    /// Reserved control slots never carry data. A periodic transmission
    /// revisits several tile positions of the superframe, so every
    /// position in the repetition cycle is checked.
    fn is_data_slot(&self, offset: u32, period_tiles: u32) -> bool {
        let superframe = self.config.control_superframe;
        let sf_size = superframe.size() as u32;
        let base_tile = offset / self.slots_per_tile as u32;
        let slot = offset as usize % self.slots_per_tile;
        let cycle = sf_size / gcd(period_tiles, sf_size);
        for k in 0..cycle {
            let tile_pos = ((base_tile + k * period_tiles) % sf_size) as usize;
            let reserved = if superframe.is_control_downlink(tile_pos) {
                self.downlink_ctrl_slots
            } else {
                self.uplink_ctrl_slots
            };
            if slot < reserved {
                return false;
            }
        }
        true
    }

    fn conflicts(
        &self,
        graph: &NetworkGraph,
        weak_graph: &NetworkGraph,
        scheduled: &[ScheduleElement],
        transmission: &ScheduleElement,
        offset: u32,
    ) -> bool {
        for other in scheduled {
            // Cheap necessary condition before the lcm walk.
            if offset % self.slots_per_tile as u32
                != other.offset % self.slots_per_tile as u32
            {
                continue;
            }
            if !slots_overlap(
                offset,
                transmission.period_tiles(),
                other.offset,
                other.period_tiles(),
                self.slots_per_tile as u32,
            ) {
                continue;
            }
            if !self.config.channel_spatial_reuse {
                // Without spatial reuse any two transmissions in the same
                // slot conflict.
                return true;
            }
            if unicity_conflict(transmission, other) {
                return true;
            }
            // Interference: neighbors of the transmitter must not be
            // receiving and neighbors of the receiver must not be
            // transmitting. With weak topologies the weak graph is the
            // interference map.
            let interference_map = if self.config.use_weak_topologies {
                weak_graph
            } else {
                graph
            };
            if interference_map.has_edge(transmission.tx, other.rx)
                || interference_map.has_edge(transmission.rx, other.tx)
            {
                return true;
            }
        }
        false
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn order_link(a: u8, b: u8) -> Link {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Do two periodic transmissions ever land on the same slot?
fn slots_overlap(
    offset_a: u32,
    period_a_tiles: u32,
    offset_b: u32,
    period_b_tiles: u32,
    slots_per_tile: u32,
) -> bool {
    let period_a = period_a_tiles * slots_per_tile;
    let period_b = period_b_tiles * slots_per_tile;
    let horizon = lcm(period_a_tiles, period_b_tiles) * slots_per_tile;
    let mut slot_a = offset_a;
    while slot_a < horizon {
        let mut slot_b = offset_b;
        while slot_b < horizon {
            if slot_a == slot_b {
                return true;
            }
            slot_b += period_b;
        }
        slot_a += period_a;
    }
    false
}

fn unicity_conflict(a: &ScheduleElement, b: &ScheduleElement) -> bool {
    a.tx == b.tx || a.tx == b.rx || a.rx == b.tx || a.rx == b.rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::collection::MasterStreamInfo;
    use crate::stream::{Direction, Period, Redundancy, StreamId, StreamParameters};

    fn scheduler(spatial_reuse: bool) -> ScheduleComputation {
        let mut config = NetworkConfig::base(0, 6, 16);
        config.channel_spatial_reuse = spatial_reuse;
        let config = Arc::new(config);
        let collection = Arc::new(StreamCollection::new());
        let topology = Arc::new(NetworkTopology::new(16, false, spatial_reuse));
        // 10 slots per tile, 2 control slots in downlink tiles, 1 in
        // uplink tiles.
        ScheduleComputation::new(config, collection, topology, 10, 8, 9)
    }

    fn stream(src: u8, dst: u8, period: Period) -> MasterStreamInfo {
        MasterStreamInfo {
            id: StreamId::new(src, dst, 0, 1),
            params: StreamParameters::new(Redundancy::None, period, 16, Direction::Tx),
            status: MasterStreamStatus::Accepted,
        }
    }

    fn line_graph() -> NetworkGraph {
        let mut g = NetworkGraph::new(16);
        g.add_edge(0, 1);
        g.add_edge(1, 2);
        g.add_edge(3, 2);
        g
    }

    #[test]
    fn control_slots_are_reserved() {
        let sc = scheduler(false);
        // Downlink tile 0: slots 0-1 reserved.
        assert!(!sc.is_data_slot(0, 2));
        assert!(!sc.is_data_slot(1, 2));
        assert!(sc.is_data_slot(2, 2));
        // Uplink tile 1: slot 10 reserved.
        assert!(!sc.is_data_slot(10, 2));
        assert!(sc.is_data_slot(11, 2));
        // A period-1 stream revisits every tile: slot 1 is free in uplink
        // tiles but reserved in downlink tiles, so it is not usable.
        assert!(!sc.is_data_slot(11, 1));
        assert!(sc.is_data_slot(12, 1));
    }

    #[test]
    fn overlap_arithmetic() {
        // Same offset, same period: overlap.
        assert!(slots_overlap(5, 1, 5, 1, 10));
        // Different offsets, same period: no overlap.
        assert!(!slots_overlap(5, 1, 6, 1, 10));
        // Period 1 at offset 5 hits period 2 at offset 15.
        assert!(slots_overlap(5, 1, 15, 2, 10));
    }

    #[test]
    fn blocks_get_sequential_conflict_free_offsets() {
        let sc = scheduler(false);
        let graph = line_graph();
        let weak = NetworkGraph::new(16);
        let mut schedule = Schedule {
            elements: Vec::new(),
            id: 1,
            tiles: 2,
        };
        sc.route_and_schedule(
            &graph,
            &weak,
            vec![stream(0, 2, Period::P1)],
            &mut schedule,
        );
        assert_eq!(schedule.elements.len(), 2);
        // Transmissions of one stream are strictly ordered.
        assert!(schedule.elements[0].offset < schedule.elements[1].offset);
        // Neither lands in a control slot.
        for e in &schedule.elements {
            assert!(sc.is_data_slot(e.offset, e.period_tiles()));
        }
    }

    #[test]
    fn unicity_conflict_on_shared_node() {
        // Streams 1->2 and 3->2 share node 2: without spatial reuse the
        // offsets must differ everywhere within slotsPerTile.
        let sc = scheduler(false);
        let graph = line_graph();
        let weak = NetworkGraph::new(16);
        let mut schedule = Schedule {
            elements: Vec::new(),
            id: 1,
            tiles: 2,
        };
        sc.route_and_schedule(
            &graph,
            &weak,
            vec![stream(1, 2, Period::P1), stream(3, 2, Period::P1)],
            &mut schedule,
        );
        assert_eq!(schedule.elements.len(), 2);
        let a = &schedule.elements[0];
        let b = &schedule.elements[1];
        assert_ne!(a.offset % 10, b.offset % 10);
        assert!(!slots_overlap(a.offset, 1, b.offset, 1, 10));
    }

    #[test]
    fn schedule_length_grows_to_lcm() {
        let sc = scheduler(false);
        let graph = line_graph();
        let weak = NetworkGraph::new(16);
        let mut schedule = Schedule {
            elements: Vec::new(),
            id: 1,
            tiles: 2,
        };
        sc.route_and_schedule(
            &graph,
            &weak,
            vec![stream(0, 1, Period::P5), stream(1, 2, Period::P2)],
            &mut schedule,
        );
        assert_eq!(schedule.tiles, 10);
    }

    #[test]
    fn infeasible_block_rolls_back() {
        let sc = scheduler(false);
        // Graph without the 1-2 edge: multi-hop 0->2 cannot route the
        // second leg.
        let mut graph = NetworkGraph::new(16);
        graph.add_edge(0, 1);
        let weak = NetworkGraph::new(16);
        let mut schedule = Schedule {
            elements: Vec::new(),
            id: 1,
            tiles: 2,
        };
        sc.route_and_schedule(
            &graph,
            &weak,
            vec![stream(0, 2, Period::P1)],
            &mut schedule,
        );
        assert!(schedule.elements.is_empty());
        assert_eq!(schedule.tiles, 2);
    }

    #[test]
    fn spatial_reuse_allows_disjoint_transmissions() {
        let sc = scheduler(true);
        // Two far-apart links: 0-1 and 4-5, no interference edges.
        let mut graph = NetworkGraph::new(16);
        graph.add_edge(0, 1);
        graph.add_edge(4, 5);
        let weak = NetworkGraph::new(16);
        let mut schedule = Schedule {
            elements: Vec::new(),
            id: 1,
            tiles: 2,
        };
        sc.route_and_schedule(
            &graph,
            &weak,
            vec![stream(0, 1, Period::P1), stream(4, 5, Period::P1)],
            &mut schedule,
        );
        assert_eq!(schedule.elements.len(), 2);
        // Both can share the first data slot.
        assert_eq!(schedule.elements[0].offset, schedule.elements[1].offset);
    }
}
