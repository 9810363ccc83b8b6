//! Master-node uplink phase.
//!
//! The master takes its round-robin turn like everyone else, then drains
//! what the round collected: topology elements into the connectivity
//! graph, stream SMEs into the stream collection, challenge SMEs into the
//! key manager.

use std::sync::Arc;

use log::trace;

use crate::mac::phase::MacPhase;
use crate::mac::MacContext;
use crate::stream::collection::StreamCollection;
use crate::stream::SmeType;

use super::graph::NetworkTopology;
use super::UplinkBase;

pub struct MasterUplink {
    base: UplinkBase,
    topology: Arc<NetworkTopology>,
    collection: Arc<StreamCollection>,
}

impl MasterUplink {
    pub fn new(
        ctx: &MacContext,
        topology: Arc<NetworkTopology>,
        collection: Arc<StreamCollection>,
    ) -> Self {
        Self {
            base: UplinkBase::new(ctx),
            topology,
            collection,
        }
    }
}

impl MacPhase for MasterUplink {
    fn execute(&mut self, ctx: &mut MacContext, slot_start: i64) {
        let current_node = self.base.current_node();
        if current_node == ctx.network_id() {
            // Hop 1 so receivers pass the [1, maxHops] check; the master
            // forwards nothing, it is the collection point.
            self.base.send_uplink(ctx, slot_start, 1, ctx.network_id(), false);
            // The master's own topology reaches the graph like any other.
            let mine = self.base.neighbors.my_topology_element().clone();
            self.base.topology_queue.enqueue(0, mine);
        } else {
            self.base.receive_uplink(ctx, slot_start, current_node);
        }

        // Drain the round's harvest.
        self.topology.handle_topologies(&mut self.base.topology_queue);
        ctx.stream_mgr.dequeue_smes(&mut self.base.sme_queue);
        let mut stream_smes = crate::util::UpdatableQueue::new();
        while let Some((key, sme)) = self.base.sme_queue.dequeue_pair() {
            if sme.ty() == SmeType::Challenge {
                ctx.key_manager().enqueue_challenge(sme);
            } else {
                stream_smes.enqueue(key, sme);
            }
        }
        self.collection.receive_smes(&mut stream_smes);
        trace!("[U] topology edges: {:?}", self.topology.edges());
    }

    fn advance(&mut self, _ctx: &mut MacContext, _slot_start: i64) {
        let _ = self.base.current_node();
    }

    // The master never resyncs or desyncs.
}
