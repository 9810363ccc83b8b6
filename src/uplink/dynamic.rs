//! Dynamic-node uplink phase.
//!
//! On this node's turn: send the neighbor bitmap toward the best
//! predecessor, with as many forwarded topologies and SMEs as fit. On any
//! other turn: listen and collect.

use log::debug;

use crate::mac::phase::MacPhase;
use crate::mac::MacContext;

use super::UplinkBase;

pub struct DynamicUplink {
    base: UplinkBase,
}

impl DynamicUplink {
    pub fn new(ctx: &MacContext) -> Self {
        Self {
            base: UplinkBase::new(ctx),
        }
    }

    fn send_my_uplink(&mut self, ctx: &mut MacContext, slot_start: i64) {
        let hop = ctx.hop();
        if self.base.neighbors.has_predecessor() {
            let assignee = self
                .base
                .neighbors
                .best_predecessor()
                .expect("predecessor checked");
            if self.base.neighbors.best_predecessor_is_bad() {
                debug!("[U] chosen assignee is bad");
            }
            self.base.send_uplink(ctx, slot_start, hop, assignee, true);
        } else {
            // No predecessor known: send only the neighbor bitmap with
            // this node as assignee, to speed up topology collection.
            let my_id = ctx.network_id();
            self.base.send_uplink(ctx, slot_start, hop, my_id, false);
            debug!("[U] no predecessor");
        }
    }
}

impl MacPhase for DynamicUplink {
    fn execute(&mut self, ctx: &mut MacContext, slot_start: i64) {
        let current_node = self.base.current_node();
        if current_node == ctx.network_id() {
            self.send_my_uplink(ctx, slot_start);
        } else {
            self.base.receive_uplink(ctx, slot_start, current_node);
        }
    }

    fn advance(&mut self, _ctx: &mut MacContext, _slot_start: i64) {
        let _ = self.base.current_node();
    }

    fn resync(&mut self, ctx: &mut MacContext) {
        let network_now = ctx.network_time.to_network(ctx.clock.now());
        self.base.align_to_network_time(ctx, network_now);
        self.base.neighbors.clear(ctx.hop());
        self.base.topology_queue.clear();
        self.base.sme_queue.clear();
    }

    fn desync(&mut self, ctx: &mut MacContext) {
        self.base.neighbors.clear(ctx.hop());
        self.base.topology_queue.clear();
        self.base.sme_queue.clear();
    }
}
