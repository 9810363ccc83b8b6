//! The slotframe engine.
//!
//! One cooperative loop, one deadline at a time: each tile opens with a
//! downlink slot (timesync at tile 0 of a clock-sync period, schedule
//! distribution otherwise) or an uplink slot, continues with the tile's
//! data slots, and ends with the tile slack and the stream manager's
//! periodic tick. Phases sleep internally until their deadlines; a phase
//! returning after its deadline is an overrun, logged and survived.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};

use crate::config::NetworkConfig;
use crate::crypto::keys::{DynamicKeyManager, KeyManager, MasterKeyManager};
use crate::dataphase::DataPhase;
use crate::error::ConfigError;
use crate::ports::{MacClock, Radio};
use crate::schedule::ScheduleComputation;
use crate::stream::collection::StreamCollection;
use crate::stream::StreamManager;
use crate::uplink::{DynamicUplink, MasterUplink, NetworkTopology};

use super::phase::{MacPhase, SyncOutcome, TimesyncPhase};
use super::{MacContext, RadioStats};

pub struct MacEngine {
    ctx: MacContext,
    timesync: Box<dyn TimesyncPhase>,
    uplink: Box<dyn MacPhase>,
    downlink: Box<dyn MacPhase>,
    data: DataPhase,
    scheduler: Option<Arc<ScheduleComputation>>,
    scheduler_thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    /// True while the node is synchronized enough to operate; mirrors
    /// timesync state for application-side polling.
    ready: Arc<AtomicBool>,
}

impl MacEngine {
    /// Assemble a node: context, role-specific phases, and (on the
    /// master) the scheduler and its collaborators.
    pub fn new(
        config: Arc<NetworkConfig>,
        radio: Arc<dyn Radio>,
        clock: Arc<dyn MacClock>,
        stream_mgr: Arc<StreamManager>,
    ) -> Result<Self, ConfigError> {
        let is_master = config.is_master();
        let key_mgr: Box<dyn KeyManager> = if is_master {
            Box::new(MasterKeyManager::new(
                stream_mgr.clone(),
                config.rekeying_period_timesyncs,
            ))
        } else {
            Box::new(DynamicKeyManager::new(
                stream_mgr.clone(),
                config.network_id,
                config.do_master_challenge_authentication,
                config.master_challenge_timeout,
            ))
        };
        let ctx = MacContext::new(config.clone(), radio, clock, stream_mgr, key_mgr)?;
        let data = DataPhase::new(ctx.slots_per_tile);

        let (timesync, uplink, downlink, scheduler): (
            Box<dyn TimesyncPhase>,
            Box<dyn MacPhase>,
            Box<dyn MacPhase>,
            Option<Arc<ScheduleComputation>>,
        ) = if is_master {
            let topology = Arc::new(NetworkTopology::new(
                config.max_nodes,
                config.use_weak_topologies,
                config.channel_spatial_reuse,
            ));
            let collection = Arc::new(StreamCollection::new());
            let scheduler = Arc::new(ScheduleComputation::new(
                config.clone(),
                collection.clone(),
                topology.clone(),
                ctx.slots_per_tile,
                ctx.data_slots_in_downlink_tile,
                ctx.data_slots_in_uplink_tile,
            ));
            (
                Box::new(crate::timesync::MasterTimesync::new()),
                Box::new(MasterUplink::new(&ctx, topology, collection.clone())),
                Box::new(crate::downlink::MasterScheduleDownlink::new(
                    &ctx,
                    scheduler.clone(),
                    collection,
                    data.schedule_handle(),
                )),
                Some(scheduler),
            )
        } else {
            (
                Box::new(crate::timesync::DynamicTimesync::new()),
                Box::new(DynamicUplink::new(&ctx)),
                Box::new(crate::downlink::DynamicScheduleDownlink::new(
                    &ctx,
                    data.schedule_handle(),
                )),
                None,
            )
        };

        Ok(Self {
            ctx,
            timesync,
            uplink,
            downlink,
            data,
            scheduler,
            scheduler_thread: None,
            running: Arc::new(AtomicBool::new(false)),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle to stop the slotframe loop from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// True once the node is synchronized and the MAC is operating.
    pub fn ready_handle(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    pub fn stats(&self) -> RadioStats {
        self.ctx.stats()
    }

    pub fn diagnostics(&self) -> crate::diagnostics::DiagnosticsSnapshot {
        crate::diagnostics::DiagnosticsSnapshot::new(
            self.ctx.network_id(),
            self.ctx.stats(),
            self.ctx.stream_mgr.pending_smes(),
            self.ctx.stream_mgr.is_master_trusted(),
        )
    }

    /// Run the slotframe loop until the stop handle clears. Blocks the
    /// calling thread, which becomes the MAC thread.
    pub fn run(&mut self) {
        info!("[M] MAC starting, node {}", self.ctx.network_id());
        self.ctx.radio.turn_on();
        self.timesync.mac_start_hook(&mut self.ctx);
        if let Some(scheduler) = &self.scheduler {
            self.scheduler_thread = Some(scheduler.start_thread());
        }

        let superframe = self.ctx.config.control_superframe;
        let superframes_per_sync = self.ctx.config.superframes_per_clock_sync();
        let downlink_slots = self.ctx.slots_per_tile - self.ctx.data_slots_in_downlink_tile;
        let uplink_slots = self.ctx.slots_per_tile - self.ctx.data_slots_in_uplink_tile;

        let mut deadline: i64 = 0;
        let mut tile_counter: usize = 0;
        let mut superframe_counter: i64 = 0;

        self.running.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            let can_operate = self.timesync.mac_can_operate();
            self.ready.store(can_operate, Ordering::Release);

            let data_slots = if superframe.is_control_downlink(tile_counter) {
                if tile_counter == 0 && superframe_counter == 0 {
                    let outcome = self.timesync.execute(&mut self.ctx, deadline);
                    deadline = self.timesync.slotframe_start();
                    self.dispatch_sync_outcome(outcome);
                } else {
                    if let Some(scheduler) = &self.scheduler {
                        scheduler.begin_scheduling();
                    }
                    if can_operate {
                        self.downlink.execute(&mut self.ctx, deadline);
                    } else {
                        self.downlink.advance(&mut self.ctx, deadline);
                    }
                }
                deadline += self.ctx.downlink_slot_duration;
                self.data.advance_by(downlink_slots);
                self.ctx.data_slots_in_downlink_tile
            } else {
                if can_operate {
                    self.uplink.execute(&mut self.ctx, deadline);
                } else {
                    self.uplink.advance(&mut self.ctx, deadline);
                }
                deadline += self.ctx.uplink_slot_duration;
                self.data.advance_by(uplink_slots);
                self.ctx.data_slots_in_uplink_tile
            };

            for _ in 0..data_slots {
                if can_operate {
                    self.data.execute(&mut self.ctx, deadline);
                } else {
                    self.data.advance(&mut self.ctx, deadline);
                }
                deadline += self.ctx.data_slot_duration;
            }

            self.ctx.stream_mgr.periodic_update();
            self.ctx.stream_mgr.process_wakeups(self.ctx.clock.now());

            deadline += self.ctx.tile_slack;
            let now = self.ctx.clock.now();
            if now > deadline {
                // Overrun: log it and resync the deadline chain forward to
                // the next tile boundary instead of accumulating lag.
                let tile = self.ctx.config.tile_duration_ns;
                let behind = now - deadline;
                let skip = (behind + tile - 1) / tile;
                warn!("[M] tile overrun by {behind} ns, skipping {skip} tiles");
                deadline += skip * tile;
            }

            tile_counter += 1;
            if tile_counter >= superframe.size() {
                tile_counter = 0;
                superframe_counter += 1;
                if superframe_counter >= superframes_per_sync {
                    superframe_counter = 0;
                }
            }
        }

        self.ctx.radio.turn_off();
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }
        if let Some(handle) = self.scheduler_thread.take() {
            let _ = handle.join();
        }
        info!("[M] MAC stopped");
    }

    /// Fan the timesync outcome out to the other phases; no phase holds a
    /// reference to another.
    fn dispatch_sync_outcome(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::InSync | SyncOutcome::StillDesynced => {}
            SyncOutcome::Resynced => {
                self.uplink.resync(&mut self.ctx);
                self.downlink.resync(&mut self.ctx);
                self.data.resync(&mut self.ctx);
                self.ctx.stream_mgr.resync();
            }
            SyncOutcome::Desynced => {
                self.ctx.key_manager().desync();
                self.uplink.desync(&mut self.ctx);
                self.downlink.desync(&mut self.ctx);
                self.data.desync(&mut self.ctx);
                self.ctx.stream_mgr.desync();
            }
        }
    }
}
