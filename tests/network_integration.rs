//! End-to-end scenarios over the simulated radio medium: a master and two
//! dynamic nodes in a line (0 - 1 - 2), driven phase by phase on a single
//! test thread. Transmitting phases always run before the listening ones,
//! exactly as the TDMA slot structure guarantees on air.

use std::sync::Arc;
use std::time::Duration;

use tdmh::adapters::{SimClock, SimMedium};
use tdmh::config::NetworkConfig;
use tdmh::crypto::keys::{DynamicKeyManager, KeyManager, MasterKeyManager};
use tdmh::dataphase::DataPhase;
use tdmh::mac::phase::{MacPhase, SyncOutcome, TimesyncPhase};
use tdmh::mac::MacContext;
use tdmh::schedule::{Action, ExplicitScheduleElement, ScheduleComputation, ScheduleElement};
use tdmh::stream::collection::StreamCollection;
use tdmh::stream::{Direction, Period, Redundancy, StreamParameters, StreamStatus};
use tdmh::timesync::{DynamicTimesync, MasterTimesync};
use tdmh::uplink::{DynamicUplink, MasterUplink, NetworkTopology};

const TILE_NS: i64 = 100_000_000;

fn make_node(id: u8, medium: &Arc<SimMedium>, authenticate: bool) -> MacContext {
    let mut cfg = NetworkConfig::base(id, 2, 8);
    cfg.authenticate_control_messages = authenticate;
    let cfg = Arc::new(cfg);
    let clock = SimClock::new();
    let radio = medium.radio(id, clock.clone());
    let stream_mgr = Arc::new(tdmh::StreamManager::new(cfg.clone(), id));
    let key_mgr: Box<dyn KeyManager> = if id == 0 {
        Box::new(MasterKeyManager::new(stream_mgr.clone(), 0))
    } else {
        Box::new(DynamicKeyManager::new(stream_mgr.clone(), id, false, 5))
    };
    MacContext::new(cfg, radio, clock, stream_mgr, key_mgr).expect("valid node config")
}

fn params() -> StreamParameters {
    StreamParameters::new(Redundancy::None, Period::P1, 16, Direction::Tx)
}

/// S1: beacon flooding joins a line of nodes at increasing hops, and the
/// FLOPSYNC loop locks on the second beacon.
#[test]
fn timesync_joins_line_topology() {
    let medium = SimMedium::new();
    medium.set_link(0, 1, -60);
    medium.set_link(1, 2, -60);

    let mut master = make_node(0, &medium, false);
    let mut node1 = make_node(1, &medium, false);
    let mut node2 = make_node(2, &medium, false);

    let mut ts0 = MasterTimesync::new();
    let mut ts1 = DynamicTimesync::new();
    let mut ts2 = DynamicTimesync::new();
    ts0.mac_start_hook(&mut master);

    // First beacon: both dynamic nodes scan, join, and pick their hop.
    assert_eq!(ts0.execute(&mut master, 0), SyncOutcome::InSync);
    assert_eq!(ts1.execute(&mut node1, 0), SyncOutcome::Resynced);
    assert_eq!(ts2.execute(&mut node2, 0), SyncOutcome::Resynced);
    assert_eq!(node1.hop(), 1);
    assert_eq!(node2.hop(), 2);
    assert!(node1.network_time.is_valid());
    assert!(node2.network_time.is_valid());
    // Synchronizing but not yet locked.
    assert!(!ts1.mac_can_operate());

    // Second beacon, one clock-sync period later: the controller closes
    // the loop and the MAC may operate.
    assert_eq!(ts0.execute(&mut master, 0), SyncOutcome::InSync);
    assert_eq!(ts1.execute(&mut node1, 0), SyncOutcome::InSync);
    assert_eq!(ts2.execute(&mut node2, 0), SyncOutcome::InSync);
    assert!(ts1.mac_can_operate());
    assert!(ts2.mac_can_operate());

    // Both nodes agree on the tile counter at their slotframe starts.
    let tile1 = node1.current_tile(ts1.slotframe_start());
    let tile2 = node2.current_tile(ts2.slotframe_start());
    assert_eq!(tile1, 100);
    assert_eq!(tile2, 100);
}

/// S3: a tampered authenticated beacon is treated as not received; after
/// `maxMissedTimesyncs` consecutive failures the node desynchronizes.
#[test]
fn tampered_beacons_force_desync() {
    let medium = SimMedium::new();
    medium.set_link(0, 1, -60);

    let mut master = make_node(0, &medium, true);
    let mut node1 = make_node(1, &medium, true);

    let mut ts0 = MasterTimesync::new();
    let mut ts1 = DynamicTimesync::new();
    ts0.mac_start_hook(&mut master);

    // Clean join.
    assert_eq!(ts0.execute(&mut master, 0), SyncOutcome::InSync);
    assert_eq!(ts1.execute(&mut node1, 0), SyncOutcome::Resynced);

    // Three consecutive beacons tampered in transit (a tag byte flips).
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        assert_eq!(ts0.execute(&mut master, 0), SyncOutcome::InSync);
        assert!(medium.tamper_next(1, 25));
        outcomes.push(ts1.execute(&mut node1, 0));
    }
    assert_eq!(
        outcomes,
        vec![SyncOutcome::InSync, SyncOutcome::InSync, SyncOutcome::Desynced]
    );
}

/// Uplink round-robin over the line: topology reaches the master within
/// two rounds, SMEs follow the parent pointers, and the scheduler turns
/// them into a conflict-free two-hop schedule.
#[test]
fn uplink_collects_topology_and_schedules_stream() {
    let medium = SimMedium::new();
    medium.set_link(0, 1, -60);
    medium.set_link(1, 2, -60);

    let mut master = make_node(0, &medium, false);
    let mut node1 = make_node(1, &medium, false);
    let mut node2 = make_node(2, &medium, false);

    // Nodes are synchronized out-of-band for this scenario.
    master.network_time.set(0, 0);
    node1.network_time.set(0, 0);
    node2.network_time.set(0, 0);
    node1.set_hop(1);
    node2.set_hop(2);

    let topology = Arc::new(NetworkTopology::new(8, false, false));
    let collection = Arc::new(StreamCollection::new());
    let mut uplink0 = MasterUplink::new(&master, topology.clone(), collection.clone());
    let mut uplink1 = DynamicUplink::new(&node1);
    let mut uplink2 = DynamicUplink::new(&node2);

    // Node 2 announces a server early; the LISTEN SME will ride the
    // uplink as soon as node 2 knows its predecessor.
    let server_fd = node2.stream_mgr.listen(1, params()).unwrap();

    let mut uplink_count: u64 = 0;
    let mut run_round = |master: &mut MacContext,
                         node1: &mut MacContext,
                         node2: &mut MacContext,
                         uplink0: &mut MasterUplink,
                         uplink1: &mut DynamicUplink,
                         uplink2: &mut DynamicUplink| {
        for _ in 0..8 {
            // Uplink slots open the odd tiles of the [D, U] superframe.
            let slot_start = (2 * uplink_count as i64 + 1) * TILE_NS;
            let current = (7 - (uplink_count % 8)) as u8;
            uplink_count += 1;
            // The transmitter of the slot runs first, listeners after.
            match current {
                1 => {
                    uplink1.execute(node1, slot_start);
                    uplink0.execute(master, slot_start);
                    uplink2.execute(node2, slot_start);
                }
                2 => {
                    uplink2.execute(node2, slot_start);
                    uplink0.execute(master, slot_start);
                    uplink1.execute(node1, slot_start);
                }
                _ => {
                    uplink0.execute(master, slot_start);
                    uplink1.execute(node1, slot_start);
                    uplink2.execute(node2, slot_start);
                }
            }
        }
    };

    run_round(&mut master, &mut node1, &mut node2, &mut uplink0, &mut uplink1, &mut uplink2);
    run_round(&mut master, &mut node1, &mut node2, &mut uplink0, &mut uplink1, &mut uplink2);

    // The connectivity graph at the master matches the physical line.
    let edges = topology.edges();
    assert!(edges.contains(&(0, 1)), "edges: {edges:?}");
    assert!(edges.contains(&(1, 2)), "edges: {edges:?}");

    // The LISTEN SME crossed the two hops: the server is known.
    let streams = collection.streams();
    assert!(
        streams.iter().any(|s| s.id.dst == 2 && s.id.is_server()),
        "streams: {streams:?}"
    );

    // The master now opens a stream toward node 2's server.
    let fd = master.stream_mgr.connect(2, 1, params()).unwrap();
    run_round(&mut master, &mut node1, &mut node2, &mut uplink0, &mut uplink1, &mut uplink2);
    assert!(collection
        .streams()
        .iter()
        .any(|s| s.id.src == 0 && s.id.dst == 2));

    // The scheduler routes it over the only path and avoids conflicts.
    let scheduler = Arc::new(ScheduleComputation::new(
        master.config.clone(),
        collection.clone(),
        topology.clone(),
        master.slots_per_tile,
        master.data_slots_in_downlink_tile,
        master.data_slots_in_uplink_tile,
    ));
    let handle = scheduler.start_thread();
    let mut scheduled = false;
    for _ in 0..500 {
        scheduler.begin_scheduling();
        if scheduler.schedule_id() > 0 {
            scheduled = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(scheduled, "scheduler produced no schedule");
    let schedule = scheduler.schedule();
    assert_eq!(schedule.elements.len(), 2, "schedule: {schedule:?}");
    let first = &schedule.elements[0];
    let second = &schedule.elements[1];
    assert_eq!((first.tx, first.rx), (0, 1));
    assert_eq!((second.tx, second.rx), (1, 2));
    // Sequential and conflict-free: node 1 is in both transmissions.
    assert!(first.offset < second.offset);

    scheduler.stop();
    handle.join().unwrap();

    let _ = (server_fd, fd);
}

/// S2 tail: a payload written on an established stream is delivered to
/// the peer's read in the matching data slot.
#[test]
fn data_phase_delivers_payload_single_hop() {
    let medium = SimMedium::new();
    medium.set_link(0, 1, -60);

    let mut master = make_node(0, &medium, false);
    let mut node1 = make_node(1, &medium, false);
    master.network_time.set(0, 0);
    node1.network_time.set(0, 0);
    node1.set_hop(1);

    // Node 1 opens a confirmed server.
    let server_fd = node1.stream_mgr.listen(1, params()).unwrap();
    let server_id = tdmh::stream::StreamId::new(1, 1, 0, 1);
    node1
        .stream_mgr
        .apply_info_elements(&[(server_id, tdmh::schedule::InfoType::ServerOpened)]);
    assert_eq!(
        node1.stream_mgr.get_info(server_fd).unwrap().status,
        StreamStatus::Listen
    );

    // The master connects; the schedule carries the stream to both ends.
    let fd = master.stream_mgr.connect(1, 1, params()).unwrap();
    let id = master.stream_mgr.get_info(fd).unwrap().id;
    let element = ScheduleElement::single_hop(id, params());
    master.stream_mgr.set_schedule(std::slice::from_ref(&element));
    master.stream_mgr.apply_schedule(std::slice::from_ref(&element));
    node1.stream_mgr.set_schedule(std::slice::from_ref(&element));
    let accepted_fd = node1.stream_mgr.accept(server_fd).unwrap();
    node1.stream_mgr.apply_schedule(std::slice::from_ref(&element));
    assert_eq!(
        master.stream_mgr.get_info(fd).unwrap().status,
        StreamStatus::Established
    );

    // One-slot explicit schedules: master sends, node 1 receives.
    let data0 = DataPhase::new(master.slots_per_tile);
    let data1 = DataPhase::new(node1.slots_per_tile);
    let send = ExplicitScheduleElement::new(Action::SendStream, element.stream_info());
    let recv = ExplicitScheduleElement::new(Action::RecvStream, element.stream_info());
    DataPhase::apply_schedule(&data0.schedule_handle(), vec![send], 1, 1, Default::default());
    DataPhase::apply_schedule(&data1.schedule_handle(), vec![recv], 1, 1, Default::default());
    let mut data0 = data0;
    let mut data1 = data1;

    assert_eq!(master.stream_mgr.write(fd, &[0xaa, 0xbb]).unwrap(), 2);

    let slot_start = 2 * TILE_NS;
    data0.execute(&mut master, slot_start);
    data1.execute(&mut node1, slot_start);

    let mut buf = [0u8; 16];
    let n = node1.stream_mgr.read(accepted_fd, &mut buf).unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf[..2], &[0xaa, 0xbb]);
}
