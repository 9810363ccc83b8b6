//! Master-side stream database.
//!
//! The collection tracks every stream and server in the network as seen
//! through received SMEs. The scheduler thread never touches it directly:
//! it takes a [`StreamSnapshot`], computes, and pushes back a set of
//! changes, so the MAC thread and the scheduler only meet at two short
//! critical sections.

use std::collections::BTreeMap;
use std::sync::Mutex;

use log::{debug, info};

use crate::schedule::{InfoType, ScheduleElement};
use crate::util::UpdatableQueue;

use super::{SmeType, StreamId, StreamManagementElement, StreamParameters};

/// Master-side status of a stream or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStreamStatus {
    /// Stream admitted, waiting to be scheduled.
    Accepted,
    /// Stream present in the active (or outgoing) schedule.
    Established,
    /// Server open on the destination node.
    Listen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterStreamInfo {
    pub id: StreamId,
    pub params: StreamParameters,
    pub status: MasterStreamStatus,
}

/// Change computed by the scheduler for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChange {
    /// ACCEPTED stream present in the new schedule.
    Establish,
    /// ACCEPTED stream that could not be scheduled.
    Reject,
    /// ESTABLISHED stream missing from the new schedule.
    Close,
}

/// Pending operations requested through SMEs, polled by the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOperation {
    pub reschedule: bool,
    pub resend: bool,
}

struct CollectionState {
    collection: BTreeMap<StreamId, MasterStreamInfo>,
    info_queue: UpdatableQueue<StreamId, (StreamId, InfoType)>,
    modified: bool,
    removed: bool,
    added: bool,
    resend_requested: bool,
}

pub struct StreamCollection {
    state: Mutex<CollectionState>,
}

impl Default for StreamCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCollection {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CollectionState {
                collection: BTreeMap::new(),
                info_queue: UpdatableQueue::new(),
                modified: false,
                removed: false,
                added: false,
                resend_requested: false,
            }),
        }
    }

    /// Consume SMEs collected by the master uplink. Challenge SMEs must be
    /// routed to the key manager before calling this.
    pub fn receive_smes(
        &self,
        smes: &mut UpdatableQueue<super::SmeKey, StreamManagementElement>,
    ) {
        let mut st = self.state.lock().unwrap();
        while let Some(sme) = smes.dequeue() {
            let id = sme.stream_id();
            match sme.ty() {
                SmeType::ResendSchedule => {
                    debug!("[SC] resend requested by node {}", id.src);
                    st.resend_requested = true;
                }
                SmeType::Challenge => {
                    // Not ours; dropped if it gets here.
                }
                _ if id.is_server() => Self::handle_server_sme(&mut st, &sme),
                _ => Self::handle_stream_sme(&mut st, &sme),
            }
        }
    }

    fn handle_stream_sme(st: &mut CollectionState, sme: &StreamManagementElement) {
        let id = sme.stream_id();
        match (st.collection.get(&id).copied(), sme.ty()) {
            (None, SmeType::Connect) => {
                // Admission requires an open server on (dst, dstPort).
                let server_id = id.server_id();
                match st.collection.get(&server_id) {
                    Some(server) if server.status == MasterStreamStatus::Listen => {
                        let params = negotiate_parameters(server.params, sme.params());
                        st.collection.insert(
                            id,
                            MasterStreamInfo {
                                id,
                                params,
                                status: MasterStreamStatus::Accepted,
                            },
                        );
                        st.modified = true;
                        st.added = true;
                        info!("[SC] stream {id} accepted");
                    }
                    _ => {
                        debug!("[SC] stream {id} refused, no server");
                        st.info_queue.enqueue(id, (id, InfoType::StreamReject));
                    }
                }
            }
            (Some(_), SmeType::Closed) => {
                st.collection.remove(&id);
                st.modified = true;
                st.removed = true;
                info!("[SC] stream {id} closed");
            }
            (Some(_), SmeType::Connect) | (None, SmeType::Closed) => {
                // CONNECT retransmission or CLOSED for an unknown stream.
            }
            _ => {}
        }
    }

    fn handle_server_sme(st: &mut CollectionState, sme: &StreamManagementElement) {
        let id = sme.stream_id();
        match (st.collection.get(&id).copied(), sme.ty()) {
            (None, SmeType::Listen) => {
                st.collection.insert(
                    id,
                    MasterStreamInfo {
                        id,
                        params: sme.params(),
                        status: MasterStreamStatus::Listen,
                    },
                );
                st.info_queue.enqueue(id, (id, InfoType::ServerOpened));
                info!("[SC] server {id} opened");
            }
            (Some(_), SmeType::Listen) => {
                // LISTEN retransmission: repeat the confirmation, the
                // previous info element may have been lost.
                st.info_queue.enqueue(id, (id, InfoType::ServerOpened));
            }
            (Some(_), SmeType::Closed) => {
                st.collection.remove(&id);
                st.info_queue.enqueue(id, (id, InfoType::ServerClosed));
                // Streams toward a dead server are forcibly closed.
                let orphans: Vec<StreamId> = st
                    .collection
                    .keys()
                    .copied()
                    .filter(|s| s.is_stream() && s.server_id() == id)
                    .collect();
                for orphan in orphans {
                    st.collection.remove(&orphan);
                    st.removed = true;
                }
                st.modified = true;
                info!("[SC] server {id} closed");
            }
            _ => {}
        }
    }

    /// Take the pending operation flags, clearing them.
    pub fn take_operation(&self) -> StreamOperation {
        let mut st = self.state.lock().unwrap();
        let op = StreamOperation {
            reschedule: st.modified,
            resend: st.resend_requested,
        };
        st.resend_requested = false;
        op
    }

    pub fn was_modified(&self) -> bool {
        self.state.lock().unwrap().modified
    }

    /// Snapshot for the scheduler; clears the change flags so the next
    /// snapshot sees only new changes.
    pub fn snapshot(&self) -> StreamSnapshot {
        let mut st = self.state.lock().unwrap();
        let snap = StreamSnapshot {
            collection: st.collection.clone(),
            modified: st.modified,
            removed: st.removed,
            added: st.added,
        };
        st.modified = false;
        st.removed = false;
        st.added = false;
        snap
    }

    /// Apply the changes the scheduler computed on its snapshot.
    pub fn apply_changes(&self, changes: &BTreeMap<StreamId, StreamChange>) {
        let mut st = self.state.lock().unwrap();
        for (id, change) in changes {
            match change {
                StreamChange::Establish => {
                    if let Some(entry) = st.collection.get_mut(id) {
                        entry.status = MasterStreamStatus::Established;
                    }
                }
                StreamChange::Reject => {
                    st.collection.remove(id);
                    st.info_queue.enqueue(*id, (*id, InfoType::StreamReject));
                    info!("[SC] stream {id} rejected by scheduler");
                }
                StreamChange::Close => {
                    st.collection.remove(id);
                }
            }
        }
    }

    pub fn num_info(&self) -> usize {
        self.state.lock().unwrap().info_queue.len()
    }

    /// Pop up to `n` info elements for the downlink.
    pub fn dequeue_info(&self, n: usize) -> Vec<(StreamId, InfoType)> {
        let mut st = self.state.lock().unwrap();
        let mut out = Vec::new();
        for _ in 0..n {
            match st.info_queue.dequeue() {
                Some(info) => out.push(info),
                None => break,
            }
        }
        out
    }

    pub fn streams(&self) -> Vec<MasterStreamInfo> {
        self.state.lock().unwrap().collection.values().copied().collect()
    }
}

/// Parameter negotiation between a server and a connecting client: the
/// client chooses redundancy, period and direction; the payload is bounded
/// by what the server is willing to buffer.
fn negotiate_parameters(server: StreamParameters, client: StreamParameters) -> StreamParameters {
    StreamParameters {
        redundancy: client.redundancy,
        period: client.period,
        payload_size: client.payload_size.min(server.payload_size),
        direction: client.direction,
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Scheduler-private copy of the collection; no locking needed.
#[derive(Debug, Clone, Default)]
pub struct StreamSnapshot {
    collection: BTreeMap<StreamId, MasterStreamInfo>,
    modified: bool,
    removed: bool,
    added: bool,
}

impl StreamSnapshot {
    pub fn stream_count(&self) -> usize {
        self.collection.len()
    }

    pub fn streams(&self) -> Vec<MasterStreamInfo> {
        self.collection.values().copied().collect()
    }

    pub fn streams_with_status(&self, status: MasterStreamStatus) -> Vec<MasterStreamInfo> {
        self.collection
            .values()
            .filter(|s| s.status == status)
            .copied()
            .collect()
    }

    pub fn was_modified(&self) -> bool {
        self.modified
    }

    pub fn was_removed(&self) -> bool {
        self.removed
    }

    pub fn was_added(&self) -> bool {
        self.added
    }

    /// Compare the snapshot against the freshly computed schedule and
    /// derive the status changes to push back into the collection.
    pub fn stream_changes(
        &self,
        schedule: &[ScheduleElement],
    ) -> BTreeMap<StreamId, StreamChange> {
        let mut changes = BTreeMap::new();
        for stream in self.collection.values() {
            let scheduled = schedule.iter().any(|e| e.id == stream.id);
            match stream.status {
                MasterStreamStatus::Accepted => {
                    changes.insert(
                        stream.id,
                        if scheduled {
                            StreamChange::Establish
                        } else {
                            StreamChange::Reject
                        },
                    );
                }
                MasterStreamStatus::Established => {
                    if !scheduled {
                        changes.insert(stream.id, StreamChange::Close);
                    }
                }
                MasterStreamStatus::Listen => {}
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Direction, Period, Redundancy, StreamInfo, StreamStatus};

    fn params(payload: u8) -> StreamParameters {
        StreamParameters::new(Redundancy::None, Period::P2, payload, Direction::Tx)
    }

    fn sme(id: StreamId, ty: SmeType, payload: u8) -> StreamManagementElement {
        let info = StreamInfo::new(id, params(payload), StreamStatus::Connecting);
        StreamManagementElement::new(&info, ty)
    }

    fn push(coll: &StreamCollection, element: StreamManagementElement) {
        let mut q = UpdatableQueue::new();
        q.enqueue(element.key(), element);
        coll.receive_smes(&mut q);
    }

    #[test]
    fn listen_opens_server_and_confirms() {
        let coll = StreamCollection::new();
        push(&coll, sme(StreamId::new(2, 2, 0, 1), SmeType::Listen, 16));
        assert_eq!(coll.streams().len(), 1);
        let infos = coll.dequeue_info(4);
        assert_eq!(infos, vec![(StreamId::new(2, 2, 0, 1), InfoType::ServerOpened)]);
    }

    #[test]
    fn connect_without_server_is_refused() {
        let coll = StreamCollection::new();
        push(&coll, sme(StreamId::new(1, 2, 0, 1), SmeType::Connect, 16));
        assert!(coll.streams().is_empty());
        let infos = coll.dequeue_info(4);
        assert_eq!(infos[0].1, InfoType::StreamReject);
    }

    #[test]
    fn connect_with_server_is_accepted_and_negotiated() {
        let coll = StreamCollection::new();
        push(&coll, sme(StreamId::new(2, 2, 0, 1), SmeType::Listen, 8));
        push(&coll, sme(StreamId::new(1, 2, 0, 1), SmeType::Connect, 64));
        let streams = coll.streams();
        let stream = streams
            .iter()
            .find(|s| s.id == StreamId::new(1, 2, 0, 1))
            .unwrap();
        assert_eq!(stream.status, MasterStreamStatus::Accepted);
        // Payload bounded by the server's advertisement.
        assert_eq!(stream.params.payload_size, 8);
    }

    #[test]
    fn snapshot_clears_flags() {
        let coll = StreamCollection::new();
        push(&coll, sme(StreamId::new(2, 2, 0, 1), SmeType::Listen, 8));
        push(&coll, sme(StreamId::new(1, 2, 0, 1), SmeType::Connect, 8));
        let snap = coll.snapshot();
        assert!(snap.was_added());
        let snap2 = coll.snapshot();
        assert!(!snap2.was_added());
    }

    #[test]
    fn changes_from_schedule() {
        let coll = StreamCollection::new();
        push(&coll, sme(StreamId::new(2, 2, 0, 1), SmeType::Listen, 8));
        push(&coll, sme(StreamId::new(1, 2, 0, 1), SmeType::Connect, 8));
        push(&coll, sme(StreamId::new(3, 2, 0, 1), SmeType::Connect, 8));
        let snap = coll.snapshot();

        // Only the first stream made it into the schedule.
        let scheduled = ScheduleElement::single_hop(StreamId::new(1, 2, 0, 1), params(8));
        let changes = snap.stream_changes(std::slice::from_ref(&scheduled));
        assert_eq!(
            changes.get(&StreamId::new(1, 2, 0, 1)),
            Some(&StreamChange::Establish)
        );
        assert_eq!(
            changes.get(&StreamId::new(3, 2, 0, 1)),
            Some(&StreamChange::Reject)
        );

        coll.apply_changes(&changes);
        let streams = coll.streams();
        assert!(streams
            .iter()
            .any(|s| s.id == StreamId::new(1, 2, 0, 1)
                && s.status == MasterStreamStatus::Established));
        assert!(!streams.iter().any(|s| s.id == StreamId::new(3, 2, 0, 1)));
        // The rejected stream got a STREAM_REJECT info element.
        let infos = coll.dequeue_info(8);
        assert!(infos.contains(&(StreamId::new(3, 2, 0, 1), InfoType::StreamReject)));
    }

    #[test]
    fn established_stream_missing_from_schedule_closes() {
        let coll = StreamCollection::new();
        push(&coll, sme(StreamId::new(2, 2, 0, 1), SmeType::Listen, 8));
        push(&coll, sme(StreamId::new(1, 2, 0, 1), SmeType::Connect, 8));
        let snap = coll.snapshot();
        let scheduled = ScheduleElement::single_hop(StreamId::new(1, 2, 0, 1), params(8));
        coll.apply_changes(&snap.stream_changes(std::slice::from_ref(&scheduled)));

        // Topology broke; new schedule is empty.
        let snap = coll.snapshot();
        let changes = snap.stream_changes(&[]);
        assert_eq!(
            changes.get(&StreamId::new(1, 2, 0, 1)),
            Some(&StreamChange::Close)
        );
    }

    #[test]
    fn server_close_removes_orphan_streams() {
        let coll = StreamCollection::new();
        push(&coll, sme(StreamId::new(2, 2, 0, 1), SmeType::Listen, 8));
        push(&coll, sme(StreamId::new(1, 2, 0, 1), SmeType::Connect, 8));
        push(&coll, sme(StreamId::new(2, 2, 0, 1), SmeType::Closed, 8));
        assert!(coll.streams().is_empty());
    }

    #[test]
    fn resend_request_sets_flag_once() {
        let coll = StreamCollection::new();
        push(&coll, StreamManagementElement::make_resend(4));
        let op = coll.take_operation();
        assert!(op.resend);
        let op = coll.take_operation();
        assert!(!op.resend);
    }
}
