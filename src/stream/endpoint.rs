//! Stream and Server endpoints.
//!
//! An endpoint is shared between the MAC thread (data phase, schedule
//! application, periodic update) and application threads (the fd-style
//! API). Each endpoint has one state mutex and per-purpose condition
//! variables; the application blocks on them, the MAC never does.
//!
//! Payload handoff uses double buffering: the application writes into
//! `next_tx`, the data phase latches it into `tx_packet` at the first send
//! slot of each period and repeats it for redundant slots; mirrored on the
//! receive side, where the period's packet is published to the application
//! when the period closes.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::crypto::AesOcb;
use crate::error::StreamError;
use crate::util::Packet;

use super::{SmeType, StreamId, StreamInfo, StreamManagementElement, StreamParameters, StreamStatus};

/// SME retransmission timer, in tiles.
pub(crate) const SME_TIMEOUT_MAX: i32 = 600;
/// Endpoint failure timer, in tiles.
pub(crate) const FAIL_TIMEOUT_MAX: i32 = 1800;

/// An SME produced by an endpoint, to be enqueued by the manager.
pub(crate) type PendingSme = StreamManagementElement;

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

pub(crate) struct StreamState {
    pub info: StreamInfo,
    sme_timeout: i32,
    fail_timeout: i32,

    /// Transmissions per period, from the redundancy parameter.
    redundancy_count: u8,
    tx_count: u8,
    rx_count: u8,

    /// Current-period packets owned by the MAC side.
    tx_packet: Packet,
    rx_packet: Packet,
    tx_packet_ready: bool,
    received: bool,

    /// Handoff buffers shared with the application.
    next_tx: Packet,
    next_tx_ready: bool,
    rx_shared: Packet,
    received_shared: bool,
    /// The first read must wait for data to be present.
    already_read_shared: bool,

    /// Pending wakeup from the stream wait scheduler.
    wakeup_pending: bool,

    /// Authenticated-data sequence number, reset at schedule activation.
    seq_no: u64,
    /// Transmitter wakeup advance for the wait scheduler, nanoseconds.
    wakeup_advance_ns: i64,

    /// Per-stream authenticated encryption, present when data
    /// authentication is enabled.
    pub ocb: Option<AesOcb>,
    next_ocb: Option<AesOcb>,
}

pub struct Stream {
    fd: i32,
    state: Mutex<StreamState>,
    connect_cv: Condvar,
    tx_cv: Condvar,
    rx_cv: Condvar,
    wait_cv: Condvar,
}

impl Stream {
    pub(crate) fn new(fd: i32, info: StreamInfo) -> Self {
        let redundancy_count = info.params.redundancy.multiplier();
        Self {
            fd,
            state: Mutex::new(StreamState {
                info,
                sme_timeout: SME_TIMEOUT_MAX,
                fail_timeout: FAIL_TIMEOUT_MAX,
                redundancy_count,
                tx_count: 0,
                rx_count: 0,
                tx_packet: Packet::new(),
                rx_packet: Packet::new(),
                tx_packet_ready: false,
                received: false,
                next_tx: Packet::new(),
                next_tx_ready: false,
                rx_shared: Packet::new(),
                received_shared: false,
                already_read_shared: true,
                wakeup_pending: false,
                seq_no: 1,
                wakeup_advance_ns: 0,
                ocb: None,
                next_ocb: None,
            }),
            connect_cv: Condvar::new(),
            tx_cv: Condvar::new(),
            rx_cv: Condvar::new(),
            wait_cv: Condvar::new(),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn info(&self) -> StreamInfo {
        self.state.lock().unwrap().info
    }

    pub fn id(&self) -> StreamId {
        self.state.lock().unwrap().info.id
    }

    // ── Application side ────────────────────────────────────────

    /// Block until the connection attempt resolves.
    pub(crate) fn wait_connection(&self) -> Result<(), StreamError> {
        let mut st = self.state.lock().unwrap();
        while st.info.status == StreamStatus::Connecting {
            st = self.connect_cv.wait(st).unwrap();
        }
        match st.info.status {
            StreamStatus::Established | StreamStatus::Reopened => Ok(()),
            _ => Err(StreamError::InvalidEndpoint),
        }
    }

    /// Copy up to one period's payload into the handoff buffer; blocks
    /// while the previous payload has not been consumed by the data phase.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        let mut st = self.state.lock().unwrap();
        loop {
            match st.info.status {
                StreamStatus::Established | StreamStatus::Reopened => {}
                StreamStatus::RemotelyClosed | StreamStatus::CloseWait | StreamStatus::Closed => {
                    return Err(StreamError::Closed)
                }
                _ => return Err(StreamError::NotEstablished),
            }
            if !st.next_tx_ready {
                break;
            }
            st = self.tx_cv.wait(st).unwrap();
        }
        let n = data.len().min(st.info.params.payload_size as usize);
        st.next_tx.clear();
        st.next_tx.put(&data[..n]).map_err(|_| StreamError::InvalidEndpoint)?;
        st.next_tx_ready = true;
        Ok(n)
    }

    /// Block until one period's payload is available, then copy it out.
    /// A period in which every redundant reception was missed yields zero
    /// bytes.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, StreamError> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.received_shared && !st.already_read_shared {
                break;
            }
            match st.info.status {
                StreamStatus::Established | StreamStatus::Reopened => {}
                StreamStatus::RemotelyClosed
                | StreamStatus::CloseWait
                | StreamStatus::Closed => return Err(StreamError::Closed),
                _ => return Err(StreamError::NotEstablished),
            }
            st = self.rx_cv.wait(st).unwrap();
        }
        st.already_read_shared = true;
        let payload = st.rx_shared.remaining();
        let n = payload.len().min(out.len());
        out[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    /// Block the caller until the wait scheduler signals the next send slot.
    pub fn wait_send_slot(&self) -> Result<(), StreamError> {
        let mut st = self.state.lock().unwrap();
        if st.info.params.direction == super::Direction::Rx {
            return Err(StreamError::NotSender);
        }
        while !st.wakeup_pending {
            if !st.info.status.carries_data() && st.info.status != StreamStatus::Connecting {
                return Err(StreamError::Closed);
            }
            st = self.wait_cv.wait(st).unwrap();
        }
        st.wakeup_pending = false;
        Ok(())
    }

    /// Signal the application thread blocked in [`wait_send_slot`].
    pub(crate) fn wakeup(&self) {
        let mut st = self.state.lock().unwrap();
        st.wakeup_pending = true;
        self.wait_cv.notify_all();
    }

    // ── MAC side ────────────────────────────────────────────────

    /// Fill `data` with this period's payload; returns false when the
    /// application has not produced one.
    pub(crate) fn send_packet(&self, data: &mut Packet) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.tx_count == 0 {
            // First send slot of the period: latch the handoff buffer.
            if st.next_tx_ready {
                st.tx_packet = st.next_tx.clone();
                st.next_tx_ready = false;
                st.tx_packet_ready = true;
                self.tx_cv.notify_all();
            } else {
                st.tx_packet_ready = false;
            }
        }
        st.tx_count += 1;
        if st.tx_count >= st.redundancy_count {
            st.tx_count = 0;
            // Period closed on the transmit side.
            st.seq_no += 1;
        }
        if st.tx_packet_ready {
            *data = st.tx_packet.clone();
        }
        st.tx_packet_ready
    }

    /// Store a received payload; redundant copies after the first are
    /// ignored. Returns true when this reception closes the period.
    pub(crate) fn receive_packet(&self, data: &Packet) -> bool {
        let mut st = self.state.lock().unwrap();
        if !st.received {
            st.rx_packet = data.clone();
            st.received = true;
        }
        self.advance_rx_period(&mut st)
    }

    /// Account a missed reception slot. Returns true when this closes the
    /// period.
    pub(crate) fn miss_packet(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        self.advance_rx_period(&mut st)
    }

    fn advance_rx_period(&self, st: &mut StreamState) -> bool {
        st.rx_count += 1;
        if st.rx_count < st.redundancy_count {
            return false;
        }
        // Period closed: publish to the application, empty on a fully
        // missed period.
        st.rx_count = 0;
        if st.received {
            st.rx_shared = st.rx_packet.clone();
            st.rx_packet.clear();
        } else {
            st.rx_shared.clear();
        }
        st.received = false;
        st.received_shared = true;
        st.already_read_shared = false;
        // Period closed on the receive side; keep the sequence number in
        // lockstep with the transmitter.
        st.seq_no += 1;
        self.rx_cv.notify_all();
        true
    }

    /// This stream appears in the newly applied schedule.
    pub(crate) fn added_to_schedule(&self, new_params: StreamParameters) {
        let mut st = self.state.lock().unwrap();
        st.info.params = new_params;
        st.redundancy_count = new_params.redundancy.multiplier();
        match st.info.status {
            StreamStatus::Connecting => {
                st.info.status = StreamStatus::Established;
                self.reset_timeouts(&mut st);
                self.connect_cv.notify_all();
            }
            StreamStatus::RemotelyClosed => {
                // The master re-accepted after a temporary close.
                st.info.status = StreamStatus::Reopened;
                self.reset_timeouts(&mut st);
                self.rx_cv.notify_all();
                self.tx_cv.notify_all();
            }
            _ => {}
        }
    }

    /// The stream was accepted by the application through `accept()`.
    pub(crate) fn accepted(&self) {
        let mut st = self.state.lock().unwrap();
        if st.info.status == StreamStatus::AcceptWait {
            st.info.status = StreamStatus::Established;
            self.reset_timeouts(&mut st);
        }
    }

    /// This stream is absent from the newly applied schedule; returns true
    /// when the endpoint can be deleted.
    pub(crate) fn removed_from_schedule(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        match st.info.status {
            StreamStatus::Established | StreamStatus::Reopened | StreamStatus::AcceptWait => {
                st.info.status = StreamStatus::RemotelyClosed;
                self.reset_timeouts(&mut st);
                self.wake_all();
                false
            }
            StreamStatus::CloseWait | StreamStatus::Closed => {
                st.info.status = StreamStatus::Closed;
                self.wake_all();
                true
            }
            _ => false,
        }
    }

    /// STREAM_REJECT info element received.
    pub(crate) fn rejected(&self) {
        let mut st = self.state.lock().unwrap();
        st.info.status = StreamStatus::ConnectFailed;
        self.reset_timeouts(&mut st);
        self.wake_all();
    }

    /// The server this stream belongs to was closed; a stream still
    /// waiting for `accept()` is forced into CloseWait.
    pub(crate) fn server_closed(&self) -> Option<PendingSme> {
        let mut st = self.state.lock().unwrap();
        if st.info.status == StreamStatus::AcceptWait {
            st.info.status = StreamStatus::CloseWait;
            self.reset_timeouts(&mut st);
            self.wake_all();
            return Some(StreamManagementElement::new(&st.info, SmeType::Closed));
        }
        None
    }

    /// Application-side close; returns the CLOSED SME to enqueue and
    /// whether the endpoint can be deleted right away.
    pub(crate) fn close(&self) -> (Option<PendingSme>, bool) {
        let mut st = self.state.lock().unwrap();
        match st.info.status {
            StreamStatus::Closed | StreamStatus::ConnectFailed | StreamStatus::Uninitialized => {
                (None, true)
            }
            StreamStatus::CloseWait => (None, false),
            _ => {
                st.info.status = StreamStatus::CloseWait;
                self.reset_timeouts(&mut st);
                self.wake_all();
                (
                    Some(StreamManagementElement::new(&st.info, SmeType::Closed)),
                    false,
                )
            }
        }
    }

    /// Periodic tile update: SME retransmission and overall failure
    /// timers. Returns the SME to re-enqueue (if any) and whether the
    /// endpoint became deletable.
    pub(crate) fn periodic_update(&self) -> (Option<PendingSme>, bool) {
        let mut st = self.state.lock().unwrap();
        let mut sme = None;

        let pending_type = match st.info.status {
            StreamStatus::Connecting => Some(SmeType::Connect),
            StreamStatus::CloseWait => Some(SmeType::Closed),
            _ => None,
        };
        if let Some(ty) = pending_type {
            st.sme_timeout -= 1;
            if st.sme_timeout <= 0 {
                st.sme_timeout = SME_TIMEOUT_MAX;
                sme = Some(StreamManagementElement::new(&st.info, ty));
            }
            st.fail_timeout -= 1;
            if st.fail_timeout <= 0 {
                st.fail_timeout = FAIL_TIMEOUT_MAX;
                let deletable = match st.info.status {
                    StreamStatus::Connecting => {
                        st.info.status = StreamStatus::ConnectFailed;
                        false
                    }
                    StreamStatus::CloseWait => {
                        st.info.status = StreamStatus::Closed;
                        true
                    }
                    _ => false,
                };
                self.wake_all();
                return (None, deletable);
            }
        }
        (sme, false)
    }

    /// Timesync lost: abort in-flight operations. Returns true when the
    /// endpoint can be deleted.
    pub(crate) fn desync(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        let deletable = match st.info.status {
            StreamStatus::Connecting => {
                st.info.status = StreamStatus::ConnectFailed;
                false
            }
            StreamStatus::Established | StreamStatus::Reopened | StreamStatus::AcceptWait => {
                st.info.status = StreamStatus::RemotelyClosed;
                false
            }
            StreamStatus::CloseWait => {
                st.info.status = StreamStatus::Closed;
                true
            }
            _ => false,
        };
        self.wake_all();
        deletable
    }

    /// Reset redundancy counters at schedule activation.
    pub(crate) fn reset_counters(&self) {
        let mut st = self.state.lock().unwrap();
        st.tx_count = 0;
        st.rx_count = 0;
        st.received = false;
    }

    pub(crate) fn reset_sequence_number(&self) {
        self.state.lock().unwrap().seq_no = 1;
    }

    pub(crate) fn sequence_number(&self) -> u64 {
        self.state.lock().unwrap().seq_no
    }

    pub(crate) fn set_wakeup_advance(&self, ns: i64) {
        self.state.lock().unwrap().wakeup_advance_ns = ns;
    }

    pub(crate) fn wakeup_advance(&self) -> i64 {
        self.state.lock().unwrap().wakeup_advance_ns
    }

    pub(crate) fn set_key(&self, key: &[u8; 16]) {
        self.state.lock().unwrap().ocb = Some(AesOcb::new(key));
    }

    pub(crate) fn set_next_key(&self, key: &[u8; 16]) {
        self.state.lock().unwrap().next_ocb = Some(AesOcb::new(key));
    }

    pub(crate) fn apply_next_key(&self) {
        let mut st = self.state.lock().unwrap();
        if let Some(ocb) = st.next_ocb.take() {
            st.ocb = Some(ocb);
        }
    }

    /// Run `f` on the stream cipher, if data authentication is active.
    pub(crate) fn with_cipher<R>(&self, f: impl FnOnce(&mut AesOcb) -> R) -> Option<R> {
        let mut st = self.state.lock().unwrap();
        st.ocb.as_mut().map(f)
    }

    fn reset_timeouts(&self, st: &mut StreamState) {
        st.sme_timeout = SME_TIMEOUT_MAX;
        st.fail_timeout = FAIL_TIMEOUT_MAX;
    }

    fn wake_all(&self) {
        self.connect_cv.notify_all();
        self.tx_cv.notify_all();
        self.rx_cv.notify_all();
        self.wait_cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct ServerState {
    info: StreamInfo,
    sme_timeout: i32,
    fail_timeout: i32,
    pending: VecDeque<Arc<Stream>>,
}

/// Listening endpoint announcing the possibility to accept streams.
pub struct Server {
    fd: i32,
    state: Mutex<ServerState>,
    cv: Condvar,
}

impl Server {
    pub(crate) fn new(fd: i32, info: StreamInfo) -> Self {
        Self {
            fd,
            state: Mutex::new(ServerState {
                info,
                sme_timeout: SME_TIMEOUT_MAX,
                fail_timeout: FAIL_TIMEOUT_MAX,
                pending: VecDeque::new(),
            }),
            cv: Condvar::new(),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn info(&self) -> StreamInfo {
        self.state.lock().unwrap().info
    }

    /// Block until the master confirms or rejects the LISTEN request.
    pub(crate) fn wait_listen(&self) -> Result<(), StreamError> {
        let mut st = self.state.lock().unwrap();
        while st.info.status == StreamStatus::ListenWait {
            st = self.cv.wait(st).unwrap();
        }
        if st.info.status == StreamStatus::Listen {
            Ok(())
        } else {
            Err(StreamError::InvalidEndpoint)
        }
    }

    /// Block until an incoming stream is pending, then return it.
    pub fn accept(&self) -> Result<Arc<Stream>, StreamError> {
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(stream) = st.pending.pop_front() {
                return Ok(stream);
            }
            match st.info.status {
                StreamStatus::Listen | StreamStatus::ListenWait => {}
                _ => return Err(StreamError::Closed),
            }
            st = self.cv.wait(st).unwrap();
        }
    }

    pub(crate) fn add_pending_stream(&self, stream: Arc<Stream>) {
        let mut st = self.state.lock().unwrap();
        st.pending.push_back(stream);
        self.cv.notify_all();
    }

    /// Remove every stream still waiting for an accept; used when the
    /// server closes.
    pub(crate) fn drain_pending(&self) -> Vec<Arc<Stream>> {
        let mut st = self.state.lock().unwrap();
        st.pending.drain(..).collect()
    }

    /// SERVER_OPENED info element received.
    pub(crate) fn accepted(&self) {
        let mut st = self.state.lock().unwrap();
        if st.info.status == StreamStatus::ListenWait {
            st.info.status = StreamStatus::Listen;
            st.sme_timeout = SME_TIMEOUT_MAX;
            st.fail_timeout = FAIL_TIMEOUT_MAX;
            self.cv.notify_all();
        }
    }

    /// SERVER_CLOSED info element received.
    pub(crate) fn rejected(&self) {
        let mut st = self.state.lock().unwrap();
        st.info.status = match st.info.status {
            StreamStatus::ListenWait => StreamStatus::ListenFailed,
            _ => StreamStatus::RemotelyClosed,
        };
        self.cv.notify_all();
    }

    pub(crate) fn close(&self) -> (Option<PendingSme>, bool) {
        let mut st = self.state.lock().unwrap();
        match st.info.status {
            StreamStatus::Closed | StreamStatus::ListenFailed | StreamStatus::Uninitialized => {
                (None, true)
            }
            StreamStatus::CloseWait => (None, false),
            _ => {
                st.info.status = StreamStatus::CloseWait;
                st.sme_timeout = SME_TIMEOUT_MAX;
                st.fail_timeout = FAIL_TIMEOUT_MAX;
                self.cv.notify_all();
                (
                    Some(StreamManagementElement::new(&st.info, SmeType::Closed)),
                    false,
                )
            }
        }
    }

    pub(crate) fn periodic_update(&self) -> (Option<PendingSme>, bool) {
        let mut st = self.state.lock().unwrap();
        let pending_type = match st.info.status {
            StreamStatus::ListenWait => Some(SmeType::Listen),
            StreamStatus::CloseWait => Some(SmeType::Closed),
            _ => None,
        };
        let Some(ty) = pending_type else {
            return (None, false);
        };
        st.sme_timeout -= 1;
        let mut sme = None;
        if st.sme_timeout <= 0 {
            st.sme_timeout = SME_TIMEOUT_MAX;
            sme = Some(StreamManagementElement::new(&st.info, ty));
        }
        st.fail_timeout -= 1;
        if st.fail_timeout <= 0 {
            st.fail_timeout = FAIL_TIMEOUT_MAX;
            let deletable = match st.info.status {
                StreamStatus::ListenWait => {
                    st.info.status = StreamStatus::ListenFailed;
                    debug!("server {} listen timed out", st.info.id);
                    false
                }
                StreamStatus::CloseWait => {
                    st.info.status = StreamStatus::Closed;
                    true
                }
                _ => false,
            };
            self.cv.notify_all();
            return (None, deletable);
        }
        (sme, false)
    }

    pub(crate) fn desync(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        let deletable = match st.info.status {
            StreamStatus::ListenWait => {
                st.info.status = StreamStatus::ListenFailed;
                false
            }
            StreamStatus::CloseWait => {
                st.info.status = StreamStatus::Closed;
                true
            }
            _ => false,
        };
        self.cv.notify_all();
        deletable
    }
}

/// Entry of the file-descriptor table.
#[derive(Clone)]
pub(crate) enum Endpoint {
    Stream(Arc<Stream>),
    Server(Arc<Server>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Direction, Period, Redundancy};

    fn stream(status: StreamStatus, redundancy: Redundancy) -> Stream {
        let info = StreamInfo::new(
            StreamId::new(1, 2, 0, 1),
            StreamParameters::new(redundancy, Period::P2, 8, Direction::Tx),
            status,
        );
        Stream::new(3, info)
    }

    #[test]
    fn write_then_send_latches_payload() {
        let s = stream(StreamStatus::Established, Redundancy::None);
        assert_eq!(s.write(&[0xaa, 0xbb]).unwrap(), 2);
        let mut pkt = Packet::new();
        assert!(s.send_packet(&mut pkt));
        assert_eq!(pkt.remaining(), &[0xaa, 0xbb]);
        // Next period without a new write: nothing to send.
        let mut pkt2 = Packet::new();
        assert!(!s.send_packet(&mut pkt2));
    }

    #[test]
    fn redundant_sends_repeat_same_payload() {
        let s = stream(StreamStatus::Established, Redundancy::Double);
        s.write(&[1, 2, 3]).unwrap();
        let mut a = Packet::new();
        let mut b = Packet::new();
        assert!(s.send_packet(&mut a));
        assert!(s.send_packet(&mut b));
        assert_eq!(a.remaining(), b.remaining());
        // Period closed; no new payload.
        let mut c = Packet::new();
        assert!(!s.send_packet(&mut c));
    }

    #[test]
    fn write_caps_at_payload_size() {
        let s = stream(StreamStatus::Established, Redundancy::None);
        let big = [0u8; 64];
        assert_eq!(s.write(&big).unwrap(), 8);
    }

    #[test]
    fn receive_publishes_at_period_end() {
        let s = stream(StreamStatus::Established, Redundancy::Double);
        let mut pkt = Packet::new();
        pkt.put(&[9, 8, 7]).unwrap();
        assert!(!s.receive_packet(&pkt)); // first of two redundant slots
        assert!(s.miss_packet()); // second slot missed: period closes
        let mut out = [0u8; 8];
        assert_eq!(s.read(&mut out).unwrap(), 3);
        assert_eq!(&out[..3], &[9, 8, 7]);
    }

    #[test]
    fn duplicate_reception_keeps_first_copy() {
        let s = stream(StreamStatus::Established, Redundancy::Double);
        let mut first = Packet::new();
        first.put(&[1]).unwrap();
        let mut second = Packet::new();
        second.put(&[2]).unwrap();
        s.receive_packet(&first);
        s.receive_packet(&second);
        let mut out = [0u8; 4];
        assert_eq!(s.read(&mut out).unwrap(), 1);
        assert_eq!(out[0], 1);
    }

    #[test]
    fn fully_missed_period_reads_empty() {
        let s = stream(StreamStatus::Established, Redundancy::None);
        assert!(s.miss_packet());
        let mut out = [0u8; 4];
        assert_eq!(s.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn write_on_closed_stream_errors() {
        let s = stream(StreamStatus::RemotelyClosed, Redundancy::None);
        assert_eq!(s.write(&[1]), Err(StreamError::Closed));
    }

    #[test]
    fn added_to_schedule_establishes_connecting() {
        let s = stream(StreamStatus::Connecting, Redundancy::None);
        s.added_to_schedule(StreamParameters::new(
            Redundancy::Double,
            Period::P2,
            8,
            Direction::Tx,
        ));
        assert_eq!(s.info().status, StreamStatus::Established);
        assert_eq!(s.info().params.redundancy, Redundancy::Double);
    }

    #[test]
    fn reopened_after_temporary_close() {
        let s = stream(StreamStatus::Established, Redundancy::None);
        assert!(!s.removed_from_schedule());
        assert_eq!(s.info().status, StreamStatus::RemotelyClosed);
        s.added_to_schedule(s.info().params);
        assert_eq!(s.info().status, StreamStatus::Reopened);
    }

    #[test]
    fn close_wait_removed_is_deletable() {
        let s = stream(StreamStatus::Established, Redundancy::None);
        let (sme, deletable) = s.close();
        assert!(sme.is_some());
        assert!(!deletable);
        assert_eq!(s.info().status, StreamStatus::CloseWait);
        assert!(s.removed_from_schedule());
    }

    #[test]
    fn periodic_update_reenqueues_sme_and_times_out() {
        let s = stream(StreamStatus::Connecting, Redundancy::None);
        // The SME timer re-enqueues at most once per expiry.
        let mut resent = 0;
        for _ in 0..SME_TIMEOUT_MAX {
            if s.periodic_update().0.is_some() {
                resent += 1;
            }
        }
        assert_eq!(resent, 1);
        // Run out the overall timer.
        for _ in 0..(FAIL_TIMEOUT_MAX + 1) {
            s.periodic_update();
        }
        assert_eq!(s.info().status, StreamStatus::ConnectFailed);
    }

    #[test]
    fn server_accept_returns_pending() {
        let srv = Server::new(
            1,
            StreamInfo::new(
                StreamId::new(2, 2, 0, 1),
                StreamParameters::default(),
                StreamStatus::Listen,
            ),
        );
        let st = Arc::new(stream(StreamStatus::AcceptWait, Redundancy::None));
        srv.add_pending_stream(st.clone());
        let got = srv.accept().unwrap();
        assert_eq!(got.fd(), st.fd());
    }

    #[test]
    fn server_rejected_fails_listen() {
        let srv = Server::new(
            1,
            StreamInfo::new(
                StreamId::new(2, 2, 0, 1),
                StreamParameters::default(),
                StreamStatus::ListenWait,
            ),
        );
        srv.rejected();
        assert_eq!(srv.info().status, StreamStatus::ListenFailed);
        assert!(srv.wait_listen().is_err());
    }

    #[test]
    fn desync_aborts_connecting() {
        let s = stream(StreamStatus::Connecting, Redundancy::None);
        assert!(!s.desync());
        assert_eq!(s.info().status, StreamStatus::ConnectFailed);
    }
}
