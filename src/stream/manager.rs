//! StreamManager: the node-side registry of streams and servers.
//!
//! Exposes the file-descriptor style API to applications and the packet
//! and schedule hooks to the MAC phases. One coarse mutex protects the
//! endpoint maps; a second protects the SME queue (endpoints produce SMEs
//! while the uplink phase drains them). Never call a manager method from
//! inside another: the locks are not reentrant.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::crypto::hash::SingleBlockMpHash;
use crate::error::StreamError;
use crate::schedule::{InfoType, ScheduleElement};
use crate::util::{Packet, UpdatableQueue};

use super::endpoint::Endpoint;
use super::{
    Server, SmeKey, SmeType, Stream, StreamId, StreamInfo, StreamManagementElement,
    StreamParameters, StreamStatus,
};

/// Stream keys re-derived per downlink slot while rekeying.
const MAX_HASHES_PER_SLOT: usize = 5;

/// Kind of entry in a wakeup list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupInfoKind {
    Stream,
    Downlink,
}

/// Precomputed absolute wakeup instant for a transmitting stream (or a
/// downlink boundary), produced by the schedule expansion.
#[derive(Debug, Clone, Copy)]
pub struct StreamWakeupInfo {
    pub kind: WakeupInfoKind,
    pub id: StreamId,
    /// Absolute local time of the wakeup, nanoseconds.
    pub wakeup_time_ns: i64,
    /// Re-arm period, nanoseconds.
    pub period_ns: i64,
}

struct ManagerState {
    fd_counter: i32,
    fdt: BTreeMap<i32, Endpoint>,
    streams: BTreeMap<StreamId, Arc<Stream>>,
    servers: BTreeMap<u8, Arc<Server>>,
    /// Source-port allocation bitmap, one slot per port.
    client_ports: [bool; 16],
    master_trusted: bool,
    /// Streams to drop when the pending schedule is applied.
    streams_to_remove: Vec<StreamId>,
    /// Sorted stream wakeup entries for the current and next superframe.
    wakeup_curr: VecDeque<StreamWakeupInfo>,
    wakeup_next: VecDeque<StreamWakeupInfo>,
}

struct StreamCrypto {
    /// Cached first block of the per-stream derivation chain,
    /// `MP_stream(masterKey)`: only the second block runs per stream.
    current_iv: [u8; 16],
    next_iv: Option<[u8; 16]>,
    /// Streams still waiting for their next-generation key.
    rekeying_queue: VecDeque<StreamId>,
}

pub struct StreamManager {
    config: Arc<NetworkConfig>,
    my_id: u8,
    state: Mutex<ManagerState>,
    sme_queue: Mutex<UpdatableQueue<SmeKey, StreamManagementElement>>,
    crypto: Mutex<StreamCrypto>,
}

impl StreamManager {
    pub fn new(config: Arc<NetworkConfig>, my_id: u8) -> Self {
        Self {
            config,
            my_id,
            state: Mutex::new(ManagerState {
                fd_counter: 1,
                fdt: BTreeMap::new(),
                streams: BTreeMap::new(),
                servers: BTreeMap::new(),
                client_ports: [false; 16],
                // Trusted until the key manager says otherwise; networks
                // without challenge authentication never revoke it.
                master_trusted: true,
                streams_to_remove: Vec::new(),
                wakeup_curr: VecDeque::new(),
                wakeup_next: VecDeque::new(),
            }),
            sme_queue: Mutex::new(UpdatableQueue::new()),
            crypto: Mutex::new(StreamCrypto {
                current_iv: [0; 16],
                next_iv: None,
                rekeying_queue: VecDeque::new(),
            }),
        }
    }

    // ── Application API ─────────────────────────────────────────

    /// Open a stream toward `(dst, dst_port)`. Returns the endpoint fd;
    /// the endpoint starts in Connecting and a CONNECT SME is enqueued.
    pub fn connect(
        &self,
        dst: u8,
        dst_port: u8,
        params: StreamParameters,
    ) -> Result<i32, StreamError> {
        if dst == self.my_id || dst_port > 15 {
            return Err(StreamError::InvalidEndpoint);
        }
        let (fd, sme) = {
            let mut st = self.state.lock().unwrap();
            if !st.master_trusted {
                return Err(StreamError::MasterUntrusted);
            }
            let src_port = Self::allocate_client_port(&mut st).ok_or(StreamError::InvalidEndpoint)?;
            let id = StreamId::new(self.my_id, dst, src_port, dst_port);
            if st.streams.contains_key(&id) {
                st.client_ports[src_port as usize] = false;
                return Err(StreamError::InvalidEndpoint);
            }
            let info = StreamInfo::new(id, params, StreamStatus::Connecting);
            let (fd, stream) = self.add_stream(&mut st, info);
            let sme = StreamManagementElement::new(&stream.info(), SmeType::Connect);
            (fd, sme)
        };
        self.enqueue_sme(sme);
        info!("[S] stream fd={fd} connecting");
        Ok(fd)
    }

    /// Open a server on `port`. Returns the endpoint fd; the endpoint
    /// starts in ListenWait and a LISTEN SME is enqueued.
    pub fn listen(&self, port: u8, params: StreamParameters) -> Result<i32, StreamError> {
        if port > 15 {
            return Err(StreamError::InvalidEndpoint);
        }
        let (fd, sme) = {
            let mut st = self.state.lock().unwrap();
            if !st.master_trusted {
                return Err(StreamError::MasterUntrusted);
            }
            if st.servers.contains_key(&port) {
                return Err(StreamError::InvalidEndpoint);
            }
            let id = StreamId::new(self.my_id, self.my_id, 0, port);
            let info = StreamInfo::new(id, params, StreamStatus::ListenWait);
            let (fd, server) = self.add_server(&mut st, info);
            let sme = StreamManagementElement::new(&server.info(), SmeType::Listen);
            (fd, sme)
        };
        self.enqueue_sme(sme);
        info!("[S] server fd={fd} listening");
        Ok(fd)
    }

    /// Block until a stream is pending on the server, returning its fd.
    pub fn accept(&self, server_fd: i32) -> Result<i32, StreamError> {
        let server = {
            let st = self.state.lock().unwrap();
            if !st.master_trusted {
                return Err(StreamError::MasterUntrusted);
            }
            match st.fdt.get(&server_fd) {
                Some(Endpoint::Server(s)) => s.clone(),
                _ => return Err(StreamError::InvalidEndpoint),
            }
        };
        let stream = server.accept()?;
        stream.accepted();
        Ok(stream.fd())
    }

    pub fn write(&self, fd: i32, data: &[u8]) -> Result<usize, StreamError> {
        self.stream_by_fd(fd)?.write(data)
    }

    pub fn read(&self, fd: i32, out: &mut [u8]) -> Result<usize, StreamError> {
        self.stream_by_fd(fd)?.read(out)
    }

    /// Block the caller until the next scheduled send slot of `fd`.
    pub fn wait(&self, fd: i32) -> Result<(), StreamError> {
        self.stream_by_fd(fd)?.wait_send_slot()
    }

    /// Block until the connect attempt of `fd` resolves.
    pub fn wait_established(&self, fd: i32) -> Result<(), StreamError> {
        self.stream_by_fd(fd)?.wait_connection()
    }

    /// Block until the listen request of `fd` resolves.
    pub fn wait_listen(&self, fd: i32) -> Result<(), StreamError> {
        let server = {
            let st = self.state.lock().unwrap();
            match st.fdt.get(&fd) {
                Some(Endpoint::Server(s)) => s.clone(),
                _ => return Err(StreamError::InvalidEndpoint),
            }
        };
        server.wait_listen()
    }

    pub fn get_info(&self, fd: i32) -> Option<StreamInfo> {
        let st = self.state.lock().unwrap();
        st.fdt.get(&fd).map(|e| match e {
            Endpoint::Stream(s) => s.info(),
            Endpoint::Server(s) => s.info(),
        })
    }

    pub fn set_wakeup_advance(&self, fd: i32, advance_ns: i64) -> Result<(), StreamError> {
        self.stream_by_fd(fd)?.set_wakeup_advance(advance_ns);
        Ok(())
    }

    /// Close an endpoint on the application side; the endpoint lingers in
    /// CloseWait until the master confirms.
    pub fn close(&self, fd: i32) {
        let endpoint = {
            let st = self.state.lock().unwrap();
            st.fdt.get(&fd).cloned()
        };
        let Some(endpoint) = endpoint else { return };
        match endpoint {
            Endpoint::Stream(stream) => {
                let id = stream.id();
                let (sme, deletable) = stream.close();
                if let Some(sme) = sme {
                    self.enqueue_sme(sme);
                }
                if deletable {
                    let mut st = self.state.lock().unwrap();
                    self.remove_stream(&mut st, id);
                }
            }
            Endpoint::Server(server) => {
                let port = server.info().id.dst_port;
                let (sme, deletable) = server.close();
                // Streams still pending on the server are force-closed.
                for pending in server.drain_pending() {
                    if let Some(sme) = pending.server_closed() {
                        self.enqueue_sme(sme);
                    }
                }
                if let Some(sme) = sme {
                    self.enqueue_sme(sme);
                }
                if deletable {
                    let mut st = self.state.lock().unwrap();
                    self.remove_server(&mut st, port);
                }
            }
        }
    }

    // ── MAC hooks ───────────────────────────────────────────────

    /// Per-tile update of every endpoint's SME and failure timers.
    pub fn periodic_update(&self) {
        let (streams, servers): (Vec<_>, Vec<_>) = {
            let st = self.state.lock().unwrap();
            (
                st.streams.values().cloned().collect(),
                st.servers.values().cloned().collect(),
            )
        };
        let mut smes = Vec::new();
        let mut dead_streams = Vec::new();
        let mut dead_servers = Vec::new();
        for stream in &streams {
            let (sme, deletable) = stream.periodic_update();
            if let Some(sme) = sme {
                smes.push(sme);
            }
            if deletable {
                dead_streams.push(stream.id());
            }
        }
        for server in &servers {
            let (sme, deletable) = server.periodic_update();
            if let Some(sme) = sme {
                smes.push(sme);
            }
            if deletable {
                dead_servers.push(server.info().id.dst_port);
            }
        }
        for sme in smes {
            self.enqueue_sme(sme);
        }
        if !dead_streams.is_empty() || !dead_servers.is_empty() {
            let mut st = self.state.lock().unwrap();
            for id in dead_streams {
                self.remove_stream(&mut st, id);
            }
            for port in dead_servers {
                self.remove_server(&mut st, port);
            }
        }
    }

    /// Data phase: deliver a received payload. Returns false for unknown
    /// streams.
    pub fn receive_packet(&self, id: StreamId, data: &Packet) -> bool {
        match self.stream_by_id(id) {
            Some(s) => s.receive_packet(data),
            None => false,
        }
    }

    /// Data phase: account a missed reception.
    pub fn miss_packet(&self, id: StreamId) -> bool {
        match self.stream_by_id(id) {
            Some(s) => s.miss_packet(),
            None => false,
        }
    }

    /// Data phase: fetch the payload to transmit. Returns false when the
    /// application produced none.
    pub fn send_packet(&self, id: StreamId, data: &mut Packet) -> bool {
        match self.stream_by_id(id) {
            Some(s) => s.send_packet(data),
            None => false,
        }
    }

    pub(crate) fn stream_sequence_number(&self, id: StreamId) -> u64 {
        self.stream_by_id(id).map_or(0, |s| s.sequence_number())
    }

    /// Run `f` on the stream's cipher, when data authentication is on.
    pub fn with_stream_cipher<R>(
        &self,
        id: StreamId,
        f: impl FnOnce(&mut crate::crypto::AesOcb) -> R,
    ) -> Option<R> {
        self.stream_by_id(id)?.with_cipher(f)
    }

    pub(crate) fn wakeup_advance(&self, id: StreamId) -> i64 {
        self.stream_by_id(id).map_or(0, |s| s.wakeup_advance())
    }

    /// A new schedule has been received (not yet active): create endpoints
    /// for streams appearing in it, and note which existing streams it
    /// drops.
    pub fn set_schedule(&self, schedule: &[ScheduleElement]) {
        let mut smes = Vec::new();
        {
            let mut st = self.state.lock().unwrap();
            st.streams_to_remove = st.streams.keys().copied().collect();

            for element in schedule {
                let id = element.id;
                if id.src != self.my_id && id.dst != self.my_id {
                    continue;
                }
                st.streams_to_remove.retain(|r| *r != id);
                if st.streams.contains_key(&id) {
                    continue;
                }
                // A stream we did not know about: the accept side learns of
                // accepted streams through the schedule itself.
                let server_port = id.dst_port;
                let server_ok = id.dst == self.my_id
                    && st
                        .servers
                        .get(&server_port)
                        .is_some_and(|s| s.info().status == StreamStatus::Listen);
                if server_ok {
                    let info = StreamInfo::new(id, element.params, StreamStatus::AcceptWait);
                    let (_, stream) = self.add_stream(&mut st, info);
                    if let Some(server) = st.servers.get(&server_port) {
                        server.add_pending_stream(stream);
                    }
                } else if id.dst == self.my_id {
                    // No server: refuse the stream and tell the master the
                    // server it believes in is gone.
                    let info = StreamInfo::new(id, element.params, StreamStatus::CloseWait);
                    let (_, stream) = self.add_stream(&mut st, info);
                    smes.push(StreamManagementElement::new(&stream.info(), SmeType::Closed));
                    let server_id = id.server_id();
                    if !st.servers.contains_key(&server_port) {
                        let server_info = StreamInfo::new(
                            server_id,
                            element.params,
                            StreamStatus::CloseWait,
                        );
                        let (_, server) = self.add_server(&mut st, server_info);
                        smes.push(StreamManagementElement::new(&server.info(), SmeType::Closed));
                    }
                }
            }
        }
        for sme in smes {
            self.enqueue_sme(sme);
        }
    }

    /// Activation barrier: the new schedule takes effect now.
    pub fn apply_schedule(&self, schedule: &[ScheduleElement]) {
        let (streams, removed): (Vec<(Arc<Stream>, StreamParameters)>, Vec<StreamId>) = {
            let mut st = self.state.lock().unwrap();
            let mut touched = Vec::new();
            for element in schedule {
                let id = element.id;
                if id.src != self.my_id && id.dst != self.my_id {
                    continue;
                }
                if let Some(stream) = st.streams.get(&id) {
                    touched.push((stream.clone(), element.params));
                }
            }
            let removed = core::mem::take(&mut st.streams_to_remove);
            (touched, removed)
        };

        for (stream, params) in streams {
            stream.added_to_schedule(params);
        }
        {
            let mut st = self.state.lock().unwrap();
            for id in removed {
                let deletable = match st.streams.get(&id) {
                    Some(stream) => stream.removed_from_schedule(),
                    None => false,
                };
                if deletable {
                    self.remove_stream(&mut st, id);
                }
            }
            // Fresh period and replay state for the new schedule.
            for stream in st.streams.values() {
                stream.reset_counters();
                stream.reset_sequence_number();
            }
        }
        if self.config.authenticate_data() {
            self.apply_rekeying();
        }
    }

    /// Apply downlink info elements addressed to this node.
    pub fn apply_info_elements(&self, infos: &[(StreamId, InfoType)]) {
        for (id, ty) in infos {
            if id.src != self.my_id && id.dst != self.my_id {
                continue;
            }
            if id.is_server() {
                let port = id.dst_port;
                let server = {
                    let st = self.state.lock().unwrap();
                    st.servers.get(&port).cloned()
                };
                match (server, ty) {
                    (Some(server), InfoType::ServerOpened) => server.accepted(),
                    (Some(server), InfoType::ServerClosed) => server.rejected(),
                    (None, InfoType::ServerOpened) => {
                        // The master believes we have a server here; deny.
                        let mut st = self.state.lock().unwrap();
                        let info = StreamInfo::new(
                            *id,
                            StreamParameters::default(),
                            StreamStatus::CloseWait,
                        );
                        let (_, server) = self.add_server(&mut st, info);
                        let sme = StreamManagementElement::new(&server.info(), SmeType::Closed);
                        drop(st);
                        self.enqueue_sme(sme);
                    }
                    _ => {}
                }
            } else if *ty == InfoType::StreamReject {
                if let Some(stream) = self.stream_by_id(*id) {
                    stream.rejected();
                }
            }
        }
    }

    /// Uplink phase: move every queued SME into `queue`, oldest first.
    pub fn dequeue_smes(&self, queue: &mut UpdatableQueue<SmeKey, StreamManagementElement>) {
        let mut q = self.sme_queue.lock().unwrap();
        q.drain_into(queue);
    }

    pub fn enqueue_sme(&self, sme: StreamManagementElement) {
        debug!("[S] enqueueing {} seq={}", sme.ty(), sme.seq_no());
        let mut q = self.sme_queue.lock().unwrap();
        q.enqueue(sme.key(), sme);
    }

    /// Number of SMEs waiting for the uplink.
    pub fn pending_smes(&self) -> usize {
        self.sme_queue.lock().unwrap().len()
    }

    /// Timesync regained; nothing to rebuild, new SMEs will re-request
    /// whatever the master forgot about us.
    pub fn resync(&self) {}

    /// Timesync lost: abort in-flight operations and drop stale SMEs.
    pub fn desync(&self) {
        let mut st = self.state.lock().unwrap();
        let mut dead = Vec::new();
        for (id, stream) in st.streams.iter() {
            if stream.desync() {
                dead.push(*id);
            }
        }
        for id in dead {
            self.remove_stream(&mut st, id);
        }
        let mut dead_servers = Vec::new();
        for (port, server) in st.servers.iter() {
            if server.desync() {
                dead_servers.push(*port);
            }
        }
        for port in dead_servers {
            self.remove_server(&mut st, port);
        }
        drop(st);
        // Old SMEs must not be sent after resync.
        self.sme_queue.lock().unwrap().clear();
    }

    pub fn trust_master(&self) {
        self.state.lock().unwrap().master_trusted = true;
    }

    pub fn untrust_master(&self) {
        self.state.lock().unwrap().master_trusted = false;
    }

    pub fn is_master_trusted(&self) -> bool {
        self.state.lock().unwrap().master_trusted
    }

    // ── Wakeup lists ────────────────────────────────────────────

    /// Install the wakeup lists computed by the schedule expansion.
    pub fn set_wakeup_lists(
        &self,
        curr: Vec<StreamWakeupInfo>,
        next: Vec<StreamWakeupInfo>,
    ) {
        let mut st = self.state.lock().unwrap();
        st.wakeup_curr = curr.into();
        st.wakeup_next = next.into();
    }

    /// Fire every wakeup whose time has come, re-arming it one period
    /// later. Called by the slotframe once per slot boundary.
    pub fn process_wakeups(&self, now_ns: i64) {
        let due: Vec<StreamWakeupInfo> = {
            let mut st = self.state.lock().unwrap();
            let mut due = Vec::new();
            fn drain_due(
                list: &mut VecDeque<StreamWakeupInfo>,
                now_ns: i64,
                due: &mut Vec<StreamWakeupInfo>,
            ) {
                while let Some(front) = list.front() {
                    if front.wakeup_time_ns > now_ns {
                        break;
                    }
                    let mut entry = list.pop_front().unwrap();
                    entry.wakeup_time_ns += entry.period_ns;
                    due.push(entry);
                    list.push_back(entry);
                }
            }
            drain_due(&mut st.wakeup_curr, now_ns, &mut due);
            drain_due(&mut st.wakeup_next, now_ns, &mut due);
            due
        };
        for entry in due {
            if entry.kind == WakeupInfoKind::Stream {
                if let Some(stream) = self.stream_by_id(entry.id) {
                    stream.wakeup();
                }
            }
        }
    }

    // ── Stream key derivation ───────────────────────────────────

    /// Install the cached first-block digest of the derivation chain.
    pub fn set_stream_key_iv(&self, iv: [u8; 16]) {
        let mut c = self.crypto.lock().unwrap();
        c.current_iv = iv;
    }

    /// Begin re-deriving every stream key from the next master key.
    pub fn start_rekeying(&self, next_iv: [u8; 16]) {
        let ids: Vec<StreamId> = {
            let st = self.state.lock().unwrap();
            st.streams.keys().copied().collect()
        };
        let mut c = self.crypto.lock().unwrap();
        c.next_iv = Some(next_iv);
        c.rekeying_queue = ids.into();
    }

    /// Bounded slice of rekeying work, amortized across downlink slots.
    pub fn continue_rekeying(&self) {
        let mut c = self.crypto.lock().unwrap();
        let Some(next_iv) = c.next_iv else { return };
        let hash = SingleBlockMpHash::new(&next_iv);
        for _ in 0..MAX_HASHES_PER_SLOT {
            let Some(id) = c.rekeying_queue.pop_front() else {
                break;
            };
            drop(c);
            if let Some(stream) = self.stream_by_id(id) {
                let mut key = [0u8; 16];
                hash.digest_block(&mut key, &id.to_key_block());
                stream.set_next_key(&key);
            }
            c = self.crypto.lock().unwrap();
        }
    }

    /// Commit the new generation: finish outstanding derivations and swap
    /// every stream's cipher.
    pub fn apply_rekeying(&self) {
        let next_iv = {
            let c = self.crypto.lock().unwrap();
            match c.next_iv {
                Some(iv) => iv,
                None => return,
            }
        };
        // Finish whatever the per-slot budget did not cover.
        loop {
            let id = {
                let mut c = self.crypto.lock().unwrap();
                c.rekeying_queue.pop_front()
            };
            let Some(id) = id else { break };
            if let Some(stream) = self.stream_by_id(id) {
                let hash = SingleBlockMpHash::new(&next_iv);
                let mut key = [0u8; 16];
                hash.digest_block(&mut key, &id.to_key_block());
                stream.set_next_key(&key);
            }
        }
        let streams: Vec<Arc<Stream>> = {
            let st = self.state.lock().unwrap();
            st.streams.values().cloned().collect()
        };
        for stream in streams {
            stream.apply_next_key();
        }
        let mut c = self.crypto.lock().unwrap();
        c.current_iv = next_iv;
        c.next_iv = None;
    }

    pub fn rekeying_in_progress(&self) -> bool {
        let c = self.crypto.lock().unwrap();
        c.next_iv.is_some() && !c.rekeying_queue.is_empty()
    }

    // ── Internal ────────────────────────────────────────────────

    fn allocate_client_port(st: &mut ManagerState) -> Option<u8> {
        for (port, used) in st.client_ports.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Some(port as u8);
            }
        }
        None
    }

    fn add_stream(&self, st: &mut ManagerState, info: StreamInfo) -> (i32, Arc<Stream>) {
        let fd = st.fd_counter;
        st.fd_counter += 1;
        let stream = Arc::new(Stream::new(fd, info));
        if self.config.authenticate_data() {
            let c = self.crypto.lock().unwrap();
            let hash = SingleBlockMpHash::new(&c.current_iv);
            let mut key = [0u8; 16];
            hash.digest_block(&mut key, &info.id.to_key_block());
            stream.set_key(&key);
        }
        st.fdt.insert(fd, Endpoint::Stream(stream.clone()));
        st.streams.insert(info.id, stream.clone());
        (fd, stream)
    }

    fn add_server(&self, st: &mut ManagerState, info: StreamInfo) -> (i32, Arc<Server>) {
        let fd = st.fd_counter;
        st.fd_counter += 1;
        let server = Arc::new(Server::new(fd, info));
        st.fdt.insert(fd, Endpoint::Server(server.clone()));
        st.servers.insert(info.id.dst_port, server.clone());
        (fd, server)
    }

    fn remove_stream(&self, st: &mut ManagerState, id: StreamId) {
        if let Some(stream) = st.streams.remove(&id) {
            st.fdt.remove(&stream.fd());
            if id.src == self.my_id {
                st.client_ports[id.src_port as usize] = false;
            }
            debug!("[S] stream {id} removed");
        }
    }

    fn remove_server(&self, st: &mut ManagerState, port: u8) {
        if let Some(server) = st.servers.remove(&port) {
            st.fdt.remove(&server.fd());
            debug!("[S] server on port {port} removed");
        }
    }

    fn stream_by_fd(&self, fd: i32) -> Result<Arc<Stream>, StreamError> {
        let st = self.state.lock().unwrap();
        match st.fdt.get(&fd) {
            Some(Endpoint::Stream(s)) => Ok(s.clone()),
            _ => Err(StreamError::InvalidEndpoint),
        }
    }

    fn stream_by_id(&self, id: StreamId) -> Option<Arc<Stream>> {
        let st = self.state.lock().unwrap();
        st.streams.get(&id).cloned()
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        if !self.state.get_mut().unwrap().streams.is_empty() {
            warn!("[S] stream manager dropped with live streams");
        }
    }
}
