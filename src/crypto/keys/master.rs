//! Master-node key manager.
//!
//! The master owns the hash chain: it rotates the master key by one MP step
//! per rekeying period and answers challenge SMEs so that resyncing nodes
//! can verify they are talking to the real master and not a replayed one.

use std::sync::Arc;

use log::{debug, warn};

use super::{KeyChain, KeyManager, KeyManagerStatus, CHALLENGE_SECRET};
use crate::crypto::aes::Aes;
use crate::crypto::ocb::AesOcb;
use crate::crypto::utils::secure_clear;
use crate::schedule::DownlinkElement;
use crate::stream::{StreamManagementElement, StreamManager};

/// Challenges answered per downlink slot.
const MAX_SOLVES_PER_SLOT: usize = 5;
/// Bound on challenges waiting to be solved.
const MAX_PENDING_CHALLENGES: usize = 16;

pub struct MasterKeyManager {
    chain: KeyChain,
    status: KeyManagerStatus,
    stream_mgr: Arc<StreamManager>,
    /// Pending challenges, one slot per node id; a node re-challenging
    /// overwrites its pending entry in place.
    challenges: heapless::Deque<(u8, [u8; 16]), MAX_PENDING_CHALLENGES>,
    rekeying_period: u32,
    timesyncs_since_rekey: u32,
}

impl MasterKeyManager {
    pub fn new(stream_mgr: Arc<StreamManager>, rekeying_period: u32) -> Self {
        let chain = KeyChain::new();
        stream_mgr.set_stream_key_iv(chain.stream_key_iv(&chain.master_key));
        Self {
            chain,
            status: KeyManagerStatus::Connected,
            stream_mgr,
            challenges: heapless::Deque::new(),
            rekeying_period,
            timesyncs_since_rekey: 0,
        }
    }
}

impl KeyManager for MasterKeyManager {
    fn status(&self) -> KeyManagerStatus {
        self.status
    }

    fn master_index(&self) -> u32 {
        match self.status {
            KeyManagerStatus::Connected | KeyManagerStatus::Rekeying => self.chain.master_index,
            _ => unreachable!("master key manager in dynamic-only state"),
        }
    }

    fn master_key(&self) -> [u8; 16] {
        self.chain.master_key
    }

    fn timesync_ocb(&mut self) -> &mut AesOcb {
        &mut self.chain.timesync_ocb
    }

    fn uplink_ocb(&mut self) -> &mut AesOcb {
        &mut self.chain.uplink_ocb
    }

    fn downlink_ocb(&mut self) -> &mut AesOcb {
        &mut self.chain.downlink_ocb
    }

    fn start_rekeying(&mut self) {
        assert!(
            self.status == KeyManagerStatus::Connected,
            "unexpected call to start_rekeying"
        );
        debug!("[KM] N=0 starting rekeying");
        let master = self.chain.master_key;
        let index = self.chain.master_index;
        self.chain.prepare_next_keys(&master, index);
        self.status = KeyManagerStatus::Rekeying;

        // Streams re-derive their keys gradually from the next master key.
        let next = self.chain.next_master_key;
        self.stream_mgr.start_rekeying(self.chain.stream_key_iv(&next));
    }

    fn apply_rekeying(&mut self) {
        assert!(
            self.status == KeyManagerStatus::Rekeying,
            "unexpected call to apply_rekeying"
        );
        debug!("[KM] N=0 applying rekeying");
        self.chain.master_index = self.chain.next_master_index;
        self.chain.master_key = self.chain.next_master_key;
        self.chain.apply_next_keys();
        self.status = KeyManagerStatus::Connected;
        let master = self.chain.master_key;
        self.stream_mgr.set_stream_key_iv(self.chain.stream_key_iv(&master));
    }

    /// Counts timesync periods toward the rekeying boundary. The master
    /// never desyncs, so this can never request one.
    fn periodic_update(&mut self) -> bool {
        if self.rekeying_period == 0 {
            return false;
        }
        self.timesyncs_since_rekey += 1;
        if self.timesyncs_since_rekey >= self.rekeying_period {
            self.timesyncs_since_rekey = 0;
            match self.status {
                KeyManagerStatus::Connected => self.start_rekeying(),
                // Previous rotation still pending: commit it first.
                KeyManagerStatus::Rekeying => {
                    self.apply_rekeying();
                }
                _ => {}
            }
        } else if self.status == KeyManagerStatus::Rekeying
            && !self.stream_mgr.rekeying_in_progress()
        {
            // All stream keys recomputed: commit at the next boundary.
            self.apply_rekeying();
        }
        false
    }

    fn challenges_present(&self) -> bool {
        !self.challenges.is_empty()
    }

    fn enqueue_challenge(&mut self, sme: StreamManagementElement) {
        let node = sme.stream_id().src;
        let mut block = [0u8; 16];
        block[..4].copy_from_slice(&sme.challenge_bytes());

        // A repeated challenge from the same node replaces the pending one.
        for entry in self.challenges.iter_mut() {
            if entry.0 == node {
                entry.1 = block;
                return;
            }
        }
        if self.challenges.push_back((node, block)).is_err() {
            warn!("[KM] challenge queue full, dropping challenge from {node}");
        }
    }

    fn solve_challenges(&mut self) -> Vec<DownlinkElement> {
        let mut result = Vec::new();
        let mut key = [0u8; 16];
        for i in 0..16 {
            key[i] = self.chain.master_key[i] ^ CHALLENGE_SECRET[i];
        }
        let aes = Aes::new(&key);

        while let Some((node, block)) = self.challenges.pop_front() {
            debug!("[KM] solving challenge for node {node}");
            let mut out = [0u8; 16];
            aes.encrypt_block(&mut out, &block);
            // Only the first 8 response bytes fit the response element.
            let mut response = [0u8; 8];
            response.copy_from_slice(&out[..8]);
            result.push(DownlinkElement::Response {
                node_id: node,
                response,
            });
            secure_clear(&mut out);
            if result.len() >= MAX_SOLVES_PER_SLOT {
                break;
            }
        }
        secure_clear(&mut key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn manager(rekey_period: u32) -> MasterKeyManager {
        let cfg = Arc::new(NetworkConfig::base(0, 6, 16));
        let mgr = Arc::new(StreamManager::new(cfg, 0));
        MasterKeyManager::new(mgr, rekey_period)
    }

    #[test]
    fn starts_connected_at_index_zero() {
        let km = manager(0);
        assert_eq!(km.status(), KeyManagerStatus::Connected);
        assert_eq!(km.master_index(), 0);
    }

    #[test]
    fn rekeying_advances_index() {
        let mut km = manager(0);
        let key0 = km.master_key();
        km.start_rekeying();
        assert_eq!(km.status(), KeyManagerStatus::Rekeying);
        // Index is reported from the still-active generation.
        assert_eq!(km.master_index(), 0);
        km.apply_rekeying();
        assert_eq!(km.status(), KeyManagerStatus::Connected);
        assert_eq!(km.master_index(), 1);
        assert_ne!(km.master_key(), key0);
    }

    #[test]
    fn periodic_update_triggers_rotation() {
        let mut km = manager(2);
        assert!(!km.periodic_update());
        assert_eq!(km.status(), KeyManagerStatus::Connected);
        assert!(!km.periodic_update());
        // Second period boundary: rotation starts.
        assert_eq!(km.status(), KeyManagerStatus::Rekeying);
        // With no streams to rekey, the next tick commits.
        assert!(!km.periodic_update());
        assert_eq!(km.status(), KeyManagerStatus::Connected);
        assert_eq!(km.master_index(), 1);
    }

    #[test]
    fn challenge_queue_updates_in_place() {
        let mut km = manager(0);
        km.enqueue_challenge(StreamManagementElement::make_challenge(3, [1, 2, 3, 4]));
        km.enqueue_challenge(StreamManagementElement::make_challenge(3, [5, 6, 7, 8]));
        km.enqueue_challenge(StreamManagementElement::make_challenge(4, [9, 9, 9, 9]));
        assert!(km.challenges_present());
        let responses = km.solve_challenges();
        assert_eq!(responses.len(), 2);
        assert!(!km.challenges_present());
    }

    #[test]
    fn responses_depend_on_challenge() {
        let mut km = manager(0);
        km.enqueue_challenge(StreamManagementElement::make_challenge(3, [1, 2, 3, 4]));
        let a = km.solve_challenges();
        km.enqueue_challenge(StreamManagementElement::make_challenge(3, [1, 2, 3, 5]));
        let b = km.solve_challenges();
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic]
    fn double_start_rekeying_asserts() {
        let mut km = manager(0);
        km.start_rekeying();
        km.start_rekeying();
    }
}
