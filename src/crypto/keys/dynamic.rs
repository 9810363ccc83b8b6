//! Dynamic-node key manager.
//!
//! Tracks the master's hash chain from the index carried in timesync
//! beacons. Resync tentatively advances the chain (at most
//! `MAX_INDEX_DELTA` steps), switching to MasterUntrusted until either the
//! challenge-response handshake or plain beacon verification commits the
//! new generation. A one-step advance while connected is handled by the
//! ephemeral Advancing state within a single timesync slot.

use std::sync::Arc;

use log::{debug, warn};

use super::{KeyChain, KeyManager, KeyManagerStatus, CHALLENGE_SECRET};
use crate::crypto::aes::Aes;
use crate::crypto::ocb::AesOcb;
use crate::crypto::utils::{ct_eq, fill_random, secure_clear};
use crate::schedule::DownlinkElement;
use crate::stream::{StreamManagementElement, StreamManager};

/// Maximum chain advancement accepted in a single resync attempt.
const MAX_INDEX_DELTA: u32 = 470_000;

pub struct DynamicKeyManager {
    chain: KeyChain,
    status: KeyManagerStatus,
    stream_mgr: Arc<StreamManager>,
    my_id: u8,

    /// Tentative key/index, committed only after verification.
    temp_master_key: [u8; 16],
    temp_master_index: u32,

    do_challenge_response: bool,
    challenge_timeout: u32,
    /// Resend cadence, sized so the challenge goes out three times before
    /// the timeout fires.
    chal_resend_timeout: u32,
    chal_resend_ctr: u32,
    chal_timeout_ctr: u32,
    /// Set when a response failed verification; the next periodic update
    /// reports a forced desync.
    force_desync: bool,
    /// Last challenge sent, meaningful while MasterUntrusted.
    challenge: [u8; 4],
}

impl DynamicKeyManager {
    pub fn new(
        stream_mgr: Arc<StreamManager>,
        my_id: u8,
        do_challenge_response: bool,
        challenge_timeout: u32,
    ) -> Self {
        let chain = KeyChain::new();
        stream_mgr.set_stream_key_iv(chain.stream_key_iv(&chain.master_key));
        Self {
            chain,
            status: KeyManagerStatus::Disconnected,
            stream_mgr,
            my_id,
            temp_master_key: [0; 16],
            temp_master_index: 0,
            do_challenge_response,
            challenge_timeout,
            chal_resend_timeout: (challenge_timeout / 5) * 2,
            chal_resend_ctr: 0,
            chal_timeout_ctr: 0,
            force_desync: false,
            challenge: [0; 4],
        }
    }

    fn enqueue_challenge_sme(&mut self) {
        self.stream_mgr
            .enqueue_sme(StreamManagementElement::make_challenge(
                self.my_id,
                self.challenge,
            ));
        self.chal_timeout_ctr = 0;
        self.chal_resend_ctr = 0;
    }

    fn resend_challenge(&mut self) {
        debug!("[KM] N={} resending challenge", self.my_id);
        self.stream_mgr
            .enqueue_sme(StreamManagementElement::make_challenge(
                self.my_id,
                self.challenge,
            ));
    }
}

impl KeyManager for DynamicKeyManager {
    fn status(&self) -> KeyManagerStatus {
        self.status
    }

    fn master_index(&self) -> u32 {
        match self.status {
            KeyManagerStatus::Disconnected
            | KeyManagerStatus::Connected
            | KeyManagerStatus::Rekeying => self.chain.master_index,
            KeyManagerStatus::MasterUntrusted
            | KeyManagerStatus::RekeyingUntrusted
            | KeyManagerStatus::Advancing => self.temp_master_index,
        }
    }

    fn master_key(&self) -> [u8; 16] {
        match self.status {
            KeyManagerStatus::Disconnected
            | KeyManagerStatus::Connected
            | KeyManagerStatus::Rekeying => self.chain.master_key,
            KeyManagerStatus::MasterUntrusted
            | KeyManagerStatus::RekeyingUntrusted
            | KeyManagerStatus::Advancing => self.temp_master_key,
        }
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
        match self.status {
            KeyManagerStatus::MasterUntrusted => {
                let from = self.temp_master_key;
                let index = self.temp_master_index;
                self.chain.prepare_next_keys(&from, index);
                self.status = KeyManagerStatus::RekeyingUntrusted;
            }
            KeyManagerStatus::Connected => {
                let from = self.chain.master_key;
                let index = self.chain.master_index;
                self.chain.prepare_next_keys(&from, index);
                self.status = KeyManagerStatus::Rekeying;
                let next = self.chain.next_master_key;
                self.stream_mgr.start_rekeying(self.chain.stream_key_iv(&next));
            }
            _ => panic!("unexpected call to start_rekeying"),
        }
        debug!("[KM] N={} starting rekeying", self.my_id);
    }

    fn apply_rekeying(&mut self) {
        match self.status {
            KeyManagerStatus::RekeyingUntrusted => {
                self.temp_master_index = self.chain.next_master_index;
                self.temp_master_key = self.chain.next_master_key;
                self.status = KeyManagerStatus::MasterUntrusted;
            }
            KeyManagerStatus::Rekeying => {
                self.chain.master_index = self.chain.next_master_index;
                self.chain.master_key = self.chain.next_master_key;
                self.status = KeyManagerStatus::Connected;
            }
            _ => panic!("unexpected call to apply_rekeying"),
        }
        debug!("[KM] N={} applying rekeying", self.my_id);
        self.chain.apply_next_keys();
    }

    fn periodic_update(&mut self) -> bool {
        // A failed response verification forces the next desync.
        if self.force_desync {
            self.chal_resend_ctr = 0;
            self.chal_timeout_ctr = 0;
            self.force_desync = false;
            return true;
        }
        if !self.do_challenge_response
            || !matches!(
                self.status,
                KeyManagerStatus::MasterUntrusted | KeyManagerStatus::RekeyingUntrusted
            )
        {
            return false;
        }
        self.chal_resend_ctr += 1;
        self.chal_timeout_ctr += 1;
        if self.chal_resend_ctr >= self.chal_resend_timeout {
            self.chal_resend_ctr = 0;
            self.resend_challenge();
            false
        } else if self.chal_timeout_ctr >= self.challenge_timeout {
            debug!("[KM] N={} challenge timeout", self.my_id);
            self.chal_resend_ctr = 0;
            self.chal_timeout_ctr = 0;
            self.rollback_resync();
            true
        } else {
            false
        }
    }

    fn desync(&mut self) {
        self.status = KeyManagerStatus::Disconnected;
        // Back to the last committed generation.
        self.chain.rekey_phase_ciphers_from_master();
    }

    fn attempt_resync(&mut self, new_index: u32) -> bool {
        if self.status != KeyManagerStatus::Disconnected {
            return false;
        }
        if new_index < self.chain.master_index {
            return false;
        }
        if new_index - self.chain.master_index > MAX_INDEX_DELTA {
            return false;
        }

        self.temp_master_key = self.chain.master_key;
        for _ in self.chain.master_index..new_index {
            self.temp_master_key = self.chain.chain_step(&self.temp_master_key);
        }
        self.temp_master_index = new_index;

        debug!("[KM] N={} attempting resync at index {new_index}", self.my_id);
        self.status = KeyManagerStatus::MasterUntrusted;
        self.stream_mgr.untrust_master();

        let temp = self.temp_master_key;
        self.chain.rekey_phase_ciphers(&temp);
        true
    }

    fn advance_resync(&mut self) {
        if self.status != KeyManagerStatus::MasterUntrusted {
            self.status = KeyManagerStatus::Disconnected;
            return;
        }
        debug!("[KM] N={} advancing resync", self.my_id);
        self.temp_master_key = self.chain.chain_step(&self.temp_master_key);
        self.temp_master_index += 1;
        let temp = self.temp_master_key;
        self.chain.rekey_phase_ciphers(&temp);
    }

    fn rollback_resync(&mut self) {
        debug!("[KM] N={} aborting resync", self.my_id);
        self.status = KeyManagerStatus::Disconnected;
        self.stream_mgr.untrust_master();
        self.chain.rekey_phase_ciphers_from_master();
    }

    fn commit_resync(&mut self) {
        match self.status {
            KeyManagerStatus::MasterUntrusted => self.status = KeyManagerStatus::Connected,
            KeyManagerStatus::RekeyingUntrusted => self.status = KeyManagerStatus::Rekeying,
            _ => {
                self.status = KeyManagerStatus::Disconnected;
                self.stream_mgr.untrust_master();
                return;
            }
        }
        debug!("[KM] N={} committing resync", self.my_id);
        self.chain.master_key = self.temp_master_key;
        self.chain.master_index = self.temp_master_index;
        let master = self.chain.master_key;
        self.stream_mgr.set_stream_key_iv(self.chain.stream_key_iv(&master));
        self.stream_mgr.trust_master();
    }

    fn attempt_advance(&mut self) {
        if self.status != KeyManagerStatus::Connected {
            return;
        }
        debug!("[KM] N={} attempting advance", self.my_id);
        // Only the timesync phase runs while ADVANCING, so only the
        // timesync key is derived here; the rest follows on commit.
        self.temp_master_key = self.chain.chain_step(&self.chain.master_key);
        self.temp_master_index = self.chain.master_index + 1;
        self.status = KeyManagerStatus::Advancing;
        let temp = self.temp_master_key;
        self.chain.rekey_timesync_cipher(&temp);
    }

    fn commit_advance(&mut self) {
        if self.status != KeyManagerStatus::Advancing {
            return;
        }
        debug!("[KM] N={} committing advance", self.my_id);
        self.chain.master_key = self.temp_master_key;
        self.chain.master_index = self.temp_master_index;
        self.status = KeyManagerStatus::Connected;
        // Timesync is already on the new generation.
        let master = self.chain.master_key;
        self.chain.rekey_phase_ciphers(&master);
        self.stream_mgr.start_rekeying(self.chain.stream_key_iv(&master));
    }

    fn rollback_advance(&mut self) {
        if self.status != KeyManagerStatus::Advancing {
            return;
        }
        debug!("[KM] N={} rolling back advance", self.my_id);
        self.status = KeyManagerStatus::Connected;
        let master = self.chain.master_key;
        self.chain.rekey_timesync_cipher(&master);
    }

    fn send_challenge(&mut self) {
        assert!(
            matches!(
                self.status,
                KeyManagerStatus::MasterUntrusted | KeyManagerStatus::RekeyingUntrusted
            ),
            "unexpected call to send_challenge"
        );
        if !self.do_challenge_response {
            return;
        }
        debug!("[KM] N={} sending challenge SME", self.my_id);
        fill_random(&mut self.challenge);
        self.enqueue_challenge_sme();
    }

    fn verify_response(&mut self, element: &DownlinkElement) -> bool {
        let DownlinkElement::Response { node_id, response } = element else {
            return false;
        };
        if *node_id != self.my_id {
            return false;
        }
        if !matches!(
            self.status,
            KeyManagerStatus::MasterUntrusted | KeyManagerStatus::RekeyingUntrusted
        ) {
            return false;
        }

        let mut key = [0u8; 16];
        for i in 0..16 {
            key[i] = self.temp_master_key[i] ^ CHALLENGE_SECRET[i];
        }
        let aes = Aes::new(&key);
        let mut block = [0u8; 16];
        block[..4].copy_from_slice(&self.challenge);
        let mut expected = [0u8; 16];
        aes.encrypt_block(&mut expected, &block);
        let valid = ct_eq(&expected[..8], response);
        secure_clear(&mut key);
        secure_clear(&mut expected);

        if valid {
            debug!("[KM] N={} challenge response verified", self.my_id);
            self.commit_resync();
        } else {
            warn!("[KM] N={} challenge response invalid", self.my_id);
            self.force_desync = true;
        }
        valid
    }
}
