//! Hash-chain key management.
//!
//! A 128-bit master key `K0` is hardcoded (provisioning placeholder). The
//! key at index `i` is `K_i = MP(K_{i-1})` with a fixed public IV; the
//! master index tracks `i` and is carried in every timesync beacon. All
//! per-phase keys (timesync, uplink, downlink) and the per-stream
//! derivation IV are single-block MP digests of the current master key,
//! each with its own public IV.
//!
//! Illegal state transitions are programming errors and assert: safety
//! before availability.

pub mod dynamic;
pub mod master;

pub use dynamic::DynamicKeyManager;
pub use master::MasterKeyManager;

use super::hash::SingleBlockMpHash;
use super::ocb::AesOcb;
use super::utils::secure_clear;
use crate::schedule::DownlinkElement;
use crate::stream::StreamManagementElement;

/// Value of the first master key. SECRET; hardcoding it is a provisioning
/// placeholder.
pub(crate) const MASTER_KEY: [u8; 16] = [
    0x4d, 0x69, 0x6c, 0x6c, 0x6f, 0x63, 0x61, 0x74, 0x4d, 0x69, 0x6c, 0x6c, 0x6f, 0x63, 0x61,
    0x74,
];

/// Secret combined in XOR with the master key for challenge responses:
/// `response = AES(masterKey ^ CHALLENGE_SECRET, challenge)`.
pub(crate) const CHALLENGE_SECRET: [u8; 16] = [
    0x51, 0x75, 0x65, 0x53, 0x74, 0x61, 0x20, 0x45, 0x20, 0x62, 0x65, 0x4e, 0x7a, 0x69, 0x6e,
    0x41,
];

// The derivation IVs are arbitrary public constants.
pub(crate) const MASTER_ROTATION_IV: [u8; 16] = [
    0x6d, 0x61, 0x73, 0x74, 0x65, 0x72, 0x49, 0x56, 0x6d, 0x61, 0x73, 0x74, 0x65, 0x72, 0x49,
    0x56,
];
pub(crate) const TIMESYNC_DERIVATION_IV: [u8; 16] = [
    0x54, 0x69, 0x4d, 0x65, 0x53, 0x79, 0x4e, 0x63, 0x74, 0x49, 0x6d, 0x45, 0x73, 0x59, 0x6e,
    0x43,
];
pub(crate) const DOWNLINK_DERIVATION_IV: [u8; 16] = [
    0x44, 0x6f, 0x57, 0x6e, 0x4c, 0x69, 0x4e, 0x6b, 0x64, 0x4f, 0x77, 0x4e, 0x6c, 0x49, 0x6e,
    0x4b,
];
pub(crate) const UPLINK_DERIVATION_IV: [u8; 16] = [
    0x55, 0x70, 0x4c, 0x69, 0x6e, 0x6b, 0x49, 0x76, 0x55, 0x70, 0x4c, 0x69, 0x6e, 0x6b, 0x49,
    0x76,
];
pub(crate) const STREAM_DERIVATION_IV: [u8; 16] = [
    0x73, 0x54, 0x72, 0x45, 0x61, 0x4d, 0x6d, 0x41, 0x6e, 0x61, 0x47, 0x65, 0x72, 0x49, 0x76,
    0x30,
];

/// State of a key manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyManagerStatus {
    Disconnected,
    /// Keys advanced to the beacon's index, master identity unverified.
    MasterUntrusted,
    /// Rekeying while the master is still unverified.
    RekeyingUntrusted,
    Connected,
    /// A rotation is precomputed but not yet committed.
    Rekeying,
    /// Ephemeral: the master's index advanced by one while connected; the
    /// advance commits or rolls back within the same timesync slot.
    Advancing,
}

/// Keys, derivation hashes and phase ciphers common to both roles.
pub(crate) struct KeyChain {
    pub master_key: [u8; 16],
    pub next_master_key: [u8; 16],
    pub master_index: u32,
    pub next_master_index: u32,

    pub master_hash: SingleBlockMpHash,
    timesync_hash: SingleBlockMpHash,
    downlink_hash: SingleBlockMpHash,
    uplink_hash: SingleBlockMpHash,
    stream_hash: SingleBlockMpHash,

    pub timesync_ocb: AesOcb,
    pub uplink_ocb: AesOcb,
    pub downlink_ocb: AesOcb,

    next_timesync_key: [u8; 16],
    next_uplink_key: [u8; 16],
    next_downlink_key: [u8; 16],
}

impl KeyChain {
    /// Load `K0` and derive the initial phase keys (reboot: the master
    /// index always restarts from zero; it is not persisted).
    pub fn new() -> Self {
        let mut chain = Self {
            master_key: MASTER_KEY,
            next_master_key: [0; 16],
            master_index: 0,
            next_master_index: 0,
            master_hash: SingleBlockMpHash::new(&MASTER_ROTATION_IV),
            timesync_hash: SingleBlockMpHash::new(&TIMESYNC_DERIVATION_IV),
            downlink_hash: SingleBlockMpHash::new(&DOWNLINK_DERIVATION_IV),
            uplink_hash: SingleBlockMpHash::new(&UPLINK_DERIVATION_IV),
            stream_hash: SingleBlockMpHash::new(&STREAM_DERIVATION_IV),
            timesync_ocb: AesOcb::zeroed(),
            uplink_ocb: AesOcb::zeroed(),
            downlink_ocb: AesOcb::zeroed(),
            next_timesync_key: [0; 16],
            next_uplink_key: [0; 16],
            next_downlink_key: [0; 16],
        };
        chain.rekey_phase_ciphers_from_master();
        chain
    }

    /// Derive all phase keys from `key` and rekey the phase ciphers.
    pub fn rekey_phase_ciphers(&mut self, key: &[u8; 16]) {
        let mut k = [0u8; 16];
        self.timesync_hash.digest_block(&mut k, key);
        self.timesync_ocb.rekey(&k);
        self.uplink_hash.digest_block(&mut k, key);
        self.uplink_ocb.rekey(&k);
        self.downlink_hash.digest_block(&mut k, key);
        self.downlink_ocb.rekey(&k);
        secure_clear(&mut k);
    }

    pub fn rekey_phase_ciphers_from_master(&mut self) {
        let key = self.master_key;
        self.rekey_phase_ciphers(&key);
    }

    /// Rekey the timesync cipher only (used by the ephemeral advance).
    pub fn rekey_timesync_cipher(&mut self, key: &[u8; 16]) {
        let mut k = [0u8; 16];
        self.timesync_hash.digest_block(&mut k, key);
        self.timesync_ocb.rekey(&k);
        secure_clear(&mut k);
    }

    /// One hash-chain step: `MP(key)`.
    pub fn chain_step(&self, key: &[u8; 16]) -> [u8; 16] {
        let mut next = [0u8; 16];
        self.master_hash.digest_block(&mut next, key);
        next
    }

    /// Precompute the next keys from `from`, filling the `next_*` fields.
    pub fn prepare_next_keys(&mut self, from: &[u8; 16], from_index: u32) {
        self.next_master_key = self.chain_step(from);
        self.next_master_index = from_index + 1;
        let next = self.next_master_key;
        self.timesync_hash.digest_block(&mut self.next_timesync_key, &next);
        self.uplink_hash.digest_block(&mut self.next_uplink_key, &next);
        self.downlink_hash.digest_block(&mut self.next_downlink_key, &next);
    }

    /// Commit the precomputed next keys into the phase ciphers.
    pub fn apply_next_keys(&mut self) {
        let t = self.next_timesync_key;
        let u = self.next_uplink_key;
        let d = self.next_downlink_key;
        self.timesync_ocb.rekey(&t);
        self.uplink_ocb.rekey(&u);
        self.downlink_ocb.rekey(&d);
    }

    /// First-block digest of the per-stream key derivation chain,
    /// `MP_stream(masterKey)`; the stream manager caches it so only the
    /// second block is evaluated per stream.
    pub fn stream_key_iv(&self, master_key: &[u8; 16]) -> [u8; 16] {
        let mut iv = [0u8; 16];
        self.stream_hash.digest_block(&mut iv, master_key);
        iv
    }
}

impl Drop for KeyChain {
    fn drop(&mut self) {
        secure_clear(&mut self.master_key);
        secure_clear(&mut self.next_master_key);
        secure_clear(&mut self.next_timesync_key);
        secure_clear(&mut self.next_uplink_key);
        secure_clear(&mut self.next_downlink_key);
    }
}

/// Key management operations used by the MAC phases. Master and dynamic
/// nodes implement the same capability set; calls that make no sense for a
/// role assert, matching the strictly-typed transition contract.
pub trait KeyManager: Send {
    fn status(&self) -> KeyManagerStatus;

    /// Current master index, per role status.
    fn master_index(&self) -> u32;

    /// Current master key (the trusted or tentatively-advanced one,
    /// depending on status).
    fn master_key(&self) -> [u8; 16];

    fn timesync_ocb(&mut self) -> &mut AesOcb;
    fn uplink_ocb(&mut self) -> &mut AesOcb;
    fn downlink_ocb(&mut self) -> &mut AesOcb;

    /// Precompute the next chain step without applying it.
    fn start_rekeying(&mut self);

    /// Rotate to the precomputed chain step.
    fn apply_rekeying(&mut self);

    fn rekeying_in_progress(&self) -> bool {
        matches!(
            self.status(),
            KeyManagerStatus::Rekeying | KeyManagerStatus::RekeyingUntrusted
        )
    }

    /// Per-timesync bookkeeping (challenge resend and timeout on dynamic
    /// nodes). Returns true when the node must desynchronize.
    fn periodic_update(&mut self) -> bool;

    fn desync(&mut self) {}

    // --- Dynamic-node resync flow ---

    /// Advance the chain to `new_index` if acceptable; enters
    /// MasterUntrusted on success.
    fn attempt_resync(&mut self, _new_index: u32) -> bool {
        false
    }

    /// One more chain step while resyncing (beacon index moved again).
    fn advance_resync(&mut self) {}

    fn rollback_resync(&mut self) {}

    fn commit_resync(&mut self) {}

    // --- Dynamic-node connected advance (hot rekeying) ---

    fn attempt_advance(&mut self) {}

    fn commit_advance(&mut self) {}

    fn rollback_advance(&mut self) {}

    // --- Challenge-response ---

    /// Dynamic node: enqueue a challenge SME toward the master.
    fn send_challenge(&mut self) {}

    /// Dynamic node: verify a challenge response from the downlink.
    fn verify_response(&mut self, _element: &DownlinkElement) -> bool {
        false
    }

    /// Master: are there challenges waiting to be solved?
    fn challenges_present(&self) -> bool {
        false
    }

    /// Master: queue a received challenge SME.
    fn enqueue_challenge(&mut self, _sme: StreamManagementElement) {}

    /// Master: solve queued challenges, bounded per downlink slot.
    fn solve_challenges(&mut self) -> Vec<DownlinkElement> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aead;

    #[test]
    fn chain_steps_are_deterministic_and_distinct() {
        let chain = KeyChain::new();
        let k1 = chain.chain_step(&MASTER_KEY);
        let k1b = chain.chain_step(&MASTER_KEY);
        let k2 = chain.chain_step(&k1);
        assert_eq!(k1, k1b);
        assert_ne!(k1, MASTER_KEY);
        assert_ne!(k2, k1);
    }

    #[test]
    fn phase_keys_differ_per_phase() {
        let chain = KeyChain::new();
        let mut t = [0u8; 16];
        let mut u = [0u8; 16];
        let mut d = [0u8; 16];
        chain.timesync_hash.digest_block(&mut t, &MASTER_KEY);
        chain.uplink_hash.digest_block(&mut u, &MASTER_KEY);
        chain.downlink_hash.digest_block(&mut d, &MASTER_KEY);
        assert_ne!(t, u);
        assert_ne!(u, d);
        assert_ne!(t, d);
    }

    #[test]
    fn prepare_and_apply_next_keys() {
        let mut chain = KeyChain::new();
        let master = chain.master_key;
        chain.prepare_next_keys(&master, 0);
        assert_eq!(chain.next_master_index, 1);
        assert_eq!(chain.next_master_key, chain.chain_step(&master));

        // After applying, the timesync cipher matches a fresh derivation
        // from the next master key.
        chain.apply_next_keys();
        let mut expect = KeyChain::new();
        let next = chain.next_master_key;
        expect.rekey_phase_ciphers(&next);

        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        chain.timesync_ocb.set_nonce(1, 1, 1);
        expect.timesync_ocb.set_nonce(1, 1, 1);
        let ta = chain.timesync_ocb.encrypt_in_place(&mut a, b"x");
        let tb = expect.timesync_ocb.encrypt_in_place(&mut b, b"x");
        assert_eq!(ta, tb);
    }
}
