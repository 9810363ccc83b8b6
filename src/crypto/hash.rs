//! Miyaguchi–Preneel hashing over AES-128.
//!
//! `H_i = E(H_{i-1}, m_i) ^ H_{i-1} ^ m_i`, with a public IV as `H_0`.
//! The chained variant digests multi-block messages (per-stream keys are a
//! two-block chain over master key and stream id); the single-block variant
//! is the hash-chain step and per-phase key derivation, where the IV never
//! changes between digests.

use super::aes::Aes;
use super::utils::{secure_clear, xor_in_place};

/// Chained Miyaguchi–Preneel hash: each digested block advances the state.
pub struct MpHash {
    iv: [u8; 16],
    state: [u8; 16],
    aes: Aes,
}

impl MpHash {
    pub fn new(iv: &[u8; 16]) -> Self {
        Self {
            iv: *iv,
            state: *iv,
            aes: Aes::new(iv),
        }
    }

    /// Change IV and reset the chain.
    pub fn set_iv(&mut self, iv: &[u8; 16]) {
        self.iv = *iv;
        self.reset();
    }

    /// Restart the chain from the IV.
    pub fn reset(&mut self) {
        self.state = self.iv;
        self.aes.rekey(&self.iv);
    }

    /// Digest one 16-byte block, writing the updated state to `hash`.
    pub fn digest_block(&mut self, hash: &mut [u8; 16], data: &[u8; 16]) {
        let mut buffer = [0u8; 16];
        self.aes.encrypt_block(&mut buffer, data);
        xor_in_place(&mut self.state, &buffer);
        xor_in_place(&mut self.state, data);
        self.aes.rekey(&self.state);
        *hash = self.state;
        secure_clear(&mut buffer);
    }
}

/// Single-block Miyaguchi–Preneel hash: every digest starts from the IV, so
/// the AES key is fixed for the lifetime of the object.
pub struct SingleBlockMpHash {
    iv: [u8; 16],
    aes: Aes,
}

impl SingleBlockMpHash {
    pub fn new(iv: &[u8; 16]) -> Self {
        Self {
            iv: *iv,
            aes: Aes::new(iv),
        }
    }

    pub fn set_iv(&mut self, iv: &[u8; 16]) {
        self.iv = *iv;
        self.aes.rekey(iv);
    }

    /// `hash = E(iv, data) ^ iv ^ data`.
    pub fn digest_block(&self, hash: &mut [u8; 16], data: &[u8; 16]) {
        let mut buffer = [0u8; 16];
        self.aes.encrypt_block(&mut buffer, data);
        xor_in_place(&mut buffer, &self.iv);
        for i in 0..16 {
            hash[i] = buffer[i] ^ data[i];
        }
        secure_clear(&mut buffer);
    }
}
