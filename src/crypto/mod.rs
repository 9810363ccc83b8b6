//! Cryptographic primitives and key management.
//!
//! Everything is built on a software AES-128 core: ECB and CTR modes,
//! the Miyaguchi–Preneel single-block hash used for the master key chain
//! and per-phase key derivation, and two interchangeable authenticated
//! encryption modes (GCM and OCB3) behind the [`Aead`] seam.
//!
//! Replay resistance is structural: every authenticated packet implicitly
//! covers a 128-bit slotInfo block encoding
//! `(masterIndex, tileOrFrameNumber, sequenceNumber)`, so a packet is bound
//! to its time slot, sequence number and key generation.

pub mod aes;
pub mod gcm;
pub mod hash;
pub mod iv;
pub mod keys;
pub mod ocb;
pub mod utils;

pub use aes::Aes;
pub use gcm::AesGcm;
pub use hash::{MpHash, SingleBlockMpHash};
pub use iv::Iv;
pub use ocb::AesOcb;

/// Authenticated encryption over one radio frame.
///
/// Implementations keep the current nonce/slotInfo as internal state, set
/// via their `set_nonce` method before each frame; both directions cover
/// the slotInfo block in the tag whether or not any explicit data is
/// passed.
pub trait Aead {
    /// Bind the next frame to its slot: `(masterIndex, tileOrFrameNumber,
    /// sequenceNumber)` become the slotInfo block and the nonce.
    fn set_nonce(&mut self, tile_or_frame: u32, sequence: u64, master_index: u32);

    /// Encrypt `data` in place (may be empty for authenticate-only use)
    /// and return the tag over slotInfo, `aad` and the ciphertext.
    fn encrypt_in_place(&mut self, data: &mut [u8], aad: &[u8]) -> [u8; 16];

    /// Verify `tag` and decrypt `data` in place. Returns false on tag
    /// mismatch; callers must treat the frame as not received.
    fn decrypt_in_place(&mut self, data: &mut [u8], aad: &[u8], tag: &[u8; 16]) -> bool;
}
