//! Fuzz target: authenticated decryption.
//!
//! Forged ciphertexts and tags must never panic either AEAD mode, and a
//! random forgery must (for all practical purposes) never verify.
//!
//! cargo fuzz run fuzz_aead_decrypt

#![no_main]

use libfuzzer_sys::fuzz_target;
use tdmh::crypto::{Aead, AesGcm, AesOcb};

fuzz_target!(|data: &[u8]| {
    if data.len() < 16 || data.len() > 125 {
        return;
    }
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&data[data.len() - 16..]);
    let mut payload = data[..data.len() - 16].to_vec();

    let mut gcm = AesGcm::new(&[7u8; 16]);
    gcm.set_nonce(1, 2, 3);
    assert!(!gcm.decrypt_in_place(&mut payload.clone(), b"ad", &tag));

    let mut ocb = AesOcb::new(&[7u8; 16]);
    ocb.set_nonce(1, 2, 3);
    assert!(!ocb.decrypt_in_place(&mut payload, b"ad", &tag));
});
