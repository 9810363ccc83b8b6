//! AES-128 Galois/Counter Mode (NIST SP 800-38D) authenticated encryption.
//!
//! One deliberate difference from the standard: instead of expanding a
//! variable-length IV into the 128-bit counter start J0 via GHASH, J0 is
//! computed directly as `AES(K, slotInfo)`. The slotInfo block — master
//! index, tile or frame number, sequence number — is also the first block
//! digested into the tag, so every frame is implicitly bound to its time
//! slot and key generation.

use super::aes::Aes;
use super::iv::Iv;
use super::utils::{ct_eq, secure_clear, xor_in_place};
use super::Aead;

const BLOCK_SIZE: usize = 16;

pub struct AesGcm {
    aes: Aes,
    /// GHASH key, `AES(K, 0)`.
    h: [u8; 16],
    /// Implicitly authenticated block, never on air.
    slot_info: [u8; 16],
    /// Counter start J0.
    iv: Iv,
}

impl AesGcm {
    pub fn new(key: &[u8; 16]) -> Self {
        let aes = Aes::new(key);
        let mut h = [0u8; 16];
        aes.encrypt_block(&mut h, &[0u8; 16]);
        Self {
            aes,
            h,
            slot_info: [0; 16],
            iv: Iv::zero(),
        }
    }

    /// Change key and the key-dependent GHASH constant.
    pub fn rekey(&mut self, key: &[u8; 16]) {
        self.aes.rekey(key);
        self.aes.encrypt_block(&mut self.h, &[0u8; 16]);
    }

    /// Bind the next frame to its slot: sets slotInfo and derives the
    /// counter start as `AES(K, slotInfo)`.
    pub fn set_nonce(&mut self, tile_or_frame: u32, sequence: u64, master_index: u32) {
        self.slot_info[0..4].copy_from_slice(&master_index.to_le_bytes());
        self.slot_info[4..8].copy_from_slice(&tile_or_frame.to_le_bytes());
        self.slot_info[8..16].copy_from_slice(&sequence.to_le_bytes());
        self.derive_iv();
    }

    fn derive_iv(&mut self) {
        let mut iv_data = [0u8; 16];
        self.aes.encrypt_block(&mut iv_data, &self.slot_info);
        self.iv = Iv::new(iv_data);
        secure_clear(&mut iv_data);
    }

    /// Testing hook: set the slotInfo block directly.
    #[cfg(test)]
    pub(crate) fn set_slot_info_raw(&mut self, data: [u8; 16]) {
        self.slot_info = data;
    }

    /// Testing hook: set the counter start directly.
    #[cfg(test)]
    pub(crate) fn set_iv_raw(&mut self, iv: Iv) {
        self.iv = iv;
    }

    fn ghash_blocks(&self, tag: &mut [u8; 16], data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            let n = BLOCK_SIZE.min(data.len() - i);
            for j in 0..n {
                tag[j] ^= data[i + j];
            }
            self.mult_h(tag);
            i += n;
        }
    }

    /// Multiplication by H in GF(2^128), bit-serial and branch-free.
    fn mult_h(&self, x: &mut [u8; 16]) {
        const R: u8 = 0xe1;
        let mut z = [0u8; 16];
        let mut v = *x;
        for i in 0..128 {
            let bit = (self.h[i / 8] >> (7 - i % 8)) & 1;
            let mask = 0u8.wrapping_sub(bit);
            for j in 0..16 {
                z[j] ^= mask & v[j];
            }
            let carry = 0u8.wrapping_sub(v[15] & 1);
            right_shift(&mut v);
            v[0] ^= carry & R;
        }
        *x = z;
    }

    fn length_block(aad_len: usize, crypt_len: usize) -> [u8; 16] {
        // Authenticated-only length always includes the slotInfo block.
        let mut block = [0u8; 16];
        let auth_bits = (8 * (aad_len + BLOCK_SIZE)) as u64;
        let crypt_bits = (8 * crypt_len) as u64;
        block[0..8].copy_from_slice(&auth_bits.to_be_bytes());
        block[8..16].copy_from_slice(&crypt_bits.to_be_bytes());
        block
    }

    fn compute_tag(&mut self, data: &[u8], aad: &[u8]) -> [u8; 16] {
        let mut first_ectr = [0u8; 16];
        self.aes.encrypt_block(&mut first_ectr, self.iv.as_bytes());

        let mut tag = self.slot_info;
        self.mult_h(&mut tag);
        self.ghash_blocks(&mut tag, aad);
        self.ghash_blocks(&mut tag, data);
        let len_block = Self::length_block(aad.len(), data.len());
        xor_in_place(&mut tag, &len_block);
        self.mult_h(&mut tag);
        xor_in_place(&mut tag, &first_ectr);
        secure_clear(&mut first_ectr);
        tag
    }
}

impl Aead for AesGcm {
    fn set_nonce(&mut self, tile_or_frame: u32, sequence: u64, master_index: u32) {
        AesGcm::set_nonce(self, tile_or_frame, sequence, master_index);
    }

    fn encrypt_in_place(&mut self, data: &mut [u8], aad: &[u8]) -> [u8; 16] {
        if !data.is_empty() {
            self.aes.ctr_xcrypt(&self.iv.next(), data);
        }
        self.compute_tag(data, aad)
    }

    fn decrypt_in_place(&mut self, data: &mut [u8], aad: &[u8], tag: &[u8; 16]) -> bool {
        let expected = self.compute_tag(data, aad);
        if !data.is_empty() {
            self.aes.ctr_xcrypt(&self.iv.next(), data);
        }
        ct_eq(&expected, tag)
    }
}

fn right_shift(buf: &mut [u8; 16]) {
    let mut carry = 0u8;
    for b in buf.iter_mut() {
        let next = (*b & 1) << 7;
        *b = (*b >> 1) | carry;
        carry = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answer_nist_case_4() {
        // NIST GCM test case 4, with Y0 given directly (the standard's IV
        // expansion is not implemented). The first 16 bytes of the standard
        // AAD play the role of the slotInfo block.
        let key = [
            0xfe, 0xff, 0xe9, 0x92, 0x86, 0x65, 0x73, 0x1c, 0x6d, 0x6a, 0x8f, 0x94, 0x67, 0x30,
            0x83, 0x08,
        ];
        let y0 = [
            0xca, 0xfe, 0xba, 0xbe, 0xfa, 0xce, 0xdb, 0xad, 0xde, 0xca, 0xf8, 0x88, 0x00, 0x00,
            0x00, 0x01,
        ];
        let slot = [
            0xfe, 0xed, 0xfa, 0xce, 0xde, 0xad, 0xbe, 0xef, 0xfe, 0xed, 0xfa, 0xce, 0xde, 0xad,
            0xbe, 0xef,
        ];
        let aad = [0xab, 0xad, 0xda, 0xd2];
        let mut data = [
            0xd9, 0x31, 0x32, 0x25, 0xf8, 0x84, 0x06, 0xe5, 0xa5, 0x59, 0x09, 0xc5, 0xaf, 0xf5,
            0x26, 0x9a, 0x86, 0xa7, 0xa9, 0x53, 0x15, 0x34, 0xf7, 0xda, 0x2e, 0x4c, 0x30, 0x3d,
            0x8a, 0x31, 0x8a, 0x72, 0x1c, 0x3c, 0x0c, 0x95, 0x95, 0x68, 0x09, 0x53, 0x2f, 0xcf,
            0x0e, 0x24, 0x49, 0xa6, 0xb5, 0x25, 0xb1, 0x6a, 0xed, 0xf5, 0xaa, 0x0d, 0xe6, 0x57,
            0xba, 0x63, 0x7b, 0x39,
        ];
        let expected_ctx = [
            0x42, 0x83, 0x1e, 0xc2, 0x21, 0x77, 0x74, 0x24, 0x4b, 0x72, 0x21, 0xb7, 0x84, 0xd0,
            0xd4, 0x9c, 0xe3, 0xaa, 0x21, 0x2f, 0x2c, 0x02, 0xa4, 0xe0, 0x35, 0xc1, 0x7e, 0x23,
            0x29, 0xac, 0xa1, 0x2e, 0x21, 0xd5, 0x14, 0xb2, 0x54, 0x66, 0x93, 0x1c, 0x7d, 0x8f,
            0x6a, 0x5a, 0xac, 0x84, 0xaa, 0x05, 0x1b, 0xa3, 0x0b, 0x39, 0x6a, 0x0a, 0xac, 0x97,
            0x3d, 0x58, 0xe0, 0x91,
        ];
        let expected_tag = [
            0x5b, 0xc9, 0x4f, 0xbc, 0x32, 0x21, 0xa5, 0xdb, 0x94, 0xfa, 0xe9, 0x5a, 0xe7, 0x12,
            0x1a, 0x47,
        ];

        let mut gcm = AesGcm::new(&key);
        gcm.set_slot_info_raw(slot);
        gcm.set_iv_raw(Iv::new(y0));
        let tag = gcm.encrypt_in_place(&mut data, &aad);
        assert_eq!(data, expected_ctx);
        assert_eq!(tag, expected_tag);

        // And back.
        let mut gcm2 = AesGcm::new(&key);
        gcm2.set_slot_info_raw(slot);
        gcm2.set_iv_raw(Iv::new(y0));
        assert!(gcm2.decrypt_in_place(&mut data, &aad, &tag));
    }

    #[test]
    fn roundtrip_with_nonce() {
        let mut gcm = AesGcm::new(&[0x11; 16]);
        gcm.set_nonce(42, 1, 7);
        let mut data = *b"hello tdmh data phase";
        let tag = gcm.encrypt_in_place(&mut data, b"aad");
        gcm.set_nonce(42, 1, 7);
        assert!(gcm.decrypt_in_place(&mut data, b"aad", &tag));
        assert_eq!(&data, b"hello tdmh data phase");
    }

    #[test]
    fn bit_flip_fails_verification() {
        let mut gcm = AesGcm::new(&[0x22; 16]);
        gcm.set_nonce(1, 2, 3);
        let mut data = *b"payload";
        let tag = gcm.encrypt_in_place(&mut data, b"x");

        for flip in 0..3 {
            let mut d = data;
            let mut a = *b"x";
            let mut t = tag;
            match flip {
                0 => d[0] ^= 1,
                1 => a[0] ^= 1,
                _ => t[15] ^= 1,
            }
            gcm.set_nonce(1, 2, 3);
            assert!(!gcm.decrypt_in_place(&mut d, &a, &t));
        }
    }

    #[test]
    fn different_slot_different_tag() {
        let mut gcm = AesGcm::new(&[0x33; 16]);
        gcm.set_nonce(1, 1, 0);
        let tag_a = gcm.encrypt_in_place(&mut [], b"same");
        gcm.set_nonce(2, 1, 0);
        let tag_b = gcm.encrypt_in_place(&mut [], b"same");
        assert_ne!(tag_a, tag_b);
    }

    #[test]
    fn authenticate_only_detects_tamper() {
        let mut gcm = AesGcm::new(&[0x44; 16]);
        gcm.set_nonce(9, 1, 0);
        let tag = gcm.encrypt_in_place(&mut [], b"control packet bytes");
        gcm.set_nonce(9, 1, 0);
        assert!(gcm.decrypt_in_place(&mut [], b"control packet bytes", &tag));
        gcm.set_nonce(9, 1, 0);
        assert!(!gcm.decrypt_in_place(&mut [], b"control packet byteZ", &tag));
    }
}
