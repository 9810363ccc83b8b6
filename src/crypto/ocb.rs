//! AES-128 OCB3 (RFC 7253) authenticated encryption, sized for radio frames.
//!
//! Capacity is bounded at 8 blocks of data and 8 blocks of associated data
//! (slotInfo included), which covers the 125-byte frame with tag. The
//! associated data always starts with the implicit slotInfo block, so the
//! tag binds the frame to its slot, sequence number and key generation even
//! when the caller passes no explicit AD.
//!
//! The nonce is the 120-bit slot identity (master index, tile, truncated
//! sequence number) behind a fixed 0x01 marker byte; KTOP stretching uses
//! plain bit-OR recombination, with the zero bit-shift case handled
//! explicitly.

use super::aes::Aes;
use super::utils::{ct_eq, secure_clear, xor_in_place};
use super::Aead;

const BLOCK_SIZE: usize = 16;
const MAX_BLOCKS: usize = 8;
/// `ntz(i)` for 1-based block index i in 1..=8.
const NTZ: [usize; MAX_BLOCKS] = [0, 1, 0, 2, 0, 1, 0, 3];
const POLY: u8 = 0x87;

pub struct AesOcb {
    aes: Aes,
    l_star: [u8; 16],
    l_dollar: [u8; 16],
    l: [[u8; 16]; 4],
    nonce: [u8; 16],
    slot_info: [u8; 16],
}

impl AesOcb {
    pub fn new(key: &[u8; 16]) -> Self {
        let mut ocb = Self {
            aes: Aes::new(key),
            l_star: [0; 16],
            l_dollar: [0; 16],
            l: [[0; 16]; 4],
            nonce: [0; 16],
            slot_info: [0; 16],
        };
        ocb.nonce[0] = 0x01;
        ocb.compute_l_values();
        ocb
    }

    pub fn zeroed() -> Self {
        Self::new(&[0; 16])
    }

    pub fn rekey(&mut self, key: &[u8; 16]) {
        self.aes.rekey(key);
        self.compute_l_values();
    }

    /// Bind the next frame to its slot. The most significant byte of the
    /// sequence number is dropped to fit the 120-bit nonce.
    pub fn set_nonce(&mut self, tile_or_frame: u32, sequence: u64, master_index: u32) {
        self.slot_info[0..4].copy_from_slice(&master_index.to_le_bytes());
        self.slot_info[4..8].copy_from_slice(&tile_or_frame.to_le_bytes());
        self.slot_info[8..16].copy_from_slice(&sequence.to_le_bytes());

        self.nonce[0] = 0x01;
        self.nonce[1..5].copy_from_slice(&master_index.to_le_bytes());
        self.nonce[5..9].copy_from_slice(&tile_or_frame.to_le_bytes());
        self.nonce[9..16].copy_from_slice(&(sequence >> 8).to_le_bytes()[..7]);
    }

    fn compute_l_values(&mut self) {
        self.aes.encrypt_block(&mut self.l_star, &[0u8; 16]);
        let l_star = self.l_star;
        gf_double(&mut self.l_dollar, &l_star);
        let l_dollar = self.l_dollar;
        gf_double(&mut self.l[0], &l_dollar);
        for i in 1..self.l.len() {
            let prev = self.l[i - 1];
            gf_double(&mut self.l[i], &prev);
        }
    }

    /// KTOP stretch and extraction of the first offset.
    fn first_offset(&self) -> [u8; 16] {
        let bottom = (self.nonce[15] & 0x3f) as usize;
        let mut top = self.nonce;
        top[15] &= 0xc0;

        let mut stretch = [0u8; 24];
        let mut ktop = [0u8; 16];
        self.aes.encrypt_block(&mut ktop, &top);
        stretch[..16].copy_from_slice(&ktop);
        for i in 0..8 {
            stretch[16 + i] = ktop[i] ^ ktop[i + 1];
        }

        let bitshift = bottom % 8;
        let byteshift = bottom / 8;
        let mut offset = [0u8; 16];
        for i in 0..16 {
            let left = stretch[i + byteshift] << bitshift;
            let right = if bitshift == 0 {
                0
            } else {
                stretch[i + byteshift + 1] >> (8 - bitshift)
            };
            offset[i] = left | right;
        }
        secure_clear(&mut stretch);
        secure_clear(&mut ktop);
        offset
    }

    /// HASH over slotInfo followed by the caller's associated data.
    fn hash_aad(&self, aad: &[u8]) -> [u8; 16] {
        let total = BLOCK_SIZE + aad.len();
        assert!(
            total <= MAX_BLOCKS * BLOCK_SIZE,
            "OCB: associated data too long"
        );
        let mut buf = [0u8; MAX_BLOCKS * BLOCK_SIZE];
        buf[..BLOCK_SIZE].copy_from_slice(&self.slot_info);
        buf[BLOCK_SIZE..total].copy_from_slice(aad);

        let full = total / BLOCK_SIZE;
        let rem = total % BLOCK_SIZE;
        if rem > 0 {
            buf[total] = 0x80;
        }

        let mut offset = [0u8; 16];
        let mut sum = [0u8; 16];
        let mut block = [0u8; 16];
        let mut enc = [0u8; 16];
        for i in 0..full {
            xor_in_place(&mut offset, &self.l[NTZ[i]]);
            block.copy_from_slice(&buf[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE]);
            xor_in_place(&mut block, &offset);
            self.aes.encrypt_block(&mut enc, &block);
            xor_in_place(&mut sum, &enc);
        }
        if rem > 0 {
            xor_in_place(&mut offset, &self.l_star);
            block.copy_from_slice(&buf[full * BLOCK_SIZE..(full + 1) * BLOCK_SIZE]);
            xor_in_place(&mut block, &offset);
            self.aes.encrypt_block(&mut enc, &block);
            xor_in_place(&mut sum, &enc);
        }
        secure_clear(&mut block);
        secure_clear(&mut enc);
        sum
    }

    fn finish_tag(&self, checksum: &[u8; 16], offset: &[u8; 16], sum: &[u8; 16]) -> [u8; 16] {
        let mut acc = *checksum;
        xor_in_place(&mut acc, offset);
        xor_in_place(&mut acc, &self.l_dollar);
        let mut tag = [0u8; 16];
        self.aes.encrypt_block(&mut tag, &acc);
        xor_in_place(&mut tag, sum);
        secure_clear(&mut acc);
        tag
    }
}

impl Aead for AesOcb {
    fn set_nonce(&mut self, tile_or_frame: u32, sequence: u64, master_index: u32) {
        AesOcb::set_nonce(self, tile_or_frame, sequence, master_index);
    }

    fn encrypt_in_place(&mut self, data: &mut [u8], aad: &[u8]) -> [u8; 16] {
        assert!(data.len() <= MAX_BLOCKS * BLOCK_SIZE, "OCB: data too long");
        let sum = self.hash_aad(aad);

        let full = data.len() / BLOCK_SIZE;
        let rem = data.len() % BLOCK_SIZE;

        let mut offset = self.first_offset();
        let mut checksum = [0u8; 16];
        let mut block = [0u8; 16];
        let mut enc = [0u8; 16];

        for i in 0..full {
            let chunk = &mut data[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
            xor_in_place(&mut checksum, chunk);
            xor_in_place(&mut offset, &self.l[NTZ[i]]);
            block.copy_from_slice(chunk);
            xor_in_place(&mut block, &offset);
            self.aes.encrypt_block(&mut enc, &block);
            xor_in_place(&mut enc, &offset);
            chunk.copy_from_slice(&enc);
        }
        if rem > 0 {
            let chunk = &mut data[full * BLOCK_SIZE..];
            for (c, b) in checksum.iter_mut().zip(chunk.iter()) {
                *c ^= *b;
            }
            checksum[rem] ^= 0x80;
            xor_in_place(&mut offset, &self.l_star);
            self.aes.encrypt_block(&mut enc, &offset);
            for (b, k) in chunk.iter_mut().zip(enc.iter()) {
                *b ^= *k;
            }
        }

        let tag = self.finish_tag(&checksum, &offset, &sum);
        secure_clear(&mut checksum);
        secure_clear(&mut block);
        secure_clear(&mut enc);
        tag
    }

    fn decrypt_in_place(&mut self, data: &mut [u8], aad: &[u8], tag: &[u8; 16]) -> bool {
        assert!(data.len() <= MAX_BLOCKS * BLOCK_SIZE, "OCB: data too long");
        let sum = self.hash_aad(aad);

        let full = data.len() / BLOCK_SIZE;
        let rem = data.len() % BLOCK_SIZE;

        let mut offset = self.first_offset();
        let mut checksum = [0u8; 16];
        let mut block = [0u8; 16];
        let mut dec = [0u8; 16];

        for i in 0..full {
            let chunk = &mut data[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
            xor_in_place(&mut offset, &self.l[NTZ[i]]);
            block.copy_from_slice(chunk);
            xor_in_place(&mut block, &offset);
            self.aes.decrypt_block(&mut dec, &block);
            xor_in_place(&mut dec, &offset);
            chunk.copy_from_slice(&dec);
            xor_in_place(&mut checksum, chunk);
        }
        if rem > 0 {
            let chunk = &mut data[full * BLOCK_SIZE..];
            xor_in_place(&mut offset, &self.l_star);
            self.aes.encrypt_block(&mut dec, &offset);
            for (b, k) in chunk.iter_mut().zip(dec.iter()) {
                *b ^= *k;
            }
            for (c, b) in checksum.iter_mut().zip(chunk.iter()) {
                *c ^= *b;
            }
            checksum[rem] ^= 0x80;
        }

        let expected = self.finish_tag(&checksum, &offset, &sum);
        secure_clear(&mut checksum);
        secure_clear(&mut block);
        secure_clear(&mut dec);
        ct_eq(&expected, tag)
    }
}

/// `dst = src * x` in GF(2^128) with the OCB polynomial.
fn gf_double(dst: &mut [u8; 16], src: &[u8; 16]) {
    let msb = (src[0] & 0x80) >> 7;
    let mut carry = 0u8;
    for i in (0..16).rev() {
        let next = (src[i] & 0x80) >> 7;
        dst[i] = (src[i] << 1) | carry;
        carry = next;
    }
    dst[15] ^= msb * POLY;
}
