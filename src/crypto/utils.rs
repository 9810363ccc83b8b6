//! Small helpers shared by the crypto modules.

use rand::RngCore;

/// `dst = a ^ b`, element-wise, over `len` bytes. The three slices may not
/// alias; use [`xor_in_place`] for the common accumulate case.
pub fn xor_bytes(dst: &mut [u8], a: &[u8], b: &[u8], len: usize) {
    for i in 0..len {
        dst[i] = a[i] ^ b[i];
    }
}

/// `dst ^= src` over the length of `src`.
pub fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= *s;
    }
}

/// Overwrite key material with zeros before releasing the buffer.
pub fn secure_clear(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        // Volatile store so the wipe is not optimized away.
        unsafe { core::ptr::write_volatile(b, 0) };
    }
}

/// Fill `buf` with cryptographically random bytes from the platform RNG.
pub fn fill_random(buf: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(buf);
}

/// Constant-time slice comparison for tag verification.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
