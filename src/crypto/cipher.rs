//! AES-128 counter-mode encryption.
//!
//! OTR uses a 16-byte counter block whose top half carries the data-message
//! counter and whose bottom half is zero. AKE payloads are encrypted with an
//! all-zero counter block.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

type Aes128Ctr = Ctr128BE<Aes128>;

/// Encrypt or decrypt `data` with AES-128-CTR. The counter block is
/// `ctr_high` followed by eight zero bytes.
pub fn aes_ctr(key: &[u8; 16], ctr_high: &[u8; 8], data: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(ctr_high);
    let mut out = data.to_vec();
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut out);
    out
}

/// CTR-mode with an all-zero counter block, as used during the AKE.
pub fn aes_ctr_zero(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    aes_ctr(key, &[0u8; 8], data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctr_roundtrip() {
        let key = [0x11u8; 16];
        let ctr = [0, 0, 0, 0, 0, 0, 0, 5];
        let plaintext = b"counter mode is an involution";

        let ciphertext = aes_ctr(&key, &ctr, plaintext);
        assert_ne!(&ciphertext, plaintext);
        assert_eq!(aes_ctr(&key, &ctr, &ciphertext), plaintext);
    }

    #[test]
    fn test_counter_changes_keystream() {
        let key = [0x22u8; 16];
        let a = aes_ctr(&key, &[0, 0, 0, 0, 0, 0, 0, 1], b"same plaintext");
        let b = aes_ctr(&key, &[0, 0, 0, 0, 0, 0, 0, 2], b"same plaintext");
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_input() {
        let key = [0x33u8; 16];
        assert!(aes_ctr_zero(&key, b"").is_empty());
    }
}
