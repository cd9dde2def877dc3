//! Cryptographic primitives for the OTR protocol.
//!
//! Thin wrappers over the RustCrypto digest and MAC crates, plus the
//! protocol's Diffie-Hellman group, DSA signatures, and AES-128-CTR.

pub mod cipher;
pub mod dh;
pub mod dsa;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::OtrError;
use crate::wire::MAC_LEN;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 over a single prefix byte followed by `data`. The AKE key
/// derivation and the SMP proof hashes are all of this shape.
pub fn sha256_prefixed(prefix: u8, data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([prefix]);
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha1(data: &[u8]) -> [u8; MAC_LEN] {
    Sha1::digest(data).into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA256 truncated to 160 bits, as used for the AKE signature MACs.
pub fn hmac_sha256_160(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let full = hmac_sha256(key, data);
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&full[..MAC_LEN]);
    out
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time equality check for MACs and hash commitments.
pub fn verify_bytes(expected: &[u8], actual: &[u8]) -> Result<(), OtrError> {
    if expected.len() == actual.len() && bool::from(expected.ct_eq(actual)) {
        Ok(())
    } else {
        Err(OtrError::MacFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_prefixed_differs_from_plain() {
        let data = b"some input";
        assert_ne!(sha256_prefixed(0x00, data), sha256(data));
    }

    #[test]
    fn test_hmac_sha256_160_is_prefix_of_full() {
        let full = hmac_sha256(b"key", b"msg");
        let trunc = hmac_sha256_160(b"key", b"msg");
        assert_eq!(trunc, full[..20]);
    }

    #[test]
    fn test_verify_bytes_rejects_mismatch() {
        assert!(verify_bytes(b"aaaa", b"aaaa").is_ok());
        assert!(verify_bytes(b"aaaa", b"aaab").is_err());
        assert!(verify_bytes(b"aaaa", b"aaa").is_err());
    }
}
