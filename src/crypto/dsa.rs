//! DSA long-term signing keys.
//!
//! OTR authenticates the AKE with 1024/160-bit DSA. Domain parameters are
//! generated per keypair (a 160-bit prime q, a 1024-bit prime p with
//! q | p - 1, and a generator of the order-q subgroup), so every keypair is
//! self-consistent and key generation is deterministic under a seeded
//! [`Rng`]. The signed input is reduced modulo q rather than truncated,
//! matching how the AKE signs its 32-byte HMAC digests.

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::crypto::sha1;
use crate::error::OtrError;
use crate::rng::Rng;
use crate::wire::{Encoder, WirePublicKey, MAC_LEN};

const Q_BITS: u64 = 160;
const P_BITS: u64 = 1024;
const MILLER_RABIN_ROUNDS: usize = 32;

/// Small primes for cheap trial division ahead of Miller-Rabin.
const SMALL_PRIMES: [u32; 30] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97, 101, 103, 107, 109, 113,
];

/// A DSA public key: domain parameters plus the verification value y.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsaPublicKey {
    pub p: BigUint,
    pub q: BigUint,
    pub g: BigUint,
    pub y: BigUint,
}

impl DsaPublicKey {
    /// Verify a raw (r, s) signature over `digest`.
    ///
    /// The digest is interpreted as a big-endian integer modulo q.
    pub fn verify(&self, digest: &[u8], r: &BigUint, s: &BigUint) -> Result<(), OtrError> {
        if r.is_zero() || s.is_zero() || r >= &self.q || s >= &self.q {
            return Err(OtrError::SignatureFailure);
        }
        let z = BigUint::from_bytes_be(digest) % &self.q;
        let w = mod_inverse_prime(s, &self.q);
        let u1 = (&z * &w) % &self.q;
        let u2 = (r * &w) % &self.q;
        let v = ((self.g.modpow(&u1, &self.p) * self.y.modpow(&u2, &self.p)) % &self.p) % &self.q;
        if &v == r {
            Ok(())
        } else {
            Err(OtrError::SignatureFailure)
        }
    }

    /// The key fingerprint: SHA-1 over the wire encoding of the four
    /// parameter MPIs, excluding the leading key-type word.
    pub fn fingerprint(&self) -> [u8; MAC_LEN] {
        let mut enc = Encoder::new();
        enc.write_mpi(&self.p)
            .write_mpi(&self.q)
            .write_mpi(&self.g)
            .write_mpi(&self.y);
        sha1(&enc.into_vec())
    }

    pub fn to_wire(&self) -> WirePublicKey {
        WirePublicKey {
            p: self.p.clone(),
            q: self.q.clone(),
            g: self.g.clone(),
            y: self.y.clone(),
        }
    }

    /// Import a key received on the wire, rejecting degenerate parameters.
    pub fn from_wire(wire: WirePublicKey) -> Result<Self, OtrError> {
        let two = BigUint::from(2u8);
        if wire.q < two || wire.p < two || wire.g < two || wire.y < two || wire.y >= wire.p {
            return Err(OtrError::MalformedMessage);
        }
        Ok(Self {
            p: wire.p,
            q: wire.q,
            g: wire.g,
            y: wire.y,
        })
    }
}

/// A DSA keypair with its private exponent.
#[derive(Debug, Clone)]
pub struct DsaKeyPair {
    public: DsaPublicKey,
    x: BigUint,
}

impl DsaKeyPair {
    /// Generate fresh domain parameters and a keypair within them.
    pub fn generate(rng: &mut Rng) -> Result<Self, OtrError> {
        let (p, q, g) = generate_parameters(rng)?;
        let x = random_below(rng, &q)?;
        let y = g.modpow(&x, &p);
        Ok(Self {
            public: DsaPublicKey { p, q, g, y },
            x,
        })
    }

    /// Reconstruct a keypair from stored components.
    pub fn from_components(p: BigUint, q: BigUint, g: BigUint, x: BigUint) -> Self {
        let y = g.modpow(&x, &p);
        Self {
            public: DsaPublicKey { p, q, g, y },
            x,
        }
    }

    pub fn public(&self) -> &DsaPublicKey {
        &self.public
    }

    /// Sign `digest` (interpreted modulo q), returning raw (r, s).
    pub fn sign(&self, digest: &[u8], rng: &mut Rng) -> Result<(BigUint, BigUint), OtrError> {
        let p = &self.public.p;
        let q = &self.public.q;
        let z = BigUint::from_bytes_be(digest) % q;
        loop {
            let k = random_below(rng, q)?;
            let r = self.public.g.modpow(&k, p) % q;
            if r.is_zero() {
                continue;
            }
            let k_inv = mod_inverse_prime(&k, q);
            let s = (&k_inv * (&z + &self.x * &r)) % q;
            if s.is_zero() {
                continue;
            }
            return Ok((r, s));
        }
    }
}

impl Drop for DsaKeyPair {
    fn drop(&mut self) {
        self.x = BigUint::zero();
    }
}

/// Inverse of `a` modulo the prime `m`, via Fermat's little theorem.
fn mod_inverse_prime(a: &BigUint, m: &BigUint) -> BigUint {
    a.modpow(&(m - 2u8), m)
}

/// Uniform random integer in (0, bound).
fn random_below(rng: &mut Rng, bound: &BigUint) -> Result<BigUint, OtrError> {
    let byte_len = ((bound.bits() + 7) / 8) as usize;
    let mut buf = vec![0u8; byte_len];
    loop {
        rng.fill(&mut buf)?;
        let candidate = BigUint::from_bytes_be(&buf);
        if !candidate.is_zero() && &candidate < bound {
            return Ok(candidate);
        }
    }
}

/// Random integer with exactly `bits` bits (top bit set).
fn random_with_bits(rng: &mut Rng, bits: u64) -> Result<BigUint, OtrError> {
    let byte_len = (bits as usize + 7) / 8;
    let mut buf = vec![0u8; byte_len];
    rng.fill(&mut buf)?;
    buf[0] |= 0x80;
    Ok(BigUint::from_bytes_be(&buf))
}

fn is_probable_prime(n: &BigUint, rng: &mut Rng) -> Result<bool, OtrError> {
    let one = BigUint::one();
    let two = BigUint::from(2u8);
    if n < &two {
        return Ok(false);
    }
    for &sp in &SMALL_PRIMES {
        let sp = BigUint::from(sp);
        if n == &sp {
            return Ok(true);
        }
        if (n % &sp).is_zero() {
            return Ok(false);
        }
    }

    // Write n - 1 = d * 2^s with d odd.
    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    'witness: for _ in 0..MILLER_RABIN_ROUNDS {
        let a = loop {
            let a = random_below(rng, &n_minus_one)?;
            if a >= two {
                break a;
            }
        };
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return Ok(false);
    }
    Ok(true)
}

/// FIPS-186-style search for (p, q, g) with q | p - 1.
fn generate_parameters(rng: &mut Rng) -> Result<(BigUint, BigUint, BigUint), OtrError> {
    let one = BigUint::one();
    loop {
        let q = loop {
            let mut candidate = random_with_bits(rng, Q_BITS)?;
            candidate |= &one; // force odd
            if is_probable_prime(&candidate, rng)? {
                break candidate;
            }
        };

        let two_q = &q << 1;
        for _ in 0..4096 {
            let x = random_with_bits(rng, P_BITS)?;
            // Align on p = 1 (mod 2q) so the order-q subgroup exists.
            let p: BigUint = &x - (&x % &two_q) + &one;
            if p.bits() != P_BITS || !is_probable_prime(&p, rng)? {
                continue;
            }
            let exp = (&p - &one) / &q;
            let g = loop {
                let h = random_below(rng, &(&p - 2u8))?;
                let g = h.modpow(&exp, &p);
                if g > one {
                    break g;
                }
            };
            return Ok((p, q, g));
        }
        // No prime p found under this q; draw a fresh q.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> DsaKeyPair {
        let mut rng = Rng::from_seed([42; 32]);
        DsaKeyPair::generate(&mut rng).unwrap()
    }

    #[test]
    fn test_parameter_shape() {
        let key = test_keypair();
        let public = key.public();
        assert_eq!(public.q.bits(), 160);
        assert_eq!(public.p.bits(), 1024);
        // q divides p - 1 and g has order q.
        assert!(((&public.p - 1u8) % &public.q).is_zero());
        assert_eq!(public.g.modpow(&public.q, &public.p), BigUint::one());
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let mut rng = Rng::from_seed([42; 32]);
        let key = DsaKeyPair::generate(&mut rng).unwrap();
        let digest = [0xA5u8; 32];

        let (r, s) = key.sign(&digest, &mut rng).unwrap();
        assert!(key.public().verify(&digest, &r, &s).is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_digest() {
        let mut rng = Rng::from_seed([42; 32]);
        let key = DsaKeyPair::generate(&mut rng).unwrap();

        let (r, s) = key.sign(&[0x01u8; 32], &mut rng).unwrap();
        assert_eq!(
            key.public().verify(&[0x02u8; 32], &r, &s),
            Err(OtrError::SignatureFailure)
        );
    }

    #[test]
    fn test_verify_rejects_out_of_range_signature() {
        let key = test_keypair();
        let q = key.public().q.clone();
        assert_eq!(
            key.public().verify(&[0u8; 32], &q, &BigUint::one()),
            Err(OtrError::SignatureFailure)
        );
        assert_eq!(
            key.public().verify(&[0u8; 32], &BigUint::zero(), &BigUint::one()),
            Err(OtrError::SignatureFailure)
        );
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = test_keypair();
        assert_eq!(key.public().fingerprint(), key.public().fingerprint());
    }

    #[test]
    fn test_wire_roundtrip() {
        let key = test_keypair();
        let wire = key.public().to_wire();
        let back = DsaPublicKey::from_wire(wire).unwrap();
        assert_eq!(&back, key.public());
    }
}
