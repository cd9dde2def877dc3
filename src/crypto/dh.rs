//! The protocol's Diffie-Hellman group.
//!
//! All exponentiations happen in the well-known 1536-bit MODP group with
//! generator 2. The group order used for zero-knowledge-proof arithmetic is
//! q = (p - 1) / 2, which is prime for this modulus.
//!
//! `num-bigint`'s modular exponentiation is not constant-time; an observer
//! able to measure execution time of this process may learn information
//! about exponents.

use std::sync::OnceLock;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use zeroize::Zeroize;

use crate::error::OtrError;
use crate::rng::Rng;

/// Hex digits of the 1536-bit MODP prime.
const MODULUS_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
83655D23DCA3AD961C62F356208552BB9ED529077096966D\
670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF";

/// Byte length of a private DH exponent (320 bits).
const PRIVATE_KEY_BYTES: usize = 40;

/// The group modulus p.
pub fn modulus() -> &'static BigUint {
    static P: OnceLock<BigUint> = OnceLock::new();
    P.get_or_init(|| BigUint::parse_bytes(MODULUS_HEX, 16).expect("modulus constant is valid hex"))
}

/// p - 2, the upper bound for valid public group elements.
pub fn modulus_minus_two() -> &'static BigUint {
    static PM2: OnceLock<BigUint> = OnceLock::new();
    PM2.get_or_init(|| modulus() - 2u8)
}

/// The prime order q = (p - 1) / 2 of the subgroup generated by g.
pub fn order() -> &'static BigUint {
    static Q: OnceLock<BigUint> = OnceLock::new();
    Q.get_or_init(|| (modulus() - 1u8) >> 1)
}

/// The group generator, 2.
pub fn generator() -> &'static BigUint {
    static G: OnceLock<BigUint> = OnceLock::new();
    G.get_or_init(|| BigUint::from(2u8))
}

/// Check that a received public value lies in [2, p-2].
pub fn verify_group_element(v: &BigUint) -> Result<(), OtrError> {
    if v >= &BigUint::from(2u8) && v <= modulus_minus_two() {
        Ok(())
    } else {
        Err(OtrError::InvalidGroupElement)
    }
}

/// Draw a uniformly random exponent in (0, bound), retrying on out-of-range
/// draws rather than reducing.
pub fn random_exponent(rng: &mut Rng, byte_len: usize, bound: &BigUint) -> Result<BigUint, OtrError> {
    let mut buf = vec![0u8; byte_len];
    loop {
        rng.fill(&mut buf)?;
        let candidate = BigUint::from_bytes_be(&buf);
        if !candidate.is_zero() && &candidate < bound {
            buf.zeroize();
            return Ok(candidate);
        }
    }
}

/// An ephemeral DH keypair in the protocol group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keypair {
    pub private: BigUint,
    pub public: BigUint,
}

impl Keypair {
    /// Generate a keypair with a 320-bit private exponent.
    pub fn generate(rng: &mut Rng) -> Result<Self, OtrError> {
        let private = random_exponent(rng, PRIVATE_KEY_BYTES, order())?;
        let public = generator().modpow(&private, modulus());
        Ok(Self { private, public })
    }

    /// s = their_public ^ our_private mod p.
    pub fn shared_secret(&self, their_public: &BigUint) -> BigUint {
        their_public.modpow(&self.private, modulus())
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        // Best effort: overwrite the exponent value. The heap limbs the
        // bignum previously allocated may survive reallocation.
        self.private = BigUint::zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulus_has_1536_bits() {
        assert_eq!(modulus().bits(), 1536);
    }

    #[test]
    fn test_generator_has_order_q() {
        // g^q mod p == 1 for the safe-prime group.
        assert_eq!(generator().modpow(order(), modulus()), BigUint::one());
    }

    #[test]
    fn test_shared_secret_agreement() {
        let mut rng = Rng::from_seed([3; 32]);
        let a = Keypair::generate(&mut rng).unwrap();
        let b = Keypair::generate(&mut rng).unwrap();
        assert_eq!(a.shared_secret(&b.public), b.shared_secret(&a.public));
    }

    #[test]
    fn test_group_element_bounds() {
        assert!(verify_group_element(&BigUint::from(2u8)).is_ok());
        assert!(verify_group_element(modulus_minus_two()).is_ok());
        assert!(verify_group_element(&BigUint::one()).is_err());
        assert!(verify_group_element(&BigUint::zero()).is_err());
        assert!(verify_group_element(modulus()).is_err());
        assert!(verify_group_element(&(modulus() - 1u8)).is_err());
    }

    #[test]
    fn test_random_exponent_in_range() {
        let mut rng = Rng::from_seed([9; 32]);
        let bound = BigUint::from(1u128 << 100);
        for _ in 0..16 {
            let e = random_exponent(&mut rng, 12, &bound).unwrap();
            assert!(!e.is_zero());
            assert!(e < bound);
        }
    }
}
