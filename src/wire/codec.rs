//! Big-endian wire primitives.
//!
//! OTR serializes everything as fixed-width big-endian integers,
//! length-prefixed byte strings (DATA), and length-prefixed unsigned
//! big integers with no leading zero bytes (MPI). All decoders are total:
//! short input yields [`OtrError::MalformedMessage`], never a panic.

use num_bigint::BigUint;
use num_traits::Zero;

use crate::error::OtrError;

/// Length in bytes of a truncated HMAC as carried on the wire.
pub const MAC_LEN: usize = 20;

/// Length in bytes of a raw DSA signature (r and s, 20 bytes each).
pub const SIGNATURE_LEN: usize = 40;

/// Wire-format type word for a DSA public key.
const PUBKEY_TYPE_DSA: u16 = 0x0000;

/// A DSA public key as carried inside AKE signature blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePublicKey {
    pub p: BigUint,
    pub q: BigUint,
    pub g: BigUint,
    pub y: BigUint,
}

/// Append-only serializer for OTR wire data.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Raw bytes, no length prefix.
    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Length-prefixed byte string.
    pub fn write_data(&mut self, v: &[u8]) -> &mut Self {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    /// Length-prefixed big integer, minimal big-endian magnitude.
    /// Zero encodes with length 0.
    pub fn write_mpi(&mut self, v: &BigUint) -> &mut Self {
        if v.is_zero() {
            return self.write_u32(0);
        }
        let bytes = v.to_bytes_be();
        self.write_data(&bytes)
    }

    /// A sequence of MPIs prefixed by their count.
    pub fn write_mpi_sequence(&mut self, mpis: &[&BigUint]) -> &mut Self {
        self.write_u32(mpis.len() as u32);
        for mpi in mpis {
            self.write_mpi(mpi);
        }
        self
    }

    /// A 20-byte MAC, written raw.
    pub fn write_mac(&mut self, mac: &[u8; MAC_LEN]) -> &mut Self {
        self.write_bytes(mac)
    }

    /// DSA public key: type word followed by the four parameter MPIs.
    pub fn write_public_key(&mut self, key: &WirePublicKey) -> &mut Self {
        self.write_u16(PUBKEY_TYPE_DSA);
        self.write_mpi(&key.p);
        self.write_mpi(&key.q);
        self.write_mpi(&key.g);
        self.write_mpi(&key.y)
    }

    /// DSA signature: r then s, each left-padded to 20 bytes.
    pub fn write_signature(&mut self, r: &BigUint, s: &BigUint) -> &mut Self {
        self.write_bytes(&to_fixed_bytes_be(r, MAC_LEN));
        self.write_bytes(&to_fixed_bytes_be(s, MAC_LEN))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Left-pad the big-endian magnitude of `v` to exactly `len` bytes.
pub fn to_fixed_bytes_be(v: &BigUint, len: usize) -> Vec<u8> {
    let bytes = v.to_bytes_be();
    if bytes.len() >= len {
        bytes[bytes.len() - len..].to_vec()
    } else {
        let mut out = vec![0u8; len - bytes.len()];
        out.extend_from_slice(&bytes);
        out
    }
}

/// Cursor-style reader over OTR wire data.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OtrError> {
        if self.buf.len() - self.pos < n {
            return Err(OtrError::MalformedMessage);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, OtrError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, OtrError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, OtrError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, OtrError> {
        let b = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(u64::from_be_bytes(out))
    }

    /// Raw bytes of a caller-known length.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], OtrError> {
        self.take(n)
    }

    /// Length-prefixed byte string.
    pub fn read_data(&mut self) -> Result<Vec<u8>, OtrError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Length-prefixed big integer.
    pub fn read_mpi(&mut self) -> Result<BigUint, OtrError> {
        let len = self.read_u32()? as usize;
        Ok(BigUint::from_bytes_be(self.take(len)?))
    }

    /// Count-prefixed sequence of MPIs.
    pub fn read_mpi_sequence(&mut self) -> Result<Vec<BigUint>, OtrError> {
        let count = self.read_u32()? as usize;
        // The count is attacker-controlled; never preallocate from it.
        let mut mpis = Vec::new();
        for _ in 0..count {
            mpis.push(self.read_mpi()?);
        }
        Ok(mpis)
    }

    pub fn read_mac(&mut self) -> Result<[u8; MAC_LEN], OtrError> {
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(self.take(MAC_LEN)?);
        Ok(out)
    }

    pub fn read_ctr(&mut self) -> Result<[u8; 8], OtrError> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8)?);
        Ok(out)
    }

    pub fn read_public_key(&mut self) -> Result<WirePublicKey, OtrError> {
        if self.read_u16()? != PUBKEY_TYPE_DSA {
            return Err(OtrError::MalformedMessage);
        }
        Ok(WirePublicKey {
            p: self.read_mpi()?,
            q: self.read_mpi()?,
            g: self.read_mpi()?,
            y: self.read_mpi()?,
        })
    }

    pub fn read_signature(&mut self) -> Result<(BigUint, BigUint), OtrError> {
        let r = BigUint::from_bytes_be(self.take(MAC_LEN)?);
        let s = BigUint::from_bytes_be(self.take(MAC_LEN)?);
        Ok((r, s))
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Offset of the cursor from the start of the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Succeeds only if the whole input has been consumed.
    pub fn done(&self) -> Result<(), OtrError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(OtrError::MalformedMessage)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::One;

    #[test]
    fn test_integer_roundtrip() {
        let mut enc = Encoder::new();
        enc.write_u8(0x42).write_u16(0xBEEF).write_u32(7).write_u64(u64::MAX);
        let bytes = enc.into_vec();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_u8().unwrap(), 0x42);
        assert_eq!(dec.read_u16().unwrap(), 0xBEEF);
        assert_eq!(dec.read_u32().unwrap(), 7);
        assert_eq!(dec.read_u64().unwrap(), u64::MAX);
        assert!(dec.done().is_ok());
    }

    #[test]
    fn test_data_roundtrip() {
        let mut enc = Encoder::new();
        enc.write_data(b"hello").write_data(b"");
        let bytes = enc.into_vec();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_data().unwrap(), b"hello");
        assert_eq!(dec.read_data().unwrap(), b"");
    }

    #[test]
    fn test_mpi_strips_leading_zeros() {
        let v = BigUint::from(0xABCDu32);
        let mut enc = Encoder::new();
        enc.write_mpi(&v);
        assert_eq!(enc.to_vec(), vec![0, 0, 0, 2, 0xAB, 0xCD]);
    }

    #[test]
    fn test_mpi_zero_encodes_empty() {
        let mut enc = Encoder::new();
        enc.write_mpi(&BigUint::zero());
        assert_eq!(enc.to_vec(), vec![0, 0, 0, 0]);

        let bytes = enc.into_vec();
        let mut dec = Decoder::new(&bytes);
        assert!(dec.read_mpi().unwrap().is_zero());
    }

    #[test]
    fn test_mpi_sequence_roundtrip() {
        let a = BigUint::one();
        let b = BigUint::from(1_000_000u32);
        let mut enc = Encoder::new();
        enc.write_mpi_sequence(&[&a, &b]);
        let bytes = enc.into_vec();

        let mut dec = Decoder::new(&bytes);
        let seq = dec.read_mpi_sequence().unwrap();
        assert_eq!(seq, vec![a, b]);
    }

    #[test]
    fn test_short_input_fails_without_panic() {
        let mut dec = Decoder::new(&[0, 0, 0, 9, 1, 2]);
        assert_eq!(dec.read_data(), Err(OtrError::MalformedMessage));
    }

    #[test]
    fn test_truncated_integer_fails() {
        let mut dec = Decoder::new(&[0xFF]);
        assert_eq!(dec.read_u32(), Err(OtrError::MalformedMessage));
    }

    #[test]
    fn test_fixed_width_padding() {
        let v = BigUint::from(0x01u8);
        assert_eq!(to_fixed_bytes_be(&v, 4), vec![0, 0, 0, 1]);
    }
}
