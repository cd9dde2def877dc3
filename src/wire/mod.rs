//! OTR wire primitives: big-endian integers, DATA and MPI fields, and TLVs.

pub mod codec;
pub mod tlv;

pub use codec::{Decoder, Encoder, WirePublicKey, MAC_LEN, SIGNATURE_LEN};
pub use tlv::Tlv;
