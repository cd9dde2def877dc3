//! Type-Length-Value records carried inside data-message plaintext.

use crate::error::OtrError;
use crate::wire::codec::{Decoder, Encoder};

/// Padding; the value is ignored.
pub const TLV_PADDING: u16 = 0;
/// The peer has ended the secure conversation.
pub const TLV_DISCONNECTED: u16 = 1;
/// First SMP message.
pub const TLV_SMP1: u16 = 2;
/// Second SMP message.
pub const TLV_SMP2: u16 = 3;
/// Third SMP message.
pub const TLV_SMP3: u16 = 4;
/// Fourth SMP message.
pub const TLV_SMP4: u16 = 5;
/// Abort a running SMP exchange.
pub const TLV_SMP_ABORT: u16 = 6;
/// First SMP message carrying a user-visible question.
pub const TLV_SMP1_WITH_QUESTION: u16 = 7;

/// A single TLV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub typ: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(typ: u16, value: Vec<u8>) -> Self {
        Self { typ, value }
    }

    /// True for any of the SMP message types, including abort and question.
    pub fn is_smp(&self) -> bool {
        (TLV_SMP1..=TLV_SMP1_WITH_QUESTION).contains(&self.typ)
    }

    pub fn serialize_into(&self, enc: &mut Encoder) {
        enc.write_u16(self.typ);
        enc.write_u16(self.value.len() as u16);
        enc.write_bytes(&self.value);
    }

    pub fn deserialize(dec: &mut Decoder) -> Result<Self, OtrError> {
        let typ = dec.read_u16()?;
        let len = dec.read_u16()? as usize;
        let value = dec.read_bytes(len)?.to_vec();
        Ok(Self { typ, value })
    }
}

/// Serialize a list of TLVs back-to-back.
pub fn serialize_tlvs(tlvs: &[Tlv]) -> Vec<u8> {
    let mut enc = Encoder::new();
    for tlv in tlvs {
        tlv.serialize_into(&mut enc);
    }
    enc.into_vec()
}

/// Parse TLVs until the input is exhausted.
pub fn parse_tlvs(bytes: &[u8]) -> Result<Vec<Tlv>, OtrError> {
    let mut dec = Decoder::new(bytes);
    let mut tlvs = Vec::new();
    while !dec.is_empty() {
        tlvs.push(Tlv::deserialize(&mut dec)?);
    }
    Ok(tlvs)
}
