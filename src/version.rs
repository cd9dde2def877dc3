//! Protocol versions and their wire-level differences.
//!
//! Version 3 extends the version 2 message header with sender and receiver
//! instance tags and uses a longer fragment prefix; everything else in the
//! header layout is shared.

use crate::error::OtrError;
use crate::wire::{Decoder, Encoder};

/// Message type byte for a DH-commit message.
pub const MSG_TYPE_DH_COMMIT: u8 = 0x02;
/// Message type byte for a data message.
pub const MSG_TYPE_DATA: u8 = 0x03;
/// Message type byte for a DH-key message.
pub const MSG_TYPE_DH_KEY: u8 = 0x0A;
/// Message type byte for a reveal-signature message.
pub const MSG_TYPE_REVEAL_SIG: u8 = 0x11;
/// Message type byte for a signature message.
pub const MSG_TYPE_SIG: u8 = 0x12;

/// Marker starting every base64-framed OTR message.
pub const ENCODED_PREFIX: &[u8] = b"?OTR:";
/// Marker starting every OTR error message.
pub const ERROR_PREFIX: &[u8] = b"?OTR Error:";
/// Marker starting every query message and fragment.
pub const QUERY_PREFIX: &[u8] = b"?OTR";

/// Sixteen bytes of whitespace announcing "I speak OTR" inside plaintext.
pub const WHITESPACE_TAG_BASE: &[u8; 16] = b"\x20\x09\x20\x20\x09\x09\x09\x09\x20\x09\x20\x09\x20\x09\x20\x20";
/// Per-version 8-byte suffixes appended after the base tag.
pub const WHITESPACE_TAG_V2: &[u8; 8] = b"\x20\x20\x09\x09\x20\x20\x09\x20";
pub const WHITESPACE_TAG_V3: &[u8; 8] = b"\x20\x20\x09\x09\x20\x20\x09\x09";

/// Smallest instance tag value valid for a conversation participant.
pub const MIN_INSTANCE_TAG: u32 = 0x100;

/// A negotiated OTR protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V2,
    V3,
}

impl Version {
    /// The version word carried in message headers.
    pub fn protocol_version(self) -> u16 {
        match self {
            Version::V2 => 0x0002,
            Version::V3 => 0x0003,
        }
    }

    pub fn from_protocol_version(v: u16) -> Option<Self> {
        match v {
            0x0002 => Some(Version::V2),
            0x0003 => Some(Version::V3),
            _ => None,
        }
    }

    /// The digit used in query messages and whitespace tags.
    pub fn query_digit(self) -> char {
        match self {
            Version::V2 => '2',
            Version::V3 => '3',
        }
    }

    pub fn whitespace_tag(self) -> &'static [u8; 8] {
        match self {
            Version::V2 => WHITESPACE_TAG_V2,
            Version::V3 => WHITESPACE_TAG_V3,
        }
    }

    /// Bytes consumed by the fragment prefix, suffix, and counters, i.e. the
    /// per-fragment overhead subtracted from the fragment size budget.
    pub fn fragment_overhead(self) -> usize {
        match self {
            // "?OTR," + "nnnnn,nnnnn," + trailing ","
            Version::V2 => 5 + 12 + 1,
            // "?OTR|xxxxxxxx|yyyyyyyy," + "nnnnn,nnnnn," + trailing ","
            Version::V3 => 23 + 12 + 1,
        }
    }

    /// The smallest usable fragment size for this version.
    pub fn min_fragment_size(self) -> usize {
        self.fragment_overhead() + 1
    }

    /// Serialize a message header for this version.
    pub fn message_header(self, msg_type: u8, sender_tag: u32, receiver_tag: u32) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u16(self.protocol_version()).write_u8(msg_type);
        if self == Version::V3 {
            enc.write_u32(sender_tag).write_u32(receiver_tag);
        }
        enc.into_vec()
    }
}

/// A parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHead {
    pub version: Version,
    pub msg_type: u8,
    pub sender_tag: u32,
    pub receiver_tag: u32,
}

impl MessageHead {
    /// Parse a header off the front of `message`, returning the head and
    /// the remaining payload.
    pub fn parse(message: &[u8]) -> Result<(Self, &[u8]), OtrError> {
        let mut dec = Decoder::new(message);
        let version = Version::from_protocol_version(dec.read_u16()?)
            .ok_or(OtrError::WrongProtocolVersion)?;
        let msg_type = dec.read_u8()?;
        let (sender_tag, receiver_tag) = match version {
            Version::V2 => (0, 0),
            Version::V3 => (dec.read_u32()?, dec.read_u32()?),
        };
        Ok((
            Self {
                version,
                msg_type,
                sender_tag,
                receiver_tag,
            },
            dec.remaining(),
        ))
    }

    /// The header bytes exactly as they appeared on the wire.
    pub fn serialize(&self) -> Vec<u8> {
        self.version
            .message_header(self.msg_type, self.sender_tag, self.receiver_tag)
    }
}
