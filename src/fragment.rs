//! Splitting encoded messages into transport-sized fragments and
//! reassembling them on receive.
//!
//! A fragment looks like `?OTR,i,k,piece,` in version 2 and
//! `?OTR|sender|receiver,i,k,piece,` in version 3, with `i`/`k` in decimal
//! and the instance tags in lowercase hex. Reassembly is strict: any
//! out-of-order index or mismatched total discards the partial buffer.

use crate::error::OtrError;
use crate::version::Version;

/// A parsed inbound fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub sender_tag: u32,
    pub receiver_tag: u32,
    pub index: u16,
    pub total: u16,
    pub piece: Vec<u8>,
}

/// True if `message` carries the fragment marker of either version.
pub fn is_fragment(message: &[u8]) -> bool {
    message.starts_with(b"?OTR|") || message.starts_with(b"?OTR,")
}

/// Split an encoded message into transport fragments.
///
/// With `fragment_size` zero or no overflow the message is passed through
/// whole. Otherwise each piece is sized so the framed fragment fits within
/// `fragment_size`.
pub fn fragment(
    encoded: Vec<u8>,
    version: Version,
    fragment_size: usize,
    sender_tag: u32,
    receiver_tag: u32,
) -> Result<Vec<Vec<u8>>, OtrError> {
    if fragment_size == 0 || encoded.len() <= fragment_size {
        return Ok(vec![encoded]);
    }
    if fragment_size < version.min_fragment_size() {
        return Err(OtrError::PolicyViolation);
    }

    let piece_len = fragment_size - version.fragment_overhead();
    let total = encoded.len().div_ceil(piece_len);
    if total > u16::MAX as usize {
        return Err(OtrError::PolicyViolation);
    }

    let mut out = Vec::with_capacity(total);
    for (i, piece) in encoded.chunks(piece_len).enumerate() {
        let header = match version {
            Version::V2 => format!("?OTR,{:05},{:05},", i + 1, total),
            Version::V3 => format!(
                "?OTR|{:08x}|{:08x},{:05},{:05},",
                sender_tag,
                receiver_tag,
                i + 1,
                total
            ),
        };
        let mut frag = header.into_bytes();
        frag.extend_from_slice(piece);
        frag.push(b',');
        out.push(frag);
    }
    Ok(out)
}

/// Parse a fragment of either version.
pub fn parse_fragment(message: &[u8]) -> Result<Fragment, OtrError> {
    let text = std::str::from_utf8(message).map_err(|_| OtrError::MalformedMessage)?;

    let (sender_tag, receiver_tag, rest) = if let Some(rest) = text.strip_prefix("?OTR|") {
        let (sender, rest) = rest.split_once('|').ok_or(OtrError::MalformedMessage)?;
        let (receiver, rest) = rest.split_once(',').ok_or(OtrError::MalformedMessage)?;
        let sender = u32::from_str_radix(sender, 16).map_err(|_| OtrError::MalformedMessage)?;
        let receiver = u32::from_str_radix(receiver, 16).map_err(|_| OtrError::MalformedMessage)?;
        (sender, receiver, rest)
    } else if let Some(rest) = text.strip_prefix("?OTR,") {
        (0, 0, rest)
    } else {
        return Err(OtrError::MalformedMessage);
    };

    let (index, rest) = rest.split_once(',').ok_or(OtrError::MalformedMessage)?;
    let (total, rest) = rest.split_once(',').ok_or(OtrError::MalformedMessage)?;
    let index: u16 = index.parse().map_err(|_| OtrError::MalformedMessage)?;
    let total: u16 = total.parse().map_err(|_| OtrError::MalformedMessage)?;
    let piece = rest.strip_suffix(',').ok_or(OtrError::MalformedMessage)?;
    if index == 0 || index > total {
        return Err(OtrError::MalformedMessage);
    }
    Ok(Fragment {
        sender_tag,
        receiver_tag,
        index,
        total,
        piece: piece.as_bytes().to_vec(),
    })
}

/// Accumulates fragments until a whole message is available.
#[derive(Debug, Default)]
pub struct Assembler {
    total: u16,
    received: u16,
    buf: Vec<u8>,
}

impl Assembler {
    fn reset(&mut self) {
        self.total = 0;
        self.received = 0;
        self.buf.clear();
    }

    /// Feed one fragment. Returns the reassembled message when the final
    /// piece arrives; out-of-order input discards the partial buffer.
    pub fn assemble(&mut self, frag: Fragment) -> Option<Vec<u8>> {
        if frag.index == 1 {
            self.reset();
            self.total = frag.total;
            self.received = 1;
            self.buf = frag.piece;
        } else if frag.index == self.received + 1 && frag.total == self.total {
            self.received += 1;
            self.buf.extend_from_slice(&frag.piece);
        } else {
            self.reset();
            return None;
        }

        if self.received == self.total {
            let complete = std::mem::take(&mut self.buf);
            self.reset();
            Some(complete)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble_all(frags: Vec<Vec<u8>>) -> Option<Vec<u8>> {
        let mut assembler = Assembler::default();
        let mut out = None;
        for f in frags {
            out = assembler.assemble(parse_fragment(&f).unwrap());
        }
        out
    }

    #[test]
    fn test_small_message_passes_through() {
        let msg = b"?OTR:AAAA.".to_vec();
        let frags = fragment(msg.clone(), Version::V3, 400, 1, 2).unwrap();
        assert_eq!(frags, vec![msg]);
    }

    #[test]
    fn test_fragment_reassemble_identity_v3() {
        let msg: Vec<u8> = (0..600).map(|i| b'A' + (i % 26) as u8).collect();
        let frags = fragment(msg.clone(), Version::V3, 100, 0x100, 0x200).unwrap();
        assert!(frags.len() > 1);
        for f in &frags {
            assert!(f.len() <= 100);
            assert!(f.starts_with(b"?OTR|00000100|00000200,"));
        }
        assert_eq!(reassemble_all(frags), Some(msg));
    }

    #[test]
    fn test_fragment_reassemble_identity_v2() {
        let msg: Vec<u8> = (0..300).map(|i| b'a' + (i % 26) as u8).collect();
        let frags = fragment(msg.clone(), Version::V2, 40, 0, 0).unwrap();
        assert!(frags.len() > 1);
        assert_eq!(reassemble_all(frags), Some(msg));
    }

    #[test]
    fn test_minimum_fragment_size() {
        let msg = vec![b'x'; 200];
        let min = Version::V3.min_fragment_size();
        let frags = fragment(msg.clone(), Version::V3, min, 1, 2).unwrap();
        assert_eq!(frags.len(), 200);
        assert_eq!(reassemble_all(frags), Some(msg));

        assert!(fragment(vec![b'x'; 200], Version::V3, min - 1, 1, 2).is_err());
    }

    #[test]
    fn test_out_of_order_resets_buffer() {
        let msg = vec![b'z'; 300];
        let frags = fragment(msg, Version::V2, 50, 0, 0).unwrap();

        let mut assembler = Assembler::default();
        assert!(assembler
            .assemble(parse_fragment(&frags[0]).unwrap())
            .is_none());
        // Skipping a piece discards everything received so far.
        assert!(assembler
            .assemble(parse_fragment(&frags[2]).unwrap())
            .is_none());
        // Even the formerly-valid continuation is now rejected.
        assert!(assembler
            .assemble(parse_fragment(&frags[1]).unwrap())
            .is_none());
    }

    #[test]
    fn test_zero_index_rejected() {
        assert!(parse_fragment(b"?OTR,00000,00002,abc,").is_err());
    }

    #[test]
    fn test_garbage_fragment_rejected() {
        assert!(parse_fragment(b"?OTR|zzzz|0001,1,2,abc,").is_err());
        assert!(parse_fragment(b"?OTR,1,2,abc").is_err());
    }
}
