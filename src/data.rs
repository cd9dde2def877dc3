//! The encrypted data-message codec.
//!
//! A data message carries the flags byte, the sender and recipient key-ids,
//! the sender's next DH public key, the 8-byte top-half counter, the
//! AES-CTR ciphertext, a 20-byte HMAC-SHA1 over everything before it, and
//! the block of revealed MAC keys. The plaintext inside the ciphertext is
//! the user message, a NUL separator, and a TLV stream.

use num_bigint::BigUint;

use crate::crypto::{cipher, dh, hmac_sha1, verify_bytes};
use crate::error::OtrError;
use crate::keys::KeyManager;
use crate::rng::Rng;
use crate::wire::tlv::{parse_tlvs, serialize_tlvs};
use crate::wire::{Decoder, Encoder, Tlv};

/// Flag asking the receiver not to surface an error if the message is
/// unreadable. Set on heartbeats and TLV-only replies.
pub const FLAG_IGNORE_UNREADABLE: u8 = 0x01;

/// A decrypted and verified data message.
#[derive(Debug)]
pub struct OpenedData {
    pub plaintext: Vec<u8>,
    pub tlvs: Vec<Tlv>,
    pub flags: u8,
}

/// Build a complete serialized data message (header included).
pub fn seal(
    keys: &mut KeyManager,
    header: &[u8],
    message: &[u8],
    tlvs: &[Tlv],
    flags: u8,
) -> Result<Vec<u8>, OtrError> {
    let sender_keyid = keys.our_sending_keyid();
    let recipient_keyid = keys.their_keyid();
    let next_dh = keys.our_next_public().clone();
    let ctr = keys.next_counter();

    let mut plain = message.to_vec();
    plain.push(0x00);
    plain.extend_from_slice(&serialize_tlvs(tlvs));

    let session = keys.sending_keys()?;
    let encrypted = cipher::aes_ctr(&session.sending_aes, &ctr, &plain);
    let sending_mac = session.sending_mac;

    let mut enc = Encoder::new();
    enc.write_bytes(header)
        .write_u8(flags)
        .write_u32(sender_keyid)
        .write_u32(recipient_keyid)
        .write_mpi(&next_dh)
        .write_bytes(&ctr)
        .write_data(&encrypted);
    let authenticated = enc.into_vec();

    let mac = hmac_sha1(&sending_mac, &authenticated);
    let revealed = keys.reveal_mac_keys();

    let mut enc = Encoder::new();
    enc.write_bytes(&authenticated)
        .write_mac(&mac)
        .write_data(&revealed);
    Ok(enc.into_vec())
}

/// Verify and decrypt an inbound data message.
///
/// `header` is the already-parsed message header exactly as received;
/// `payload` is everything after it. Key rotations happen only after the
/// message authenticates and decrypts.
pub fn open(
    keys: &mut KeyManager,
    header: &[u8],
    payload: &[u8],
    rng: &mut Rng,
) -> Result<OpenedData, OtrError> {
    let mut dec = Decoder::new(payload);
    let flags = dec.read_u8()?;
    let sender_keyid = dec.read_u32()?;
    let recipient_keyid = dec.read_u32()?;
    let next_dh: BigUint = dec.read_mpi()?;
    let ctr = dec.read_ctr()?;
    let encrypted = dec.read_data()?;
    let mac_offset = dec.position();
    let mac = dec.read_mac()?;
    let _old_mac_keys = dec.read_data()?;
    dec.done()?;

    keys.counter_valid(sender_keyid, recipient_keyid, &ctr)?;

    // Inbound ids arrive from the peer's perspective: their sender key-id
    // pairs with our recipient key-id.
    let session = keys.session_keys_for(recipient_keyid, sender_keyid)?;

    let mut authenticated = Vec::with_capacity(header.len() + mac_offset);
    authenticated.extend_from_slice(header);
    authenticated.extend_from_slice(&payload[..mac_offset]);
    verify_bytes(&hmac_sha1(&session.receiving_mac, &authenticated), &mac)?;
    session.mac_used = true;

    let plain = cipher::aes_ctr(&session.receiving_aes, &ctr, &encrypted);
    let (plaintext, tlvs) = split_payload(&plain)?;

    keys.commit_counter(sender_keyid, recipient_keyid, &ctr);
    dh::verify_group_element(&next_dh)?;
    keys.rotate_their_key(sender_keyid, &next_dh);
    keys.rotate_our_keys(recipient_keyid, rng)?;

    Ok(OpenedData {
        plaintext,
        tlvs,
        flags,
    })
}

/// Split decrypted content at the first NUL into user text and TLV stream.
fn split_payload(plain: &[u8]) -> Result<(Vec<u8>, Vec<Tlv>), OtrError> {
    match plain.iter().position(|&b| b == 0x00) {
        Some(nul) => Ok((plain[..nul].to_vec(), parse_tlvs(&plain[nul + 1..])?)),
        None => Ok((plain.to_vec(), Vec::new())),
    }
}
