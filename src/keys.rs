//! Key management for the encrypted channel.
//!
//! After the AKE both sides keep a sliding window of Diffie-Hellman keys:
//! two of ours (current and previous, each with a key-id) and up to two of
//! the peer's. Per-message AES and MAC keys are derived lazily for each
//! (our-id, their-id) pair and memoised until either id leaves the window.
//! MAC keys of retired pairs are queued for revelation in the next outbound
//! data message.

use std::collections::HashMap;

use num_bigint::BigUint;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{dh, sha1};
use crate::error::OtrError;
use crate::rng::Rng;
use crate::wire::{Encoder, MAC_LEN};

/// AES and MAC keys for one (our-id, their-id) pairing.
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionKeys {
    pub sending_aes: [u8; 16],
    pub receiving_aes: [u8; 16],
    pub sending_mac: [u8; MAC_LEN],
    pub receiving_mac: [u8; MAC_LEN],
    /// Set once the receiving MAC verified an inbound message; only used
    /// keys are worth revealing after retirement.
    pub mac_used: bool,
}

impl SessionKeys {
    /// Derive session keys from our keypair and their public value.
    ///
    /// The side with the numerically larger public value mixes the 0x01
    /// byte into its sending keys and 0x02 into its receiving keys; the
    /// other side mirrors this, so both derive the same material.
    fn derive(ours: &dh::Keypair, their_public: &BigUint) -> Self {
        let mut enc = Encoder::new();
        enc.write_mpi(&ours.shared_secret(their_public));
        let secbytes = enc.into_vec();

        let (send_byte, recv_byte) = if ours.public > *their_public {
            (0x01u8, 0x02u8)
        } else {
            (0x02u8, 0x01u8)
        };

        let halved = |b: u8| {
            let mut input = Vec::with_capacity(1 + secbytes.len());
            input.push(b);
            input.extend_from_slice(&secbytes);
            let digest = sha1(&input);
            let mut key = [0u8; 16];
            key.copy_from_slice(&digest[..16]);
            key
        };

        let sending_aes = halved(send_byte);
        let receiving_aes = halved(recv_byte);
        Self {
            sending_aes,
            receiving_aes,
            sending_mac: sha1(&sending_aes),
            receiving_mac: sha1(&receiving_aes),
            mac_used: false,
        }
    }
}

/// The rotating key window for one conversation.
pub(crate) struct KeyManager {
    our_keyid: u32,
    our_current: dh::Keypair,
    our_previous: dh::Keypair,
    their_keyid: u32,
    their_current: BigUint,
    their_previous: Option<BigUint>,
    /// Outbound counter; used then incremented, so the first message
    /// carries 1 and values are strictly monotone for the conversation.
    our_counter: u64,
    /// Highest accepted inbound top-half counter per (sender, recipient) id.
    counters: HashMap<(u32, u32), u64>,
    /// Memoised session keys per (our-id, their-id).
    session_keys: HashMap<(u32, u32), SessionKeys>,
    /// MAC keys awaiting revelation in the next outbound message.
    pending_reveals: Vec<[u8; MAC_LEN]>,
}

impl KeyManager {
    /// Install the material handed over by a completed AKE. The AKE keypair
    /// becomes our previous key (id 1) and a fresh keypair is advertised as
    /// our current (id 2).
    pub fn new(ake_keypair: dh::Keypair, their_public: BigUint, rng: &mut Rng) -> Result<Self, OtrError> {
        let our_current = dh::Keypair::generate(rng)?;
        Ok(Self {
            our_keyid: 2,
            our_current,
            our_previous: ake_keypair,
            their_keyid: 1,
            their_current: their_public,
            their_previous: None,
            our_counter: 1,
            counters: HashMap::new(),
            session_keys: HashMap::new(),
            pending_reveals: Vec::new(),
        })
    }

    /// Key-id written as the sender key-id of outbound data messages.
    pub fn our_sending_keyid(&self) -> u32 {
        self.our_keyid - 1
    }

    pub fn their_keyid(&self) -> u32 {
        self.their_keyid
    }

    /// The public value advertised as our next key in outbound messages.
    pub fn our_next_public(&self) -> &BigUint {
        &self.our_current.public
    }

    /// The counter value for the next outbound message.
    pub fn next_counter(&mut self) -> [u8; 8] {
        let value = self.our_counter;
        self.our_counter += 1;
        value.to_be_bytes()
    }

    /// Session keys used for sending right now.
    pub fn sending_keys(&mut self) -> Result<&mut SessionKeys, OtrError> {
        self.session_keys_for(self.our_keyid - 1, self.their_keyid)
    }

    /// Resolve (and memoise) session keys for an id pair inside the window.
    pub fn session_keys_for(
        &mut self,
        our_id: u32,
        their_id: u32,
    ) -> Result<&mut SessionKeys, OtrError> {
        let ours = if our_id == self.our_keyid {
            &self.our_current
        } else if our_id + 1 == self.our_keyid {
            &self.our_previous
        } else {
            return Err(OtrError::UnreadableMessage);
        };
        let theirs = if their_id == self.their_keyid {
            &self.their_current
        } else if their_id + 1 == self.their_keyid {
            self.their_previous
                .as_ref()
                .ok_or(OtrError::UnreadableMessage)?
        } else {
            return Err(OtrError::UnreadableMessage);
        };

        Ok(self
            .session_keys
            .entry((our_id, their_id))
            .or_insert_with(|| SessionKeys::derive(ours, theirs)))
    }

    /// Check the strictly-increasing counter rule for an inbound message
    /// without advancing the stored value.
    pub fn counter_valid(
        &self,
        sender_keyid: u32,
        recipient_keyid: u32,
        ctr: &[u8; 8],
    ) -> Result<(), OtrError> {
        let value = u64::from_be_bytes(*ctr);
        let last = self
            .counters
            .get(&(sender_keyid, recipient_keyid))
            .copied()
            .unwrap_or(0);
        if value <= last {
            return Err(OtrError::CounterReplay);
        }
        Ok(())
    }

    /// Advance the stored counter once the message authenticated.
    pub fn commit_counter(&mut self, sender_keyid: u32, recipient_keyid: u32, ctr: &[u8; 8]) {
        let value = u64::from_be_bytes(*ctr);
        let last = self
            .counters
            .entry((sender_keyid, recipient_keyid))
            .or_insert(0);
        if value > *last {
            *last = value;
        }
    }

    /// Rotate the peer's key window after they advertised `next_public`
    /// from their current key.
    pub fn rotate_their_key(&mut self, sender_keyid: u32, next_public: &BigUint) {
        if sender_keyid != self.their_keyid {
            return;
        }
        if self.their_previous.is_some() {
            let retired = self.their_keyid - 1;
            self.retire(|(_, their_id)| *their_id == retired);
        }
        self.their_previous = Some(std::mem::replace(
            &mut self.their_current,
            next_public.clone(),
        ));
        self.their_keyid += 1;
        log::debug!("rotated their key window to id {}", self.their_keyid);
    }

    /// Rotate our key window after the peer acknowledged our current key.
    pub fn rotate_our_keys(&mut self, recipient_keyid: u32, rng: &mut Rng) -> Result<(), OtrError> {
        if recipient_keyid != self.our_keyid {
            return Ok(());
        }
        let retired = self.our_keyid - 1;
        self.retire(|(our_id, _)| *our_id == retired);
        let fresh = dh::Keypair::generate(rng)?;
        self.our_previous = std::mem::replace(&mut self.our_current, fresh);
        self.our_keyid += 1;
        log::debug!("rotated our key window to id {}", self.our_keyid);
        Ok(())
    }

    /// Drop memoised session keys matching `retired`, queueing the MAC keys
    /// of any that verified inbound traffic.
    fn retire<F: Fn(&(u32, u32)) -> bool>(&mut self, retired: F) {
        let ids: Vec<(u32, u32)> = self
            .session_keys
            .keys()
            .filter(|id| retired(id))
            .copied()
            .collect();
        for id in ids {
            if let Some(keys) = self.session_keys.remove(&id) {
                if keys.mac_used {
                    self.pending_reveals.push(keys.receiving_mac);
                }
            }
        }
        self.counters.retain(|(sender, recipient), _| !retired(&(*recipient, *sender)));
    }

    /// Drain the pending MAC keys as the concatenated wire block.
    pub fn reveal_mac_keys(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pending_reveals.len() * MAC_LEN);
        for mut key in self.pending_reveals.drain(..) {
            out.extend_from_slice(&key);
            key.zeroize();
        }
        out
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        for key in &mut self.pending_reveals {
            key.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_managers() -> (KeyManager, KeyManager, Rng, Rng) {
        let mut rng_a = Rng::from_seed([1; 32]);
        let mut rng_b = Rng::from_seed([2; 32]);
        let kp_a = dh::Keypair::generate(&mut rng_a).unwrap();
        let kp_b = dh::Keypair::generate(&mut rng_b).unwrap();
        let pub_a = kp_a.public.clone();
        let pub_b = kp_b.public.clone();
        let alice = KeyManager::new(kp_a, pub_b, &mut rng_a).unwrap();
        let bob = KeyManager::new(kp_b, pub_a, &mut rng_b).unwrap();
        (alice, bob, rng_a, rng_b)
    }

    #[test]
    fn test_initial_window_after_ake() {
        let (mut alice, _, _, _) = paired_managers();
        assert_eq!(alice.our_sending_keyid(), 1);
        assert_eq!(alice.their_keyid(), 1);
        assert_eq!(alice.next_counter(), 1u64.to_be_bytes());
        assert_eq!(alice.next_counter(), 2u64.to_be_bytes());
    }

    #[test]
    fn test_both_sides_derive_matching_keys() {
        let (mut alice, mut bob, _, _) = paired_managers();
        let a = alice.sending_keys().unwrap();
        let (a_send_aes, a_send_mac, a_recv_aes) =
            (a.sending_aes, a.sending_mac, a.receiving_aes);
        // Bob reads with the mirror id pair (his id 1, her sender id 1).
        let b = bob.session_keys_for(1, 1).unwrap();
        assert_eq!(a_send_aes, b.receiving_aes);
        assert_eq!(a_send_mac, b.receiving_mac);
        assert_eq!(a_recv_aes, b.sending_aes);
    }

    #[test]
    fn test_counter_must_strictly_increase() {
        let (mut alice, _, _, _) = paired_managers();
        let ctr1 = 1u64.to_be_bytes();
        let ctr2 = 2u64.to_be_bytes();
        assert!(alice.counter_valid(1, 1, &ctr1).is_ok());
        alice.commit_counter(1, 1, &ctr1);
        assert_eq!(
            alice.counter_valid(1, 1, &ctr1),
            Err(OtrError::CounterReplay)
        );
        assert!(alice.counter_valid(1, 1, &ctr2).is_ok());
        alice.commit_counter(1, 1, &ctr2);
        assert_eq!(
            alice.counter_valid(1, 1, &ctr1),
            Err(OtrError::CounterReplay)
        );
    }

    #[test]
    fn test_uncommitted_counter_does_not_advance() {
        let (mut alice, _, _, _) = paired_managers();
        let ctr = 5u64.to_be_bytes();
        assert!(alice.counter_valid(1, 1, &ctr).is_ok());
        // Validation alone leaves the stored counter untouched.
        assert!(alice.counter_valid(1, 1, &ctr).is_ok());
        alice.commit_counter(1, 1, &ctr);
        assert_eq!(alice.counter_valid(1, 1, &ctr), Err(OtrError::CounterReplay));
    }

    #[test]
    fn test_zero_counter_rejected() {
        let (alice, _, _, _) = paired_managers();
        assert_eq!(
            alice.counter_valid(1, 1, &[0; 8]),
            Err(OtrError::CounterReplay)
        );
    }

    #[test]
    fn test_unknown_keyid_is_unreadable() {
        let (mut alice, _, _, _) = paired_managers();
        assert_eq!(
            alice.session_keys_for(7, 1).unwrap_err(),
            OtrError::UnreadableMessage
        );
        assert_eq!(
            alice.session_keys_for(1, 9).unwrap_err(),
            OtrError::UnreadableMessage
        );
    }

    #[test]
    fn test_their_rotation_installs_next_key() {
        let (mut alice, _, mut rng, _) = paired_managers();
        let next = dh::Keypair::generate(&mut rng).unwrap().public.clone();
        alice.rotate_their_key(1, &next);
        assert_eq!(alice.their_keyid(), 2);
        // A second advertisement from the same old id is ignored.
        alice.rotate_their_key(1, &next);
        assert_eq!(alice.their_keyid(), 2);
    }

    #[test]
    fn test_our_rotation_acknowledged() {
        let (mut alice, _, mut rng, _) = paired_managers();
        let old_sending = alice.our_sending_keyid();
        alice.rotate_our_keys(2, &mut rng).unwrap();
        assert_eq!(alice.our_sending_keyid(), old_sending + 1);
        // Acknowledging a stale id changes nothing.
        alice.rotate_our_keys(2, &mut rng).unwrap();
        assert_eq!(alice.our_sending_keyid(), old_sending + 1);
    }

    #[test]
    fn test_used_mac_keys_revealed_once_after_retirement() {
        let (mut alice, _, mut rng, _) = paired_managers();
        let keys = alice.session_keys_for(1, 1).unwrap();
        keys.mac_used = true;
        let expected = keys.receiving_mac;

        // Their rotation alone retires nothing (no previous key yet); ours
        // retires (1, 1) because our id 1 leaves the window.
        let next = dh::Keypair::generate(&mut rng).unwrap().public.clone();
        alice.rotate_their_key(1, &next);
        alice.rotate_our_keys(2, &mut rng).unwrap();

        let revealed = alice.reveal_mac_keys();
        assert_eq!(revealed, expected.to_vec());
        assert!(alice.reveal_mac_keys().is_empty());
    }

    #[test]
    fn test_unused_mac_keys_not_revealed() {
        let (mut alice, _, mut rng, _) = paired_managers();
        alice.session_keys_for(1, 1).unwrap();
        alice.rotate_our_keys(2, &mut rng).unwrap();
        assert!(alice.reveal_mac_keys().is_empty());
    }
}
