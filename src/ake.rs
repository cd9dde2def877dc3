//! The authenticated key exchange.
//!
//! Four messages establish the secure channel: DH-commit, DH-key,
//! reveal-signature, and signature. The commit sender hides gx behind an
//! AES key r and a SHA-256 commitment, reveals both in the third message,
//! and each side signs the exchanged DH values with its long-term DSA key.
//! Simultaneous initiations are broken by comparing the hashed commitments
//! as unsigned big-endian values.
//!
//! Verification failures reset the exchange to its initial state and the
//! offending message is dropped without a reply.

use num_bigint::BigUint;

use crate::crypto::dsa::{DsaKeyPair, DsaPublicKey};
use crate::crypto::{cipher, dh, hmac_sha256, hmac_sha256_160, sha256, verify_bytes};
use crate::error::OtrError;
use crate::rng::Rng;
use crate::version::{Version, MSG_TYPE_DH_COMMIT, MSG_TYPE_DH_KEY, MSG_TYPE_REVEAL_SIG, MSG_TYPE_SIG};
use crate::wire::{Decoder, Encoder, MAC_LEN};

/// Symmetric keys derived from the AKE shared secret.
pub(crate) struct AkeKeys {
    pub ssid: [u8; 8],
    pub c: [u8; 16],
    pub cp: [u8; 16],
    pub m1: [u8; 32],
    pub m2: [u8; 32],
    pub m1p: [u8; 32],
    pub m2p: [u8; 32],
}

impl AkeKeys {
    /// Expand s into the session id, the two AES keys, and the four MAC
    /// keys, each from SHA-256 over a distinct prefix byte and MPI(s).
    fn derive(s: &BigUint) -> Self {
        let mut enc = Encoder::new();
        enc.write_mpi(s);
        let secbytes = enc.into_vec();
        let h2 = |b: u8| crate::crypto::sha256_prefixed(b, &secbytes);

        let mut ssid = [0u8; 8];
        ssid.copy_from_slice(&h2(0x00)[..8]);
        let c_full = h2(0x01);
        let mut c = [0u8; 16];
        let mut cp = [0u8; 16];
        c.copy_from_slice(&c_full[..16]);
        cp.copy_from_slice(&c_full[16..]);

        Self {
            ssid,
            c,
            cp,
            m1: h2(0x02),
            m2: h2(0x03),
            m1p: h2(0x04),
            m2p: h2(0x05),
        }
    }
}

/// Everything a completed AKE hands to the conversation.
#[derive(Debug)]
pub(crate) struct AkeOutcome {
    pub ssid: [u8; 8],
    pub our_keypair: dh::Keypair,
    pub their_public: BigUint,
    pub their_dsa: DsaPublicKey,
}

/// Inputs the AKE needs from the surrounding conversation.
pub(crate) struct AkeInputs<'a> {
    pub version: Version,
    pub our_tag: u32,
    pub their_tag: u32,
    pub our_key: &'a DsaKeyPair,
}

impl AkeInputs<'_> {
    fn header(&self, msg_type: u8) -> Vec<u8> {
        self.version
            .message_header(msg_type, self.our_tag, self.their_tag)
    }
}

struct AwaitingDhKey {
    r: [u8; 16],
    our_dh: dh::Keypair,
    hashed_gx: [u8; 32],
    /// The serialized DH-commit, kept for bit-exact retransmission.
    dh_commit: Vec<u8>,
}

struct AwaitingRevealSig {
    our_dh: dh::Keypair,
    gx_encrypted: Vec<u8>,
    gx_hashed: Vec<u8>,
    /// The serialized DH-key, kept for bit-exact retransmission.
    dh_key: Vec<u8>,
}

struct AwaitingSig {
    our_dh: dh::Keypair,
    gy: BigUint,
    keys: AkeKeys,
    /// The serialized reveal-signature, retransmitted on a repeated DH-key.
    reveal_sig: Vec<u8>,
}

enum AkeState {
    None,
    AwaitingDhKey(AwaitingDhKey),
    AwaitingRevealSig(AwaitingRevealSig),
    AwaitingSig(AwaitingSig),
}

/// The AKE state machine for one conversation.
pub(crate) struct Ake {
    state: AkeState,
}

impl Default for Ake {
    fn default() -> Self {
        Self {
            state: AkeState::None,
        }
    }
}

impl Ake {
    pub fn reset(&mut self) {
        self.state = AkeState::None;
    }

    pub fn in_progress(&self) -> bool {
        !matches!(self.state, AkeState::None)
    }

    /// Begin (or restart) the exchange by emitting a DH-commit.
    pub fn initiate(&mut self, inputs: &AkeInputs, rng: &mut Rng) -> Result<Vec<u8>, OtrError> {
        let our_dh = dh::Keypair::generate(rng)?;
        let r: [u8; 16] = rng.random_array()?;

        let mut enc = Encoder::new();
        enc.write_mpi(&our_dh.public);
        let gxmpi = enc.into_vec();
        let gx_encrypted = cipher::aes_ctr_zero(&r, &gxmpi);
        let hashed_gx = sha256(&gxmpi);

        let mut enc = Encoder::new();
        enc.write_bytes(&inputs.header(MSG_TYPE_DH_COMMIT))
            .write_data(&gx_encrypted)
            .write_data(&hashed_gx);
        let dh_commit = enc.into_vec();

        log::debug!("AKE: sending DH-commit, awaiting DH-key");
        self.state = AkeState::AwaitingDhKey(AwaitingDhKey {
            r,
            our_dh,
            hashed_gx,
            dh_commit: dh_commit.clone(),
        });
        Ok(dh_commit)
    }

    /// Process an inbound DH-commit payload.
    pub fn handle_dh_commit(
        &mut self,
        inputs: &AkeInputs,
        payload: &[u8],
        rng: &mut Rng,
    ) -> Result<Option<Vec<u8>>, OtrError> {
        let mut dec = Decoder::new(payload);
        let gx_encrypted = dec.read_data()?;
        let gx_hashed = dec.read_data()?;

        match std::mem::replace(&mut self.state, AkeState::None) {
            AkeState::None | AkeState::AwaitingSig(_) => {
                self.respond_with_dh_key(inputs, gx_encrypted, gx_hashed, rng).map(Some)
            }
            AkeState::AwaitingRevealSig(mut st) => {
                // The peer restarted or resent its commit: adopt the new
                // commitment but retransmit our DH-key unchanged.
                st.gx_encrypted = gx_encrypted;
                st.gx_hashed = gx_hashed;
                let resend = st.dh_key.clone();
                self.state = AkeState::AwaitingRevealSig(st);
                log::debug!("AKE: repeated DH-commit, retransmitting DH-key");
                Ok(Some(resend))
            }
            AkeState::AwaitingDhKey(st) => {
                // Both sides committed at once. The higher hashed gx wins
                // and keeps its commitment.
                let ours = BigUint::from_bytes_be(&st.hashed_gx);
                let theirs = BigUint::from_bytes_be(&gx_hashed);
                if ours > theirs {
                    let resend = st.dh_commit.clone();
                    self.state = AkeState::AwaitingDhKey(st);
                    log::debug!("AKE: commit collision won, retransmitting DH-commit");
                    Ok(Some(resend))
                } else {
                    log::debug!("AKE: commit collision lost, adopting peer's commit");
                    self.respond_with_dh_key(inputs, gx_encrypted, gx_hashed, rng).map(Some)
                }
            }
        }
    }

    fn respond_with_dh_key(
        &mut self,
        inputs: &AkeInputs,
        gx_encrypted: Vec<u8>,
        gx_hashed: Vec<u8>,
        rng: &mut Rng,
    ) -> Result<Vec<u8>, OtrError> {
        let our_dh = dh::Keypair::generate(rng)?;
        let mut enc = Encoder::new();
        enc.write_bytes(&inputs.header(MSG_TYPE_DH_KEY))
            .write_mpi(&our_dh.public);
        let dh_key = enc.into_vec();

        self.state = AkeState::AwaitingRevealSig(AwaitingRevealSig {
            our_dh,
            gx_encrypted,
            gx_hashed,
            dh_key: dh_key.clone(),
        });
        Ok(dh_key)
    }

    /// Process an inbound DH-key payload.
    pub fn handle_dh_key(
        &mut self,
        inputs: &AkeInputs,
        payload: &[u8],
        rng: &mut Rng,
    ) -> Result<Option<Vec<u8>>, OtrError> {
        let mut dec = Decoder::new(payload);
        let gy = dec.read_mpi()?;

        match std::mem::replace(&mut self.state, AkeState::None) {
            AkeState::AwaitingDhKey(st) => {
                if let Err(e) = dh::verify_group_element(&gy) {
                    log::debug!("AKE: DH-key carried an invalid group element");
                    return Err(e);
                }
                let s = st.our_dh.shared_secret(&gy);
                let keys = AkeKeys::derive(&s);
                let signature_block = build_signature_block(
                    &keys.c,
                    &keys.m1,
                    &keys.m2,
                    &st.our_dh.public,
                    &gy,
                    inputs.our_key,
                    rng,
                )?;

                let mut enc = Encoder::new();
                enc.write_bytes(&inputs.header(MSG_TYPE_REVEAL_SIG))
                    .write_data(&st.r)
                    .write_data(&signature_block.encrypted)
                    .write_mac(&signature_block.mac);
                let reveal_sig = enc.into_vec();

                log::debug!("AKE: DH-key accepted, sending reveal-signature");
                self.state = AkeState::AwaitingSig(AwaitingSig {
                    our_dh: st.our_dh,
                    gy,
                    keys,
                    reveal_sig: reveal_sig.clone(),
                });
                Ok(Some(reveal_sig))
            }
            AkeState::AwaitingSig(st) => {
                // A repeat of the DH-key we already answered gets the same
                // reveal-signature again; anything else is ignored.
                let resend = (st.gy == gy).then(|| st.reveal_sig.clone());
                self.state = AkeState::AwaitingSig(st);
                Ok(resend)
            }
            other => {
                self.state = other;
                Ok(None)
            }
        }
    }

    /// Process an inbound reveal-signature payload. On success the secure
    /// channel material and the final signature message are returned.
    pub fn handle_reveal_sig(
        &mut self,
        inputs: &AkeInputs,
        payload: &[u8],
        rng: &mut Rng,
    ) -> Result<Option<(AkeOutcome, Vec<u8>)>, OtrError> {
        let mut dec = Decoder::new(payload);
        let revealed_key = dec.read_data()?;
        let sig_encrypted = dec.read_data()?;
        let sig_mac = dec.read_mac()?;
        let r: [u8; 16] = revealed_key
            .try_into()
            .map_err(|_| OtrError::MalformedMessage)?;

        let st = match std::mem::replace(&mut self.state, AkeState::None) {
            AkeState::AwaitingRevealSig(st) => st,
            other => {
                self.state = other;
                return Ok(None);
            }
        };

        // Decrypt the committed gx and check it against the commitment
        // before trusting anything else in the message.
        let gxmpi = cipher::aes_ctr_zero(&r, &st.gx_encrypted);
        verify_bytes(&sha256(&gxmpi), &st.gx_hashed).map_err(|_| OtrError::HashMismatch)?;
        let mut gx_dec = Decoder::new(&gxmpi);
        let gx = gx_dec.read_mpi()?;
        gx_dec.done()?;
        dh::verify_group_element(&gx)?;

        let s = st.our_dh.shared_secret(&gx);
        let keys = AkeKeys::derive(&s);
        let their_dsa = verify_signature_block(
            &keys.c,
            &keys.m1,
            &keys.m2,
            &gx,
            &st.our_dh.public,
            &sig_encrypted,
            &sig_mac,
        )?;

        // Answer with our own signature under the primed keys.
        let signature_block = build_signature_block(
            &keys.cp,
            &keys.m1p,
            &keys.m2p,
            &st.our_dh.public,
            &gx,
            inputs.our_key,
            rng,
        )?;
        let mut enc = Encoder::new();
        enc.write_bytes(&inputs.header(MSG_TYPE_SIG))
            .write_data(&signature_block.encrypted)
            .write_mac(&signature_block.mac);
        let sig_msg = enc.into_vec();

        log::debug!("AKE: reveal-signature verified, channel established");
        Ok(Some((
            AkeOutcome {
                ssid: keys.ssid,
                our_keypair: st.our_dh,
                their_public: gx,
                their_dsa,
            },
            sig_msg,
        )))
    }

    /// Process the final signature payload.
    pub fn handle_sig(&mut self, payload: &[u8]) -> Result<Option<AkeOutcome>, OtrError> {
        let mut dec = Decoder::new(payload);
        let sig_encrypted = dec.read_data()?;
        let sig_mac = dec.read_mac()?;

        let st = match std::mem::replace(&mut self.state, AkeState::None) {
            AkeState::AwaitingSig(st) => st,
            other => {
                self.state = other;
                return Ok(None);
            }
        };

        let their_dsa = verify_signature_block(
            &st.keys.cp,
            &st.keys.m1p,
            &st.keys.m2p,
            &st.gy,
            &st.our_dh.public,
            &sig_encrypted,
            &sig_mac,
        )?;

        log::debug!("AKE: signature verified, channel established");
        Ok(Some(AkeOutcome {
            ssid: st.keys.ssid,
            our_keypair: st.our_dh,
            their_public: st.gy,
            their_dsa,
        }))
    }
}

struct SignatureBlock {
    encrypted: Vec<u8>,
    mac: [u8; MAC_LEN],
}

/// Sign {our gx, their gy, our public key, keyid 1} and wrap the result in
/// the AKE's encrypt-then-MAC envelope.
fn build_signature_block(
    aes_key: &[u8; 16],
    m1: &[u8; 32],
    m2: &[u8; 32],
    our_public: &BigUint,
    their_public: &BigUint,
    our_key: &DsaKeyPair,
    rng: &mut Rng,
) -> Result<SignatureBlock, OtrError> {
    const KEY_ID: u32 = 1;
    let wire_key = our_key.public().to_wire();

    let mut enc = Encoder::new();
    enc.write_mpi(our_public)
        .write_mpi(their_public)
        .write_public_key(&wire_key)
        .write_u32(KEY_ID);
    let m = hmac_sha256(m1, &enc.to_vec());
    let (sig_r, sig_s) = our_key.sign(&m, rng)?;

    let mut enc = Encoder::new();
    enc.write_public_key(&wire_key)
        .write_u32(KEY_ID)
        .write_signature(&sig_r, &sig_s);
    let encrypted = cipher::aes_ctr_zero(aes_key, &enc.to_vec());

    let mut enc = Encoder::new();
    enc.write_data(&encrypted);
    let mac = hmac_sha256_160(m2, &enc.to_vec());

    Ok(SignatureBlock { encrypted, mac })
}

/// Verify the peer's encrypt-then-MAC signature block; `their_public` /
/// `our_public` are ordered as the signer ordered them.
fn verify_signature_block(
    aes_key: &[u8; 16],
    m1: &[u8; 32],
    m2: &[u8; 32],
    their_public: &BigUint,
    our_public: &BigUint,
    sig_encrypted: &[u8],
    sig_mac: &[u8; MAC_LEN],
) -> Result<DsaPublicKey, OtrError> {
    let mut enc = Encoder::new();
    enc.write_data(sig_encrypted);
    verify_bytes(&hmac_sha256_160(m2, &enc.to_vec()), sig_mac)?;

    let block = cipher::aes_ctr_zero(aes_key, sig_encrypted);
    let mut dec = Decoder::new(&block);
    let wire_key = dec.read_public_key()?;
    let key_id = dec.read_u32()?;
    let (sig_r, sig_s) = dec.read_signature()?;
    dec.done()?;
    if key_id == 0 {
        return Err(OtrError::MalformedMessage);
    }
    let their_dsa = DsaPublicKey::from_wire(wire_key)?;

    let mut enc = Encoder::new();
    enc.write_mpi(their_public)
        .write_mpi(our_public)
        .write_public_key(&their_dsa.to_wire())
        .write_u32(key_id);
    let m = hmac_sha256(m1, &enc.to_vec());
    their_dsa.verify(&m, &sig_r, &sig_s)?;
    Ok(their_dsa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::MessageHead;

    struct Party {
        ake: Ake,
        key: DsaKeyPair,
        rng: Rng,
        tag: u32,
    }

    impl Party {
        fn new(seed: u8, tag: u32) -> Self {
            let mut rng = Rng::from_seed([seed; 32]);
            let key = DsaKeyPair::generate(&mut rng).unwrap();
            Self {
                ake: Ake::default(),
                key,
                rng,
                tag,
            }
        }

    }

    fn inputs_for(key: &DsaKeyPair, our_tag: u32, their_tag: u32) -> AkeInputs<'_> {
        AkeInputs {
            version: Version::V3,
            our_tag,
            their_tag,
            our_key: key,
        }
    }

    fn payload(message: &[u8]) -> &[u8] {
        MessageHead::parse(message).unwrap().1
    }

    /// Run the whole handshake and return both outcomes.
    fn run_handshake(alice: &mut Party, bob: &mut Party) -> (AkeOutcome, AkeOutcome) {
        let inputs_a = AkeInputs {
            version: Version::V3,
            our_tag: alice.tag,
            their_tag: bob.tag,
            our_key: &alice.key,
        };
        let inputs_b = AkeInputs {
            version: Version::V3,
            our_tag: bob.tag,
            their_tag: alice.tag,
            our_key: &bob.key,
        };

        let commit = alice.ake.initiate(&inputs_a, &mut alice.rng).unwrap();
        let dh_key = bob
            .ake
            .handle_dh_commit(&inputs_b, payload(&commit), &mut bob.rng)
            .unwrap()
            .unwrap();
        let reveal = alice
            .ake
            .handle_dh_key(&inputs_a, payload(&dh_key), &mut alice.rng)
            .unwrap()
            .unwrap();
        let (bob_outcome, sig) = bob
            .ake
            .handle_reveal_sig(&inputs_b, payload(&reveal), &mut bob.rng)
            .unwrap()
            .unwrap();
        let alice_outcome = alice.ake.handle_sig(payload(&sig)).unwrap().unwrap();
        (alice_outcome, bob_outcome)
    }

    #[test]
    fn test_handshake_agrees_on_ssid() {
        let mut alice = Party::new(1, 0x101);
        let mut bob = Party::new(2, 0x202);
        let (a, b) = run_handshake(&mut alice, &mut bob);

        assert_eq!(a.ssid, b.ssid);
        assert_eq!(a.our_keypair.public, b.their_public);
        assert_eq!(b.our_keypair.public, a.their_public);
        assert_eq!(a.their_dsa, *bob.key.public());
        assert_eq!(b.their_dsa, *alice.key.public());
        assert!(!alice.ake.in_progress());
        assert!(!bob.ake.in_progress());
    }

    #[test]
    fn test_repeated_dh_commit_retransmits_same_dh_key() {
        let mut alice = Party::new(3, 0x101);
        let mut bob = Party::new(4, 0x202);
        let inputs_a = inputs_for(&alice.key, alice.tag, bob.tag);
        let inputs_b = inputs_for(&bob.key, bob.tag, alice.tag);

        let commit = alice.ake.initiate(&inputs_a, &mut alice.rng).unwrap();
        let first = bob
            .ake
            .handle_dh_commit(&inputs_b, payload(&commit), &mut bob.rng)
            .unwrap()
            .unwrap();
        let second = bob
            .ake
            .handle_dh_commit(&inputs_b, payload(&commit), &mut bob.rng)
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_commit_collision_higher_hash_wins() {
        let mut alice = Party::new(5, 0x101);
        let mut bob = Party::new(6, 0x202);
        let inputs_a = inputs_for(&alice.key, alice.tag, bob.tag);
        let inputs_b = inputs_for(&bob.key, bob.tag, alice.tag);

        let commit_a = alice.ake.initiate(&inputs_a, &mut alice.rng).unwrap();
        let commit_b = bob.ake.initiate(&inputs_b, &mut bob.rng).unwrap();

        let hash_of = |msg: &[u8]| {
            let mut dec = Decoder::new(payload(msg));
            dec.read_data().unwrap();
            BigUint::from_bytes_be(&dec.read_data().unwrap())
        };
        let a_wins = hash_of(&commit_a) > hash_of(&commit_b);

        let reply_a = alice
            .ake
            .handle_dh_commit(&inputs_a, payload(&commit_b), &mut alice.rng)
            .unwrap()
            .unwrap();
        let reply_b = bob
            .ake
            .handle_dh_commit(&inputs_b, payload(&commit_a), &mut bob.rng)
            .unwrap()
            .unwrap();

        let (winner_reply, loser_reply, winner_commit) = if a_wins {
            (reply_a, reply_b, commit_a)
        } else {
            (reply_b, reply_a, commit_b)
        };
        // The winner repeats its commit bit-for-bit; the loser answers it
        // with a DH-key.
        assert_eq!(winner_reply, winner_commit);
        let head = MessageHead::parse(&loser_reply).unwrap().0;
        assert_eq!(head.msg_type, MSG_TYPE_DH_KEY);
    }

    #[test]
    fn test_out_of_state_messages_ignored() {
        let mut alice = Party::new(7, 0x101);
        let mut bob = Party::new(8, 0x202);
        let inputs_a = inputs_for(&alice.key, alice.tag, bob.tag);
        let inputs_b = inputs_for(&bob.key, bob.tag, alice.tag);

        let commit = alice.ake.initiate(&inputs_a, &mut alice.rng).unwrap();
        let dh_key = bob
            .ake
            .handle_dh_commit(&inputs_b, payload(&commit), &mut bob.rng)
            .unwrap()
            .unwrap();

        // Bob (awaiting reveal-sig) ignores a stray DH-key.
        assert!(bob
            .ake
            .handle_dh_key(&inputs_b, payload(&dh_key), &mut bob.rng)
            .unwrap()
            .is_none());
        // A fresh party ignores a stray signature payload.
        let mut carol = Party::new(9, 0x303);
        let mut enc = Encoder::new();
        enc.write_data(b"junk").write_mac(&[0u8; MAC_LEN]);
        let bytes = enc.into_vec();
        assert!(carol.ake.handle_sig(&bytes).unwrap().is_none());
    }

    #[test]
    fn test_tampered_reveal_sig_mac_resets() {
        let mut alice = Party::new(10, 0x101);
        let mut bob = Party::new(11, 0x202);
        let inputs_a = inputs_for(&alice.key, alice.tag, bob.tag);
        let inputs_b = inputs_for(&bob.key, bob.tag, alice.tag);

        let commit = alice.ake.initiate(&inputs_a, &mut alice.rng).unwrap();
        let dh_key = bob
            .ake
            .handle_dh_commit(&inputs_b, payload(&commit), &mut bob.rng)
            .unwrap()
            .unwrap();
        let mut reveal = alice
            .ake
            .handle_dh_key(&inputs_a, payload(&dh_key), &mut alice.rng)
            .unwrap()
            .unwrap();
        let last = reveal.len() - 1;
        reveal[last] ^= 0xFF;

        let result = bob
            .ake
            .handle_reveal_sig(&inputs_b, payload(&reveal), &mut bob.rng);
        assert_eq!(result.unwrap_err(), OtrError::MacFailure);
        assert!(!bob.ake.in_progress());
    }

    #[test]
    fn test_invalid_dh_key_element_rejected() {
        let mut alice = Party::new(12, 0x101);
        let inputs_a = inputs_for(&alice.key, alice.tag, 0x202);
        alice.ake.initiate(&inputs_a, &mut alice.rng).unwrap();

        let mut enc = Encoder::new();
        enc.write_mpi(&BigUint::from(1u8));
        let bytes = enc.into_vec();
        assert_eq!(
            alice
                .ake
                .handle_dh_key(&inputs_a, &bytes, &mut alice.rng)
                .unwrap_err(),
            OtrError::InvalidGroupElement
        );
    }
}
