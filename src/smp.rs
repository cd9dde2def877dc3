//! The Socialist Millionaires' Protocol.
//!
//! A four-message zero-knowledge comparison of a shared secret, run as
//! TLVs inside the encrypted channel. All arithmetic happens in the same
//! 1536-bit group as the AKE; exponents and proof responses are taken
//! modulo the group order q = (p - 1) / 2.
//!
//! Any proof failure replies with an abort TLV and resets the machine; a
//! message for the wrong state does the same but is reported as a state
//! error rather than cheating.

use num_bigint::BigUint;

use crate::crypto::{dh, sha256};
use crate::error::OtrError;
use crate::events::SmpEvent;
use crate::rng::Rng;
use crate::wire::tlv::{TLV_SMP1, TLV_SMP1_WITH_QUESTION, TLV_SMP2, TLV_SMP3, TLV_SMP4, TLV_SMP_ABORT};
use crate::wire::{Decoder, Encoder, Tlv};

/// Byte length of a random SMP exponent (1536 bits, reduced by rejection).
const EXPONENT_BYTES: usize = 192;

/// Context the SMP needs from the conversation for each step.
pub(crate) struct SmpInputs {
    pub ssid: [u8; 8],
    pub our_fingerprint: [u8; 20],
    pub their_fingerprint: [u8; 20],
}

/// An event to surface through the host's SMP callback.
pub(crate) struct SmpNotice {
    pub event: SmpEvent,
    pub progress: u8,
    pub question: String,
}

impl SmpNotice {
    fn new(event: SmpEvent, progress: u8) -> Self {
        Self {
            event,
            progress,
            question: String::new(),
        }
    }
}

struct Smp1Message {
    g2a: BigUint,
    c2: BigUint,
    d2: BigUint,
    g3a: BigUint,
    c3: BigUint,
    d3: BigUint,
}

struct Smp2Message {
    g2b: BigUint,
    c2: BigUint,
    d2: BigUint,
    g3b: BigUint,
    c3: BigUint,
    d3: BigUint,
    pb: BigUint,
    qb: BigUint,
    cp: BigUint,
    d5: BigUint,
    d6: BigUint,
}

struct Smp3Message {
    pa: BigUint,
    qa: BigUint,
    cp: BigUint,
    d5: BigUint,
    d6: BigUint,
    ra: BigUint,
    cr: BigUint,
    d7: BigUint,
}

struct Smp4Message {
    rb: BigUint,
    cr: BigUint,
    d7: BigUint,
}

enum SmpState {
    /// Nothing in flight; ready to initiate or receive an SMP1.
    Expect1,
    /// SMP1 arrived and was verified; the host still owes us the secret.
    WaitingForSecret {
        question: Option<String>,
        msg: Smp1Message,
    },
    /// We initiated and await the responder's SMP2.
    Expect2 {
        x: BigUint,
        a2: BigUint,
        a3: BigUint,
    },
    /// We responded with SMP2 and await SMP3.
    Expect3 {
        g3a: BigUint,
        g2: BigUint,
        g3: BigUint,
        b3: BigUint,
        pb: BigUint,
        qb: BigUint,
    },
    /// We sent SMP3 and await the final SMP4.
    Expect4 {
        g3b: BigUint,
        pab: BigUint,
        qab: BigUint,
        a3: BigUint,
    },
}

/// The SMP state machine for one conversation.
pub(crate) struct Smp {
    state: SmpState,
}

impl Default for Smp {
    fn default() -> Self {
        Self {
            state: SmpState::Expect1,
        }
    }
}

impl Smp {
    /// True while an exchange is in flight.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, SmpState::Expect1)
    }

    /// Initiate the protocol with our secret, optionally with a question
    /// shown to the peer.
    pub fn start(
        &mut self,
        inputs: &SmpInputs,
        rng: &mut Rng,
        secret: &[u8],
        question: Option<&str>,
    ) -> Result<Tlv, OtrError> {
        if self.in_progress() {
            return Err(OtrError::PolicyViolation);
        }
        // We initiate, so our fingerprint hashes first.
        let x = compute_secret(
            &inputs.our_fingerprint,
            &inputs.their_fingerprint,
            &inputs.ssid,
            secret,
        );
        let a2 = random_exponent(rng)?;
        let a3 = random_exponent(rng)?;
        let r2 = random_exponent(rng)?;
        let r3 = random_exponent(rng)?;

        let g1 = dh::generator();
        let p = dh::modulus();
        let g2a = g1.modpow(&a2, p);
        let g3a = g1.modpow(&a3, p);
        let (c2, d2) = generate_zkp(&r2, &a2, 1);
        let (c3, d3) = generate_zkp(&r3, &a3, 2);

        let mut enc = Encoder::new();
        let typ = if let Some(q) = question {
            enc.write_bytes(q.as_bytes()).write_u8(0x00);
            TLV_SMP1_WITH_QUESTION
        } else {
            TLV_SMP1
        };
        enc.write_mpi_sequence(&[&g2a, &c2, &d2, &g3a, &c3, &d3]);

        log::debug!("SMP: initiated, awaiting SMP2");
        self.state = SmpState::Expect2 { x, a2, a3 };
        Ok(Tlv::new(typ, enc.into_vec()))
    }

    /// Supply the secret after an inbound SMP1 asked for it.
    pub fn provide_secret(
        &mut self,
        inputs: &SmpInputs,
        rng: &mut Rng,
        secret: &[u8],
    ) -> Result<Tlv, OtrError> {
        let msg = match std::mem::replace(&mut self.state, SmpState::Expect1) {
            SmpState::WaitingForSecret { msg, .. } => msg,
            other => {
                self.state = other;
                return Err(OtrError::PolicyViolation);
            }
        };
        // The peer initiated, so their fingerprint hashes first.
        let y = compute_secret(
            &inputs.their_fingerprint,
            &inputs.our_fingerprint,
            &inputs.ssid,
            secret,
        );

        let b2 = random_exponent(rng)?;
        let b3 = random_exponent(rng)?;
        let r2 = random_exponent(rng)?;
        let r3 = random_exponent(rng)?;
        let r4 = random_exponent(rng)?;
        let r5 = random_exponent(rng)?;
        let r6 = random_exponent(rng)?;

        let g1 = dh::generator();
        let p = dh::modulus();
        let q = dh::order();

        let g2b = g1.modpow(&b2, p);
        let g3b = g1.modpow(&b3, p);
        let (c2, d2) = generate_zkp(&r2, &b2, 3);
        let (c3, d3) = generate_zkp(&r3, &b3, 4);

        let g2 = msg.g2a.modpow(&b2, p);
        let g3 = msg.g3a.modpow(&b3, p);
        let pb = g3.modpow(&r4, p);
        let qb = mul_mod(&g1.modpow(&r4, p), &g2.modpow(&y, p), p);

        let cp = hash_mpis(5, &[&g3.modpow(&r5, p), &mul_mod(&g1.modpow(&r5, p), &g2.modpow(&r6, p), p)]);
        let d5 = sub_mod(&r5, &(&r4 * &cp), q);
        let d6 = sub_mod(&r6, &(&y * &cp), q);

        let mut enc = Encoder::new();
        enc.write_mpi_sequence(&[&g2b, &c2, &d2, &g3b, &c3, &d3, &pb, &qb, &cp, &d5, &d6]);

        log::debug!("SMP: secret supplied, awaiting SMP3");
        self.state = SmpState::Expect3 {
            g3a: msg.g3a,
            g2,
            g3,
            b3,
            pb,
            qb,
        };
        Ok(Tlv::new(TLV_SMP2, enc.into_vec()))
    }

    /// Abort unconditionally, resetting the machine.
    pub fn abort(&mut self) -> Tlv {
        self.state = SmpState::Expect1;
        Tlv::new(TLV_SMP_ABORT, Vec::new())
    }

    /// Process an inbound SMP TLV.
    pub fn handle(
        &mut self,
        rng: &mut Rng,
        tlv: &Tlv,
    ) -> Result<(Option<Tlv>, Option<SmpNotice>), OtrError> {
        match tlv.typ {
            TLV_SMP_ABORT => {
                self.state = SmpState::Expect1;
                Ok((None, Some(SmpNotice::new(SmpEvent::Abort, 0))))
            }
            TLV_SMP1 | TLV_SMP1_WITH_QUESTION => self.handle_smp1(tlv),
            TLV_SMP2 => self.handle_smp2(rng, tlv),
            TLV_SMP3 => self.handle_smp3(rng, tlv),
            TLV_SMP4 => self.handle_smp4(tlv),
            _ => Ok((None, None)),
        }
    }

    fn cheated(&mut self) -> (Option<Tlv>, Option<SmpNotice>) {
        log::debug!("SMP: proof verification failed, aborting");
        (
            Some(self.abort()),
            Some(SmpNotice::new(SmpEvent::Cheated, 0)),
        )
    }

    fn state_error(&mut self) -> (Option<Tlv>, Option<SmpNotice>) {
        log::debug!("SMP: message out of sequence, aborting");
        (Some(self.abort()), Some(SmpNotice::new(SmpEvent::Error, 0)))
    }

    fn handle_smp1(&mut self, tlv: &Tlv) -> Result<(Option<Tlv>, Option<SmpNotice>), OtrError> {
        if !matches!(self.state, SmpState::Expect1) {
            return Ok(self.state_error());
        }
        let (question, msg) = match parse_smp1(tlv) {
            Some(parsed) => parsed,
            None => return Ok(self.cheated()),
        };
        if verify_smp1(&msg).is_err() {
            return Ok(self.cheated());
        }

        let mut notice = SmpNotice::new(
            if question.is_some() {
                SmpEvent::AskForAnswer
            } else {
                SmpEvent::AskForSecret
            },
            25,
        );
        notice.question = question.clone().unwrap_or_default();

        log::debug!("SMP: SMP1 verified, waiting for the user's secret");
        self.state = SmpState::WaitingForSecret { question, msg };
        Ok((None, Some(notice)))
    }

    fn handle_smp2(
        &mut self,
        rng: &mut Rng,
        tlv: &Tlv,
    ) -> Result<(Option<Tlv>, Option<SmpNotice>), OtrError> {
        let (x, a2, a3) = match std::mem::replace(&mut self.state, SmpState::Expect1) {
            SmpState::Expect2 { x, a2, a3 } => (x, a2, a3),
            other => {
                self.state = other;
                return Ok(self.state_error());
            }
        };
        let msg = match parse_smp2(tlv) {
            Some(msg) => msg,
            None => return Ok(self.cheated()),
        };

        let p = dh::modulus();
        let q = dh::order();
        let g1 = dh::generator();

        if verify_smp2(&msg, &a2, &a3).is_err() {
            return Ok(self.cheated());
        }

        let g2 = msg.g2b.modpow(&a2, p);
        let g3 = msg.g3b.modpow(&a3, p);

        let r4 = random_exponent(rng)?;
        let r5 = random_exponent(rng)?;
        let r6 = random_exponent(rng)?;
        let r7 = random_exponent(rng)?;

        let pa = g3.modpow(&r4, p);
        let qa = mul_mod(&g1.modpow(&r4, p), &g2.modpow(&x, p), p);
        let cp = hash_mpis(6, &[&g3.modpow(&r5, p), &mul_mod(&g1.modpow(&r5, p), &g2.modpow(&r6, p), p)]);
        let d5 = sub_mod(&r5, &(&r4 * &cp), q);
        let d6 = sub_mod(&r6, &(&x * &cp), q);

        let qab = mul_mod(&qa, &inverse(&msg.qb), p);
        let ra = qab.modpow(&a3, p);
        let cr = hash_mpis(7, &[&g1.modpow(&r7, p), &qab.modpow(&r7, p)]);
        let d7 = sub_mod(&r7, &(&a3 * &cr), q);

        let pab = mul_mod(&pa, &inverse(&msg.pb), p);

        let mut enc = Encoder::new();
        enc.write_mpi_sequence(&[&pa, &qa, &cp, &d5, &d6, &ra, &cr, &d7]);

        log::debug!("SMP: SMP2 verified, awaiting SMP4");
        self.state = SmpState::Expect4 {
            g3b: msg.g3b,
            pab,
            qab,
            a3,
        };
        Ok((
            Some(Tlv::new(TLV_SMP3, enc.into_vec())),
            Some(SmpNotice::new(SmpEvent::InProgress, 60)),
        ))
    }

    fn handle_smp3(
        &mut self,
        rng: &mut Rng,
        tlv: &Tlv,
    ) -> Result<(Option<Tlv>, Option<SmpNotice>), OtrError> {
        let (g3a, g2, g3, b3, pb, qb) =
            match std::mem::replace(&mut self.state, SmpState::Expect1) {
                SmpState::Expect3 {
                    g3a,
                    g2,
                    g3,
                    b3,
                    pb,
                    qb,
                } => (g3a, g2, g3, b3, pb, qb),
                other => {
                    self.state = other;
                    return Ok(self.state_error());
                }
            };
        let msg = match parse_smp3(tlv) {
            Some(msg) => msg,
            None => return Ok(self.cheated()),
        };

        let p = dh::modulus();
        let q = dh::order();
        let g1 = dh::generator();

        if verify_smp3(&msg, &g3a, &g2, &g3, &qb).is_err() {
            return Ok(self.cheated());
        }

        // Send our exponentiation of Qa/Qb so the initiator can finish,
        // and compute the comparison ourselves.
        let qab = mul_mod(&msg.qa, &inverse(&qb), p);
        let rb = qab.modpow(&b3, p);
        let r7 = random_exponent(rng)?;
        let cr = hash_mpis(8, &[&g1.modpow(&r7, p), &qab.modpow(&r7, p)]);
        let d7 = sub_mod(&r7, &(&b3 * &cr), q);

        let rab = msg.ra.modpow(&b3, p);
        let pab = mul_mod(&msg.pa, &inverse(&pb), p);
        let matched = rab == pab;

        let mut enc = Encoder::new();
        enc.write_mpi_sequence(&[&rb, &cr, &d7]);

        log::debug!("SMP: completed as responder, secrets matched: {matched}");
        self.state = SmpState::Expect1;
        Ok((
            Some(Tlv::new(TLV_SMP4, enc.into_vec())),
            Some(SmpNotice::new(
                if matched {
                    SmpEvent::Success
                } else {
                    SmpEvent::Failure
                },
                100,
            )),
        ))
    }

    fn handle_smp4(&mut self, tlv: &Tlv) -> Result<(Option<Tlv>, Option<SmpNotice>), OtrError> {
        let (g3b, pab, qab, a3) = match std::mem::replace(&mut self.state, SmpState::Expect1) {
            SmpState::Expect4 { g3b, pab, qab, a3 } => (g3b, pab, qab, a3),
            other => {
                self.state = other;
                return Ok(self.state_error());
            }
        };
        let msg = match parse_smp4(tlv) {
            Some(msg) => msg,
            None => return Ok(self.cheated()),
        };

        if verify_smp4(&msg, &g3b, &qab).is_err() {
            return Ok(self.cheated());
        }

        let p = dh::modulus();
        let rab = msg.rb.modpow(&a3, p);
        let matched = rab == pab;

        log::debug!("SMP: completed as initiator, secrets matched: {matched}");
        self.state = SmpState::Expect1;
        Ok((
            None,
            Some(SmpNotice::new(
                if matched {
                    SmpEvent::Success
                } else {
                    SmpEvent::Failure
                },
                100,
            )),
        ))
    }
}

/// The value compared by the protocol: a hash binding the user secret to
/// both long-term identities and this session.
fn compute_secret(
    initiator_fingerprint: &[u8; 20],
    responder_fingerprint: &[u8; 20],
    ssid: &[u8; 8],
    secret: &[u8],
) -> BigUint {
    let mut input = Vec::with_capacity(1 + 20 + 20 + 8 + secret.len());
    input.push(0x01);
    input.extend_from_slice(initiator_fingerprint);
    input.extend_from_slice(responder_fingerprint);
    input.extend_from_slice(ssid);
    input.extend_from_slice(secret);
    BigUint::from_bytes_be(&sha256(&input))
}

fn random_exponent(rng: &mut Rng) -> Result<BigUint, OtrError> {
    dh::random_exponent(rng, EXPONENT_BYTES, dh::order())
}

fn mul_mod(a: &BigUint, b: &BigUint, m: &BigUint) -> BigUint {
    (a * b) % m
}

/// (a - b) mod m without going through signed integers.
fn sub_mod(a: &BigUint, b: &BigUint, m: &BigUint) -> BigUint {
    ((a % m) + m - (b % m)) % m
}

/// Multiplicative inverse modulo the prime p.
fn inverse(a: &BigUint) -> BigUint {
    let p = dh::modulus();
    a.modpow(&(p - 2u8), p)
}

/// SHA-256 over a version byte and the MPI encodings of the inputs,
/// interpreted as an unsigned integer.
fn hash_mpis(version: u8, mpis: &[&BigUint]) -> BigUint {
    let mut enc = Encoder::new();
    enc.write_u8(version);
    for mpi in mpis {
        enc.write_mpi(mpi);
    }
    BigUint::from_bytes_be(&sha256(&enc.to_vec()))
}

/// Schnorr proof of knowledge of `a` with `g1^a` public: c over a fresh
/// commitment, d folding the witness in modulo q.
fn generate_zkp(r: &BigUint, a: &BigUint, version: u8) -> (BigUint, BigUint) {
    let c = hash_mpis(version, &[&dh::generator().modpow(r, dh::modulus())]);
    let d = sub_mod(r, &(a * &c), dh::order());
    (c, d)
}

fn verify_zkp(d: &BigUint, g_a: &BigUint, c: &BigUint, version: u8) -> Result<(), OtrError> {
    let p = dh::modulus();
    let commitment = mul_mod(&dh::generator().modpow(d, p), &g_a.modpow(c, p), p);
    if &hash_mpis(version, &[&commitment]) == c {
        Ok(())
    } else {
        Err(OtrError::SignatureFailure)
    }
}

/// The two-generator proof over (pb, qb) or (pa, qa).
fn verify_zkp2(
    g2: &BigUint,
    g3: &BigUint,
    d5: &BigUint,
    d6: &BigUint,
    pb: &BigUint,
    qb: &BigUint,
    cp: &BigUint,
    version: u8,
) -> Result<(), OtrError> {
    let p = dh::modulus();
    let g1 = dh::generator();
    let left = mul_mod(&g3.modpow(d5, p), &pb.modpow(cp, p), p);
    let right = mul_mod(
        &mul_mod(&g1.modpow(d5, p), &g2.modpow(d6, p), p),
        &qb.modpow(cp, p),
        p,
    );
    if &hash_mpis(version, &[&left, &right]) == cp {
        Ok(())
    } else {
        Err(OtrError::SignatureFailure)
    }
}

/// The proof over ra / rb against the Qa/Qb ratio.
fn verify_zkp3(
    g3x: &BigUint,
    qab: &BigUint,
    d7: &BigUint,
    r: &BigUint,
    cr: &BigUint,
    version: u8,
) -> Result<(), OtrError> {
    let p = dh::modulus();
    let g1 = dh::generator();
    let left = mul_mod(&g1.modpow(d7, p), &g3x.modpow(cr, p), p);
    let right = mul_mod(&qab.modpow(d7, p), &r.modpow(cr, p), p);
    if &hash_mpis(version, &[&left, &right]) == cr {
        Ok(())
    } else {
        Err(OtrError::SignatureFailure)
    }
}

fn verify_smp1(msg: &Smp1Message) -> Result<(), OtrError> {
    dh::verify_group_element(&msg.g2a)?;
    dh::verify_group_element(&msg.g3a)?;
    verify_zkp(&msg.d2, &msg.g2a, &msg.c2, 1)?;
    verify_zkp(&msg.d3, &msg.g3a, &msg.c3, 2)
}

fn verify_smp2(msg: &Smp2Message, a2: &BigUint, a3: &BigUint) -> Result<(), OtrError> {
    dh::verify_group_element(&msg.g2b)?;
    dh::verify_group_element(&msg.g3b)?;
    dh::verify_group_element(&msg.pb)?;
    dh::verify_group_element(&msg.qb)?;
    verify_zkp(&msg.d2, &msg.g2b, &msg.c2, 3)?;
    verify_zkp(&msg.d3, &msg.g3b, &msg.c3, 4)?;
    let p = dh::modulus();
    let g2 = msg.g2b.modpow(a2, p);
    let g3 = msg.g3b.modpow(a3, p);
    verify_zkp2(&g2, &g3, &msg.d5, &msg.d6, &msg.pb, &msg.qb, &msg.cp, 5)
}

fn verify_smp3(
    msg: &Smp3Message,
    g3a: &BigUint,
    g2: &BigUint,
    g3: &BigUint,
    qb: &BigUint,
) -> Result<(), OtrError> {
    dh::verify_group_element(&msg.pa)?;
    dh::verify_group_element(&msg.qa)?;
    dh::verify_group_element(&msg.ra)?;
    verify_zkp2(g2, g3, &msg.d5, &msg.d6, &msg.pa, &msg.qa, &msg.cp, 6)?;
    let qab = mul_mod(&msg.qa, &inverse(qb), dh::modulus());
    verify_zkp3(g3a, &qab, &msg.d7, &msg.ra, &msg.cr, 7)
}

fn verify_smp4(msg: &Smp4Message, g3b: &BigUint, qab: &BigUint) -> Result<(), OtrError> {
    dh::verify_group_element(&msg.rb)?;
    verify_zkp3(g3b, qab, &msg.d7, &msg.rb, &msg.cr, 8)
}

fn parse_smp1(tlv: &Tlv) -> Option<(Option<String>, Smp1Message)> {
    let (question, mpi_bytes) = if tlv.typ == TLV_SMP1_WITH_QUESTION {
        let nul = tlv.value.iter().position(|&b| b == 0x00)?;
        let question = String::from_utf8_lossy(&tlv.value[..nul]).into_owned();
        (Some(question), &tlv.value[nul + 1..])
    } else {
        (None, &tlv.value[..])
    };
    let mut mpis = read_mpis(mpi_bytes, 6)?;
    let d3 = mpis.pop()?;
    let c3 = mpis.pop()?;
    let g3a = mpis.pop()?;
    let d2 = mpis.pop()?;
    let c2 = mpis.pop()?;
    let g2a = mpis.pop()?;
    Some((
        question,
        Smp1Message {
            g2a,
            c2,
            d2,
            g3a,
            c3,
            d3,
        },
    ))
}

fn parse_smp2(tlv: &Tlv) -> Option<Smp2Message> {
    let mut m = read_mpis(&tlv.value, 11)?;
    let d6 = m.pop()?;
    let d5 = m.pop()?;
    let cp = m.pop()?;
    let qb = m.pop()?;
    let pb = m.pop()?;
    let d3 = m.pop()?;
    let c3 = m.pop()?;
    let g3b = m.pop()?;
    let d2 = m.pop()?;
    let c2 = m.pop()?;
    let g2b = m.pop()?;
    Some(Smp2Message {
        g2b,
        c2,
        d2,
        g3b,
        c3,
        d3,
        pb,
        qb,
        cp,
        d5,
        d6,
    })
}

fn parse_smp3(tlv: &Tlv) -> Option<Smp3Message> {
    let mut m = read_mpis(&tlv.value, 8)?;
    let d7 = m.pop()?;
    let cr = m.pop()?;
    let ra = m.pop()?;
    let d6 = m.pop()?;
    let d5 = m.pop()?;
    let cp = m.pop()?;
    let qa = m.pop()?;
    let pa = m.pop()?;
    Some(Smp3Message {
        pa,
        qa,
        cp,
        d5,
        d6,
        ra,
        cr,
        d7,
    })
}

fn parse_smp4(tlv: &Tlv) -> Option<Smp4Message> {
    let mut m = read_mpis(&tlv.value, 3)?;
    let d7 = m.pop()?;
    let cr = m.pop()?;
    let rb = m.pop()?;
    Some(Smp4Message { rb, cr, d7 })
}

fn read_mpis(bytes: &[u8], expected: usize) -> Option<Vec<BigUint>> {
    let mut dec = Decoder::new(bytes);
    let mpis = dec.read_mpi_sequence().ok()?;
    if mpis.len() == expected && dec.is_empty() {
        Some(mpis)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs_pair() -> (SmpInputs, SmpInputs) {
        let alice_fp = [0xAA; 20];
        let bob_fp = [0xBB; 20];
        let ssid = [0x12; 8];
        (
            SmpInputs {
                ssid,
                our_fingerprint: alice_fp,
                their_fingerprint: bob_fp,
            },
            SmpInputs {
                ssid,
                our_fingerprint: bob_fp,
                their_fingerprint: alice_fp,
            },
        )
    }

    /// Drive a full exchange; returns the terminal events on each side.
    fn run_smp(alice_secret: &[u8], bob_secret: &[u8]) -> (SmpEvent, SmpEvent) {
        let (alice_inputs, bob_inputs) = inputs_pair();
        let mut alice = Smp::default();
        let mut bob = Smp::default();
        let mut rng_a = Rng::from_seed([77; 32]);
        let mut rng_b = Rng::from_seed([88; 32]);

        let smp1 = alice
            .start(&alice_inputs, &mut rng_a, alice_secret, None)
            .unwrap();
        let (reply, notice) = bob.handle(&mut rng_b, &smp1).unwrap();
        assert!(reply.is_none());
        assert_eq!(notice.unwrap().event, SmpEvent::AskForSecret);

        let smp2 = bob
            .provide_secret(&bob_inputs, &mut rng_b, bob_secret)
            .unwrap();
        let (smp3, notice) = alice.handle(&mut rng_a, &smp2).unwrap();
        assert_eq!(notice.unwrap().event, SmpEvent::InProgress);

        let (smp4, bob_final) = bob
            .handle(&mut rng_b, &smp3.unwrap())
            .unwrap();
        let (last, alice_final) = alice
            .handle(&mut rng_a, &smp4.unwrap())
            .unwrap();
        assert!(last.is_none());
        assert!(!alice.in_progress());
        assert!(!bob.in_progress());
        (alice_final.unwrap().event, bob_final.unwrap().event)
    }

    #[test]
    fn test_matching_secrets_succeed() {
        let (alice, bob) = run_smp(b"correct", b"correct");
        assert_eq!(alice, SmpEvent::Success);
        assert_eq!(bob, SmpEvent::Success);
    }

    #[test]
    fn test_mismatched_secrets_fail_without_cheating() {
        let (alice, bob) = run_smp(b"correct", b"wrong");
        assert_eq!(alice, SmpEvent::Failure);
        assert_eq!(bob, SmpEvent::Failure);
    }

    #[test]
    fn test_question_is_delivered() {
        let (alice_inputs, bob_inputs) = inputs_pair();
        let mut alice = Smp::default();
        let mut bob = Smp::default();
        let mut rng_a = Rng::from_seed([1; 32]);
        let mut rng_b = Rng::from_seed([2; 32]);

        let smp1 = alice
            .start(&alice_inputs, &mut rng_a, b"s", Some("our first pet?"))
            .unwrap();
        assert_eq!(smp1.typ, TLV_SMP1_WITH_QUESTION);
        let (_, notice) = bob.handle(&mut rng_b, &smp1).unwrap();
        let notice = notice.unwrap();
        assert_eq!(notice.event, SmpEvent::AskForAnswer);
        assert_eq!(notice.question, "our first pet?");
    }

    #[test]
    fn test_corrupted_smp2_is_cheating() {
        let (alice_inputs, bob_inputs) = inputs_pair();
        let mut alice = Smp::default();
        let mut bob = Smp::default();
        let mut rng_a = Rng::from_seed([3; 32]);
        let mut rng_b = Rng::from_seed([4; 32]);

        let smp1 = alice.start(&alice_inputs, &mut rng_a, b"s", None).unwrap();
        bob.handle(&mut rng_b, &smp1).unwrap();
        let mut smp2 = bob.provide_secret(&bob_inputs, &mut rng_b, b"s").unwrap();
        // Corrupt one of the proof MPIs.
        let len = smp2.value.len();
        smp2.value[len - 1] ^= 0x01;

        let (reply, notice) = alice.handle(&mut rng_a, &smp2).unwrap();
        assert_eq!(reply.unwrap().typ, TLV_SMP_ABORT);
        assert_eq!(notice.unwrap().event, SmpEvent::Cheated);
        assert!(!alice.in_progress());
    }

    #[test]
    fn test_corrupted_pa_in_smp3_is_cheating() {
        let (alice_inputs, bob_inputs) = inputs_pair();
        let mut alice = Smp::default();
        let mut bob = Smp::default();
        let mut rng_a = Rng::from_seed([9; 32]);
        let mut rng_b = Rng::from_seed([10; 32]);

        let smp1 = alice.start(&alice_inputs, &mut rng_a, b"s", None).unwrap();
        bob.handle(&mut rng_b, &smp1).unwrap();
        let smp2 = bob.provide_secret(&bob_inputs, &mut rng_b, b"s").unwrap();
        let (smp3, _) = alice.handle(&mut rng_a, &smp2).unwrap();
        let mut smp3 = smp3.unwrap();

        // Garble pa, the first MPI of the sequence (count word, length
        // word, then the value bytes).
        smp3.value[9] ^= 0x55;

        let (reply, notice) = bob.handle(&mut rng_b, &smp3).unwrap();
        assert_eq!(reply.unwrap().typ, TLV_SMP_ABORT);
        assert_eq!(notice.unwrap().event, SmpEvent::Cheated);
        assert!(!bob.in_progress());
    }

    #[test]
    fn test_out_of_state_message_is_error_not_cheating() {
        let (alice_inputs, _) = inputs_pair();
        let mut alice = Smp::default();
        let mut rng_a = Rng::from_seed([5; 32]);

        // An SMP3 with a syntactically valid payload arrives while nothing
        // is in flight.
        let mut enc = Encoder::new();
        let one = BigUint::from(1u8);
        enc.write_mpi_sequence(&[&one, &one, &one, &one, &one, &one, &one, &one]);
        let stray = Tlv::new(TLV_SMP3, enc.into_vec());

        let (reply, notice) = alice.handle(&mut rng_a, &stray).unwrap();
        assert_eq!(reply.unwrap().typ, TLV_SMP_ABORT);
        assert_eq!(notice.unwrap().event, SmpEvent::Error);
    }

    #[test]
    fn test_abort_resets_state() {
        let (alice_inputs, bob_inputs) = inputs_pair();
        let mut alice = Smp::default();
        let mut bob = Smp::default();
        let mut rng_a = Rng::from_seed([6; 32]);
        let mut rng_b = Rng::from_seed([7; 32]);

        let smp1 = alice.start(&alice_inputs, &mut rng_a, b"s", None).unwrap();
        bob.handle(&mut rng_b, &smp1).unwrap();
        assert!(bob.in_progress());

        let abort = alice.abort();
        let (reply, notice) = bob.handle(&mut rng_b, &abort).unwrap();
        assert!(reply.is_none());
        assert_eq!(notice.unwrap().event, SmpEvent::Abort);
        assert!(!bob.in_progress());
        assert!(!alice.in_progress());
    }

    #[test]
    fn test_start_while_in_progress_rejected() {
        let (alice_inputs, _) = inputs_pair();
        let mut alice = Smp::default();
        let mut rng_a = Rng::from_seed([8; 32]);

        alice.start(&alice_inputs, &mut rng_a, b"s", None).unwrap();
        assert_eq!(
            alice
                .start(&alice_inputs, &mut rng_a, b"s", None)
                .unwrap_err(),
            OtrError::PolicyViolation
        );
    }

    #[test]
    fn test_secret_binds_fingerprints_in_order() {
        let a = compute_secret(&[1; 20], &[2; 20], &[3; 8], b"s");
        let b = compute_secret(&[2; 20], &[1; 20], &[3; 8], b"s");
        assert_ne!(a, b);
    }
}
