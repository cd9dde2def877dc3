//! The per-peer conversation object.
//!
//! A `Conversation` consumes inbound transport messages and produces
//! outbound ones. It classifies each inbound message (fragment, encoded,
//! query, error, or plaintext), routes encoded messages into the AKE or
//! the data-message codec, and exposes the host-facing operations: send,
//! receive, end, and the SMP controls.
//!
//! Every operation runs to completion synchronously; the caller serialises
//! access to a conversation, and distinct conversations are independent.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::ake::{Ake, AkeInputs, AkeOutcome};
use crate::crypto::dsa::{DsaKeyPair, DsaPublicKey};
use crate::data::{self, FLAG_IGNORE_UNREADABLE};
use crate::error::OtrError;
use crate::events::{ErrorCode, EventHandler, MessageEvent, NoopEventHandler};
use crate::fragment::{self, Assembler};
use crate::keys::KeyManager;
use crate::policy::Policy;
use crate::rng::Rng;
use crate::smp::{Smp, SmpInputs, SmpNotice};
use crate::version::{
    MessageHead, Version, ENCODED_PREFIX, ERROR_PREFIX, MIN_INSTANCE_TAG, MSG_TYPE_DATA,
    MSG_TYPE_DH_COMMIT, MSG_TYPE_DH_KEY, MSG_TYPE_REVEAL_SIG, MSG_TYPE_SIG, QUERY_PREFIX,
    WHITESPACE_TAG_BASE,
};
use crate::wire::tlv::{Tlv, TLV_DISCONNECTED};

/// Message state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    /// No secure channel; messages pass through as plaintext.
    Plaintext,
    /// The AKE completed and messages are encrypted.
    Encrypted,
    /// The peer ended the secure channel; sending is refused until the
    /// host acknowledges by calling [`Conversation::end`].
    Finished,
}

/// An OTR conversation with a single peer.
pub struct Conversation {
    policy: Policy,
    version: Option<Version>,
    msg_state: MsgState,
    our_instance_tag: u32,
    their_instance_tag: u32,
    our_key: DsaKeyPair,
    their_key: Option<DsaPublicKey>,
    ssid: Option<[u8; 8]>,
    keys: Option<KeyManager>,
    ake: Ake,
    smp: Smp,
    fragment_size: usize,
    assembler: Assembler,
    rng: Rng,
    events: Box<dyn EventHandler>,
}

impl Conversation {
    /// Create a conversation with an OS-seeded random source.
    pub fn new(our_key: DsaKeyPair, policy: Policy) -> Result<Self, OtrError> {
        Self::with_rng(our_key, policy, Rng::default())
    }

    /// Create a conversation drawing all randomness from `rng`.
    pub fn with_rng(our_key: DsaKeyPair, policy: Policy, mut rng: Rng) -> Result<Self, OtrError> {
        let our_instance_tag = generate_instance_tag(&mut rng)?;
        Ok(Self {
            policy,
            version: None,
            msg_state: MsgState::Plaintext,
            our_instance_tag,
            their_instance_tag: 0,
            our_key,
            their_key: None,
            ssid: None,
            keys: None,
            ake: Ake::default(),
            smp: Smp::default(),
            fragment_size: 0,
            assembler: Assembler::default(),
            rng,
            events: Box::new(NoopEventHandler),
        })
    }

    /// Install the host's event callbacks.
    pub fn set_event_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.events = handler;
    }

    /// Cap outbound messages at `size` bytes; zero disables fragmentation.
    pub fn set_fragment_size(&mut self, size: usize) {
        self.fragment_size = size;
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn msg_state(&self) -> MsgState {
        self.msg_state
    }

    pub fn is_encrypted(&self) -> bool {
        self.msg_state == MsgState::Encrypted
    }

    /// True while an SMP exchange is in flight.
    pub fn smp_in_progress(&self) -> bool {
        self.smp.in_progress()
    }

    /// Our long-term key fingerprint, hex-encoded.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.our_key.public().fingerprint())
    }

    /// The peer's fingerprint, once their key is learned during the AKE.
    pub fn their_fingerprint(&self) -> Option<String> {
        self.their_key
            .as_ref()
            .map(|key| hex::encode(key.fingerprint()))
    }

    /// The 8-byte session id for out-of-band verification.
    pub fn ssid(&self) -> Option<[u8; 8]> {
        self.ssid
    }

    /// Build the query message advertising our allowed versions.
    pub fn query_message(&self) -> Result<Vec<u8>, OtrError> {
        let mut digits = String::new();
        if self.policy.allow_v2 {
            digits.push(Version::V2.query_digit());
        }
        if self.policy.allow_v3 {
            digits.push(Version::V3.query_digit());
        }
        if digits.is_empty() {
            return Err(OtrError::PolicyViolation);
        }
        Ok(format!("?OTRv{digits}?").into_bytes())
    }

    /// Send an application message.
    ///
    /// In the plaintext state the message passes through (whitespace-tagged
    /// or replaced by a query under the matching policies); in the
    /// encrypted state it is wrapped in a data message and fragmented.
    pub fn send(&mut self, message: &[u8]) -> Result<Vec<Vec<u8>>, OtrError> {
        if !self.policy.is_otr_enabled() {
            return Ok(vec![message.to_vec()]);
        }
        match self.msg_state {
            MsgState::Plaintext => {
                if self.policy.require_encryption {
                    self.events
                        .handle_message_event(MessageEvent::EncryptionRequired, &[], None);
                    return Ok(vec![self.query_message()?]);
                }
                let mut out = message.to_vec();
                if self.policy.send_whitespace_tag {
                    out.extend_from_slice(&self.whitespace_tag());
                }
                Ok(vec![out])
            }
            MsgState::Encrypted => self.build_data_message(message, &[], 0x00),
            MsgState::Finished => Err(OtrError::ConversationFinished),
        }
    }

    /// End the secure conversation.
    ///
    /// When encrypted this emits a data message carrying the disconnected
    /// TLV and wipes the channel keys; a finished conversation just drops
    /// back to plaintext.
    pub fn end(&mut self) -> Result<Vec<Vec<u8>>, OtrError> {
        match self.msg_state {
            MsgState::Plaintext => Ok(Vec::new()),
            MsgState::Encrypted => {
                let disconnect = Tlv::new(TLV_DISCONNECTED, Vec::new());
                let out = self.build_data_message(b"", &[disconnect], FLAG_IGNORE_UNREADABLE)?;
                self.teardown_secure_channel();
                self.msg_state = MsgState::Plaintext;
                Ok(out)
            }
            MsgState::Finished => {
                self.msg_state = MsgState::Plaintext;
                Ok(Vec::new())
            }
        }
    }

    /// Process one inbound transport message. Returns any recovered
    /// plaintext plus protocol replies to hand to the transport.
    pub fn receive(&mut self, message: &[u8]) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), OtrError> {
        if !self.policy.is_otr_enabled() {
            return Ok((Some(message.to_vec()), Vec::new()));
        }
        if fragment::is_fragment(message) {
            let frag = match fragment::parse_fragment(message) {
                Ok(frag) => frag,
                Err(_) => return Ok((None, Vec::new())),
            };
            if frag.receiver_tag != 0 && frag.receiver_tag != self.our_instance_tag {
                log::debug!("dropping fragment for another instance");
                return Ok((None, Vec::new()));
            }
            return match self.assembler.assemble(frag) {
                Some(complete) => self.receive_whole(&complete),
                None => Ok((None, Vec::new())),
            };
        }
        self.receive_whole(message)
    }

    /// Begin the Socialist Millionaires' Protocol with our secret.
    pub fn start_smp(
        &mut self,
        secret: &[u8],
        question: Option<&str>,
    ) -> Result<Vec<Vec<u8>>, OtrError> {
        if self.msg_state != MsgState::Encrypted {
            return Err(OtrError::NoSecureChannel);
        }
        let inputs = self.smp_inputs()?;
        let tlv = self.smp.start(&inputs, &mut self.rng, secret, question)?;
        self.build_data_message(b"", &[tlv], FLAG_IGNORE_UNREADABLE)
    }

    /// Answer an inbound SMP request with our secret.
    pub fn provide_secret_for_smp(&mut self, secret: &[u8]) -> Result<Vec<Vec<u8>>, OtrError> {
        if self.msg_state != MsgState::Encrypted {
            return Err(OtrError::NoSecureChannel);
        }
        let inputs = self.smp_inputs()?;
        let tlv = self.smp.provide_secret(&inputs, &mut self.rng, secret)?;
        self.build_data_message(b"", &[tlv], FLAG_IGNORE_UNREADABLE)
    }

    /// Abort a running SMP exchange.
    pub fn abort_smp(&mut self) -> Result<Vec<Vec<u8>>, OtrError> {
        if self.msg_state != MsgState::Encrypted {
            return Err(OtrError::NoSecureChannel);
        }
        let tlv = self.smp.abort();
        self.build_data_message(b"", &[tlv], FLAG_IGNORE_UNREADABLE)
    }

    fn receive_whole(&mut self, message: &[u8]) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), OtrError> {
        if message.starts_with(ENCODED_PREFIX) && message.ends_with(b".") {
            let encoded = &message[ENCODED_PREFIX.len()..message.len() - 1];
            let decoded = BASE64
                .decode(encoded)
                .map_err(|_| OtrError::MalformedMessage)?;
            return self.receive_encoded(&decoded);
        }
        if is_query_message(message) {
            return Ok((None, self.receive_query(message)?));
        }
        if message.starts_with(ERROR_PREFIX) {
            let text = &message[ERROR_PREFIX.len()..];
            self.events
                .handle_message_event(MessageEvent::GeneralError, text, None);
            if self.policy.error_start_ake {
                log::debug!("peer reported an error, restarting AKE");
                return Ok((None, vec![self.query_message()?]));
            }
            return Ok((None, Vec::new()));
        }
        self.receive_plaintext(message)
    }

    fn receive_plaintext(&mut self, message: &[u8]) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), OtrError> {
        let (clean, offered) = strip_whitespace_tag(message);
        let mut to_send = Vec::new();
        if !offered.is_empty() && self.policy.whitespace_start_ake {
            if let Some(version) = self.policy.best_version(&offered) {
                log::debug!("whitespace tag seen, starting AKE with {version:?}");
                self.version = Some(version);
                let inputs = AkeInputs {
                    version,
                    our_tag: self.our_instance_tag,
                    their_tag: self.their_instance_tag,
                    our_key: &self.our_key,
                };
                let commit = self.ake.initiate(&inputs, &mut self.rng)?;
                to_send = self.encode_and_fragment(commit)?;
            }
        }
        if self.policy.require_encryption {
            self.events
                .handle_message_event(MessageEvent::UnencryptedReceived, &clean, None);
        }
        Ok((Some(clean), to_send))
    }

    fn receive_query(&mut self, message: &[u8]) -> Result<Vec<Vec<u8>>, OtrError> {
        let offered = parse_query_versions(message);
        let Some(version) = self.policy.best_version(&offered) else {
            log::debug!("query offered no allowed version, ignoring");
            return Ok(Vec::new());
        };
        log::debug!("query accepted, starting AKE with {version:?}");
        self.version = Some(version);
        let inputs = AkeInputs {
            version,
            our_tag: self.our_instance_tag,
            their_tag: self.their_instance_tag,
            our_key: &self.our_key,
        };
        let commit = self.ake.initiate(&inputs, &mut self.rng)?;
        self.encode_and_fragment(commit)
    }

    fn receive_encoded(&mut self, message: &[u8]) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), OtrError> {
        let (head, payload) = MessageHead::parse(message)?;
        if !self.policy.allows(head.version) {
            log::debug!("dropping message with version not allowed by policy");
            return Ok((None, Vec::new()));
        }
        if head.version == Version::V3 {
            if head.sender_tag == 0 {
                log::debug!("dropping v3 message with zero sender tag");
                return Ok((None, Vec::new()));
            }
            if head.msg_type != MSG_TYPE_DH_COMMIT
                && head.receiver_tag != 0
                && head.receiver_tag != self.our_instance_tag
            {
                log::debug!("dropping message for another instance");
                return Ok((None, Vec::new()));
            }
            self.their_instance_tag = head.sender_tag;
        }
        if head.msg_type == MSG_TYPE_DATA && self.msg_state != MsgState::Encrypted {
            // A data message with no secure channel cannot be read in any
            // version; answer with an error without touching our state.
            self.events
                .handle_message_event(MessageEvent::NotInPrivateReceived, &[], None);
            let reply = self.error_message(ErrorCode::MessageNotInPrivate);
            return Ok((None, vec![reply]));
        }
        if head.msg_type != MSG_TYPE_DH_COMMIT && self.version != Some(head.version) {
            log::debug!("dropping message with inconsistent protocol version");
            return Ok((None, Vec::new()));
        }

        match head.msg_type {
            MSG_TYPE_DATA => self.receive_data(&head, payload),
            MSG_TYPE_DH_COMMIT | MSG_TYPE_DH_KEY | MSG_TYPE_REVEAL_SIG | MSG_TYPE_SIG => {
                Ok((None, self.receive_ake(&head, payload)?))
            }
            other => {
                log::debug!("ignoring unrecognized message type {other:#04x}");
                Ok((None, Vec::new()))
            }
        }
    }

    fn receive_ake(&mut self, head: &MessageHead, payload: &[u8]) -> Result<Vec<Vec<u8>>, OtrError> {
        if head.msg_type == MSG_TYPE_DH_COMMIT {
            // A commit is acceptable in any state and fixes the version.
            self.version = Some(head.version);
        }
        let inputs = AkeInputs {
            version: head.version,
            our_tag: self.our_instance_tag,
            their_tag: self.their_instance_tag,
            our_key: &self.our_key,
        };

        enum Step {
            Reply(Option<Vec<u8>>),
            Done(AkeOutcome, Option<Vec<u8>>),
        }

        let result = match head.msg_type {
            MSG_TYPE_DH_COMMIT => self
                .ake
                .handle_dh_commit(&inputs, payload, &mut self.rng)
                .map(Step::Reply),
            MSG_TYPE_DH_KEY => self
                .ake
                .handle_dh_key(&inputs, payload, &mut self.rng)
                .map(Step::Reply),
            MSG_TYPE_REVEAL_SIG => self
                .ake
                .handle_reveal_sig(&inputs, payload, &mut self.rng)
                .map(|done| match done {
                    Some((outcome, reply)) => Step::Done(outcome, Some(reply)),
                    None => Step::Reply(None),
                }),
            _ => self.ake.handle_sig(payload).map(|done| match done {
                Some(outcome) => Step::Done(outcome, None),
                None => Step::Reply(None),
            }),
        };

        match result {
            Ok(Step::Reply(Some(reply))) => self.encode_and_fragment(reply),
            Ok(Step::Reply(None)) => Ok(Vec::new()),
            Ok(Step::Done(outcome, reply)) => {
                let out = match reply {
                    Some(reply) => self.encode_and_fragment(reply)?,
                    None => Vec::new(),
                };
                self.install_outcome(outcome)?;
                Ok(out)
            }
            Err(err) => {
                // AKE failures reset the sub-state and drop the message
                // without a reply.
                log::debug!("AKE message dropped: {err}");
                self.events
                    .handle_message_event(MessageEvent::SetupError, &[], Some(&err));
                self.ake.reset();
                Ok(Vec::new())
            }
        }
    }

    fn install_outcome(&mut self, outcome: AkeOutcome) -> Result<(), OtrError> {
        self.keys = Some(KeyManager::new(
            outcome.our_keypair,
            outcome.their_public,
            &mut self.rng,
        )?);
        self.ssid = Some(outcome.ssid);
        self.their_key = Some(outcome.their_dsa);
        self.msg_state = MsgState::Encrypted;
        log::info!("secure channel established");
        Ok(())
    }

    fn receive_data(&mut self, head: &MessageHead, payload: &[u8]) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), OtrError> {
        let header = head.serialize();
        let keys = self.keys.as_mut().ok_or(OtrError::NoSecureChannel)?;
        let opened = match data::open(keys, &header, payload, &mut self.rng) {
            Ok(opened) => opened,
            Err(err) => {
                log::debug!("unreadable data message: {err}");
                self.events
                    .handle_message_event(MessageEvent::UnreadableReceived, &[], Some(&err));
                return Err(err);
            }
        };

        let mut reply_tlvs = Vec::new();
        let mut notices: Vec<SmpNotice> = Vec::new();
        for tlv in &opened.tlvs {
            if tlv.is_smp() {
                let (reply, notice) = self.smp.handle(&mut self.rng, tlv)?;
                reply_tlvs.extend(reply);
                notices.extend(notice);
            } else if tlv.typ == TLV_DISCONNECTED {
                log::info!("peer ended the secure conversation");
                self.teardown_secure_channel();
                self.msg_state = MsgState::Finished;
            }
        }
        for notice in notices {
            self.events
                .handle_smp_event(notice.event, notice.progress, &notice.question);
        }

        let to_send = if !reply_tlvs.is_empty() && self.msg_state == MsgState::Encrypted {
            self.build_data_message(b"", &reply_tlvs, FLAG_IGNORE_UNREADABLE)?
        } else {
            Vec::new()
        };

        if opened.plaintext.is_empty() && opened.tlvs.is_empty() {
            self.events
                .handle_message_event(MessageEvent::HeartbeatReceived, &[], None);
        }
        let plain = (!opened.plaintext.is_empty()).then_some(opened.plaintext);
        Ok((plain, to_send))
    }

    fn build_data_message(
        &mut self,
        message: &[u8],
        tlvs: &[Tlv],
        flags: u8,
    ) -> Result<Vec<Vec<u8>>, OtrError> {
        let version = self.version.ok_or(OtrError::NoSecureChannel)?;
        let header =
            version.message_header(MSG_TYPE_DATA, self.our_instance_tag, self.their_instance_tag);
        let keys = self.keys.as_mut().ok_or(OtrError::NoSecureChannel)?;
        let sealed = data::seal(keys, &header, message, tlvs, flags)?;
        self.encode_and_fragment(sealed)
    }

    /// Frame a binary message as `?OTR:<base64>.` and split into fragments.
    fn encode_and_fragment(&self, message: Vec<u8>) -> Result<Vec<Vec<u8>>, OtrError> {
        let version = self.version.ok_or(OtrError::NoSecureChannel)?;
        let mut framed = Vec::from(ENCODED_PREFIX);
        framed.extend_from_slice(BASE64.encode(&message).as_bytes());
        framed.push(b'.');
        fragment::fragment(
            framed,
            version,
            self.fragment_size,
            self.our_instance_tag,
            self.their_instance_tag,
        )
    }

    fn smp_inputs(&self) -> Result<SmpInputs, OtrError> {
        let their_key = self.their_key.as_ref().ok_or(OtrError::NoSecureChannel)?;
        let ssid = self.ssid.ok_or(OtrError::NoSecureChannel)?;
        Ok(SmpInputs {
            ssid,
            our_fingerprint: self.our_key.public().fingerprint(),
            their_fingerprint: their_key.fingerprint(),
        })
    }

    fn error_message(&mut self, code: ErrorCode) -> Vec<u8> {
        let text = self.events.handle_error(code);
        let mut out = Vec::from(ERROR_PREFIX);
        out.push(b' ');
        out.extend_from_slice(text.as_bytes());
        out
    }

    /// The whitespace tag advertising our allowed versions.
    fn whitespace_tag(&self) -> Vec<u8> {
        let mut tag = Vec::from(&WHITESPACE_TAG_BASE[..]);
        if self.policy.allow_v2 {
            tag.extend_from_slice(Version::V2.whitespace_tag());
        }
        if self.policy.allow_v3 {
            tag.extend_from_slice(Version::V3.whitespace_tag());
        }
        tag
    }

    /// Drop all channel secrets. The KeyManager and SMP state zero their
    /// material on drop.
    fn teardown_secure_channel(&mut self) {
        self.keys = None;
        self.smp = Smp::default();
        self.ake.reset();
        self.ssid = None;
    }
}

fn generate_instance_tag(rng: &mut Rng) -> Result<u32, OtrError> {
    loop {
        let tag = u32::from_be_bytes(rng.random_array()?);
        if tag >= MIN_INSTANCE_TAG {
            return Ok(tag);
        }
    }
}

/// True for `?OTR?`, `?OTRv...?`-style version advertisements.
fn is_query_message(message: &[u8]) -> bool {
    message.starts_with(QUERY_PREFIX)
        && matches!(message.get(QUERY_PREFIX.len()), Some(b'?') | Some(b'v'))
}

/// Extract the versions offered by a query message.
fn parse_query_versions(message: &[u8]) -> Vec<Version> {
    let mut offered = Vec::new();
    let mut rest = &message[QUERY_PREFIX.len()..];
    if rest.first() == Some(&b'?') {
        // A bare "?OTR?" offers only version 1, which we never speak.
        rest = &rest[1..];
    }
    if rest.first() == Some(&b'v') {
        for &b in &rest[1..] {
            match b {
                b'?' => break,
                b'2' => offered.push(Version::V2),
                b'3' => offered.push(Version::V3),
                _ => {}
            }
        }
    }
    offered
}

/// Remove a whitespace tag from `message`, returning the cleaned text and
/// the versions the tag advertised.
fn strip_whitespace_tag(message: &[u8]) -> (Vec<u8>, Vec<Version>) {
    let Some(start) = message
        .windows(WHITESPACE_TAG_BASE.len())
        .position(|w| w == WHITESPACE_TAG_BASE)
    else {
        return (message.to_vec(), Vec::new());
    };

    let mut offered = Vec::new();
    let mut end = start + WHITESPACE_TAG_BASE.len();
    while let Some(chunk) = message.get(end..end + 8) {
        if chunk == Version::V2.whitespace_tag() {
            offered.push(Version::V2);
        } else if chunk == Version::V3.whitespace_tag() {
            offered.push(Version::V3);
        } else {
            break;
        }
        end += 8;
    }

    let mut clean = Vec::with_capacity(message.len() - (end - start));
    clean.extend_from_slice(&message[..start]);
    clean.extend_from_slice(&message[end..]);
    (clean, offered)
}
