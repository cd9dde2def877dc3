//! # offrecord - Off-the-Record messaging for Rust
//!
//! An implementation of the OTR protocol, versions 2 and 3: end-to-end
//! encryption with mutual authentication, perfect forward secrecy, and
//! deniability, layered over any in-order message transport (typically an
//! instant-messaging channel).
//!
//! ## Overview
//!
//! The central type is [`Conversation`], one per peer. Feed every inbound
//! transport message to [`Conversation::receive`] and hand whatever it
//! returns back to the transport; send application text through
//! [`Conversation::send`]. The conversation runs the authenticated key
//! exchange, rotates session keys, fragments oversized messages, and
//! drives the Socialist Millionaires' Protocol when asked to verify the
//! peer's identity against a shared secret.
//!
//! ## Security model
//!
//! - **DSA long-term keys** authenticate the key exchange; fingerprints
//!   are exposed for out-of-band verification.
//! - **AES-128-CTR with HMAC-SHA1** protects data messages; session keys
//!   rotate with every acknowledged Diffie-Hellman exchange.
//! - **MAC keys are revealed** once rotated out, preserving deniability.
//! - **Replay is rejected** through strictly monotone counters.
//! - All session secrets are wiped when the channel closes.
//!
//! ## Example
//!
//! ```no_run
//! use offrecord::{Conversation, DsaKeyPair, Policy, Rng};
//!
//! let mut rng = Rng::default();
//! let our_key = DsaKeyPair::generate(&mut rng).unwrap();
//! let mut conversation = Conversation::new(our_key, Policy::default()).unwrap();
//!
//! // Ask the peer to go encrypted.
//! let query = conversation.query_message().unwrap();
//! // send `query` over the transport ...
//!
//! // For every message from the transport:
//! # let inbound: Vec<u8> = vec![];
//! let (plaintext, replies) = conversation.receive(&inbound).unwrap();
//! // deliver `plaintext` to the user, hand `replies` to the transport.
//! ```

pub(crate) mod ake;
pub mod conversation;
pub mod crypto;
pub(crate) mod data;
pub mod error;
pub mod events;
pub mod fragment;
pub(crate) mod keys;
pub mod policy;
pub mod rng;
pub(crate) mod smp;
pub mod version;
pub mod wire;

pub use conversation::{Conversation, MsgState};
pub use crypto::dsa::{DsaKeyPair, DsaPublicKey};
pub use error::OtrError;
pub use events::{ErrorCode, EventHandler, MessageEvent, SmpEvent};
pub use policy::Policy;
pub use rng::Rng;
pub use version::Version;
