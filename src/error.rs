//! Error types for OTR processing.

use thiserror::Error;

/// Errors that can occur while driving an OTR conversation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum OtrError {
    /// A length or bounds violation while parsing wire data.
    #[error("malformed OTR message")]
    MalformedMessage,

    /// The protocol version in a message header is not permitted by policy
    /// or is inconsistent with the negotiated conversation version.
    #[error("wrong protocol version")]
    WrongProtocolVersion,

    /// A v3 message addressed to a different instance of this account.
    #[error("message intended for another instance")]
    WrongInstanceTag,

    /// A Diffie-Hellman public value outside the range [2, p-2].
    #[error("invalid group element")]
    InvalidGroupElement,

    /// A revealed gx does not match its earlier hash commitment.
    #[error("hash commitment mismatch")]
    HashMismatch,

    /// HMAC verification failed.
    #[error("MAC verification failed")]
    MacFailure,

    /// DSA signature verification failed.
    #[error("signature verification failed")]
    SignatureFailure,

    /// A data-message counter was not strictly greater than the last
    /// accepted counter for its key-id pair.
    #[error("message counter replayed")]
    CounterReplay,

    /// A data message could not be read in the encrypted state: MAC failure,
    /// decryption failure, or unknown key-ids.
    #[error("received an unreadable encrypted message")]
    UnreadableMessage,

    /// A send was attempted after the peer ended the secure conversation.
    #[error("secure conversation has finished")]
    ConversationFinished,

    /// The operation conflicts with the configured policy.
    #[error("operation violates conversation policy")]
    PolicyViolation,

    /// An SMP or data operation requires an established secure channel.
    #[error("no secure channel established")]
    NoSecureChannel,

    /// Not enough randomness could be drawn from the random source.
    #[error("short read from random source")]
    ShortRandomRead,
}
