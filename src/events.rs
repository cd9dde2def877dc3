//! Host event callbacks.
//!
//! The conversation core never talks to a user interface directly. Progress
//! of the Socialist Millionaires' Protocol, unreadable-message notifications,
//! and outbound OTR error text all flow through an [`EventHandler`] that the
//! host installs on the conversation.

/// Reason codes passed to [`EventHandler::handle_error`] when the library
/// needs human-readable text for an outbound `?OTR Error:` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// An error occurred while encrypting a message.
    EncryptionError,
    /// An encrypted message arrived but no secure channel is established.
    MessageNotInPrivate,
    /// An encrypted message arrived that could not be read.
    MessageUnreadable,
    /// The received message was malformed.
    MessageMalformed,
}

/// Status updates for the Socialist Millionaires' Protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpEvent {
    /// An SMP message arrived for a different protocol state than ours.
    Error,
    /// The peer aborted the protocol.
    Abort,
    /// A zero-knowledge proof failed verification; the peer misbehaved.
    Cheated,
    /// The peer started SMP with a question; ask the user to answer it.
    AskForAnswer,
    /// The peer started SMP; prompt the user for the shared secret.
    AskForSecret,
    /// The exchange is progressing normally.
    InProgress,
    /// The secrets matched.
    Success,
    /// The protocol completed correctly but the secrets did not match.
    Failure,
}

/// Notifications about message-level conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEvent {
    /// Policy requires encryption but no secure channel exists yet.
    EncryptionRequired,
    /// A secure channel could not be established.
    SetupError,
    /// We received one of our own messages echoed back.
    MessageReflected,
    /// A heartbeat (empty data message) was received.
    HeartbeatReceived,
    /// A heartbeat was sent.
    HeartbeatSent,
    /// An encrypted message arrived that could not be read.
    UnreadableReceived,
    /// An encrypted message arrived but no secure channel is established.
    NotInPrivateReceived,
    /// The peer reported an OTR error.
    GeneralError,
    /// Plaintext arrived although policy requires encryption.
    UnencryptedReceived,
}

/// Callbacks from the conversation into the host application.
///
/// All methods have no-op (or empty-string) defaults so hosts only implement
/// what they care about.
pub trait EventHandler {
    /// Produce the human-readable text for an outbound OTR error message.
    fn handle_error(&mut self, _code: ErrorCode) -> String {
        String::new()
    }

    /// Update authentication UI with SMP progress.
    ///
    /// `progress` is a percentage in 0..=100. `question` is non-empty only
    /// for [`SmpEvent::AskForAnswer`].
    fn handle_smp_event(&mut self, _event: SmpEvent, _progress: u8, _question: &str) {}

    /// Handle a message-level notification. `message` carries associated
    /// content (error text, rejected plaintext) and `error` the underlying
    /// failure, where one exists.
    fn handle_message_event(
        &mut self,
        _event: MessageEvent,
        _message: &[u8],
        _error: Option<&crate::error::OtrError>,
    ) {
    }
}

/// Event handler that ignores everything. Used when the host installs none.
pub(crate) struct NoopEventHandler;

impl EventHandler for NoopEventHandler {}
