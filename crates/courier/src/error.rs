use thiserror::Error;

/// Coarse classification used by callers to decide between retrying,
/// swallowing and surfacing a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Queue,
    Storage,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection attempt timed out")]
    ConnectTimeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Frame decode error: {0}")]
    FrameDecode(String),

    #[error("No published keys for {0}")]
    NoPublishedKeys(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Message counter {counter} already processed")]
    DuplicateMessage { counter: u32 },

    #[error("Invalid header")]
    InvalidHeader,

    #[error("Too many skipped messages")]
    TooManySkippedMessages,

    #[error("Invalid signed prekey signature")]
    InvalidSignature,

    #[error("Identity key changed for {0}")]
    UntrustedIdentity(String),

    #[error("Session not ready")]
    SessionNotReady,

    #[error("No session for {0}")]
    NoSession(String),

    #[error("Local keys missing")]
    MissingLocalKeys,

    #[error("Retry budget exhausted after {0} attempts")]
    RetryBudgetExhausted(u32),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    NostrKey(#[from] nostr::key::Error),

    #[error(transparent)]
    Nip44(#[from] nostr::nips::nip44::Error),

    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),

    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotConnected
            | Error::ConnectTimeout
            | Error::Connection(_)
            | Error::FrameDecode(_)
            | Error::Decode(_)
            | Error::Directory(_) => ErrorKind::Transport,
            Error::RetryBudgetExhausted(_) => ErrorKind::Queue,
            Error::Storage(_) | Error::Config(_) => ErrorKind::Storage,
            _ => ErrorKind::Protocol,
        }
    }

    /// Replay-class failure: the message was already processed and must be
    /// skipped silently.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateMessage { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
