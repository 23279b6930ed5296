pub mod config;
pub mod directory;
pub mod encrypted_storage;
pub mod error;
pub mod file_storage;
pub mod inbound;
pub mod key_store;
pub mod local_store;
pub mod messenger;
pub mod outbox;
pub mod prekeys;
pub mod session;
pub mod session_manager;
pub mod storage;
pub mod transport;
pub mod types;
pub mod utils;
pub mod wire;
pub mod x3dh;

pub use config::{EngineConfig, TrustPolicy};
pub use directory::{ConversationDirectory, InMemoryDirectory, KeyDirectory};
pub use encrypted_storage::EncryptedStorage;
pub use error::{Error, ErrorKind, Result};
pub use file_storage::FileStorageAdapter;
pub use inbound::InboundProcessor;
pub use key_store::{IdentityChange, KeyStore};
pub use local_store::{LocalStore, StoreChange, SubscriptionId};
pub use messenger::{Account, Messenger};
pub use outbox::{Outbox, OutboxItem};
pub use prekeys::{KeyUpload, PreKeyBundle, PublicPreKey, PublicSignedPreKey};
pub use session::{PreKeyMessage, RatchetMessage, Session};
pub use session_manager::{EncryptedPayload, SessionManager};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use transport::{Backoff, ConnectionState, Link, Transport, TransportEvent};
pub use types::*;
pub use wire::{Frame, SignalMessage, SyncMessage};
