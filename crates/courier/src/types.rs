use nostr::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const MAX_SKIP: usize = 1000;
/// Sender keys of fully ratcheted-away chains remembered for replay detection
pub const MAX_RETIRED_CHAINS: usize = 16;
pub const DEFAULT_DEVICE_ID: u32 = 1;
pub const SIGNED_PREKEY_KIND: u16 = 30443;

/// A single device of a single user; sessions are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolAddress {
    pub user_id: String,
    pub device_id: u32,
}

impl ProtocolAddress {
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

/// Wire tag distinguishing a plain ratchet message from one that also
/// carries the key-agreement header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    Normal,
    PreKey,
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Normal => 1,
            MessageType::PreKey => 3,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Normal),
            3 => Ok(MessageType::PreKey),
            other => Err(format!("unknown message type {}", other)),
        }
    }
}

/// 32 bytes of key material, hex encoded when persisted.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBytes(#[serde(with = "hex::serde")] pub [u8; 32]);

impl fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyBytes(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub number: u32,
    pub previous_chain_length: u32,
    pub next_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableKeyPair {
    #[serde(with = "serde_pubkey")]
    pub public_key: PublicKey,
    pub private_key: KeyBytes,
}

impl SerializableKeyPair {
    pub fn generate() -> Self {
        let keys = nostr::Keys::generate();
        Self {
            public_key: keys.public_key(),
            private_key: KeyBytes(keys.secret_key().to_secret_bytes()),
        }
    }

    pub fn secret_key(&self) -> crate::Result<nostr::SecretKey> {
        Ok(nostr::SecretKey::from_slice(&self.private_key.0)?)
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public_key.to_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub root_key: KeyBytes,

    #[serde(with = "serde_option_pubkey", default)]
    pub their_current_ratchet_key: Option<PublicKey>,
    #[serde(with = "serde_option_pubkey", default)]
    pub their_next_ratchet_key: Option<PublicKey>,

    pub our_current_ratchet_key: Option<SerializableKeyPair>,
    pub our_next_ratchet_key: SerializableKeyPair,

    pub receiving_chain_key: Option<KeyBytes>,
    pub sending_chain_key: Option<KeyBytes>,

    pub sending_chain_message_number: u32,
    pub receiving_chain_message_number: u32,
    pub previous_sending_chain_message_count: u32,

    /// Keyed by the hex ratchet key of the sending chain
    #[serde(default)]
    pub skipped_keys: HashMap<String, SkippedKeysEntry>,

    #[serde(default)]
    pub retired_sender_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkippedKeysEntry {
    /// Our secret keys the chain's headers may be sealed to
    pub header_keys: Vec<KeyBytes>,
    pub message_keys: HashMap<u32, KeyBytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    Me,
    Them,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Client generated, unique within a conversation
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub sender: Author,
    pub status: MessageStatus,
    pub is_read: bool,
    /// Milliseconds since the UNIX epoch
    pub timestamp: u64,
    #[serde(default)]
    pub server_id: Option<i64>,
}

impl Message {
    pub fn outgoing(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            text: text.into(),
            sender: Author::Me,
            status: MessageStatus::Pending,
            is_read: true,
            timestamp: crate::utils::message_timestamp(),
            server_id: None,
        }
    }
}

mod serde_pubkey {
    use nostr::PublicKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(pk: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(pk.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        crate::utils::pubkey_from_hex(&s).map_err(serde::de::Error::custom)
    }
}

mod serde_option_pubkey {
    use nostr::PublicKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(pk: &Option<PublicKey>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match pk {
            Some(p) => serializer.serialize_str(&hex::encode(p.to_bytes())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PublicKey>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| crate::utils::pubkey_from_hex(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_uses_numeric_wire_values() {
        assert_eq!(u8::from(MessageType::Normal), 1);
        assert_eq!(u8::from(MessageType::PreKey), 3);
        assert_eq!(MessageType::try_from(3).unwrap(), MessageType::PreKey);
        assert!(MessageType::try_from(2).is_err());
        assert_eq!(serde_json::to_string(&MessageType::PreKey).unwrap(), "3");
    }

    #[test]
    fn address_displays_user_and_device() {
        let address = ProtocolAddress::new("alice", 2);
        assert_eq!(address.to_string(), "alice.2");
    }

    #[test]
    fn outgoing_message_starts_pending_and_read() {
        let message = Message::outgoing("c1", "hi");
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.sender, Author::Me);
        assert!(message.is_read);
        assert!(message.server_id.is_none());
    }
}
