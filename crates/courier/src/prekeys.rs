//! Prekey material published for asynchronous session setup.
//!
//! The signed prekey's signature is an event signed by the identity key whose
//! content is the hex prekey; verifying it proves the identity published it.

use crate::types::SIGNED_PREKEY_KIND;
use crate::utils::now_millis;
use crate::{Error, Result, SerializableKeyPair};
use nostr::{EventBuilder, Keys, Kind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub id: u32,
    pub key_pair: SerializableKeyPair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    pub key_pair: SerializableKeyPair,
    pub signature: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicPreKey {
    pub id: u32,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicSignedPreKey {
    pub id: u32,
    pub public_key: String,
    pub signature: String,
}

/// What a peer needs to start a session with one of our devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub user_id: String,
    pub device_id: u32,
    pub registration_id: u32,
    pub identity_key: String,
    pub signed_prekey: PublicSignedPreKey,
    #[serde(default)]
    pub one_time_prekey: Option<PublicPreKey>,
}

/// Payload of the key upload call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUpload {
    pub user_id: String,
    pub device_id: u32,
    pub registration_id: u32,
    pub identity_key: String,
    pub signed_prekey: PublicSignedPreKey,
    pub prekeys: Vec<PublicPreKey>,
}

impl PreKeyRecord {
    pub fn public(&self) -> PublicPreKey {
        PublicPreKey {
            id: self.id,
            public_key: self.key_pair.public_hex(),
        }
    }
}

impl SignedPreKeyRecord {
    pub fn public(&self) -> PublicSignedPreKey {
        PublicSignedPreKey {
            id: self.id,
            public_key: self.key_pair.public_hex(),
            signature: self.signature.clone(),
        }
    }
}

pub fn generate_prekeys(start_id: u32, count: u32) -> Vec<PreKeyRecord> {
    (0..count)
        .map(|offset| PreKeyRecord {
            id: start_id.wrapping_add(offset),
            key_pair: SerializableKeyPair::generate(),
        })
        .collect()
}

pub fn generate_signed_prekey(
    identity: &SerializableKeyPair,
    id: u32,
) -> Result<SignedPreKeyRecord> {
    let key_pair = SerializableKeyPair::generate();
    let identity_keys = Keys::new(identity.secret_key()?);

    let signed = EventBuilder::new(Kind::from(SIGNED_PREKEY_KIND), key_pair.public_hex())
        .build(identity.public_key)
        .sign_with_keys(&identity_keys)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    Ok(SignedPreKeyRecord {
        id,
        key_pair,
        signature: serde_json::to_string(&signed)?,
        created_at: now_millis(),
    })
}

pub fn verify_signed_prekey(identity_key: &str, signed_prekey: &PublicSignedPreKey) -> Result<()> {
    let event: nostr::Event =
        serde_json::from_str(&signed_prekey.signature).map_err(|_| Error::InvalidSignature)?;

    if hex::encode(event.pubkey.to_bytes()) != identity_key
        || event.content != signed_prekey.public_key
        || event.kind != Kind::from(SIGNED_PREKEY_KIND)
    {
        return Err(Error::InvalidSignature);
    }
    event.verify().map_err(|_| Error::InvalidSignature)
}
