use crate::types::MAX_RETIRED_CHAINS;
use crate::utils::{dh, kdf, pubkey_from_hex};
use crate::{
    Error, Header, KeyBytes, Result, SerializableKeyPair, SessionState, SkippedKeysEntry, MAX_SKIP,
};
use base64::Engine;
use nostr::nips::nip44::{self, Version};
use nostr::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One ratchet ciphertext. The header is sealed to the recipient's ratchet
/// key, the body with the per-message key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub sender_key: String,
    pub header: String,
    pub ciphertext: String,
}

/// Ratchet ciphertext prefixed with what the responder needs to run the
/// key agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    pub registration_id: u32,
    pub identity_key: String,
    pub base_key: String,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub message: RatchetMessage,
}

impl RatchetMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::Decryption(format!("malformed ratchet message: {}", e)))
    }
}

impl PreKeyMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::Decryption(format!("malformed prekey message: {}", e)))
    }
}

pub struct Session {
    pub state: SessionState,
}

impl Session {
    pub fn new(state: SessionState) -> Self {
        Self { state }
    }

    /// The initiator passes the responder's signed prekey as `their_ratchet_key`
    /// and its ephemeral base key as `our_ratchet_key`; the responder passes
    /// them the other way round.
    pub fn init(
        their_ratchet_key: PublicKey,
        our_ratchet_key: &SerializableKeyPair,
        is_initiator: bool,
        shared_secret: [u8; 32],
    ) -> Result<Self> {
        let (root_key, sending_chain_key, our_current_ratchet_key, our_next_ratchet_key);

        if is_initiator {
            let our_next = SerializableKeyPair::generate();
            let kdf_outputs = kdf(
                &shared_secret,
                &dh(&our_next.secret_key()?, &their_ratchet_key),
                2,
            );
            root_key = KeyBytes(kdf_outputs[0]);
            sending_chain_key = Some(KeyBytes(kdf_outputs[1]));
            our_current_ratchet_key = Some(our_ratchet_key.clone());
            our_next_ratchet_key = our_next;
        } else {
            root_key = KeyBytes(shared_secret);
            sending_chain_key = None;
            our_current_ratchet_key = None;
            our_next_ratchet_key = our_ratchet_key.clone();
        }

        // Their current key is learned from the first message they send
        let state = SessionState {
            root_key,
            their_current_ratchet_key: None,
            their_next_ratchet_key: Some(their_ratchet_key),
            our_current_ratchet_key,
            our_next_ratchet_key,
            receiving_chain_key: None,
            sending_chain_key,
            sending_chain_message_number: 0,
            receiving_chain_message_number: 0,
            previous_sending_chain_message_count: 0,
            skipped_keys: HashMap::new(),
            retired_sender_keys: Vec::new(),
        };

        Ok(Self { state })
    }

    pub fn can_send(&self) -> bool {
        self.state.their_next_ratchet_key.is_some()
            && self.state.our_current_ratchet_key.is_some()
            && self.state.sending_chain_key.is_some()
    }

    /// Encrypts and advances the sending chain. State is only updated when
    /// the whole message was produced.
    pub fn encrypt(&mut self, plaintext: &str) -> Result<RatchetMessage> {
        if !self.can_send() {
            return Err(Error::SessionNotReady);
        }

        let mut next = self.state.clone();
        let (header, ciphertext) = ratchet_encrypt(&mut next, plaintext)?;

        let our_current = next
            .our_current_ratchet_key
            .as_ref()
            .ok_or(Error::SessionNotReady)?;
        let their_next = next.their_next_ratchet_key.ok_or(Error::SessionNotReady)?;

        let sealed_header = nip44::encrypt(
            &our_current.secret_key()?,
            &their_next,
            serde_json::to_string(&header)?,
            Version::V2,
        )?;
        let sender_key = our_current.public_hex();

        self.state = next;
        Ok(RatchetMessage {
            sender_key,
            header: sealed_header,
            ciphertext,
        })
    }

    /// Decrypts and advances the receiving side. A message whose counter was
    /// already consumed fails with [`Error::DuplicateMessage`] and leaves the
    /// state untouched, as does any other failure.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<String> {
        let sender = pubkey_from_hex(&message.sender_key)?;
        let mut next = self.state.clone();
        let plaintext = receive(&mut next, &sender, message)?;
        self.state = next;
        Ok(plaintext)
    }
}

fn receive(state: &mut SessionState, sender: &PublicKey, message: &RatchetMessage) -> Result<String> {
    let sender_hex = hex::encode(sender.to_bytes());
    let is_next = state.their_next_ratchet_key.as_ref() == Some(sender);
    let is_current = state.their_current_ratchet_key.as_ref() == Some(sender);

    if !is_next && !is_current {
        if let Some(plaintext) = try_retired_chain(state, &sender_hex, sender, message)? {
            return Ok(plaintext);
        }
        return Err(Error::Decryption("unexpected sender key".to_string()));
    }

    let (header, should_ratchet, header_key) = decrypt_header(state, &message.header, sender)?;

    if let Some(plaintext) = try_skipped_message_key(state, &sender_hex, header.number, &message.ciphertext)? {
        return Ok(plaintext);
    }

    if !should_ratchet && header.number < state.receiving_chain_message_number {
        return Err(Error::DuplicateMessage {
            counter: header.number,
        });
    }

    if should_ratchet {
        if let Some(previous) = state.their_current_ratchet_key.filter(|pk| pk != sender) {
            let previous_hex = hex::encode(previous.to_bytes());
            if state.receiving_chain_key.is_some() {
                let previous_header_key = state
                    .our_current_ratchet_key
                    .as_ref()
                    .map(|kp| kp.private_key);
                skip_message_keys(
                    state,
                    header.previous_chain_length,
                    &previous_hex,
                    previous_header_key,
                )?;
            }
            retire_sender_key(state, previous_hex);
        }

        state.their_current_ratchet_key = Some(*sender);
        let their_next_hex = state
            .their_next_ratchet_key
            .map(|pk| hex::encode(pk.to_bytes()))
            .unwrap_or_default();
        if header.next_public_key != their_next_hex {
            state.their_next_ratchet_key = Some(pubkey_from_hex(&header.next_public_key)?);
        }

        ratchet_step(state)?;
    }

    ratchet_decrypt(state, &header, &message.ciphertext, &sender_hex, header_key)
}

fn ratchet_encrypt(state: &mut SessionState, plaintext: &str) -> Result<(Header, String)> {
    let sending_chain_key = state.sending_chain_key.ok_or(Error::SessionNotReady)?;

    let kdf_outputs = kdf(&sending_chain_key.0, &[1u8], 2);
    state.sending_chain_key = Some(KeyBytes(kdf_outputs[0]));
    let message_key = kdf_outputs[1];

    let header = Header {
        number: state.sending_chain_message_number,
        next_public_key: state.our_next_ratchet_key.public_hex(),
        previous_chain_length: state.previous_sending_chain_message_count,
    };

    state.sending_chain_message_number += 1;

    let conversation_key = nip44::v2::ConversationKey::new(message_key);
    let encrypted_bytes = nip44::v2::encrypt_to_bytes(&conversation_key, plaintext.as_bytes())
        .map_err(|e| Error::Encryption(e.to_string()))?;
    let ciphertext = base64::engine::general_purpose::STANDARD.encode(encrypted_bytes);
    Ok((header, ciphertext))
}

fn ratchet_decrypt(
    state: &mut SessionState,
    header: &Header,
    ciphertext: &str,
    sender_hex: &str,
    header_key: KeyBytes,
) -> Result<String> {
    if state.receiving_chain_key.is_none() {
        return Err(Error::SessionNotReady);
    }

    skip_message_keys(state, header.number, sender_hex, Some(header_key))?;

    let receiving_chain_key = state.receiving_chain_key.ok_or(Error::SessionNotReady)?;
    let kdf_outputs = kdf(&receiving_chain_key.0, &[1u8], 2);
    state.receiving_chain_key = Some(KeyBytes(kdf_outputs[0]));
    state.receiving_chain_message_number += 1;

    open_body(kdf_outputs[1], ciphertext)
}

fn ratchet_step(state: &mut SessionState) -> Result<()> {
    state.previous_sending_chain_message_count = state.sending_chain_message_number;
    state.sending_chain_message_number = 0;
    state.receiving_chain_message_number = 0;

    let their_next = state.their_next_ratchet_key.ok_or(Error::SessionNotReady)?;

    let kdf_outputs = kdf(
        &state.root_key.0,
        &dh(&state.our_next_ratchet_key.secret_key()?, &their_next),
        2,
    );
    state.receiving_chain_key = Some(KeyBytes(kdf_outputs[1]));

    state.our_current_ratchet_key = Some(state.our_next_ratchet_key.clone());
    state.our_next_ratchet_key = SerializableKeyPair::generate();

    let kdf_outputs2 = kdf(
        &kdf_outputs[0],
        &dh(&state.our_next_ratchet_key.secret_key()?, &their_next),
        2,
    );
    state.root_key = KeyBytes(kdf_outputs2[0]);
    state.sending_chain_key = Some(KeyBytes(kdf_outputs2[1]));

    Ok(())
}

fn skip_message_keys(
    state: &mut SessionState,
    until: u32,
    sender_hex: &str,
    header_key: Option<KeyBytes>,
) -> Result<()> {
    if until <= state.receiving_chain_message_number {
        return Ok(());
    }

    if (until - state.receiving_chain_message_number) as usize > MAX_SKIP {
        return Err(Error::TooManySkippedMessages);
    }

    let entry = state
        .skipped_keys
        .entry(sender_hex.to_string())
        .or_insert_with(SkippedKeysEntry::default);
    if let Some(key) = header_key {
        if !entry.header_keys.contains(&key) {
            entry.header_keys.push(key);
        }
    }

    while state.receiving_chain_message_number < until {
        let receiving_chain_key = state.receiving_chain_key.ok_or(Error::SessionNotReady)?;
        let kdf_outputs = kdf(&receiving_chain_key.0, &[1u8], 2);
        state.receiving_chain_key = Some(KeyBytes(kdf_outputs[0]));
        entry
            .message_keys
            .insert(state.receiving_chain_message_number, KeyBytes(kdf_outputs[1]));
        state.receiving_chain_message_number += 1;
    }

    Ok(())
}

fn try_skipped_message_key(
    state: &mut SessionState,
    sender_hex: &str,
    number: u32,
    ciphertext: &str,
) -> Result<Option<String>> {
    let Some(entry) = state.skipped_keys.get_mut(sender_hex) else {
        return Ok(None);
    };
    let Some(message_key) = entry.message_keys.remove(&number) else {
        return Ok(None);
    };

    let plaintext = open_body(message_key.0, ciphertext)?;
    if entry.message_keys.is_empty() {
        state.skipped_keys.remove(sender_hex);
    }
    Ok(Some(plaintext))
}

/// Messages from a chain we already ratcheted away from: either a late
/// message with a stored skipped key, or a replay.
fn try_retired_chain(
    state: &mut SessionState,
    sender_hex: &str,
    sender: &PublicKey,
    message: &RatchetMessage,
) -> Result<Option<String>> {
    let header = state.skipped_keys.get(sender_hex).and_then(|entry| {
        entry.header_keys.iter().find_map(|key| {
            let secret = nostr::SecretKey::from_slice(&key.0).ok()?;
            let decrypted = nip44::decrypt(&secret, sender, &message.header).ok()?;
            serde_json::from_str::<Header>(&decrypted).ok()
        })
    });

    if let Some(header) = header {
        return match try_skipped_message_key(state, sender_hex, header.number, &message.ciphertext)? {
            Some(plaintext) => Ok(Some(plaintext)),
            None => Err(Error::DuplicateMessage {
                counter: header.number,
            }),
        };
    }

    if state.retired_sender_keys.iter().any(|k| k == sender_hex) {
        return Err(Error::DuplicateMessage { counter: 0 });
    }
    Ok(None)
}

fn retire_sender_key(state: &mut SessionState, sender_hex: String) {
    if state.retired_sender_keys.contains(&sender_hex) {
        return;
    }
    state.retired_sender_keys.push(sender_hex);
    if state.retired_sender_keys.len() > MAX_RETIRED_CHAINS {
        let evicted = state.retired_sender_keys.remove(0);
        state.skipped_keys.remove(&evicted);
    }
}

fn decrypt_header(
    state: &SessionState,
    sealed_header: &str,
    sender: &PublicKey,
) -> Result<(Header, bool, KeyBytes)> {
    if let Some(current) = &state.our_current_ratchet_key {
        if let Ok(decrypted) = nip44::decrypt(&current.secret_key()?, sender, sealed_header) {
            let header: Header = serde_json::from_str(&decrypted)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            return Ok((header, false, current.private_key));
        }
    }

    let next = &state.our_next_ratchet_key;
    let decrypted = nip44::decrypt(&next.secret_key()?, sender, sealed_header)
        .map_err(|e| Error::Decryption(format!("header: {}", e)))?;
    let header: Header =
        serde_json::from_str(&decrypted).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok((header, true, next.private_key))
}

fn open_body(message_key: [u8; 32], ciphertext: &str) -> Result<String> {
    let conversation_key = nip44::v2::ConversationKey::new(message_key);
    let ciphertext_bytes = base64::engine::general_purpose::STANDARD
        .decode(ciphertext)
        .map_err(|e| Error::Decryption(e.to_string()))?;

    let plaintext_bytes = nip44::v2::decrypt_to_bytes(&conversation_key, &ciphertext_bytes)
        .map_err(|e| Error::Decryption(e.to_string()))?;
    String::from_utf8(plaintext_bytes).map_err(|e| Error::Decryption(e.to_string()))
}
