use crate::{Error, Result};
use hkdf::Hkdf;
use nostr::nips::nip44;
use nostr::{PublicKey, SecretKey};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn kdf(input1: &[u8], input2: &[u8], num_outputs: usize) -> Vec<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(input2), input1);

    let mut outputs = Vec::with_capacity(num_outputs);
    for i in 1..=num_outputs {
        let mut okm = [0u8; 32];
        // 32 bytes is always a valid HKDF-SHA256 output length
        let _ = hk.expand(&[i as u8], &mut okm);
        outputs.push(okm);
    }
    outputs
}

/// Shared secret between a secret key and a public key.
pub fn dh(secret: &SecretKey, public: &PublicKey) -> [u8; 32] {
    let conversation_key = nip44::v2::ConversationKey::derive(secret, public);
    let mut out = [0u8; 32];
    out.copy_from_slice(conversation_key.as_bytes());
    out
}

pub fn pubkey_from_hex(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        return Err(Error::InvalidHeader);
    }
    Ok(PublicKey::from_slice(&bytes)?)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock milliseconds, strictly increasing within the process so
/// messages created in the same millisecond keep their creation order.
pub fn message_timestamp() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = now_millis();
    let mut last = LAST.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// Server payloads carry ids as loosely formatted strings; compare them trimmed.
pub fn normalize_id(raw: &str) -> String {
    raw.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    #[test]
    fn kdf_outputs_are_distinct_and_deterministic() {
        let a = kdf(b"input", b"salt", 2);
        let b = kdf(b"input", b"salt", 2);
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
    }

    #[test]
    fn dh_is_symmetric() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        assert_eq!(
            dh(alice.secret_key(), &bob.public_key()),
            dh(bob.secret_key(), &alice.public_key())
        );
    }

    #[test]
    fn rejects_short_pubkey_hex() {
        assert!(pubkey_from_hex("abcd").is_err());
        assert_eq!(normalize_id("  42 "), "42");
    }

    #[test]
    fn message_timestamps_strictly_increase() {
        let stamps: Vec<u64> = (0..100).map(|_| message_timestamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }
}
