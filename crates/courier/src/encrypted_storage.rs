use crate::{Error, Result, StorageAdapter};
use base64::Engine;
use nostr::nips::nip44;

/// Seals every stored value with a device-local storage key. Key names are
/// left readable so prefix listing keeps working; they carry only ids.
pub struct EncryptedStorage<S> {
    inner: S,
    storage_key: [u8; 32],
}

impl<S: StorageAdapter> EncryptedStorage<S> {
    pub fn new(inner: S, storage_key: [u8; 32]) -> Self {
        Self { inner, storage_key }
    }

    fn seal(&self, value: &str) -> Result<String> {
        let key = nip44::v2::ConversationKey::new(self.storage_key);
        let sealed = nip44::v2::encrypt_to_bytes(&key, value.as_bytes())
            .map_err(|e| Error::Storage(format!("failed to seal value: {}", e)))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    fn open(&self, sealed: &str) -> Result<String> {
        let key = nip44::v2::ConversationKey::new(self.storage_key);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| Error::Storage(format!("corrupt sealed value: {}", e)))?;
        let plain = nip44::v2::decrypt_to_bytes(&key, &bytes)
            .map_err(|e| Error::Storage(format!("corrupt sealed value: {}", e)))?;
        String::from_utf8(plain).map_err(|e| Error::Storage(e.to_string()))
    }
}

impl<S: StorageAdapter> StorageAdapter for EncryptedStorage<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner
            .get(key)?
            .map(|sealed| self.open(&sealed))
            .transpose()
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let sealed = self.seal(&value)?;
        self.inner.put(key, sealed)
    }

    fn del(&self, key: &str) -> Result<()> {
        self.inner.del(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;

    #[test]
    fn values_are_not_stored_in_the_clear() {
        let backing = InMemoryStorage::new();
        let storage = EncryptedStorage::new(backing.clone(), [7u8; 32]);

        storage.put("identity", "secret-material".to_string()).unwrap();

        let raw = backing.get("identity").unwrap().unwrap();
        assert!(!raw.contains("secret-material"));
        assert_eq!(
            storage.get("identity").unwrap(),
            Some("secret-material".to_string())
        );
        assert_eq!(storage.list("").unwrap(), vec!["identity".to_string()]);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let backing = InMemoryStorage::new();
        EncryptedStorage::new(backing.clone(), [1u8; 32])
            .put("k", "v".to_string())
            .unwrap();

        let other = EncryptedStorage::new(backing, [2u8; 32]);
        let err = other.get("k").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Storage);
    }

    #[test]
    fn tampered_value_is_a_storage_error() {
        let backing = InMemoryStorage::new();
        let storage = EncryptedStorage::new(backing.clone(), [7u8; 32]);
        storage.put("k", "value".to_string()).unwrap();

        let mut raw = backing.get("k").unwrap().unwrap();
        raw.replace_range(10..14, "AAAA");
        backing.put("k", raw).unwrap();

        assert!(matches!(storage.get("k"), Err(Error::Storage(_))));
    }
}
