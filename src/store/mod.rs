//! Durable key material for the local device.
//!
//! [`StoreBackend`] is the raw key-value contract (get, put, clear) that a
//! platform provides. [`KeyMaterialStore`] layers the typed view on top: the
//! device id, the identity key pair, the pre-key upload flag and one
//! [`SessionRecord`] per peer.
//!
//! Every read reports absence as `Ok(None)` so callers can run
//! ensure-or-create logic. A value that is present but cannot be decoded is
//! an error, never "absent".

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::{Error, KeyPair, SessionHeader, SessionKey, SessionRecord};

const DEVICE_ID: &str = "device_id";
const IDENTITY_KEYPAIR: &str = "identity_keypair";
const PREKEYS_UPLOADED: &str = "prekeys_uploaded";

fn session_key_entry(peer_id: &str) -> String {
    format!("session_key_{peer_id}")
}

fn receiver_device_entry(peer_id: &str) -> String {
    format!("receiver_device_{peer_id}")
}

fn session_header_entry(peer_id: &str) -> String {
    format!("session_header_{peer_id}")
}

/// Raw key-value storage scoped to one local namespace.
///
/// Values are read and written whole. Implementations must survive process
/// restarts to be used in production; no multi-key transactions are
/// required.
pub trait StoreBackend: Send + Sync {
    /// Returns the value stored under `key`, or `None`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;

    /// Removes every key. Callers never observe a partially cleared store.
    fn clear(&self) -> Result<(), Error>;
}

/// Typed access to the device's key material.
pub struct KeyMaterialStore<B> {
    backend: B,
}

impl<B: StoreBackend> KeyMaterialStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn get_text(&self, key: &str) -> Result<Option<String>, Error> {
        match self.backend.get(key)? {
            Some(bytes) if !bytes.is_empty() => String::from_utf8(bytes)
                .map(Some)
                .map_err(|err| Error::Storage(format!("{key} is not UTF-8: {err}"))),
            _ => Ok(None),
        }
    }

    /// The id the key directory issued to this device.
    pub fn device_id(&self) -> Result<Option<String>, Error> {
        self.get_text(DEVICE_ID)
    }

    pub fn set_device_id(&self, device_id: &str) -> Result<(), Error> {
        self.backend.put(DEVICE_ID, device_id.as_bytes().to_vec())
    }

    /// The long-term identity key pair of this device.
    pub fn identity_keypair(&self) -> Result<Option<KeyPair>, Error> {
        match self.backend.get(IDENTITY_KEYPAIR)? {
            Some(bytes) if !bytes.is_empty() => KeyPair::deserialize(&bytes).map(Some),
            _ => Ok(None),
        }
    }

    pub fn set_identity_keypair(&self, keypair: &KeyPair) -> Result<(), Error> {
        self.backend.put(IDENTITY_KEYPAIR, keypair.serialize())
    }

    /// Whether the pre-key bundle has been published.
    pub fn prekeys_uploaded(&self) -> Result<bool, Error> {
        Ok(matches!(self.backend.get(PREKEYS_UPLOADED)?.as_deref(), Some([1])))
    }

    pub fn set_prekeys_uploaded(&self, uploaded: bool) -> Result<(), Error> {
        self.backend.put(PREKEYS_UPLOADED, vec![u8::from(uploaded)])
    }

    /// The cached session with `peer_id`.
    ///
    /// A record missing either the session key or the peer's device id is
    /// reported as absent. A stored key that is not base64 is a
    /// [`Error::Storage`] and one of the wrong length is an
    /// [`Error::InvalidKeyLength`].
    pub fn session(&self, peer_id: &str) -> Result<Option<SessionRecord>, Error> {
        let Some(session_key) = self.get_text(&session_key_entry(peer_id))? else {
            return Ok(None);
        };
        let Some(receiver_device_id) = self.get_text(&receiver_device_entry(peer_id))? else {
            return Ok(None);
        };

        let header = match self.backend.get(&session_header_entry(peer_id))? {
            Some(bytes) if !bytes.is_empty() => Some(SessionHeader::deserialize(&bytes)?),
            _ => None,
        };

        let session_key = SessionKey::from_base64(&session_key).map_err(|err| match err {
            Error::Encoding(err) => Error::Storage(format!("session key for {peer_id}: {err}")),
            err => err,
        })?;

        Ok(Some(SessionRecord {
            session_key,
            receiver_device_id,
            header,
        }))
    }

    /// Replaces the session with `peer_id`.
    ///
    /// The old key is blanked first and the new one written last, so a record
    /// interrupted half-way stays invalid and is re-established on next use.
    pub fn set_session(&self, peer_id: &str, record: &SessionRecord) -> Result<(), Error> {
        self.backend.put(&session_key_entry(peer_id), Vec::new())?;
        self.backend.put(
            &session_header_entry(peer_id),
            record
                .header
                .as_ref()
                .map(SessionHeader::serialize)
                .unwrap_or_default(),
        )?;
        self.backend.put(
            &receiver_device_entry(peer_id),
            record.receiver_device_id.as_bytes().to_vec(),
        )?;
        self.backend.put(
            &session_key_entry(peer_id),
            record.session_key.to_base64().into_bytes(),
        )
    }

    /// Removes all key material. Used on logout.
    pub fn clear_all(&self) -> Result<(), Error> {
        self.backend.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_keypair;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    fn record(seed: u8) -> SessionRecord {
        SessionRecord {
            session_key: SessionKey::from_slice(&[seed; 32]).unwrap(),
            receiver_device_id: format!("device-{seed}"),
            header: Some(SessionHeader {
                ephemeral_pub: "BASE64".to_string(),
                signed_prekey_id: Some(1),
                one_time_prekey_id: None,
            }),
        }
    }

    #[test]
    fn test_reads_report_absence() {
        let store = KeyMaterialStore::new(MemoryBackend::new());

        assert_eq!(store.device_id().unwrap(), None);
        assert!(store.identity_keypair().unwrap().is_none());
        assert!(!store.prekeys_uploaded().unwrap());
        assert_eq!(store.session("bob").unwrap(), None);
    }

    #[test]
    fn test_values_are_overwritten() {
        let store = KeyMaterialStore::new(MemoryBackend::new());

        store.set_device_id("one").unwrap();
        store.set_device_id("two").unwrap();
        assert_eq!(store.device_id().unwrap().as_deref(), Some("two"));

        store.set_prekeys_uploaded(true).unwrap();
        assert!(store.prekeys_uploaded().unwrap());

        let keypair = generate_keypair().unwrap();
        store.set_identity_keypair(&keypair).unwrap();
        assert_eq!(
            store.identity_keypair().unwrap().unwrap().public_key(),
            keypair.public_key()
        );
    }

    #[test]
    fn test_session_replaced_wholesale() {
        let store = KeyMaterialStore::new(MemoryBackend::new());

        store.set_session("bob", &record(1)).unwrap();
        assert_eq!(store.session("bob").unwrap(), Some(record(1)));

        let mut without_header = record(2);
        without_header.header = None;
        store.set_session("bob", &without_header).unwrap();
        assert_eq!(store.session("bob").unwrap(), Some(without_header));

        assert_eq!(store.session("carol").unwrap(), None);
    }

    #[test]
    fn test_partial_session_is_absent() {
        let backend = MemoryBackend::new();
        let store = KeyMaterialStore::new(backend.clone());

        backend
            .put(&session_key_entry("bob"), STANDARD.encode([7u8; 32]).into_bytes())
            .unwrap();
        assert_eq!(store.session("bob").unwrap(), None);

        backend.put(&receiver_device_entry("carol"), b"d1".to_vec()).unwrap();
        assert_eq!(store.session("carol").unwrap(), None);
    }

    #[test]
    fn test_stored_key_of_wrong_length_is_a_hard_failure() {
        let backend = MemoryBackend::new();
        let store = KeyMaterialStore::new(backend.clone());

        backend
            .put(&session_key_entry("bob"), STANDARD.encode([7u8; 31]).into_bytes())
            .unwrap();
        backend.put(&receiver_device_entry("bob"), b"d1".to_vec()).unwrap();

        assert_eq!(store.session("bob"), Err(Error::InvalidKeyLength(31)));
    }

    #[test]
    fn test_stored_key_that_is_not_base64_is_a_storage_error() {
        let backend = MemoryBackend::new();
        let store = KeyMaterialStore::new(backend.clone());

        backend
            .put(&session_key_entry("bob"), b"not base64!".to_vec())
            .unwrap();
        backend.put(&receiver_device_entry("bob"), b"d1".to_vec()).unwrap();

        assert!(matches!(store.session("bob"), Err(Error::Storage(_))));
    }

    #[test]
    fn test_clear_all() {
        let store = KeyMaterialStore::new(MemoryBackend::new());
        store.set_device_id("device").unwrap();
        store.set_prekeys_uploaded(true).unwrap();
        store.set_session("bob", &record(1)).unwrap();

        store.clear_all().unwrap();

        assert_eq!(store.device_id().unwrap(), None);
        assert!(!store.prekeys_uploaded().unwrap());
        assert_eq!(store.session("bob").unwrap(), None);
    }
}
