use crate::directory::{BundleResponse, DeviceRegistration, KeyDirectory, PrekeyUpload};
use crate::store::{KeyMaterialStore, StoreBackend};
use crate::transport::{Conversation, FrameSink};
use crate::{
    EncryptedPayload, Error, KeyPair, P256PublicKey, SessionConfig, SessionKey,
    derive_session_key, derive_shared_secret, generate_keypair,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Key material the initiator sends alongside its first message so the
/// receiver can derive the same session key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    /// Base64 SEC1 public half of the initiator's ephemeral key.
    pub ephemeral_pub: String,
    #[serde(default)]
    pub signed_prekey_id: Option<u32>,
    #[serde(default)]
    pub one_time_prekey_id: Option<u32>,
}

/// An established session with one peer.
///
/// Records are never edited; re-establishing a session replaces the record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_key: SessionKey,
    /// The peer device messages are addressed to.
    pub receiver_device_id: String,
    /// Present on the initiating side only.
    pub header: Option<SessionHeader>,
}

/// Coordinates device setup and per-peer session establishment.
///
/// Holds the key material store and the key directory. Session establishment
/// for a given peer is single-flight: concurrent callers for the same peer
/// wait for the first one and then take the cached result.
///
/// A session is a single static key per peer pair. There is no ratchet and
/// therefore no forward secrecy.
pub struct SessionManager<B, D> {
    store: KeyMaterialStore<B>,
    directory: D,
    config: SessionConfig,
    identity_lock: Mutex<()>,
    registration_lock: Mutex<()>,
    prekey_lock: Mutex<()>,
    peer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<B: StoreBackend, D: KeyDirectory> SessionManager<B, D> {
    /// Creates a manager over `store` and `directory`.
    ///
    /// If no configuration is provided, default values are used.
    pub fn new(store: KeyMaterialStore<B>, directory: D, config: Option<SessionConfig>) -> Self {
        Self {
            store,
            directory,
            config: config.unwrap_or_default(),
            identity_lock: Mutex::new(()),
            registration_lock: Mutex::new(()),
            prekey_lock: Mutex::new(()),
            peer_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &KeyMaterialStore<B> {
        &self.store
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns this device's identity key pair, generating and persisting it
    /// on first use.
    pub async fn ensure_identity_keypair(&self) -> Result<KeyPair, Error> {
        let _guard = self.identity_lock.lock().await;

        if let Some(keypair) = self.store.identity_keypair()? {
            return Ok(keypair);
        }

        let keypair = generate_keypair()?;
        self.store.set_identity_keypair(&keypair)?;
        info!("generated identity key pair");

        Ok(keypair)
    }

    /// Returns this device's id, registering with the directory on first use.
    pub async fn ensure_device_registered(&self) -> Result<String, Error> {
        let _guard = self.registration_lock.lock().await;

        if let Some(device_id) = self.store.device_id()? {
            return Ok(device_id);
        }

        let identity = self.ensure_identity_keypair().await?;
        let request = DeviceRegistration {
            device_name: self.config.device_name.clone(),
            identity_key_pub: identity.public_key().to_base64(),
        };

        let response = self.directory.register_device(&request).await?;
        let device_id = response
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::RegistrationFailed("response carried no device id".to_string()))?;

        self.store.set_device_id(&device_id)?;
        info!(device_id = %device_id, "registered device");

        Ok(device_id)
    }

    /// Publishes this device's pre-keys once.
    pub async fn ensure_prekeys_uploaded(&self) -> Result<(), Error> {
        let _guard = self.prekey_lock.lock().await;

        if self.store.prekeys_uploaded()? {
            return Ok(());
        }

        let device_id = self.ensure_device_registered().await?;
        let identity = self.ensure_identity_keypair().await?;

        let upload = PrekeyUpload::from_identity(
            &identity.public_key().to_base64(),
            self.config.signed_prekey_id,
            self.config.one_time_prekey_count,
        );
        self.directory.upload_prekeys(&device_id, &upload).await?;

        self.store.set_prekeys_uploaded(true)?;
        info!(
            device_id = %device_id,
            one_time_prekeys = upload.one_time_prekeys.len(),
            "published pre-keys"
        );

        Ok(())
    }

    /// Runs identity generation, registration and pre-key publication, in
    /// that order, and returns the device id.
    pub async fn setup_device(&self) -> Result<String, Error> {
        self.ensure_identity_keypair().await?;
        let device_id = self.ensure_device_registered().await?;
        self.ensure_prekeys_uploaded().await?;

        Ok(device_id)
    }

    /// Fetches the bundle `peer_id` published.
    pub async fn fetch_peer_bundle(&self, peer_id: &str) -> Result<BundleResponse, Error> {
        self.directory
            .fetch_bundle(peer_id)
            .await?
            .ok_or_else(|| Error::BundleMissing(peer_id.to_string()))
    }

    /// Entries live until the next `reset`.
    async fn peer_lock(&self, peer_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.peer_locks.lock().await;
        locks.entry(peer_id.to_string()).or_default().clone()
    }

    /// Returns the session with `peer_id`, establishing it if needed.
    ///
    /// A cached, complete record is returned as is without touching the
    /// directory. Otherwise the peer's bundle is fetched and validated, a
    /// fresh ephemeral key pair is agreed against the peer's identity key,
    /// and the resulting record (with the header the peer needs) is stored.
    pub async fn ensure_session(&self, peer_id: &str) -> Result<SessionRecord, Error> {
        let lock = self.peer_lock(peer_id).await;
        let _guard = lock.lock().await;

        if let Some(record) = self.store.session(peer_id)? {
            debug!(peer_id, "using cached session");
            return Ok(record);
        }

        let bundle = self
            .fetch_peer_bundle(peer_id)
            .await?
            .validate(&self.config.placeholder_identity_keys)
            .inspect_err(|err| warn!(peer_id, "rejected pre-key bundle: {err}"))?;

        let ephemeral = generate_keypair()?;
        let shared_secret = derive_shared_secret(ephemeral.secret(), &bundle.identity_key_pub);
        let session_key = derive_session_key(&shared_secret, &self.config.hkdf_info)?;

        let record = SessionRecord {
            session_key,
            receiver_device_id: bundle.device_id,
            header: Some(SessionHeader {
                ephemeral_pub: ephemeral.public_key().to_base64(),
                signed_prekey_id: bundle.signed_prekey_id,
                one_time_prekey_id: bundle.one_time_prekey_id,
            }),
        };
        self.store.set_session(peer_id, &record)?;
        info!(peer_id, receiver_device_id = %record.receiver_device_id, "established session");

        Ok(record)
    }

    /// Derives the session a peer initiated, from the header it sent and
    /// this device's identity key.
    ///
    /// Replaces any session already stored for `peer_id`.
    pub async fn accept_session(
        &self,
        peer_id: &str,
        sender_device_id: &str,
        header: &SessionHeader,
    ) -> Result<SessionRecord, Error> {
        let lock = self.peer_lock(peer_id).await;
        let _guard = lock.lock().await;

        let ephemeral_pub = P256PublicKey::from_base64(&header.ephemeral_pub)?;
        let identity = self.ensure_identity_keypair().await?;

        let shared_secret = derive_shared_secret(identity.secret(), &ephemeral_pub);
        let record = SessionRecord {
            session_key: derive_session_key(&shared_secret, &self.config.hkdf_info)?,
            receiver_device_id: sender_device_id.to_string(),
            header: None,
        };
        self.store.set_session(peer_id, &record)?;
        info!(peer_id, sender_device_id, "accepted session");

        Ok(record)
    }

    /// Returns the cached session with `peer_id` without any network I/O.
    pub fn session(&self, peer_id: &str) -> Result<Option<SessionRecord>, Error> {
        self.store.session(peer_id)
    }

    fn established(&self, peer_id: &str) -> Result<SessionRecord, Error> {
        self.store
            .session(peer_id)?
            .ok_or_else(|| Error::SessionNotEstablished(peer_id.to_string()))
    }

    /// Encrypts `plaintext` for `peer_id` with the established session key.
    pub fn encrypt_for(&self, peer_id: &str, plaintext: &str) -> Result<EncryptedPayload, Error> {
        EncryptedPayload::seal(&self.established(peer_id)?.session_key, plaintext)
    }

    /// Decrypts a payload received from `peer_id`.
    pub fn decrypt_from(&self, peer_id: &str, payload: &EncryptedPayload) -> Result<String, Error> {
        payload.open(&self.established(peer_id)?.session_key)
    }

    /// Binds the established session with `peer_id` to an outbound frame
    /// sink.
    pub fn open_conversation<S: FrameSink>(
        &self,
        peer_id: &str,
        sink: S,
    ) -> Result<Conversation<S>, Error> {
        let session = self.established(peer_id)?;
        let local_device_id = self
            .store
            .device_id()?
            .ok_or(Error::DeviceNotRegistered)?;

        Ok(Conversation::new(
            peer_id,
            local_device_id,
            session,
            sink,
            Some(self.config.clone()),
        ))
    }

    /// Forgets every key, device id and session. Used on logout.
    ///
    /// Waits for in-flight session establishment to finish first, so no
    /// session is written after the store is cleared. The per-peer lock
    /// table is emptied along with it.
    pub async fn reset(&self) -> Result<(), Error> {
        let mut peer_locks = self.peer_locks.lock().await;
        let mut in_flight = Vec::with_capacity(peer_locks.len());
        for lock in peer_locks.values() {
            in_flight.push(lock.clone().lock_owned().await);
        }

        let _prekeys = self.prekey_lock.lock().await;
        let _registration = self.registration_lock.lock().await;
        let _identity = self.identity_lock.lock().await;

        self.store.clear_all()?;
        peer_locks.clear();
        info!(peers = in_flight.len(), "cleared key material");

        Ok(())
    }
}
