use async_trait::async_trait;
use courier::directory::{
    BundleResponse, DeviceRegistration, KeyDirectory, OneTimePrekeyRef, PrekeyUpload,
    RegistrationResponse, SignedPrekeyRef,
};
use courier::transport::FrameSink;
use courier::{Error, KeyMaterialStore, MemoryBackend, SessionManager};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
struct PublishedDevice {
    user_id: String,
    device_id: String,
    identity_key_pub: String,
    upload: Option<PrekeyUpload>,
}

/// An in-memory key directory shared by every test device.
///
/// Devices are registered under the user id the directory was asked for via
/// [`MemoryDirectory::for_user`]; bundles are served per user.
#[derive(Default)]
pub struct MemoryDirectory {
    devices: Mutex<Vec<PublishedDevice>>,
    overrides: Mutex<HashMap<String, BundleResponse>>,
    next_device: AtomicUsize,
    pub registrations: AtomicUsize,
    pub uploads: AtomicUsize,
    pub bundle_fetches: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serves `bundle` for `user_id` instead of whatever was published.
    pub fn override_bundle(&self, user_id: &str, bundle: BundleResponse) {
        self.overrides
            .lock()
            .unwrap()
            .insert(user_id.to_string(), bundle);
    }

    pub fn network_calls(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
            + self.uploads.load(Ordering::SeqCst)
            + self.bundle_fetches.load(Ordering::SeqCst)
    }

    pub fn for_user(self: &Arc<Self>, user_id: &str) -> UserDirectory {
        UserDirectory {
            user_id: user_id.to_string(),
            inner: self.clone(),
        }
    }
}

/// The directory as seen by one logged-in user.
pub struct UserDirectory {
    user_id: String,
    inner: Arc<MemoryDirectory>,
}

#[async_trait]
impl KeyDirectory for UserDirectory {
    async fn register_device(
        &self,
        request: &DeviceRegistration,
    ) -> Result<RegistrationResponse, Error> {
        self.inner.registrations.fetch_add(1, Ordering::SeqCst);

        let n = self.inner.next_device.fetch_add(1, Ordering::SeqCst);
        let device_id = format!("device-{n}");
        self.inner.devices.lock().unwrap().push(PublishedDevice {
            user_id: self.user_id.clone(),
            device_id: device_id.clone(),
            identity_key_pub: request.identity_key_pub.clone(),
            upload: None,
        });

        Ok(RegistrationResponse {
            id: Some(device_id),
        })
    }

    async fn upload_prekeys(&self, device_id: &str, upload: &PrekeyUpload) -> Result<(), Error> {
        self.inner.uploads.fetch_add(1, Ordering::SeqCst);

        let mut devices = self.inner.devices.lock().unwrap();
        let device = devices
            .iter_mut()
            .find(|device| device.device_id == device_id)
            .ok_or_else(|| Error::Collaborator(format!("unknown device {device_id}")))?;
        device.upload = Some(upload.clone());

        Ok(())
    }

    async fn fetch_bundle(&self, peer_id: &str) -> Result<Option<BundleResponse>, Error> {
        self.inner.bundle_fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(bundle) = self.inner.overrides.lock().unwrap().get(peer_id) {
            return Ok(Some(bundle.clone()));
        }

        let devices = self.inner.devices.lock().unwrap();
        Ok(devices
            .iter()
            .rev()
            .find(|device| device.user_id == peer_id && device.upload.is_some())
            .map(|device| {
                let upload = device.upload.as_ref();
                BundleResponse {
                    device_id: Some(device.device_id.clone()),
                    identity_key_pub: Some(device.identity_key_pub.clone()),
                    signed_prekey: upload.map(|upload| SignedPrekeyRef {
                        key_id: upload.signed_prekey.key_id,
                        public_key: Some(upload.signed_prekey.public_key.clone()),
                    }),
                    one_time_prekey: upload
                        .and_then(|upload| upload.one_time_prekeys.first())
                        .map(|otpk| OneTimePrekeyRef {
                            key_id: otpk.key_id,
                            public_key: Some(otpk.public_key.clone()),
                        }),
                }
            }))
    }
}

pub type TestManager = SessionManager<MemoryBackend, UserDirectory>;

pub fn device(directory: &Arc<MemoryDirectory>, user_id: &str) -> TestManager {
    SessionManager::new(
        KeyMaterialStore::new(MemoryBackend::new()),
        directory.for_user(user_id),
        None,
    )
}

/// Collects every frame handed to the transport.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<String>>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_frame(&self, frame: String) -> Result<(), Error> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}
