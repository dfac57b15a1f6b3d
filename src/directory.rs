//! Contracts with the key directory: device registration, pre-key upload
//! and peer bundle lookup.
//!
//! The directory is reached over some transport the embedding application
//! owns. Responses are modelled with optional fields and checked here, at the
//! boundary, so nothing downstream ever sees a half-filled bundle.

use crate::{Error, P256PublicKey};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Renders a scalar JSON value (string, number or bool) as text. Null,
/// arrays and objects have no text form.
pub(crate) fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Accepts ids sent as any JSON scalar. Values that cannot be an id read
/// as absent instead of failing the surrounding document.
pub(crate) fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(scalar_text))
}

/// Registers this device and its identity key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub device_name: String,
    /// Base64 SEC1 identity public key.
    pub identity_key_pub: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPrekeyUpload {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekeyUpload {
    pub key_id: u32,
    pub public_key: String,
}

/// The pre-key material published for a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyUpload {
    pub signed_prekey: SignedPrekeyUpload,
    pub one_time_prekeys: Vec<OneTimePrekeyUpload>,
}

impl PrekeyUpload {
    /// Builds the upload published by this implementation.
    ///
    /// Every pre-key is the identity public key itself and the "signature"
    /// is that same key. None of it is authenticated; peers must not treat
    /// the signature as proof of anything.
    pub fn from_identity(identity_key_pub: &str, signed_prekey_id: u32, one_time_count: u32) -> Self {
        Self {
            signed_prekey: SignedPrekeyUpload {
                key_id: signed_prekey_id,
                public_key: identity_key_pub.to_string(),
                signature: identity_key_pub.to_string(),
            },
            one_time_prekeys: (1..=one_time_count)
                .map(|key_id| OneTimePrekeyUpload {
                    key_id,
                    public_key: identity_key_pub.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPrekeyRef {
    pub key_id: u32,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekeyRef {
    pub key_id: u32,
    #[serde(default)]
    pub public_key: Option<String>,
}

/// A peer's bundle as returned by the directory, before validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleResponse {
    #[serde(default, deserialize_with = "optional_id")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub identity_key_pub: Option<String>,
    #[serde(default)]
    pub signed_prekey: Option<SignedPrekeyRef>,
    #[serde(default)]
    pub one_time_prekey: Option<OneTimePrekeyRef>,
}

/// A validated peer bundle, ready for key agreement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerBundle {
    pub device_id: String,
    pub identity_key_pub: P256PublicKey,
    pub signed_prekey_id: Option<u32>,
    pub one_time_prekey_id: Option<u32>,
}

impl BundleResponse {
    /// Checks the bundle before any key is derived from it.
    ///
    /// Rejects a missing device id, a missing identity key, an identity key
    /// equal to one of `placeholders`, and anything that is not a P-256 point.
    pub fn validate(self, placeholders: &[String]) -> Result<PeerBundle, Error> {
        let device_id = self
            .device_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::BundleInvalid("missing device_id".to_string()))?;

        let identity_key_pub = self
            .identity_key_pub
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::BundleInvalid("missing identity_key_pub".to_string()))?;

        if placeholders.iter().any(|placeholder| *placeholder == identity_key_pub) {
            return Err(Error::BundleInvalid(format!(
                "identity_key_pub is the placeholder {identity_key_pub:?}"
            )));
        }

        let identity_key_pub = P256PublicKey::from_base64(&identity_key_pub)
            .map_err(|err| Error::BundleInvalid(format!("identity_key_pub: {err}")))?;

        Ok(PeerBundle {
            device_id,
            identity_key_pub,
            signed_prekey_id: self.signed_prekey.map(|spk| spk.key_id),
            one_time_prekey_id: self.one_time_prekey.map(|otpk| otpk.key_id),
        })
    }
}

/// The `{"data": ...}` envelope the directory wraps its responses in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn into_data(self) -> Option<T> {
        self.data
    }
}

/// The key directory the session manager publishes to and looks peers up in.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Registers the local device. The response must carry the new id.
    async fn register_device(
        &self,
        request: &DeviceRegistration,
    ) -> Result<RegistrationResponse, Error>;

    /// Publishes pre-keys for `device_id`.
    async fn upload_prekeys(&self, device_id: &str, upload: &PrekeyUpload) -> Result<(), Error>;

    /// Looks up the bundle a peer published, if any.
    async fn fetch_bundle(&self, peer_id: &str) -> Result<Option<BundleResponse>, Error>;
}

#[async_trait]
impl<T: KeyDirectory + ?Sized> KeyDirectory for Arc<T> {
    async fn register_device(
        &self,
        request: &DeviceRegistration,
    ) -> Result<RegistrationResponse, Error> {
        (**self).register_device(request).await
    }

    async fn upload_prekeys(&self, device_id: &str, upload: &PrekeyUpload) -> Result<(), Error> {
        (**self).upload_prekeys(device_id, upload).await
    }

    async fn fetch_bundle(&self, peer_id: &str) -> Result<Option<BundleResponse>, Error> {
        (**self).fetch_bundle(peer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_keypair;

    fn placeholders() -> Vec<String> {
        vec!["string".to_string()]
    }

    #[test]
    fn test_registration_response_shapes() {
        let text: ApiResponse<RegistrationResponse> =
            serde_json::from_str(r#"{"data": {"id": "dev-1"}}"#).unwrap();
        assert_eq!(text.into_data().unwrap().id.as_deref(), Some("dev-1"));

        let number: ApiResponse<RegistrationResponse> =
            serde_json::from_str(r#"{"data": {"id": 42}}"#).unwrap();
        assert_eq!(number.into_data().unwrap().id.as_deref(), Some("42"));

        let missing: ApiResponse<RegistrationResponse> =
            serde_json::from_str(r#"{"data": {"device_id": 42}}"#).unwrap();
        assert_eq!(missing.into_data().unwrap().id, None);

        let negative: ApiResponse<RegistrationResponse> =
            serde_json::from_str(r#"{"data": {"id": -5}}"#).unwrap();
        assert_eq!(negative.into_data().unwrap().id.as_deref(), Some("-5"));

        let object: ApiResponse<RegistrationResponse> =
            serde_json::from_str(r#"{"data": {"id": {"value": 1}}}"#).unwrap();
        assert_eq!(object.into_data().unwrap().id, None);

        let empty: ApiResponse<RegistrationResponse> = serde_json::from_str("{}").unwrap();
        assert!(empty.into_data().is_none());
    }

    #[test]
    fn test_prekey_upload_wire_shape() {
        let upload = PrekeyUpload::from_identity("PUB", 1, 5);
        let json = serde_json::to_value(&upload).unwrap();

        assert_eq!(json["signed_prekey"]["key_id"], 1);
        assert_eq!(json["signed_prekey"]["signature"], "PUB");
        assert_eq!(json["one_time_prekeys"].as_array().unwrap().len(), 5);
        assert_eq!(json["one_time_prekeys"][4]["key_id"], 5);
        assert_eq!(json["one_time_prekeys"][0]["public_key"], "PUB");
    }

    #[test]
    fn test_valid_bundle() {
        let identity = generate_keypair().unwrap();
        let json = serde_json::json!({
            "device_id": 17,
            "identity_key_pub": identity.public_key().to_base64(),
            "signed_prekey": {"key_id": 1, "public_key": identity.public_key().to_base64()},
            "one_time_prekey": {"key_id": 3},
        });

        let bundle: BundleResponse = serde_json::from_value(json).unwrap();
        let bundle = bundle.validate(&placeholders()).unwrap();

        assert_eq!(bundle.device_id, "17");
        assert_eq!(bundle.identity_key_pub, identity.public_key());
        assert_eq!(bundle.signed_prekey_id, Some(1));
        assert_eq!(bundle.one_time_prekey_id, Some(3));
    }

    #[test]
    fn test_invalid_bundles() {
        let identity = generate_keypair().unwrap().public_key().to_base64();

        let no_device = BundleResponse {
            identity_key_pub: Some(identity.clone()),
            ..Default::default()
        };
        assert!(matches!(
            no_device.validate(&placeholders()),
            Err(Error::BundleInvalid(_))
        ));

        let placeholder = BundleResponse {
            device_id: Some("d1".to_string()),
            identity_key_pub: Some("string".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            placeholder.validate(&placeholders()),
            Err(Error::BundleInvalid(_))
        ));

        let not_a_point = BundleResponse {
            device_id: Some("d1".to_string()),
            identity_key_pub: Some("AAAA".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            not_a_point.validate(&placeholders()),
            Err(Error::BundleInvalid(_))
        ));
    }
}
