/// Errors that can occur while establishing or using an encrypted conversation.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The platform could not provide entropy for a new key pair.
    #[error("Key generation failed")]
    KeyGeneration,

    /// Key material is malformed or not on the expected curve.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A session key did not decode to exactly 32 bytes.
    #[error("Session key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The AEAD tag did not verify (tampered payload, wrong key or wrong nonce).
    #[error("Message authentication failed")]
    AuthenticationFailure,

    /// The key directory returned no bundle for the peer.
    #[error("No pre-key bundle published for peer {0}")]
    BundleMissing(String),

    /// The peer's bundle is incomplete or carries placeholder key material.
    #[error("Invalid pre-key bundle: {0}")]
    BundleInvalid(String),

    /// The key directory did not hand out a device id.
    #[error("Device registration failed: {0}")]
    RegistrationFailed(String),

    /// AES-GCM refused to seal the plaintext.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// This device has no id from the key directory yet.
    #[error("Device is not registered")]
    DeviceNotRegistered,

    /// No session has been established with the peer yet.
    #[error("No session established with peer {0}")]
    SessionNotEstablished(String),

    /// The key material store failed to read or write a value.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A call into the key directory or message transport failed.
    #[error("Collaborator call failed: {0}")]
    Collaborator(String),

    /// Base64 text could not be decoded.
    #[error("Invalid encoding: {0}")]
    Encoding(String),

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),
}

impl From<aes_gcm::Error> for Error {
    fn from(_: aes_gcm::Error) -> Self {
        Self::AuthenticationFailure
    }
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Self::Encoding(value.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}
