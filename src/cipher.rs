use crate::Error;
use crate::keys::fill_random;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of an AES-256 session key in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// Length of an AES-GCM nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// A symmetric key shared with one peer.
///
/// Always exactly 32 bytes; every import path rejects other lengths.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(Box<[u8; SESSION_KEY_LEN]>);

impl SessionKey {
    /// Imports raw key bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != SESSION_KEY_LEN {
            return Err(Error::InvalidKeyLength(bytes.len()));
        }

        let mut key = Box::new([0u8; SESSION_KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Imports a base64-encoded key, as kept at rest.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = Zeroizing::new(STANDARD.decode(encoded)?);
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_slice())
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl From<Box<[u8; SESSION_KEY_LEN]>> for SessionKey {
    fn from(bytes: Box<[u8; SESSION_KEY_LEN]>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Ciphertext (including the 16-byte tag) and the nonce it was sealed with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Generates a fresh random 96-bit nonce.
fn generate_nonce() -> Result<[u8; NONCE_LEN], Error> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;
    Ok(nonce)
}

fn new_cipher(key: &SessionKey) -> Result<Aes256Gcm, Error> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| Error::InvalidKeyLength(key.as_bytes().len()))
}

/// Encrypts `plaintext` with AES-256-GCM under `key`.
///
/// A new random nonce is drawn for every call. Callers never supply one.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Sealed, Error> {
    let nonce = generate_nonce()?;

    let cipher = new_cipher(key)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|err| Error::EncryptionFailed(err.to_string()))?;

    Ok(Sealed { ciphertext, nonce })
}

/// Decrypts and authenticates `ciphertext` with AES-256-GCM.
///
/// Fails with [`Error::AuthenticationFailure`] on a tampered payload, a wrong
/// key or a wrong nonce.
pub fn decrypt(key: &SessionKey, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, Error> {
    if nonce.len() != NONCE_LEN {
        return Err(Error::AuthenticationFailure);
    }

    let cipher = new_cipher(key)?;
    Ok(cipher.decrypt(Nonce::from_slice(nonce), ciphertext)?)
}

/// An encrypted text message as it travels on the wire: base64 ciphertext and
/// base64 nonce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub nonce: String,
}

impl EncryptedPayload {
    /// Encrypts a UTF-8 message.
    pub fn seal(key: &SessionKey, plaintext: &str) -> Result<Self, Error> {
        let sealed = encrypt(key, plaintext.as_bytes())?;

        Ok(Self {
            ciphertext: STANDARD.encode(&sealed.ciphertext),
            nonce: STANDARD.encode(sealed.nonce),
        })
    }

    /// Decrypts back to the UTF-8 message.
    pub fn open(&self, key: &SessionKey) -> Result<String, Error> {
        let ciphertext = STANDARD.decode(&self.ciphertext)?;
        let nonce = STANDARD.decode(&self.nonce)?;

        let plaintext = decrypt(key, &ciphertext, &nonce)?;
        String::from_utf8(plaintext).map_err(|err| Error::Encoding(err.to_string()))
    }
}

/// Encrypts `plaintext` under a base64-encoded session key.
pub fn encrypt_message(session_key_b64: &str, plaintext: &str) -> Result<EncryptedPayload, Error> {
    let key = SessionKey::from_base64(session_key_b64)?;
    EncryptedPayload::seal(&key, plaintext)
}

/// Decrypts `payload` under a base64-encoded session key.
pub fn decrypt_message(session_key_b64: &str, payload: &EncryptedPayload) -> Result<String, Error> {
    let key = SessionKey::from_base64(session_key_b64)?;
    payload.open(&key)
}
