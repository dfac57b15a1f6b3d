use crate::{Error, SessionKey};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session keys are derived without a per-session salt.
const HKDF_SALT: [u8; 32] = [0u8; 32];

/// A uniformly random seed lands outside the P-256 scalar range with
/// probability ~2^-32, so a handful of draws is plenty.
const MAX_KEYGEN_ATTEMPTS: usize = 4;

/// Fills `buf` from the operating system's CSPRNG.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<(), Error> {
    OsRng.try_fill_bytes(buf).map_err(|_| Error::KeyGeneration)
}

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn generate_random_seed() -> Result<Box<[u8; 32]>, Error> {
    let mut seed = Box::new([0u8; 32]);
    fill_random(seed.as_mut_slice())?;
    Ok(seed)
}

/// Public half of a P-256 key pair.
///
/// Travels as base64 of the uncompressed SEC1 point (65 bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct P256PublicKey(p256::PublicKey);

impl P256PublicKey {
    /// Imports a SEC1-encoded point, rejecting anything not on the curve.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, Error> {
        p256::PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidKey("not a P-256 public key".to_string()))
    }

    /// Imports a base64-encoded SEC1 point.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| Error::InvalidKey(format!("public key is not base64: {err}")))?;

        Self::from_sec1_bytes(&bytes)
    }

    /// Returns the uncompressed SEC1 encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(false).as_bytes().to_vec()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }
}

impl From<p256::PublicKey> for P256PublicKey {
    fn from(value: p256::PublicKey) -> Self {
        Self(value)
    }
}

/// Private half of a P-256 key pair. Zeroized on drop.
#[derive(Clone)]
pub struct P256Secret(Box<p256::SecretKey>);

impl P256Secret {
    /// Imports a 32-byte big-endian scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        p256::SecretKey::from_slice(bytes)
            .map(|secret| Self(Box::new(secret)))
            .map_err(|_| Error::InvalidKey("not a P-256 private key".to_string()))
    }

    /// Serializes the scalar to 32 big-endian bytes.
    pub(crate) fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.0.to_bytes().as_slice());
        bytes
    }

    pub fn public_key(&self) -> P256PublicKey {
        self.0.public_key().into()
    }

    fn dh(&self, public_key: &P256PublicKey) -> SharedSecret {
        let shared = p256::ecdh::diffie_hellman(self.0.to_nonzero_scalar(), public_key.0.as_affine());

        let mut bytes = Box::new([0u8; 32]);
        bytes.copy_from_slice(shared.raw_secret_bytes().as_slice());
        SharedSecret(bytes)
    }
}

impl fmt::Debug for P256Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("P256Secret(..)")
    }
}

/// An elliptic-curve key pair used for key agreement.
///
/// The same shape serves both the long-term identity key of a device and the
/// ephemeral keys generated for a single session establishment.
#[derive(Clone, Debug)]
pub struct KeyPair {
    public: P256PublicKey,
    secret: P256Secret,
}

impl KeyPair {
    /// Returns the public half.
    pub fn public_key(&self) -> P256PublicKey {
        self.public.clone()
    }

    /// Returns the private half.
    pub fn secret(&self) -> &P256Secret {
        &self.secret
    }

    /// Rebuilds a key pair from stored parts, checking they belong together.
    pub(crate) fn from_parts(public_key: &[u8], private_key: &[u8]) -> Result<Self, Error> {
        let pair = Self::from(P256Secret::from_bytes(private_key)?);
        if pair.public != P256PublicKey::from_sec1_bytes(public_key)? {
            return Err(Error::InvalidKey(
                "public key does not match private key".to_string(),
            ));
        }

        Ok(pair)
    }
}

impl From<P256Secret> for KeyPair {
    fn from(secret: P256Secret) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }
}

/// The raw output of an ECDH agreement: the 32-byte x-coordinate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Box<[u8; 32]>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Generates a fresh P-256 key pair from the operating system's CSPRNG.
pub fn generate_keypair() -> Result<KeyPair, Error> {
    for _ in 0..MAX_KEYGEN_ATTEMPTS {
        let mut seed = generate_random_seed()?;
        let secret = P256Secret::from_bytes(seed.as_slice());
        seed.zeroize();

        if let Ok(secret) = secret {
            return Ok(KeyPair::from(secret));
        }
    }

    Err(Error::KeyGeneration)
}

/// Performs Diffie-Hellman agreement between a local private key and a
/// remote public key.
///
/// Both keys are validated when imported, so agreement itself cannot fail.
pub fn derive_shared_secret(
    local_private_key: &P256Secret,
    remote_public_key: &P256PublicKey,
) -> SharedSecret {
    local_private_key.dh(remote_public_key)
}

/// Expands a shared secret into a 256-bit session key with HKDF-SHA256.
///
/// The salt is a fixed all-zero string and `info` is the application context.
/// Changing either breaks compatibility with every session derived so far.
pub fn derive_session_key(shared_secret: &SharedSecret, info: &[u8]) -> Result<SessionKey, Error> {
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT.as_slice()), shared_secret.as_bytes());

    let mut okm = Box::new([0u8; 32]);
    hkdf.expand(info, okm.as_mut_slice())
        .map_err(|_| Error::InvalidKey("HKDF expansion failed".to_string()))?;

    Ok(SessionKey::from(okm))
}
