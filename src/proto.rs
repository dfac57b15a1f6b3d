use crate::{Error, KeyPair, SessionHeader};
use prost::Message;
use std::collections::HashMap;
use zeroize::{Zeroize, Zeroizing};

/// Current at-rest schema version.
const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, PartialEq, Message)]
pub(crate) struct IdentityKeyPairProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Uncompressed SEC1 point.
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    /// Big-endian scalar.
    #[prost(bytes = "vec", tag = "3")]
    pub private_key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct SessionHeaderProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub ephemeral_pub: String,
    #[prost(uint32, optional, tag = "3")]
    pub signed_prekey_id: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub one_time_prekey_id: Option<u32>,
}

/// Whole-namespace snapshot written by the file backend.
#[derive(Clone, PartialEq, Message)]
pub(crate) struct StoreSnapshotProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(map = "string, bytes", tag = "2")]
    pub entries: HashMap<String, Vec<u8>>,
}

fn check_version(version: u32) -> Result<(), Error> {
    if version != SCHEMA_VERSION {
        return Err(Error::Storage(format!(
            "Unsupported schema version: {version}"
        )));
    }

    Ok(())
}

impl KeyPair {
    /// Serialize the key pair to Protocol Buffers format
    pub(crate) fn serialize(&self) -> Vec<u8> {
        let private_key = Zeroizing::new(self.secret().to_bytes());
        let proto = Zeroizing::new(IdentityKeyPairProto {
            version: SCHEMA_VERSION,
            public_key: self.public_key().to_bytes(),
            private_key: private_key.to_vec(),
        });

        proto.encode_to_vec()
    }

    /// Deserialize a key pair from Protocol Buffers format
    pub(crate) fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let proto = Zeroizing::new(IdentityKeyPairProto::decode(bytes)?);
        check_version(proto.version)?;

        Self::from_parts(&proto.public_key, &proto.private_key)
            .map_err(|err| Error::Storage(format!("Corrupt identity key pair: {err}")))
    }
}

impl Zeroize for IdentityKeyPairProto {
    fn zeroize(&mut self) {
        self.private_key.zeroize();
        self.public_key.zeroize();
    }
}

impl SessionHeader {
    /// Serialize the header to Protocol Buffers format
    pub(crate) fn serialize(&self) -> Vec<u8> {
        SessionHeaderProto {
            version: SCHEMA_VERSION,
            ephemeral_pub: self.ephemeral_pub.clone(),
            signed_prekey_id: self.signed_prekey_id,
            one_time_prekey_id: self.one_time_prekey_id,
        }
        .encode_to_vec()
    }

    /// Deserialize a header from Protocol Buffers format
    pub(crate) fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let proto = SessionHeaderProto::decode(bytes)?;
        check_version(proto.version)?;

        Ok(Self {
            ephemeral_pub: proto.ephemeral_pub,
            signed_prekey_id: proto.signed_prekey_id,
            one_time_prekey_id: proto.one_time_prekey_id,
        })
    }
}

impl StoreSnapshotProto {
    pub(crate) fn new(entries: HashMap<String, Vec<u8>>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            entries,
        }
    }

    pub(crate) fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let proto = Self::decode(bytes)?;
        check_version(proto.version)?;

        Ok(proto)
    }
}
