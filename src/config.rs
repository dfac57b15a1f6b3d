/// Tunables for the session manager and conversation adapter.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Name sent to the key directory when registering this device.
    pub device_name: String,
    /// Key id under which the signed pre-key is published.
    pub signed_prekey_id: u32,
    /// Number of one-time pre-keys published in the initial batch.
    pub one_time_prekey_count: u32,
    /// HKDF context string mixed into every session key.
    pub hkdf_info: Vec<u8>,
    /// Identity keys that peers' bundles must never carry.
    pub placeholder_identity_keys: Vec<String>,
    /// `message_type` attached to outbound frames.
    pub message_type: String,
    /// Content shown in place of a message that fails to decrypt.
    pub undecryptable_placeholder: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: "web".to_string(),
            signed_prekey_id: 1,
            one_time_prekey_count: 5,
            hkdf_info: b"connectio-e2ee-session".to_vec(),
            placeholder_identity_keys: vec!["string".to_string()],
            message_type: "text".to_string(),
            undecryptable_placeholder: "[Unable to decrypt]".to_string(),
        }
    }
}
