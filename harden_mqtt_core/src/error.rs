use thiserror::Error;

/// Largest payload the secure receive path will hand to the XML parser.
pub const MAX_PAYLOAD_BYTES: usize = 65_536;

/// Largest pairing record accepted off the wire.
pub const MAX_PAIRING_BYTES: usize = 1_000;

/// Longest Base64Url signature accepted in a payload or pairing record.
pub const MAX_SIGNATURE_CHARS: usize = 100;

/// Longest public key / device id accepted in a pairing candidate.
pub const MAX_CANDIDATE_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("payload of {len} bytes exceeds the {limit} byte limit")]
    Oversize { len: usize, limit: usize },

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed UTF-8 payload")]
    Utf8,

    #[error("malformed base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("malformed {0} value")]
    Value(&'static str),

    #[error("pairing record field '{0}' exceeds the length cap")]
    FieldTooLong(&'static str),

    #[error("key bytes do not form a usable curve point")]
    InvalidKey,

    #[error("signature verification failed")]
    BadSignature,

    #[error("expected exactly one Signature field, found {0}")]
    SignatureCount(usize),

    #[error("declared {0} role does not match the expected device type")]
    RoleMismatch(&'static str),

    #[error("encrypted frame too short ({0} bytes)")]
    FrameTooShort(usize),

    #[error("ciphertext rejected")]
    BadCiphertext,

    #[error("settings store unavailable: {0}")]
    Store(String),

    #[error("broker error: {0}")]
    Mqtt(#[from] crate::mqtt::MqttError),
}

impl SecurityError {
    /// Guard used by every receive path before any parsing happens.
    pub fn check_size(payload: &[u8], limit: usize) -> Result<(), SecurityError> {
        if payload.len() > limit {
            return Err(SecurityError::Oversize {
                len: payload.len(),
                limit,
            });
        }
        Ok(())
    }
}
