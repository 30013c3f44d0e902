//! Long-lived device identity.
//!
//! One Ed25519 keypair per device, generated on first run and persisted in
//! the settings store. The public key doubles as an MQTT topic segment, so
//! it is always rendered Base64Url (no `/`, `+`, or `#`).
//!
//! The same keypair serves both signing and key agreement: the clamped
//! secret scalar maps onto X25519, and the Edwards public point converts
//! to its Montgomery form for the Diffie-Hellman side.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use log::info;
use rand_core::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::SecurityError;
use crate::rng::secure_rng;
use crate::settings::{
    SettingsStore, KEY_DEVICE_ID, KEY_PAIR_ID, KEY_PAIR_PUBLIC, KEY_SECRET_SCALAR,
};

pub const PUBLIC_KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;

pub fn encode_b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode_b64url(text: &str) -> Result<Vec<u8>, SecurityError> {
    Ok(URL_SAFE_NO_PAD.decode(text)?)
}

/// A device's long-lived cryptographic identity.
pub struct DeviceIdentity {
    signing: SigningKey,
    device_id: String,
    device_type: String,
}

impl DeviceIdentity {
    /// Loads the identity from `store`, generating and persisting a fresh
    /// keypair on first run. `default_id` seeds `Device.ID` when absent.
    pub fn load_or_create(
        store: &dyn SettingsStore,
        default_id: &str,
        device_type: &str,
    ) -> Result<Self, SecurityError> {
        let device_id = match store.get(KEY_DEVICE_ID) {
            Some(id) => id,
            None => {
                store.set(KEY_DEVICE_ID, default_id)?;
                default_id.to_string()
            }
        };
        let signing = match store.get(KEY_SECRET_SCALAR) {
            Some(encoded) => {
                let bytes = Zeroizing::new(decode_b64url(&encoded)?);
                let scalar: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| SecurityError::InvalidKey)?;
                SigningKey::from_bytes(&scalar)
            }
            None => {
                let mut scalar = Zeroizing::new([0u8; 32]);
                secure_rng().fill_bytes(&mut *scalar);
                let signing = SigningKey::from_bytes(&scalar);
                store.set(KEY_SECRET_SCALAR, &encode_b64url(scalar.as_ref()))?;
                info!("generated new Ed25519 identity for {device_id}");
                signing
            }
        };
        Ok(Self {
            signing,
            device_id,
            device_type: device_type.to_string(),
        })
    }

    /// Builds an identity from raw scalar bytes. Test and bench helper.
    pub fn from_scalar(scalar: [u8; 32], device_id: &str, device_type: &str) -> Self {
        Self {
            signing: SigningKey::from_bytes(&scalar),
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Base64Url rendering of the public key, safe as a topic segment.
    pub fn public_base64(&self) -> String {
        encode_b64url(self.public_key().as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// X25519 Diffie-Hellman against a peer's Edwards public key, followed
    /// by no derivation; callers feed the 32 shared bytes into their KDF.
    ///
    /// Rejects peer points that do not decompress and exchanges that land
    /// on the identity element (ill-formed or low-order keys).
    pub fn agree(&self, peer: &VerifyingKey) -> Result<Zeroizing<[u8; 32]>, SecurityError> {
        let secret = StaticSecret::from(self.signing.to_scalar_bytes());
        let montgomery = CompressedEdwardsY::from_slice(peer.as_bytes())
            .map_err(|_| SecurityError::InvalidKey)?
            .decompress()
            .ok_or(SecurityError::InvalidKey)?
            .to_montgomery();
        let shared = secret.diffie_hellman(&X25519PublicKey::from(montgomery.to_bytes()));
        if !shared.was_contributory() {
            return Err(SecurityError::InvalidKey);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

/// Parses a Base64Url-encoded Ed25519 public key.
pub fn parse_public_key(encoded: &str) -> Result<VerifyingKey, SecurityError> {
    let bytes = decode_b64url(encoded)?;
    let bytes: [u8; PUBLIC_KEY_BYTES] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SecurityError::InvalidKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| SecurityError::InvalidKey)
}

/// Parses a Base64Url-encoded Ed25519 signature.
pub fn parse_signature(encoded: &str) -> Result<Signature, SecurityError> {
    if encoded.len() > crate::error::MAX_SIGNATURE_CHARS {
        return Err(SecurityError::FieldTooLong("signature"));
    }
    let bytes = decode_b64url(encoded)?;
    let bytes: [u8; SIGNATURE_BYTES] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SecurityError::BadSignature)?;
    Ok(Signature::from_bytes(&bytes))
}

/// The outcome of pairing: the peer's identity, by value.
///
/// Presence in the settings store means "paired"; absence triggers the
/// pairing engine on startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerBinding {
    pub public_key: VerifyingKey,
    pub device_id: String,
}

impl PeerBinding {
    pub fn public_base64(&self) -> String {
        encode_b64url(self.public_key.as_bytes())
    }

    pub fn load(store: &dyn SettingsStore) -> Result<Option<Self>, SecurityError> {
        let (encoded, device_id) = match (store.get(KEY_PAIR_PUBLIC), store.get(KEY_PAIR_ID)) {
            (Some(key), Some(id)) => (key, id),
            _ => return Ok(None),
        };
        Ok(Some(Self {
            public_key: parse_public_key(&encoded)?,
            device_id,
        }))
    }

    /// Idempotent: re-persisting an identical binding leaves the store
    /// contents unchanged.
    pub fn persist(&self, store: &dyn SettingsStore) -> Result<(), SecurityError> {
        store.set(KEY_PAIR_PUBLIC, &self.public_base64())?;
        store.set(KEY_PAIR_ID, &self.device_id)?;
        Ok(())
    }
}
