//! Secured telemetry: signing, key agreement, and confidential framing.
//!
//! The publish side escalates one reading through five representations;
//! the receive side is the strict mirror. Authentication always comes
//! from the Ed25519 signature nested inside the payload; the symmetric
//! layer on the confidential namespace adds confidentiality only.
//!
//! Key derivation is fixed: X25519 agreement between the local secret
//! scalar and the peer's converted Edwards point, then SHA3-256 over the
//! 32 shared bytes yields the AES-256 key. Frames are
//! `IV(16) ‖ Nonce(16) ‖ AES-256-CBC/PKCS#7 ciphertext`; the nonce never
//! enters the cipher, it only makes identical plaintexts produce distinct
//! frames on the wire.

use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ed25519_dalek::VerifyingKey;
use log::debug;
use rand_core::RngCore;
use sha3::{Digest, Sha3_256};
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::error::{SecurityError, MAX_PAYLOAD_BYTES};
use crate::fields::{FieldType, FieldValue, InteroperableField, SIGNATURE_FIELD};
use crate::identity::{encode_b64url, parse_signature, DeviceIdentity, PeerBinding};
use crate::interop::{parse_payload, render_payload};
use crate::mqtt::{
    topic_interoperable, topic_secured_confidential, topic_secured_public, topic_structured,
    topic_unstructured, MqttClient, Qos,
};
use crate::reading::SensorReading;
use crate::rng::secure_rng;

pub const IV_BYTES: usize = 16;
pub const NONCE_BYTES: usize = 16;
pub const FRAME_HEADER_BYTES: usize = IV_BYTES + NONCE_BYTES;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// SHA3-256 over the raw X25519 shared secret. Both endpoints must use
/// this exact derivation for the confidential namespace to line up.
pub fn derive_channel_key(
    local: &DeviceIdentity,
    peer: &VerifyingKey,
) -> Result<Zeroizing<[u8; 32]>, SecurityError> {
    let shared = local.agree(peer)?;
    let digest = Sha3_256::digest(shared.as_ref());
    Ok(Zeroizing::new(digest.into()))
}

/// Signs a field sequence: renders the canonical payload, signs the
/// bytes, and re-renders with the Signature field appended (Computed,
/// stamped `signed_at`). The reserved field name must not appear in the
/// input.
pub fn sign_fields_at(
    fields: &[InteroperableField],
    identity: &DeviceIdentity,
    signed_at: OffsetDateTime,
) -> Result<Vec<u8>, SecurityError> {
    if fields.iter().any(InteroperableField::is_signature) {
        return Err(SecurityError::Value("reserved Signature field"));
    }
    let unsigned = render_payload(fields);
    let signature = identity.sign(&unsigned);
    let thing = fields
        .first()
        .map(|field| field.thing.clone())
        .unwrap_or_else(|| identity.device_id().to_string());
    let mut signed = fields.to_vec();
    signed.push(InteroperableField::new(
        thing,
        signed_at,
        SIGNATURE_FIELD,
        FieldValue::String(encode_b64url(&signature.to_bytes())),
        FieldType::Computed,
    ));
    Ok(render_payload(&signed))
}

pub fn sign_fields(
    fields: &[InteroperableField],
    identity: &DeviceIdentity,
) -> Result<Vec<u8>, SecurityError> {
    sign_fields_at(fields, identity, OffsetDateTime::now_utc())
}

/// Verifies a signed payload against the peer's key and returns the field
/// sequence with the Signature field stripped. Exactly one Signature
/// field must be present.
pub fn verify_signed_payload(
    payload: &[u8],
    peer: &VerifyingKey,
) -> Result<Vec<InteroperableField>, SecurityError> {
    let mut fields = parse_payload(payload)?;
    let signature_count = fields
        .iter()
        .filter(|field| field.is_signature())
        .count();
    if signature_count != 1 {
        return Err(SecurityError::SignatureCount(signature_count));
    }
    let position = fields
        .iter()
        .position(InteroperableField::is_signature)
        .expect("counted above");
    let signature_field = fields.remove(position);
    let FieldValue::String(encoded) = &signature_field.value else {
        return Err(SecurityError::Value("signature value"));
    };
    let signature = parse_signature(encoded)?;
    let canonical = render_payload(&fields);
    peer.verify_strict(&canonical, &signature)
        .map_err(|_| SecurityError::BadSignature)?;
    Ok(fields)
}

/// Encrypts `plaintext` into a frame under `key` with fresh IV and nonce.
pub fn encrypt_frame(plaintext: &[u8], key: &[u8; 32]) -> Vec<u8> {
    let mut iv = [0u8; IV_BYTES];
    let mut nonce = [0u8; NONCE_BYTES];
    secure_rng().fill_bytes(&mut iv);
    secure_rng().fill_bytes(&mut nonce);
    encrypt_frame_with(plaintext, key, &iv, &nonce)
}

/// Deterministic frame construction; tests pin IV and nonce.
pub fn encrypt_frame_with(
    plaintext: &[u8],
    key: &[u8; 32],
    iv: &[u8; IV_BYTES],
    nonce: &[u8; NONCE_BYTES],
) -> Vec<u8> {
    let ciphertext =
        Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + ciphertext.len());
    frame.extend_from_slice(iv);
    frame.extend_from_slice(nonce);
    frame.extend_from_slice(&ciphertext);
    frame
}

/// Splits and decrypts a frame. The nonce half is public entropy and is
/// discarded; tampering anywhere surfaces as a padding or signature
/// failure downstream.
pub fn decrypt_frame(frame: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, SecurityError> {
    SecurityError::check_size(frame, MAX_PAYLOAD_BYTES)?;
    if frame.len() <= FRAME_HEADER_BYTES {
        return Err(SecurityError::FrameTooShort(frame.len()));
    }
    let iv: [u8; IV_BYTES] = frame[..IV_BYTES].try_into().expect("sized split");
    let ciphertext = &frame[FRAME_HEADER_BYTES..];
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(SecurityError::BadCiphertext);
    }
    Aes256CbcDec::new(key.into(), (&iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| SecurityError::BadCiphertext)
}

/// Decrypts a confidential frame and verifies the signed payload inside.
pub fn decrypt_and_verify(
    frame: &[u8],
    local: &DeviceIdentity,
    peer: &VerifyingKey,
) -> Result<Vec<InteroperableField>, SecurityError> {
    let key = derive_channel_key(local, peer)?;
    let plaintext = decrypt_frame(frame, &key)?;
    verify_signed_payload(&plaintext, peer)
}

/// Publisher for the five telemetry namespaces.
pub struct SecureTelemetry<'a> {
    client: &'a dyn MqttClient,
    identity: &'a DeviceIdentity,
    binding: Option<PeerBinding>,
}

impl<'a> SecureTelemetry<'a> {
    pub fn new(
        client: &'a dyn MqttClient,
        identity: &'a DeviceIdentity,
        binding: Option<PeerBinding>,
    ) -> Self {
        Self {
            client,
            identity,
            binding,
        }
    }

    pub fn binding(&self) -> Option<&PeerBinding> {
        self.binding.as_ref()
    }

    /// Publishes one reading in all five escalating representations.
    /// Everything is retained at QoS 0; the confidential namespace is
    /// skipped when no peer binding exists.
    pub fn publish_reading(&self, reading: &SensorReading) -> Result<(), SecurityError> {
        let device = self.identity.device_id();
        for (name, value) in reading.unstructured_fields() {
            self.client.publish(
                &topic_unstructured(device, name),
                Qos::AtMostOnce,
                true,
                value.as_bytes(),
            )?;
        }
        self.client.publish(
            &topic_structured(device),
            Qos::AtMostOnce,
            true,
            &serde_json::to_vec(reading)?,
        )?;
        let fields = reading.interoperable_fields();
        self.client.publish(
            &topic_interoperable(device),
            Qos::AtMostOnce,
            true,
            &render_payload(&fields),
        )?;
        let signed = sign_fields(&fields, self.identity)?;
        self.client.publish(
            &topic_secured_public(&self.identity.public_base64()),
            Qos::AtMostOnce,
            true,
            &signed,
        )?;
        if let Some(binding) = &self.binding {
            let key = derive_channel_key(self.identity, &binding.public_key)?;
            let frame = encrypt_frame(&signed, &key);
            self.client.publish(
                &topic_secured_confidential(&self.identity.public_base64()),
                Qos::AtMostOnce,
                true,
                &frame,
            )?;
        } else {
            debug!("no peer binding; confidential namespace skipped");
        }
        Ok(())
    }

    /// Verifies a payload from the peer's public namespace.
    pub fn receive_public(&self, payload: &[u8]) -> Result<Vec<InteroperableField>, SecurityError> {
        let binding = self.binding.as_ref().ok_or(SecurityError::InvalidKey)?;
        verify_signed_payload(payload, &binding.public_key)
    }

    /// Decrypts and verifies a frame from the peer's confidential
    /// namespace.
    pub fn receive_confidential(
        &self,
        frame: &[u8],
    ) -> Result<Vec<InteroperableField>, SecurityError> {
        let binding = self.binding.as_ref().ok_or(SecurityError::InvalidKey)?;
        decrypt_and_verify(frame, self.identity, &binding.public_key)
    }
}
