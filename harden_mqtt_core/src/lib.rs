//! End-to-end security layer for telemetry over a shared MQTT broker.
//!
//! Two devices discover each other on a public bus, bind their Ed25519
//! identities through a broker-mediated pairing handshake, and exchange
//! readings in five escalating representations up to signed and encrypted
//! XML. A third, adversarial actor republishes perturbed variants of
//! everything it sees to stress the receive paths.
//!
//! The crate depends on the MQTT client *contract* only; the bundled
//! loopback bus implements it for demos and tests.

pub mod cache;
pub mod cancel;
pub mod dispatch;
pub mod error;
pub mod fields;
pub mod identity;
pub mod interop;
pub mod mqtt;
pub mod pairing;
pub mod reading;
pub mod rng;
pub mod secure;
pub mod settings;
pub mod troll;

pub use crate::cache::{message_digest, DigestCache};
pub use crate::cancel::CancellationToken;
pub use crate::dispatch::{route, Dispatcher, DisplayHandler, RowTracker, TopicRoute};
pub use crate::error::{
    SecurityError, MAX_CANDIDATE_CHARS, MAX_PAIRING_BYTES, MAX_PAYLOAD_BYTES, MAX_SIGNATURE_CHARS,
};
pub use crate::fields::{
    FieldType, FieldValue, InteroperableField, IsoDuration, QOS_AUTOMATIC_READOUT, SIGNATURE_FIELD,
};
pub use crate::identity::{
    decode_b64url, encode_b64url, parse_public_key, parse_signature, DeviceIdentity, PeerBinding,
};
pub use crate::interop::{parse_payload, render_payload, SENSOR_DATA_NS};
pub use crate::mqtt::{
    topic_interoperable, topic_matches, topic_secured_confidential, topic_secured_public,
    topic_structured, topic_unstructured, ConnectOptions, EventLog, InboundMessage, LoopbackBroker,
    LoopbackClient, MqttClient, MqttError, Qos, TOPIC_EVENTS, TOPIC_PAIRING,
};
pub use crate::pairing::{
    parse_record, IndexSelector, PairingEngine, PairingOutcome, PairingRecord, PairingRole,
    SlaveCandidate, SlaveSelector,
};
pub use crate::reading::SensorReading;
pub use crate::secure::{
    decrypt_and_verify, decrypt_frame, derive_channel_key, encrypt_frame, encrypt_frame_with,
    sign_fields, sign_fields_at, verify_signed_payload, SecureTelemetry, FRAME_HEADER_BYTES,
};
pub use crate::settings::{FileSettings, MemorySettings, SettingsStore};
pub use crate::troll::{classify, large_blob_len, PayloadClass, Republication, TrollMutator};
