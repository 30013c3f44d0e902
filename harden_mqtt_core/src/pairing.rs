//! Broker-mediated pairing of two device identities.
//!
//! Both parties publish full snapshots of a shared [`PairingRecord`] on a
//! single topic and republish on a timer, so lost or reordered deliveries
//! cost nothing: every snapshot is self-describing and signed. The master
//! picks a slave from the candidates it observes; the slave countersigns
//! once it sees itself selected. The first record with both signatures is
//! the authoritative binding.
//!
//! Everything malformed, oversized, mistyped, or mis-signed is dropped
//! silently; the republish timer keeps the session alive until the
//! cancellation token fires.

use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::cancel::CancellationToken;
use crate::error::{SecurityError, MAX_CANDIDATE_CHARS, MAX_PAIRING_BYTES};
use crate::identity::{encode_b64url, parse_public_key, parse_signature, DeviceIdentity, PeerBinding};
use crate::mqtt::{MqttClient, Qos, TOPIC_PAIRING};

/// Broker-visible snapshot of a pairing session. All fields are strings;
/// absent means "not yet contributed".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PairingRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_signature: Option<String>,
}

/// Wire shape: unknown keys are rejected, but peers are allowed to echo
/// the derived predicates, which are stripped on arrival.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct PairingRecordWire {
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    master_public_key: Option<String>,
    #[serde(default)]
    master_id: Option<String>,
    #[serde(default)]
    master_type: Option<String>,
    #[serde(default)]
    master_signature: Option<String>,
    #[serde(default)]
    slave_public_key: Option<String>,
    #[serde(default)]
    slave_id: Option<String>,
    #[serde(default)]
    slave_type: Option<String>,
    #[serde(default)]
    slave_signature: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    completed: Option<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    master_completed: Option<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    slave_completed: Option<serde_json::Value>,
}

impl PairingRecord {
    pub fn master_completed(&self) -> bool {
        has(&self.master_public_key)
            && has(&self.master_id)
            && has(&self.master_type)
            && has(&self.master_signature)
    }

    pub fn slave_completed(&self) -> bool {
        has(&self.slave_public_key)
            && has(&self.slave_id)
            && has(&self.slave_type)
            && has(&self.slave_signature)
    }

    pub fn completed(&self) -> bool {
        self.master_completed() && self.slave_completed()
    }

    /// The signable bytes: the seven identity-bearing fields, pipe-joined
    /// in fixed order, absent fields as empty strings. Signatures and the
    /// derived predicates never contribute.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let parts = [
            self.nonce.as_deref().unwrap_or(""),
            self.master_public_key.as_deref().unwrap_or(""),
            self.master_id.as_deref().unwrap_or(""),
            self.master_type.as_deref().unwrap_or(""),
            self.slave_public_key.as_deref().unwrap_or(""),
            self.slave_id.as_deref().unwrap_or(""),
            self.slave_type.as_deref().unwrap_or(""),
        ];
        parts.join("|").into_bytes()
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("record serialization")
    }
}

fn has(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|value| !value.is_empty())
}

/// Parses an inbound pairing payload, applying every structural and
/// cryptographic guard. Anything that fails here is dropped by the caller.
pub fn parse_record(
    payload: &[u8],
    expected_master_type: &str,
    expected_slave_type: &str,
) -> Result<PairingRecord, SecurityError> {
    SecurityError::check_size(payload, MAX_PAIRING_BYTES)?;
    let wire: PairingRecordWire = serde_json::from_slice(payload)?;
    let record = PairingRecord {
        nonce: wire.nonce,
        master_public_key: wire.master_public_key,
        master_id: wire.master_id,
        master_type: wire.master_type,
        master_signature: wire.master_signature,
        slave_public_key: wire.slave_public_key,
        slave_id: wire.slave_id,
        slave_type: wire.slave_type,
        slave_signature: wire.slave_signature,
    };
    for (field, name) in [
        (&record.master_public_key, "master public key"),
        (&record.master_id, "master id"),
        (&record.slave_public_key, "slave public key"),
        (&record.slave_id, "slave id"),
    ] {
        if field.as_deref().map_or(0, str::len) > MAX_CANDIDATE_CHARS {
            return Err(SecurityError::FieldTooLong(name));
        }
    }
    if let Some(master_type) = record.master_type.as_deref() {
        if master_type != expected_master_type {
            return Err(SecurityError::RoleMismatch("master"));
        }
    }
    if let Some(slave_type) = record.slave_type.as_deref() {
        if slave_type != expected_slave_type {
            return Err(SecurityError::RoleMismatch("slave"));
        }
    }
    let canonical = record.canonical_bytes();
    if let Some(signature) = record.master_signature.as_deref() {
        let key = record
            .master_public_key
            .as_deref()
            .ok_or(SecurityError::BadSignature)?;
        verify_field_signature(key, signature, &canonical)?;
    }
    if let Some(signature) = record.slave_signature.as_deref() {
        let key = record
            .slave_public_key
            .as_deref()
            .ok_or(SecurityError::BadSignature)?;
        verify_field_signature(key, signature, &canonical)?;
    }
    Ok(record)
}

fn verify_field_signature(
    key: &str,
    signature: &str,
    canonical: &[u8],
) -> Result<(), SecurityError> {
    let key = parse_public_key(key)?;
    let signature = parse_signature(signature)?;
    key.verify_strict(canonical, &signature)
        .map_err(|_| SecurityError::BadSignature)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingRole {
    Master,
    Slave,
}

#[derive(Debug)]
pub enum PairingOutcome {
    Paired(PeerBinding),
    Cancelled,
}

/// A slave observed by the master, validated and deduplicated by key.
#[derive(Clone, Debug)]
pub struct SlaveCandidate {
    pub public_base64: String,
    pub device_id: String,
    pub key: VerifyingKey,
}

/// Seam for the master's "pick a slave" step. Runs on a dedicated thread
/// so republishing continues behind a blocking prompt; the engine polls
/// the result every 100 ms.
pub trait SlaveSelector: Send + Sync {
    /// Returns the chosen index into `candidates`, or `None` if selection
    /// was abandoned (cancellation).
    fn choose(
        &self,
        candidates: &Mutex<Vec<SlaveCandidate>>,
        cancel: &CancellationToken,
    ) -> Option<usize>;
}

/// Picks the n-th candidate (1-based, matching the enumerated console
/// list), waiting until that many candidates exist.
pub struct IndexSelector(pub usize);

impl SlaveSelector for IndexSelector {
    fn choose(
        &self,
        candidates: &Mutex<Vec<SlaveCandidate>>,
        cancel: &CancellationToken,
    ) -> Option<usize> {
        let wanted = self.0.max(1);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if candidates.lock().expect("candidate lock").len() >= wanted {
                return Some(wanted - 1);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

pub struct PairingEngine<'a> {
    client: &'a dyn MqttClient,
    identity: &'a DeviceIdentity,
    remote_type: String,
    first_delay: Duration,
    republish: Duration,
    poll: Duration,
}

impl<'a> PairingEngine<'a> {
    pub fn new(
        client: &'a dyn MqttClient,
        identity: &'a DeviceIdentity,
        remote_type: impl Into<String>,
    ) -> Self {
        Self {
            client,
            identity,
            remote_type: remote_type.into(),
            first_delay: Duration::from_secs(1),
            republish: Duration::from_secs(5),
            poll: Duration::from_millis(100),
        }
    }

    /// Overrides the republish cadence; tests run the protocol at
    /// millisecond scale.
    pub fn with_timing(mut self, first_delay: Duration, republish: Duration, poll: Duration) -> Self {
        self.first_delay = first_delay;
        self.republish = republish;
        self.poll = poll;
        self
    }

    fn expected_types(&self, role: PairingRole) -> (String, String) {
        match role {
            PairingRole::Master => (
                self.identity.device_type().to_string(),
                self.remote_type.clone(),
            ),
            PairingRole::Slave => (
                self.remote_type.clone(),
                self.identity.device_type().to_string(),
            ),
        }
    }

    /// Runs the handshake until a binding is established or the token
    /// fires. The returned binding is not persisted; callers decide.
    pub fn pair(
        &self,
        nonce: &[u8],
        role: PairingRole,
        selector: Arc<dyn SlaveSelector>,
        cancel: &CancellationToken,
    ) -> Result<PairingOutcome, SecurityError> {
        match role {
            PairingRole::Master => self.run_master(nonce, selector, cancel),
            PairingRole::Slave => self.run_slave(cancel),
        }
    }

    fn sign_record(&self, record: &mut PairingRecord, role: PairingRole) {
        let signature = encode_b64url(&self.identity.sign(&record.canonical_bytes()).to_bytes());
        match role {
            PairingRole::Master => record.master_signature = Some(signature),
            PairingRole::Slave => record.slave_signature = Some(signature),
        }
    }

    fn publish_record(&self, record: &PairingRecord) -> Result<(), SecurityError> {
        self.client
            .publish(TOPIC_PAIRING, Qos::AtMostOnce, false, &record.to_json())?;
        Ok(())
    }

    fn run_master(
        &self,
        nonce: &[u8],
        selector: Arc<dyn SlaveSelector>,
        cancel: &CancellationToken,
    ) -> Result<PairingOutcome, SecurityError> {
        let (expected_master_type, expected_slave_type) =
            self.expected_types(PairingRole::Master);
        let inbox = self.client.subscribe(TOPIC_PAIRING)?;
        let local_key = self.identity.public_base64();

        // Both role types are recorded from the start so each side can
        // filter foreign sessions before any signature work.
        let mut record = PairingRecord {
            nonce: Some(encode_b64url(nonce)),
            master_public_key: Some(local_key.clone()),
            master_id: Some(self.identity.device_id().to_string()),
            master_type: Some(expected_master_type.clone()),
            slave_type: Some(expected_slave_type.clone()),
            ..PairingRecord::default()
        };
        self.sign_record(&mut record, PairingRole::Master);

        let candidates: Arc<Mutex<Vec<SlaveCandidate>>> = Arc::new(Mutex::new(Vec::new()));
        let selection: Arc<Mutex<Option<Option<usize>>>> = Arc::new(Mutex::new(None));
        let mut selector_running = false;
        let mut selected = false;
        let mut next_publish = Instant::now() + self.first_delay;

        loop {
            if cancel.is_cancelled() {
                return Ok(PairingOutcome::Cancelled);
            }
            if Instant::now() >= next_publish {
                self.publish_record(&record)?;
                next_publish = Instant::now() + self.republish;
            }

            match inbox.recv_timeout(self.poll) {
                Ok(message) => {
                    let inbound = match parse_record(
                        &message.payload,
                        &expected_master_type,
                        &expected_slave_type,
                    ) {
                        Ok(inbound) => inbound,
                        Err(reason) => {
                            debug!("dropping pairing record: {reason}");
                            continue;
                        }
                    };
                    if inbound.master_public_key.is_some() {
                        // Records carrying a master belong to this pairing
                        // only once we have selected and they complete.
                        if selected
                            && inbound.completed()
                            && key_equals(inbound.master_public_key.as_deref(), &local_key)
                        {
                            if let Some(binding) = binding_from_slave_side(&inbound) {
                                // Final confirmation snapshot; replaying
                                // the completed record is idempotent and
                                // gives a lossy bus one more chance to
                                // show it to the slave.
                                self.publish_record(&inbound)?;
                                info!(
                                    "paired with {} as master",
                                    binding.device_id
                                );
                                return Ok(PairingOutcome::Paired(binding));
                            }
                        }
                        continue;
                    }
                    if selected {
                        continue;
                    }
                    self.collect_candidate(&inbound, &candidates);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(crate::mqtt::MqttError::Disconnected.into())
                }
            }

            if !selector_running && !candidates.lock().expect("candidate lock").is_empty() {
                selector_running = true;
                let selector = Arc::clone(&selector);
                let candidates = Arc::clone(&candidates);
                let selection = Arc::clone(&selection);
                let cancel = cancel.clone();
                thread::spawn(move || {
                    let choice = selector.choose(&candidates, &cancel);
                    *selection.lock().expect("selection lock") = Some(choice);
                });
            }

            if !selected {
                let choice = selection.lock().expect("selection lock").take();
                if let Some(choice) = choice {
                    let Some(index) = choice else {
                        return Ok(PairingOutcome::Cancelled);
                    };
                    let candidate = {
                        let candidates = candidates.lock().expect("candidate lock");
                        candidates.get(index).cloned()
                    };
                    if let Some(candidate) = candidate {
                        record.slave_public_key = Some(candidate.public_base64.clone());
                        record.slave_id = Some(candidate.device_id.clone());
                        // The signable bytes changed; the old master
                        // signature and any slave signature are void.
                        record.slave_signature = None;
                        self.sign_record(&mut record, PairingRole::Master);
                        self.publish_record(&record)?;
                        next_publish = Instant::now() + self.republish;
                        selected = true;
                        info!("selected slave {}", candidate.device_id);
                    }
                }
            }
        }
    }

    fn collect_candidate(
        &self,
        inbound: &PairingRecord,
        candidates: &Mutex<Vec<SlaveCandidate>>,
    ) {
        let (Some(public_base64), Some(device_id)) = (
            inbound.slave_public_key.as_deref(),
            inbound.slave_id.as_deref(),
        ) else {
            return;
        };
        if public_base64.is_empty() || device_id.is_empty() {
            return;
        }
        let key = match parse_public_key(public_base64) {
            Ok(key) => key,
            Err(reason) => {
                debug!("rejecting candidate key: {reason}");
                return;
            }
        };
        // A key we cannot agree with is useless for the secured channel.
        if let Err(reason) = self.identity.agree(&key) {
            debug!("rejecting non-contributory candidate: {reason}");
            return;
        }
        let mut candidates = candidates.lock().expect("candidate lock");
        if candidates
            .iter()
            .any(|candidate| candidate.public_base64 == public_base64)
        {
            return;
        }
        info!("pairing candidate {} ({device_id})", candidates.len() + 1);
        candidates.push(SlaveCandidate {
            public_base64: public_base64.to_string(),
            device_id: device_id.to_string(),
            key,
        });
    }

    fn run_slave(&self, cancel: &CancellationToken) -> Result<PairingOutcome, SecurityError> {
        let (expected_master_type, expected_slave_type) = self.expected_types(PairingRole::Slave);
        let inbox = self.client.subscribe(TOPIC_PAIRING)?;
        let local_key = self.identity.public_base64();

        let mut announcement = PairingRecord {
            slave_public_key: Some(local_key.clone()),
            slave_id: Some(self.identity.device_id().to_string()),
            slave_type: Some(expected_slave_type.clone()),
            ..PairingRecord::default()
        };
        self.sign_record(&mut announcement, PairingRole::Slave);
        let mut next_publish = Instant::now() + self.first_delay;
        // Once completion is observed the slave keeps serving for a short
        // linger window: a master whose copy of the countersignature was
        // lost keeps republishing its proposal, and every proposal resets
        // the window.
        let linger = self.republish * 2;
        let mut outcome: Option<(PeerBinding, Instant)> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(PairingOutcome::Cancelled);
            }
            if let Some((binding, deadline)) = &outcome {
                if Instant::now() >= *deadline {
                    info!("paired with {} as slave", binding.device_id);
                    return Ok(PairingOutcome::Paired(binding.clone()));
                }
            }
            if Instant::now() >= next_publish {
                self.publish_record(&announcement)?;
                next_publish = Instant::now() + self.republish;
            }

            let message = match inbox.recv_timeout(self.poll) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(crate::mqtt::MqttError::Disconnected.into())
                }
            };
            let mut inbound = match parse_record(
                &message.payload,
                &expected_master_type,
                &expected_slave_type,
            ) {
                Ok(inbound) => inbound,
                Err(reason) => {
                    debug!("dropping pairing record: {reason}");
                    continue;
                }
            };
            if inbound.slave_id.as_deref() != Some(self.identity.device_id())
                || !key_equals(inbound.slave_public_key.as_deref(), &local_key)
            {
                continue;
            }
            // The first fully signed record naming this device is the
            // authoritative binding (usually our own countersignature
            // echoed back by the broker).
            if inbound.completed() {
                if outcome.is_none() {
                    let Some(binding) = binding_from_master_side(&inbound) else {
                        continue;
                    };
                    outcome = Some((binding, Instant::now() + linger));
                }
                continue;
            }
            // "I was selected": a master-complete record naming this
            // device, not yet countersigned. Countersign every time it
            // arrives; the master republishes until it sees completion.
            if !inbound.master_completed() || inbound.slave_completed() {
                continue;
            }
            self.sign_record(&mut inbound, PairingRole::Slave);
            self.publish_record(&inbound)?;
            // Republish the completed snapshot from now on so a lost
            // countersignature does not strand the master, and keep the
            // linger window open while the master is still proposing.
            announcement = inbound;
            next_publish = Instant::now() + self.republish;
            if let Some((_, deadline)) = &mut outcome {
                *deadline = Instant::now() + linger;
            }
        }
    }
}

fn key_equals(field: Option<&str>, local: &str) -> bool {
    match field {
        Some(value) => bool::from(value.as_bytes().ct_eq(local.as_bytes())),
        None => false,
    }
}

fn binding_from_slave_side(record: &PairingRecord) -> Option<PeerBinding> {
    let key = parse_public_key(record.slave_public_key.as_deref()?).ok()?;
    Some(PeerBinding {
        public_key: key,
        device_id: record.slave_id.clone()?,
    })
}

fn binding_from_master_side(record: &PairingRecord) -> Option<PeerBinding> {
    let key = parse_public_key(record.master_public_key.as_deref()?).ok()?;
    Some(PeerBinding {
        public_key: key,
        device_id: record.master_id.clone()?,
    })
}
