//! MQTT client contract and topic namespace.
//!
//! The security layer depends on a minimal publish/subscribe contract; a
//! real broker client (or the in-process [`LoopbackBroker`]) implements
//! it. Nothing in this crate speaks the MQTT wire protocol.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

use crate::rng::derive_rng;
use crate::settings::{
    SettingsStore, KEY_MQTT_HOST, KEY_MQTT_PASSWORD, KEY_MQTT_PORT, KEY_MQTT_TLS,
    KEY_MQTT_TRUST_SERVER, KEY_MQTT_USER,
};

pub const TOPIC_PAIRING: &str = "HardenMqtt/Pairing";
pub const TOPIC_EVENTS: &str = "HardenMqtt/Events";

pub fn topic_unstructured(device: &str, field: &str) -> String {
    format!("HardenMqtt/Unsecured/Unstructured/{device}/{field}")
}

pub fn topic_structured(device: &str) -> String {
    format!("HardenMqtt/Unsecured/Structured/{device}")
}

pub fn topic_interoperable(device: &str) -> String {
    format!("HardenMqtt/Unsecured/Interoperable/{device}")
}

pub fn topic_secured_public(public_base64: &str) -> String {
    format!("HardenMqtt/Secured/Public/{public_base64}")
}

pub fn topic_secured_confidential(public_base64: &str) -> String {
    format!("HardenMqtt/Secured/Confidential/{public_base64}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("not connected to the broker")]
    Disconnected,
}

/// Broker connection parameters, read from the settings store.
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub trust_server: bool,
}

impl ConnectOptions {
    pub fn from_settings(store: &dyn SettingsStore) -> Self {
        Self {
            host: store
                .get(KEY_MQTT_HOST)
                .unwrap_or_else(|| "localhost".into()),
            port: store
                .get(KEY_MQTT_PORT)
                .and_then(|p| p.parse().ok())
                .unwrap_or(1883),
            tls: store.get(KEY_MQTT_TLS).as_deref() == Some("true"),
            username: store.get(KEY_MQTT_USER),
            password: store.get(KEY_MQTT_PASSWORD),
            trust_server: store.get(KEY_MQTT_TRUST_SERVER).as_deref() == Some("true"),
        }
    }
}

/// The contract the security layer needs from any MQTT client.
///
/// Subscriptions deliver through a channel rather than a callback so the
/// consuming loop stays single-threaded and cancellable.
pub trait MqttClient: Send + Sync {
    fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: &[u8])
        -> Result<(), MqttError>;
    fn subscribe(&self, filter: &str) -> Result<Receiver<InboundMessage>, MqttError>;
    fn unsubscribe(&self, filter: &str) -> Result<(), MqttError>;
}

/// Publisher for the retained event-log topic. Failures are logged and
/// swallowed; the event log must never take a protocol loop down.
pub struct EventLog<'a> {
    client: &'a dyn MqttClient,
    device_id: String,
}

impl<'a> EventLog<'a> {
    pub fn new(client: &'a dyn MqttClient, device_id: impl Into<String>) -> Self {
        Self {
            client,
            device_id: device_id.into(),
        }
    }

    pub fn publish(&self, text: &str) {
        let line = format!("{}: {text}", self.device_id);
        if let Err(reason) = self
            .client
            .publish(TOPIC_EVENTS, Qos::AtMostOnce, true, line.as_bytes())
        {
            debug!("event log publish failed: {reason}");
        }
    }
}

/// MQTT topic filter matching: `+` is one level, `#` the (possibly empty)
/// remainder and only valid as the last segment.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return filter_parts.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    id: u64,
    client: u64,
    filter: String,
    sender: Sender<InboundMessage>,
}

struct BrokerState {
    retained: BTreeMap<String, Vec<u8>>,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    next_client: u64,
    loss_ratio: f64,
    loss_rng: ChaCha20Rng,
}

/// In-process message bus implementing the [`MqttClient`] contract for the
/// demo actors and the test suites. Retained messages follow MQTT
/// semantics: last writer wins, delivered on subscribe, cleared by an
/// empty retained publish.
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::with_loss(0.0, b"loopback")
    }

    /// A broker that drops each delivery with probability `ratio`,
    /// deterministically per `seed`. Retained replay on subscribe is
    /// never dropped; it models broker state, not a delivery.
    pub fn with_loss(ratio: f64, seed: &[u8]) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                retained: BTreeMap::new(),
                subscriptions: Vec::new(),
                next_subscription: 0,
                next_client: 0,
                loss_ratio: ratio.clamp(0.0, 1.0),
                loss_rng: derive_rng(seed),
            })),
        }
    }

    pub fn client(&self) -> LoopbackClient {
        let mut state = self.state.lock().expect("broker lock");
        let id = state.next_client;
        state.next_client += 1;
        LoopbackClient {
            state: Arc::clone(&self.state),
            id,
        }
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .expect("broker lock")
            .retained
            .get(topic)
            .cloned()
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackClient {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

impl MqttClient for LoopbackClient {
    fn publish(
        &self,
        topic: &str,
        _qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), MqttError> {
        let mut state = self.state.lock().expect("broker lock");
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.to_vec());
            }
        }
        trace!("publish {topic} ({} bytes, retain={retain})", payload.len());
        let loss_ratio = state.loss_ratio;
        let mut dead = Vec::new();
        // Split borrow: the RNG and the subscription list live in the
        // same guard.
        let state = &mut *state;
        for subscription in &state.subscriptions {
            if !topic_matches(&subscription.filter, topic) {
                continue;
            }
            if loss_ratio > 0.0 && state.loss_rng.gen::<f64>() < loss_ratio {
                debug!("loopback dropped delivery of {topic}");
                continue;
            }
            let message = InboundMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retained: false,
            };
            if subscription.sender.send(message).is_err() {
                dead.push(subscription.id);
            }
        }
        state
            .subscriptions
            .retain(|subscription| !dead.contains(&subscription.id));
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<Receiver<InboundMessage>, MqttError> {
        let (sender, receiver) = mpsc::channel();
        let mut state = self.state.lock().expect("broker lock");
        for (topic, payload) in &state.retained {
            if topic_matches(filter, topic) {
                let _ = sender.send(InboundMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retained: true,
                });
            }
        }
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscriptions.push(Subscription {
            id,
            client: self.id,
            filter: filter.to_string(),
            sender,
        });
        Ok(receiver)
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        let mut state = self.state.lock().expect("broker lock");
        state
            .subscriptions
            .retain(|subscription| !(subscription.client == self.id && subscription.filter == filter));
        Ok(())
    }
}
