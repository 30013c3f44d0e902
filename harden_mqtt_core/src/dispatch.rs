//! Receiver-side topic demultiplexer.
//!
//! Routes each inbound message to the matching presentation or
//! verification path and hands the result to a [`DisplayHandler`]. Every
//! guard or verification failure is a silent drop (debug log); garbage on
//! the bus must never crash a receiver. Row positions per topic are
//! stable so a console front end can update lines in place.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use log::debug;

use crate::cancel::CancellationToken;
use crate::error::{SecurityError, MAX_PAYLOAD_BYTES};
use crate::fields::InteroperableField;
use crate::identity::{DeviceIdentity, PeerBinding};
use crate::interop::parse_payload;
use crate::mqtt::InboundMessage;
use crate::reading::SensorReading;
use crate::secure::{decrypt_and_verify, verify_signed_payload};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicRoute<'a> {
    Pairing,
    Unstructured { device: &'a str, field: &'a str },
    Structured { device: &'a str },
    Interoperable { device: &'a str },
    SecuredPublic { key: &'a str },
    SecuredConfidential { key: &'a str },
    Events,
    Other,
}

pub fn route(topic: &str) -> TopicRoute<'_> {
    let segments: Vec<&str> = topic.split('/').collect();
    match segments.as_slice() {
        ["HardenMqtt", "Pairing"] => TopicRoute::Pairing,
        ["HardenMqtt", "Events"] => TopicRoute::Events,
        ["HardenMqtt", "Unsecured", "Unstructured", device, field] => TopicRoute::Unstructured {
            device,
            field,
        },
        ["HardenMqtt", "Unsecured", "Structured", device] => TopicRoute::Structured { device },
        ["HardenMqtt", "Unsecured", "Interoperable", device] => {
            TopicRoute::Interoperable { device }
        }
        ["HardenMqtt", "Secured", "Public", key] => TopicRoute::SecuredPublic { key },
        ["HardenMqtt", "Secured", "Confidential", key] => TopicRoute::SecuredConfidential { key },
        _ => TopicRoute::Other,
    }
}

/// Stable row assignment per topic for in-place console updates.
#[derive(Debug, Default)]
pub struct RowTracker {
    rows: HashMap<String, usize>,
}

impl RowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&mut self, topic: &str) -> usize {
        let next = self.rows.len();
        *self.rows.entry(topic.to_string()).or_insert(next)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Presentation seam; the demo's console view implements this.
pub trait DisplayHandler {
    fn on_unstructured(&mut self, row: usize, device: &str, field: &str, value: &str);
    fn on_structured(&mut self, row: usize, device: &str, reading: &SensorReading);
    fn on_interoperable(&mut self, row: usize, device: &str, fields: &[InteroperableField]);
    fn on_signed(&mut self, row: usize, fields: &[InteroperableField]);
    fn on_confidential(&mut self, row: usize, fields: &[InteroperableField]);
    fn on_event(&mut self, text: &str);
}

pub struct Dispatcher<'a> {
    identity: &'a DeviceIdentity,
    binding: PeerBinding,
    rows: RowTracker,
}

impl<'a> Dispatcher<'a> {
    pub fn new(identity: &'a DeviceIdentity, binding: PeerBinding) -> Self {
        Self {
            identity,
            binding,
            rows: RowTracker::new(),
        }
    }

    /// Routes one message. Failures drop silently.
    pub fn dispatch(&mut self, message: &InboundMessage, handler: &mut dyn DisplayHandler) {
        if let Err(reason) = self.try_dispatch(message, handler) {
            debug!("dropping {}: {reason}", message.topic);
        }
    }

    fn try_dispatch(
        &mut self,
        message: &InboundMessage,
        handler: &mut dyn DisplayHandler,
    ) -> Result<(), SecurityError> {
        match route(&message.topic) {
            TopicRoute::Unstructured { device, field } => {
                if device != self.binding.device_id {
                    return Ok(());
                }
                SecurityError::check_size(&message.payload, MAX_PAYLOAD_BYTES)?;
                let value =
                    std::str::from_utf8(&message.payload).map_err(|_| SecurityError::Utf8)?;
                let row = self.rows.row(&message.topic);
                handler.on_unstructured(row, device, field, value);
            }
            TopicRoute::Structured { device } => {
                if device != self.binding.device_id {
                    return Ok(());
                }
                SecurityError::check_size(&message.payload, MAX_PAYLOAD_BYTES)?;
                let reading: SensorReading = serde_json::from_slice(&message.payload)?;
                let row = self.rows.row(&message.topic);
                handler.on_structured(row, device, &reading);
            }
            TopicRoute::Interoperable { device } => {
                if device != self.binding.device_id {
                    return Ok(());
                }
                let fields = parse_payload(&message.payload)?;
                let row = self.rows.row(&message.topic);
                handler.on_interoperable(row, device, &fields);
            }
            TopicRoute::SecuredPublic { key } => {
                if key != self.binding.public_base64() {
                    return Ok(());
                }
                let fields = verify_signed_payload(&message.payload, &self.binding.public_key)?;
                let row = self.rows.row(&message.topic);
                handler.on_signed(row, &fields);
            }
            TopicRoute::SecuredConfidential { key } => {
                if key != self.binding.public_base64() {
                    return Ok(());
                }
                let fields =
                    decrypt_and_verify(&message.payload, self.identity, &self.binding.public_key)?;
                let row = self.rows.row(&message.topic);
                handler.on_confidential(row, &fields);
            }
            TopicRoute::Events => {
                if let Ok(text) = std::str::from_utf8(&message.payload) {
                    handler.on_event(text);
                }
            }
            TopicRoute::Pairing | TopicRoute::Other => {}
        }
        Ok(())
    }

    /// Consumes the inbox until cancellation, then drains whatever is
    /// already queued and exits.
    pub fn run(
        &mut self,
        inbox: &Receiver<InboundMessage>,
        cancel: &CancellationToken,
        handler: &mut dyn DisplayHandler,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match inbox.recv_timeout(Duration::from_millis(100)) {
                Ok(message) => self.dispatch(&message, handler),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
        loop {
            match inbox.try_recv() {
                Ok(message) => self.dispatch(&message, handler),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}
