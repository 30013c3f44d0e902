//! The adversarial mutator.
//!
//! Subscribed to `#`, the troll classifies every payload it receives and
//! republishes one perturbed variant to the same topic. The digest cache
//! keeps it from chewing on its own output, and the reserved event-log
//! topic is left alone so the pedagogical output stays legible.
//!
//! The Trolliness factor scales mutation frequency inversely: at 1 every
//! mutation site fires, at 10 roughly one in ten does.

use log::{debug, trace};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime};
use url::Url;

use crate::cache::DigestCache;
use crate::error::SecurityError;
use crate::fields::{FieldValue, InteroperableField, IsoDuration};
use crate::interop::{parse_payload, render_payload};
use crate::mqtt::TOPIC_EVENTS;
use crate::rng::secure_rng;

const BLOB_THRESHOLD: usize = 65_536;
const SMALL_BLOB_BYTES: usize = 1_024;
const JSON_DEPTH_LIMIT: usize = 4;

/// What the troll decided a payload is. Classification is attempted in
/// this order; the first match wins.
#[derive(Clone, Debug)]
pub enum PayloadClass {
    Blob,
    Integer(i64),
    Float(f64),
    Duration(IsoDuration),
    DateTime(OffsetDateTime),
    Uri(Url),
    JsonObject(Map<String, Value>),
    JsonArray(Vec<Value>),
    Xml(String),
    Text(String),
}

impl PayloadClass {
    pub fn kind(&self) -> &'static str {
        match self {
            PayloadClass::Blob => "blob",
            PayloadClass::Integer(_) => "integer",
            PayloadClass::Float(_) => "float",
            PayloadClass::Duration(_) => "duration",
            PayloadClass::DateTime(_) => "dateTime",
            PayloadClass::Uri(_) => "uri",
            PayloadClass::JsonObject(_) => "jsonObject",
            PayloadClass::JsonArray(_) => "jsonArray",
            PayloadClass::Xml(_) => "xml",
            PayloadClass::Text(_) => "text",
        }
    }
}

pub fn classify(payload: &[u8]) -> PayloadClass {
    if payload.len() > BLOB_THRESHOLD {
        return PayloadClass::Blob;
    }
    let Ok(text) = std::str::from_utf8(payload) else {
        return PayloadClass::Blob;
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return PayloadClass::Text(text.to_string());
    }
    if let Ok(value) = trimmed.parse::<i64>() {
        return PayloadClass::Integer(value);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() {
            return PayloadClass::Float(value);
        }
    }
    if let Ok(value) = IsoDuration::parse(trimmed) {
        return PayloadClass::Duration(value);
    }
    if let Some(value) = parse_any_datetime(trimmed) {
        return PayloadClass::DateTime(value);
    }
    if let Ok(url) = Url::parse(trimmed) {
        if url.has_host() {
            return PayloadClass::Uri(url);
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        match value {
            Value::Object(map) => return PayloadClass::JsonObject(map),
            Value::Array(items) => return PayloadClass::JsonArray(items),
            _ => {}
        }
    }
    if trimmed.starts_with('<') && parse_xml_tree(trimmed).is_ok() {
        return PayloadClass::Xml(trimmed.to_string());
    }
    PayloadClass::Text(text.to_string())
}

fn parse_any_datetime(text: &str) -> Option<OffsetDateTime> {
    if let Ok(value) = OffsetDateTime::parse(text, &Rfc3339) {
        return Some(value);
    }
    let bare = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second]"
    );
    if let Ok(value) = PrimitiveDateTime::parse(text, &bare) {
        return Some(value.assume_utc());
    }
    None
}

/// One perturbed republication.
#[derive(Clone, Debug)]
pub struct Republication {
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Republication {
    fn retained(payload: Vec<u8>) -> Self {
        Self {
            payload,
            retain: true,
        }
    }
}

pub struct TrollMutator {
    trolliness: u32,
    cache: DigestCache,
    rng: ChaCha20Rng,
}

impl TrollMutator {
    pub fn new(trolliness: u32) -> Self {
        let mut seed = [0u8; 32];
        secure_rng().fill_bytes(&mut seed);
        Self::with_rng(trolliness, ChaCha20Rng::from_seed(seed))
    }

    /// Deterministic mutator for replayable runs and tests.
    pub fn with_rng(trolliness: u32, rng: ChaCha20Rng) -> Self {
        Self {
            trolliness: trolliness.max(1),
            cache: DigestCache::new(),
            rng,
        }
    }

    /// Processes one received message. Returns the republication to emit
    /// back to the same topic, or `None` when the message is the troll's
    /// own echo or lives on the reserved event topic.
    pub fn handle(&mut self, topic: &str, payload: &[u8]) -> Option<Republication> {
        if topic == TOPIC_EVENTS {
            return None;
        }
        if self.cache.check_and_remove(topic, payload) {
            trace!("skipping own echo on {topic}");
            return None;
        }
        let class = classify(payload);
        debug!("{topic}: classified as {}", class.kind());
        let republication = self.mutate(&class, payload);
        self.cache.insert(topic, &republication.payload);
        Some(republication)
    }

    /// One mutation site: fires with probability 1/trolliness.
    fn fires(&mut self) -> bool {
        self.trolliness <= 1 || self.rng.gen_range(0..self.trolliness) == 0
    }

    fn mutate(&mut self, class: &PayloadClass, payload: &[u8]) -> Republication {
        match class {
            PayloadClass::Blob => self.mutate_blob(payload),
            PayloadClass::Integer(value) => self.mutate_integer(*value, payload),
            PayloadClass::Float(value) => self.mutate_float(*value, payload),
            PayloadClass::Duration(value) => self.mutate_duration(*value, payload),
            PayloadClass::DateTime(value) => self.mutate_datetime(*value, payload),
            PayloadClass::Uri(url) => self.mutate_uri(url, payload),
            PayloadClass::JsonObject(map) => self.mutate_json_object(map),
            PayloadClass::JsonArray(items) => self.mutate_json_array(items),
            PayloadClass::Xml(text) => self.mutate_xml(text, payload),
            PayloadClass::Text(text) => {
                let mutated = if self.fires() {
                    self.mutate_string(text)
                } else {
                    StringMutation::Text(text.clone())
                };
                match mutated {
                    StringMutation::Text(text) => Republication::retained(text.into_bytes()),
                    StringMutation::Blob(blob) => Republication::retained(blob),
                }
            }
        }
    }

    fn mutate_integer(&mut self, value: i64, payload: &[u8]) -> Republication {
        if !self.fires() {
            return Republication::retained(payload.to_vec());
        }
        let text = match self.rng.gen_range(0..6) {
            0 => (value / 2).to_string(),
            1 => value.saturating_mul(2).to_string(),
            2 => value.checked_neg().unwrap_or(i64::MAX).to_string(),
            3 => self.rng.gen::<i64>().to_string(),
            4 => "Kilroy was here".to_string(),
            _ => return Republication::retained(self.small_blob()),
        };
        Republication::retained(text.into_bytes())
    }

    fn mutate_float(&mut self, value: f64, payload: &[u8]) -> Republication {
        if !self.fires() {
            return Republication::retained(payload.to_vec());
        }
        let text = match self.rng.gen_range(0..7) {
            0 => (value / 2.0).to_string(),
            1 => (value * 2.0).to_string(),
            2 => (-value).to_string(),
            3 => self.rng.gen_range(-1.0e9..1.0e9).to_string(),
            4 => format!("{value:e}"),
            5 => "Kilroy was here".to_string(),
            _ => return Republication::retained(self.small_blob()),
        };
        Republication::retained(text.into_bytes())
    }

    fn mutate_duration(&mut self, value: IsoDuration, payload: &[u8]) -> Republication {
        if !self.fires() {
            return Republication::retained(payload.to_vec());
        }
        let seconds = value.as_seconds();
        let text = match self.rng.gen_range(0..6) {
            0 => IsoDuration::from_seconds(seconds / 2).render(),
            1 => IsoDuration::from_seconds(seconds.saturating_mul(2)).render(),
            2 => IsoDuration::from_seconds(seconds.checked_neg().unwrap_or(i64::MAX)).render(),
            3 => IsoDuration::from_seconds(self.rng.gen_range(-1_000_000..1_000_000)).render(),
            4 => "Kilroy was here".to_string(),
            _ => return Republication::retained(self.small_blob()),
        };
        Republication::retained(text.into_bytes())
    }

    fn mutate_datetime(&mut self, value: OffsetDateTime, payload: &[u8]) -> Republication {
        if !self.fires() {
            return Republication::retained(payload.to_vec());
        }
        let text = match self.rng.gen_range(0..6) {
            0 => render_ticks(value.unix_timestamp_nanos() / 2, value),
            1 => render_ticks(value.unix_timestamp_nanos().saturating_mul(2), value),
            2 => self.invalid_component_datetime(value),
            3 => self.random_datetime(),
            4 => "Kilroy was here".to_string(),
            _ => return Republication::retained(self.small_blob()),
        };
        Republication::retained(text.into_bytes())
    }

    /// Renders the datetime with one component pushed 10 past legal.
    fn invalid_component_datetime(&mut self, value: OffsetDateTime) -> String {
        let mut parts = [
            value.year() as i64,
            value.month() as u8 as i64,
            value.day() as i64,
            value.hour() as i64,
            value.minute() as i64,
            value.second() as i64,
        ];
        let which = self.rng.gen_range(0..parts.len());
        parts[which] += 10;
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
            parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]
        )
    }

    fn random_datetime(&mut self) -> String {
        let seconds = self.rng.gen_range(0..4_000_000_000i64);
        match OffsetDateTime::from_unix_timestamp(seconds) {
            Ok(value) => crate::fields::render_datetime(value),
            Err(_) => "1970-01-01T00:00:00Z".to_string(),
        }
    }

    fn mutate_uri(&mut self, url: &Url, payload: &[u8]) -> Republication {
        if !self.fires() {
            return Republication::retained(payload.to_vec());
        }
        let text = url.as_str();
        let mutated = match self.rng.gen_range(0..6) {
            0 => text[..floor_char_boundary(text, text.len() / 2)].to_string(),
            1 => {
                let scheme = self.random_token(4);
                match text.split_once(':') {
                    Some((_, rest)) => format!("{scheme}:{rest}"),
                    None => scheme,
                }
            }
            2 => {
                let mut substituted = url.clone();
                let host = format!("host-{}.invalid", self.random_token(6));
                if substituted.set_host(Some(&host)).is_ok() {
                    substituted.to_string()
                } else {
                    host
                }
            }
            3 => {
                let mut injected = url.clone();
                let segment = self.random_token(8);
                injected.set_path(&format!("/../{segment}{}", url.path()));
                injected.to_string()
            }
            4 => "Kilroy was here".to_string(),
            _ => return Republication::retained(self.small_blob()),
        };
        Republication::retained(mutated.into_bytes())
    }

    fn mutate_json_object(&mut self, map: &Map<String, Value>) -> Republication {
        if self.fires() && self.rng.gen_ratio(1, 8) {
            return Republication::retained(self.small_blob());
        }
        let mut out = Map::new();
        for (key, value) in map {
            if !self.fires() {
                out.insert(key.clone(), value.clone());
                continue;
            }
            match self.rng.gen_range(0..5) {
                0 => {
                    let half = floor_char_boundary(key, key.len() / 2);
                    out.insert(key[..half].to_string(), value.clone());
                }
                1 => {
                    out.insert(format!("{key}{key}"), value.clone());
                }
                2 => {
                    out.insert(self.random_token(8), value.clone());
                }
                3 => {} // drop the entry
                _ => {
                    out.insert(key.clone(), self.perturb_json_value(value, 0));
                }
            }
        }
        Republication::retained(serde_json::to_vec(&Value::Object(out)).unwrap_or_default())
    }

    fn mutate_json_array(&mut self, items: &[Value]) -> Republication {
        if self.fires() && self.rng.gen_ratio(1, 8) {
            return Republication::retained(self.small_blob());
        }
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if !self.fires() {
                out.push(item.clone());
                continue;
            }
            match self.rng.gen_range(0..4) {
                0 => out.push(item.clone()),
                1 => out.push(self.perturb_json_value(item, 0)),
                2 => out.push(Value::String(self.random_token(8))),
                _ => {} // drop the element
            }
        }
        Republication::retained(serde_json::to_vec(&Value::Array(out)).unwrap_or_default())
    }

    fn perturb_json_value(&mut self, value: &Value, depth: usize) -> Value {
        if depth >= JSON_DEPTH_LIMIT {
            return value.clone();
        }
        match value {
            Value::Bool(b) => Value::Bool(!b),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    let mutated = match self.rng.gen_range(0..4) {
                        0 => int / 2,
                        1 => int.saturating_mul(2),
                        2 => int.checked_neg().unwrap_or(i64::MAX),
                        _ => self.rng.gen::<i64>(),
                    };
                    Value::from(mutated)
                } else {
                    let float = number.as_f64().unwrap_or(0.0);
                    let mutated = match self.rng.gen_range(0..4) {
                        0 => float / 2.0,
                        1 => float * 2.0,
                        2 => -float,
                        _ => self.rng.gen_range(-1.0e9..1.0e9),
                    };
                    serde_json::Number::from_f64(mutated)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Value::String(text) => match self.mutate_string(text) {
                StringMutation::Text(text) => Value::String(text),
                StringMutation::Blob(blob) => Value::String(hex::encode(blob)),
            },
            Value::Null => Value::String(self.random_token(6)),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, inner) in map {
                    out.insert(key.clone(), self.perturb_json_value(inner, depth + 1));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.perturb_json_value(item, depth + 1))
                    .collect(),
            ),
        }
    }

    fn mutate_xml(&mut self, text: &str, payload: &[u8]) -> Republication {
        // Interoperable sensor documents get typed per-field mutation.
        if let Ok(fields) = parse_payload(payload) {
            let mutated = self.mutate_interop_fields(&fields);
            return Republication::retained(render_payload(&mutated));
        }
        match parse_xml_tree(text) {
            Ok(mut root) => {
                self.fuzz_xml_node(&mut root);
                Republication::retained(render_xml_tree(&root).into_bytes())
            }
            Err(_) => Republication::retained(payload.to_vec()),
        }
    }

    fn mutate_interop_fields(&mut self, fields: &[InteroperableField]) -> Vec<InteroperableField> {
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            let mut field = field.clone();
            if self.fires() {
                field.name = match self.rng.gen_range(0..3) {
                    0 => {
                        let half = floor_char_boundary(&field.name, field.name.len() / 2);
                        field.name[..half].to_string()
                    }
                    1 => format!("{0}{0}", field.name),
                    _ => self.random_token(8),
                };
            }
            if self.fires() {
                field.value = self.perturb_field_value(&field.value);
            }
            out.push(field);
        }
        out
    }

    fn perturb_field_value(&mut self, value: &FieldValue) -> FieldValue {
        match value {
            FieldValue::Boolean(b) => FieldValue::Boolean(!b),
            FieldValue::Int32(v) => FieldValue::Int32(if self.rng.gen_bool(0.5) {
                v / 2
            } else {
                v.saturating_mul(2)
            }),
            FieldValue::Int64(v) => FieldValue::Int64(if self.rng.gen_bool(0.5) {
                v / 2
            } else {
                v.saturating_mul(2)
            }),
            FieldValue::String(text) => FieldValue::String(match self.mutate_string(text) {
                StringMutation::Text(text) => text,
                StringMutation::Blob(blob) => hex::encode(blob),
            }),
            FieldValue::Date(v) => FieldValue::Date(*v),
            FieldValue::DateTime(_) => {
                let seconds = self.rng.gen_range(0..4_000_000_000i64);
                FieldValue::DateTime(
                    OffsetDateTime::from_unix_timestamp(seconds)
                        .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                )
            }
            FieldValue::Duration(v) => {
                FieldValue::Duration(IsoDuration::from_seconds(v.as_seconds().saturating_mul(2)))
            }
            FieldValue::Time(v) => FieldValue::Time(*v),
            FieldValue::Quantity {
                magnitude,
                decimals,
                unit,
            } => FieldValue::Quantity {
                magnitude: if self.rng.gen_bool(0.5) {
                    magnitude / 2.0
                } else {
                    magnitude * 2.0
                },
                decimals: *decimals,
                unit: unit.clone(),
            },
            FieldValue::Enum { enum_type, .. } => FieldValue::Enum {
                value: self.random_token(8),
                enum_type: enum_type.clone(),
            },
        }
    }

    fn fuzz_xml_node(&mut self, node: &mut XmlNode) {
        if self.fires() {
            node.name = self.mutate_xml_name(&node.name);
        }
        for (name, _) in &mut node.attrs {
            if self.fires() {
                *name = self.mutate_xml_name(name);
            }
        }
        // Skip nodes: each child survives unless this site fires.
        let mut survivors = Vec::with_capacity(node.children.len());
        for mut child in node.children.drain(..) {
            if self.fires() && self.rng.gen_ratio(1, 4) {
                continue;
            }
            self.fuzz_xml_node(&mut child);
            survivors.push(child);
        }
        node.children = survivors;
    }

    /// Mutates an element or attribute name, keeping any namespace prefix
    /// subject to the same treatment as the local part.
    fn mutate_xml_name(&mut self, name: &str) -> String {
        let (prefix, local) = match name.split_once(':') {
            Some((prefix, local)) => (Some(prefix), local),
            None => (None, name),
        };
        let target = if prefix.is_some() && self.rng.gen_bool(0.5) {
            prefix.unwrap_or_default()
        } else {
            local
        };
        let mutated = match self.rng.gen_range(0..3) {
            0 => target[..floor_char_boundary(target, target.len() / 2)].to_string(),
            1 => format!("{target}{target}"),
            _ => self.random_token(6),
        };
        let mutated = if mutated.is_empty() {
            self.random_token(3)
        } else {
            mutated
        };
        match (prefix, target == local) {
            (Some(prefix), true) => format!("{prefix}:{mutated}"),
            (Some(_), false) => format!("{mutated}:{local}"),
            (None, _) => mutated,
        }
    }

    fn mutate_blob(&mut self, payload: &[u8]) -> Republication {
        if !self.fires() {
            return Republication {
                payload: payload.to_vec(),
                retain: false,
            };
        }
        match self.rng.gen_range(0..4) {
            0 => Republication {
                payload: payload[..payload.len() / 2].to_vec(),
                retain: false,
            },
            1 => {
                let mut doubled = payload.to_vec();
                doubled.extend_from_slice(payload);
                Republication {
                    payload: doubled,
                    retain: false,
                }
            }
            2 => {
                let mut randomized = vec![0u8; payload.len()];
                self.rng.fill_bytes(&mut randomized);
                Republication {
                    payload: randomized,
                    retain: false,
                }
            }
            _ => {
                let len = large_blob_len(self.rng.gen_range(0..1_000));
                let mut blob = vec![0u8; len];
                self.rng.fill_bytes(&mut blob);
                // Large blobs are never retained; a 192 MiB retained
                // message would bloat the broker forever.
                Republication {
                    payload: blob,
                    retain: false,
                }
            }
        }
    }

    fn mutate_string(&mut self, text: &str) -> StringMutation {
        match self.rng.gen_range(0..4) {
            0 => StringMutation::Text(text[..floor_char_boundary(text, text.len() / 2)].to_string()),
            1 => StringMutation::Text(format!("{text}{text}")),
            2 => StringMutation::Text(self.random_token(text.chars().count().max(1))),
            _ => StringMutation::Blob(self.small_blob()),
        }
    }

    fn small_blob(&mut self) -> Vec<u8> {
        let mut blob = vec![0u8; SMALL_BLOB_BYTES];
        self.rng.fill_bytes(&mut blob);
        blob
    }

    fn random_token(&mut self, len: usize) -> String {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        (0..len)
            .map(|_| ALPHABET[self.rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }
}

enum StringMutation {
    Text(String),
    Blob(Vec<u8>),
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn render_ticks(nanos: i128, fallback: OffsetDateTime) -> String {
    let value = OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(fallback);
    crate::fields::render_datetime(value)
}

/// Large-blob size schedule: 99.0 % at 1 MiB, 0.9 % at 16 MiB, 0.1 % at
/// 192 MiB. `roll` is uniform in `0..1000`.
pub fn large_blob_len(roll: u32) -> usize {
    match roll {
        0 => 192 * 1024 * 1024,
        1..=9 => 16 * 1024 * 1024,
        _ => 1024 * 1024,
    }
}

/// Minimal XML tree used for structural fuzzing of non-interoperable
/// documents. Good enough to reshape any well-formed payload; not a
/// validating parser.
#[derive(Clone, Debug, PartialEq)]
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<XmlNode>,
}

fn parse_xml_tree(text: &str) -> Result<XmlNode, SecurityError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;
    loop {
        match reader.read_event()? {
            Event::Decl(_) | Event::Comment(_) => {}
            Event::Start(element) => {
                stack.push(node_from_start(&element)?);
            }
            Event::Empty(element) => {
                let node = node_from_start(&element)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(text) => {
                if let Some(parent) = stack.last_mut() {
                    let content = text
                        .unescape()
                        .map_err(quick_xml::Error::from)?
                        .into_owned();
                    parent.text = Some(content);
                }
            }
            Event::End(_) => {
                let node = stack.pop().ok_or(SecurityError::Value("xml nesting"))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Eof => break,
            _ => return Err(SecurityError::Value("xml structure")),
        }
    }
    if !stack.is_empty() {
        return Err(SecurityError::Value("xml nesting"));
    }
    root.ok_or(SecurityError::Value("xml structure"))
}

fn node_from_start(element: &BytesStart) -> Result<XmlNode, SecurityError> {
    let name = String::from_utf8(element.name().as_ref().to_vec())
        .map_err(|_| SecurityError::Utf8)?;
    let mut attrs = Vec::new();
    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8(attr.key.as_ref().to_vec()).map_err(|_| SecurityError::Utf8)?;
        let value = attr
            .unescape_value()
            .map_err(quick_xml::Error::from)?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(XmlNode {
        name,
        attrs,
        text: None,
        children: Vec::new(),
    })
}

fn attach(
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> Result<(), SecurityError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(SecurityError::Value("xml structure")),
    }
}

fn render_xml_tree(node: &XmlNode) -> String {
    let mut writer = Writer::new(Vec::new());
    write_node(&mut writer, node);
    String::from_utf8(writer.into_inner()).unwrap_or_default()
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &XmlNode) {
    let mut start = BytesStart::new(node.name.as_str());
    for (key, value) in &node.attrs {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if node.children.is_empty() && node.text.is_none() {
        let _ = writer.write_event(Event::Empty(start));
        return;
    }
    let _ = writer.write_event(Event::Start(start));
    if let Some(text) = &node.text {
        let _ = writer.write_event(Event::Text(BytesText::new(text)));
    }
    for child in &node.children {
        write_node(writer, child);
    }
    let _ = writer.write_event(Event::End(BytesEnd::new(node.name.as_str())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldType;
    use crate::rng::derive_rng;
    use time::macros::datetime;

    fn troll(label: &[u8]) -> TrollMutator {
        TrollMutator::with_rng(1, derive_rng(label))
    }

    #[test]
    fn classification_order() {
        assert!(matches!(classify(b"100"), PayloadClass::Integer(100)));
        assert!(matches!(classify(b"21.5"), PayloadClass::Float(_)));
        assert!(matches!(classify(b"PT1M30S"), PayloadClass::Duration(_)));
        assert!(matches!(
            classify(b"2026-08-02T07:00:05Z"),
            PayloadClass::DateTime(_)
        ));
        assert!(matches!(
            classify(b"https://example.org/a"),
            PayloadClass::Uri(_)
        ));
        assert!(matches!(
            classify(br#"{"a":1}"#),
            PayloadClass::JsonObject(_)
        ));
        assert!(matches!(classify(b"[1,2]"), PayloadClass::JsonArray(_)));
        assert!(matches!(classify(b"<a><b/></a>"), PayloadClass::Xml(_)));
        assert!(matches!(classify(b"hello world"), PayloadClass::Text(_)));
        assert!(matches!(classify(&[0xFF, 0xFE, 0x00]), PayloadClass::Blob));
        let oversized = vec![b'a'; BLOB_THRESHOLD + 1];
        assert!(matches!(classify(&oversized), PayloadClass::Blob));
    }

    #[test]
    fn integer_mutation_menu() {
        // "100" must land in the documented output family.
        for round in 0..64u8 {
            let mut troll = troll(&[b'i', round]);
            let output = troll.handle("HardenMqtt/Unsecured/Unstructured/S/Counter", b"100");
            let payload = output.unwrap().payload;
            if payload.len() == SMALL_BLOB_BYTES {
                continue; // BLOB replacement
            }
            let text = String::from_utf8(payload).unwrap();
            let acceptable = text == "50"
                || text == "200"
                || text == "-100"
                || text == "Kilroy was here"
                || text.parse::<i64>().is_ok();
            assert!(acceptable, "unexpected integer mutation: {text}");
        }
    }

    #[test]
    fn own_echo_suppressed_exactly_once() {
        let mut troll = troll(b"echo");
        let topic = "HardenMqtt/Unsecured/Unstructured/S/Counter";
        let republication = troll.handle(topic, b"100").unwrap();
        // The broker feeds the republication back: suppressed.
        assert!(troll.handle(topic, &republication.payload).is_none());
        // A second identical arrival is fresh traffic again.
        assert!(troll.handle(topic, &republication.payload).is_some());
    }

    #[test]
    fn events_topic_left_alone() {
        let mut troll = troll(b"events");
        assert!(troll.handle(TOPIC_EVENTS, b"pairing completed").is_none());
    }

    #[test]
    fn blob_size_schedule() {
        assert_eq!(large_blob_len(0), 192 * 1024 * 1024);
        assert_eq!(large_blob_len(1), 16 * 1024 * 1024);
        assert_eq!(large_blob_len(9), 16 * 1024 * 1024);
        assert_eq!(large_blob_len(10), 1024 * 1024);
        assert_eq!(large_blob_len(999), 1024 * 1024);
    }

    #[test]
    fn large_blobs_are_never_retained() {
        for round in 0..32u8 {
            let mut troll = troll(&[b'b', round]);
            let oversized = vec![0u8; BLOB_THRESHOLD + 1];
            let output = troll.handle("HardenMqtt/Secured/Public/key", &oversized).unwrap();
            assert!(!output.retain);
        }
    }

    #[test]
    fn interop_mutation_respects_variants() {
        let fields = vec![
            InteroperableField::new(
                "S",
                datetime!(2026-08-02 07:00:05 UTC),
                "Window",
                FieldValue::Boolean(false),
                FieldType::Status,
            ),
            InteroperableField::new(
                "S",
                datetime!(2026-08-02 07:00:05 UTC),
                "Counter",
                FieldValue::Int64(100),
                FieldType::Momentary,
            ),
        ];
        let payload = render_payload(&fields);
        let mut troll = troll(b"interop");
        let output = troll
            .handle("HardenMqtt/Unsecured/Interoperable/S", &payload)
            .unwrap();
        // Output stays a parseable interoperable document.
        let mutated = parse_payload(&output.payload).unwrap();
        assert_eq!(mutated.len(), fields.len());
        for field in &mutated {
            match &field.value {
                FieldValue::Boolean(_) | FieldValue::Int64(_) => {}
                other => panic!("variant changed under mutation: {other:?}"),
            }
        }
    }

    #[test]
    fn structural_xml_fuzz_emits_xml() {
        let mut troll = troll(b"xml");
        let output = troll
            .handle("Some/Topic", b"<root a=\"1\"><child>text</child><x:ns/></root>")
            .unwrap();
        let text = String::from_utf8(output.payload).unwrap();
        assert!(text.starts_with('<'));
    }

    #[test]
    fn json_object_mutation_stays_json_or_blob() {
        let mut troll = troll(b"json");
        let output = troll
            .handle("Some/Topic", br#"{"temperature":21.5,"ok":true}"#)
            .unwrap();
        let payload = output.payload;
        let is_blob = payload.len() == SMALL_BLOB_BYTES;
        let is_json = serde_json::from_slice::<Value>(&payload).is_ok();
        assert!(is_blob || is_json);
    }

    #[test]
    fn high_trolliness_mostly_passes_through() {
        let mut troll = TrollMutator::with_rng(u32::MAX, derive_rng(b"calm"));
        for round in 0..16 {
            let payload = format!("{round}00");
            let output = troll.handle("Some/Topic", payload.as_bytes()).unwrap();
            assert_eq!(output.payload, payload.as_bytes());
        }
    }

    #[test]
    fn xml_tree_roundtrip() {
        let parsed = parse_xml_tree("<a x=\"1\"><b>hi</b><c/></a>").unwrap();
        assert_eq!(parsed.name, "a");
        assert_eq!(parsed.children.len(), 2);
        let rendered = render_xml_tree(&parsed);
        assert_eq!(parse_xml_tree(&rendered).unwrap(), parsed);
    }
}
