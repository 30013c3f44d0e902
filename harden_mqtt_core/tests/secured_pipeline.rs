//! Telemetry pipeline scenarios: the five namespaces over the loopback
//! bus, the verifying display, and the troll in the middle.

use harden_mqtt_core::{
    classify, route, CancellationToken, DeviceIdentity, Dispatcher, DisplayHandler,
    InteroperableField, LoopbackBroker, MqttClient, PayloadClass, PeerBinding, Qos,
    SecureTelemetry, SensorReading, TopicRoute, TrollMutator, MAX_PAYLOAD_BYTES,
};
use time::macros::datetime;

fn sensor_identity() -> DeviceIdentity {
    DeviceIdentity::from_scalar([31; 32], "Sensor-01", "Sensor")
}

fn display_identity() -> DeviceIdentity {
    DeviceIdentity::from_scalar([32; 32], "Display-01", "Display")
}

fn bindings() -> (PeerBinding, PeerBinding) {
    let sensor_side = PeerBinding {
        public_key: display_identity().public_key(),
        device_id: "Display-01".into(),
    };
    let display_side = PeerBinding {
        public_key: sensor_identity().public_key(),
        device_id: "Sensor-01".into(),
    };
    (sensor_side, display_side)
}

fn reading() -> SensorReading {
    SensorReading {
        readout: datetime!(2026-08-02 07:00:00 UTC),
        timestamp: datetime!(2026-08-02 07:00:05 UTC),
        name: "Backyard".into(),
        id: "Sensor-01".into(),
        country: "SE".into(),
        time_zone: "Europe/Stockholm".into(),
        temperature_celsius: Some(21.5),
        humidity_percent: Some(64.0),
        pressure_hpa: Some(1013.2),
        wind_speed_mps: None,
        description: None,
    }
}

#[derive(Default)]
struct CountingHandler {
    unstructured: Vec<(String, String)>,
    structured: Vec<SensorReading>,
    interoperable: usize,
    signed: Vec<Vec<(String, String)>>,
    confidential: Vec<Vec<(String, String)>>,
}

impl DisplayHandler for CountingHandler {
    fn on_unstructured(&mut self, _row: usize, _device: &str, field: &str, value: &str) {
        self.unstructured.push((field.into(), value.into()));
    }
    fn on_structured(&mut self, _row: usize, _device: &str, reading: &SensorReading) {
        self.structured.push(reading.clone());
    }
    fn on_interoperable(&mut self, _row: usize, _device: &str, _fields: &[InteroperableField]) {
        self.interoperable += 1;
    }
    fn on_signed(&mut self, _row: usize, fields: &[InteroperableField]) {
        self.signed.push(render_fields(fields));
    }
    fn on_confidential(&mut self, _row: usize, fields: &[InteroperableField]) {
        self.confidential.push(render_fields(fields));
    }
    fn on_event(&mut self, _text: &str) {}
}

fn render_fields(fields: &[InteroperableField]) -> Vec<(String, String)> {
    fields
        .iter()
        .map(|field| (field.name.clone(), field.value.render()))
        .collect()
}

fn drain_into_dispatcher(
    broker: &LoopbackBroker,
    display: &DeviceIdentity,
    binding: PeerBinding,
) -> CountingHandler {
    let client = broker.client();
    // A late joiner sees the retained state of every namespace.
    let inbox = client.subscribe("HardenMqtt/#").unwrap();
    let mut dispatcher = Dispatcher::new(display, binding);
    let mut handler = CountingHandler::default();
    let cancel = CancellationToken::new();
    cancel.cancel();
    dispatcher.run(&inbox, &cancel, &mut handler);
    handler
}

#[test]
fn all_five_namespaces_reach_a_late_display() {
    let broker = LoopbackBroker::new();
    let sensor = sensor_identity();
    let display = display_identity();
    let (sensor_binding, display_binding) = bindings();

    let sensor_client = broker.client();
    let telemetry = SecureTelemetry::new(&sensor_client, &sensor, Some(sensor_binding));
    telemetry.publish_reading(&reading()).unwrap();

    let handler = drain_into_dispatcher(&broker, &display, display_binding);

    let temperature = handler
        .unstructured
        .iter()
        .find(|(field, _)| field == "Temperature")
        .unwrap();
    assert_eq!(temperature.1, "21.5 °C");
    assert_eq!(handler.structured.len(), 1);
    assert_eq!(handler.structured[0].temperature_celsius, Some(21.5));
    assert_eq!(handler.interoperable, 1);

    // The signed view surfaces the temperature quantity (scenario S2).
    assert_eq!(handler.signed.len(), 1);
    assert!(handler
        .signed[0]
        .iter()
        .any(|(name, value)| name == "Temperature" && value == "21.5"));
    // And the confidential view decrypts to the same field list.
    assert_eq!(handler.confidential.len(), 1);
    assert!(handler.confidential[0]
        .iter()
        .any(|(name, value)| name == "Temperature" && value == "21.5"));
}

#[test]
fn confidential_namespace_skipped_without_binding() {
    let broker = LoopbackBroker::new();
    let sensor = sensor_identity();
    let sensor_client = broker.client();
    let telemetry = SecureTelemetry::new(&sensor_client, &sensor, None);
    telemetry.publish_reading(&reading()).unwrap();

    let confidential =
        harden_mqtt_core::topic_secured_confidential(&sensor.public_base64());
    assert!(broker.retained(&confidential).is_none());
    let public = harden_mqtt_core::topic_secured_public(&sensor.public_base64());
    assert!(broker.retained(&public).is_some());
}

#[test]
fn stripped_signature_is_dropped_by_the_display() {
    let broker = LoopbackBroker::new();
    let sensor = sensor_identity();
    let display = display_identity();
    let (sensor_binding, display_binding) = bindings();

    let sensor_client = broker.client();
    let telemetry = SecureTelemetry::new(&sensor_client, &sensor, Some(sensor_binding));
    telemetry.publish_reading(&reading()).unwrap();

    // Replace the signed payload with the unsigned rendering of the same
    // fields: structurally valid, cryptographically naked.
    let public_topic = harden_mqtt_core::topic_secured_public(&sensor.public_base64());
    let unsigned = harden_mqtt_core::render_payload(&reading().interoperable_fields());
    sensor_client
        .publish(&public_topic, Qos::AtMostOnce, true, &unsigned)
        .unwrap();

    let handler = drain_into_dispatcher(&broker, &display, display_binding);
    assert!(handler.signed.is_empty());
}

#[test]
fn a_third_observer_cannot_read_the_confidential_frame() {
    let broker = LoopbackBroker::new();
    let sensor = sensor_identity();
    let (sensor_binding, _) = bindings();
    let outsider = DeviceIdentity::from_scalar([33; 32], "Troll-01", "Display");

    let sensor_client = broker.client();
    let telemetry = SecureTelemetry::new(&sensor_client, &sensor, Some(sensor_binding));
    telemetry.publish_reading(&reading()).unwrap();

    // The outsider knows the sensor's public key but not the display's
    // secret; its derived key is wrong and the frame stays opaque.
    let outsider_binding = PeerBinding {
        public_key: sensor_identity().public_key(),
        device_id: "Sensor-01".into(),
    };
    let handler = drain_into_dispatcher(&broker, &outsider, outsider_binding);
    assert!(handler.confidential.is_empty());
    // The signed-public namespace still verifies for anyone holding the
    // sensor's public key.
    assert_eq!(handler.signed.len(), 1);
}

#[test]
fn troll_mutation_leaves_the_secured_view_intact() {
    let broker = LoopbackBroker::new();
    let sensor = sensor_identity();
    let display = display_identity();
    let (sensor_binding, display_binding) = bindings();

    let sensor_client = broker.client();
    let troll_client = broker.client();
    let troll_inbox = troll_client.subscribe("#").unwrap();
    let mut troll = TrollMutator::with_rng(1, harden_mqtt_core::rng::derive_rng(b"pipeline"));

    let telemetry = SecureTelemetry::new(&sensor_client, &sensor, Some(sensor_binding));
    telemetry.publish_reading(&reading()).unwrap();

    // The display is already on the bus, so it receives the genuine
    // payloads and, later, every perturbed variant.
    let display_client = broker.client();
    let display_inbox = display_client.subscribe("HardenMqtt/#").unwrap();

    // The troll processes everything the sensor put on the bus,
    // republishing perturbed variants to the same topics (scenario S4).
    let mut republished = 0;
    while let Ok(message) = troll_inbox.try_recv() {
        if let Some(republication) = troll.handle(&message.topic, &message.payload) {
            troll_client
                .publish(
                    &message.topic,
                    Qos::AtMostOnce,
                    republication.retain,
                    &republication.payload,
                )
                .unwrap();
            republished += 1;
        }
    }
    assert!(republished > 0);

    // The display trusting only verified views sees exactly one signed
    // and one confidential reading; every perturbed variant fails
    // verification and drops.
    let mut dispatcher = Dispatcher::new(&display, display_binding);
    let mut handler = CountingHandler::default();
    let cancel = CancellationToken::new();
    cancel.cancel();
    dispatcher.run(&display_inbox, &cancel, &mut handler);
    assert_eq!(handler.signed.len(), 1);
    assert_eq!(handler.confidential.len(), 1);
}

#[test]
fn oversized_payload_stops_at_the_size_guard() {
    let broker = LoopbackBroker::new();
    let sensor = sensor_identity();
    let display = display_identity();
    let (_, display_binding) = bindings();

    // A large junk payload lands on the sensor's signed topic,
    // non-retained (scenario S5, scaled to CI memory).
    let public_topic = harden_mqtt_core::topic_secured_public(&sensor.public_base64());
    let junk = vec![0u8; MAX_PAYLOAD_BYTES + 4096];
    let client = broker.client();
    let inbox = client.subscribe("HardenMqtt/#").unwrap();
    broker
        .client()
        .publish(&public_topic, Qos::AtMostOnce, false, &junk)
        .unwrap();

    let mut dispatcher = Dispatcher::new(&display, display_binding);
    let mut handler = CountingHandler::default();
    let cancel = CancellationToken::new();
    cancel.cancel();
    dispatcher.run(&inbox, &cancel, &mut handler);
    assert!(handler.signed.is_empty());
}

#[test]
fn troll_classification_of_bus_payloads() {
    assert!(matches!(classify(b"100"), PayloadClass::Integer(100)));
    assert!(matches!(classify(b"21.5 \xc2\xb0C".as_slice()), PayloadClass::Text(_)));
    assert!(matches!(
        classify(br#"{"id":"Sensor-01","name":"Backyard"}"#),
        PayloadClass::JsonObject(_)
    ));
    let xml = harden_mqtt_core::render_payload(&reading().interoperable_fields());
    assert!(matches!(classify(&xml), PayloadClass::Xml(_)));
}

#[test]
fn routes_cover_the_namespace() {
    let sensor = sensor_identity();
    let key = sensor.public_base64();
    assert!(matches!(
        route(&harden_mqtt_core::topic_secured_public(&key)),
        TopicRoute::SecuredPublic { .. }
    ));
    assert!(matches!(
        route(&harden_mqtt_core::topic_secured_confidential(&key)),
        TopicRoute::SecuredConfidential { .. }
    ));
    assert!(matches!(
        route(&harden_mqtt_core::topic_structured("Sensor-01")),
        TopicRoute::Structured { .. }
    ));
}

#[test]
fn troll_does_not_amplify_itself_on_the_bus() {
    let broker = LoopbackBroker::new();
    let troll_client = broker.client();
    let inbox = troll_client.subscribe("#").unwrap();
    let mut troll = TrollMutator::with_rng(1, harden_mqtt_core::rng::derive_rng(b"amplify"));

    broker
        .client()
        .publish(
            "HardenMqtt/Unsecured/Unstructured/Sensor-01/Counter",
            Qos::AtMostOnce,
            false,
            b"100",
        )
        .unwrap();

    // First pass: the original message produces one republication.
    let original = inbox.try_recv().unwrap();
    let republication = troll.handle(&original.topic, &original.payload).unwrap();
    troll_client
        .publish(
            &original.topic,
            Qos::AtMostOnce,
            republication.retain,
            &republication.payload,
        )
        .unwrap();

    // Second pass: the troll's own echo is suppressed, nothing new goes
    // out, and the bus settles.
    let echo = inbox.try_recv().unwrap();
    assert_eq!(echo.payload, republication.payload);
    assert!(troll.handle(&echo.topic, &echo.payload).is_none());
    assert!(inbox.try_recv().is_err());
}

#[test]
fn event_log_is_retained_and_ignored_by_the_troll() {
    let broker = LoopbackBroker::new();
    let client = broker.client();
    let events = harden_mqtt_core::EventLog::new(&client, "Sensor-01");
    events.publish("pairing completed");

    let retained = broker.retained(harden_mqtt_core::TOPIC_EVENTS).unwrap();
    assert_eq!(retained, b"Sensor-01: pairing completed");

    let mut troll = TrollMutator::with_rng(1, harden_mqtt_core::rng::derive_rng(b"events"));
    assert!(troll
        .handle(harden_mqtt_core::TOPIC_EVENTS, &retained)
        .is_none());
}
