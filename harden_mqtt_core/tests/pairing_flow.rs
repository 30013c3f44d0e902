//! End-to-end pairing scenarios over the loopback bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use harden_mqtt_core::settings::{KEY_PAIR_ID, KEY_PAIR_PUBLIC};
use harden_mqtt_core::{
    CancellationToken, DeviceIdentity, IndexSelector, LoopbackBroker, MemorySettings,
    PairingEngine, PairingOutcome, PairingRole, PeerBinding, SettingsStore,
};

const FIRST: Duration = Duration::from_millis(10);
const REPUBLISH: Duration = Duration::from_millis(40);
const POLL: Duration = Duration::from_millis(5);

fn master_identity() -> DeviceIdentity {
    DeviceIdentity::from_scalar([21; 32], "Sensor-01", "Sensor")
}

fn slave_identity() -> DeviceIdentity {
    DeviceIdentity::from_scalar([22; 32], "Display-01", "Display")
}

/// Runs both roles to completion with a watchdog that cancels the session
/// instead of letting a broken protocol hang the suite.
fn pair_both(
    broker: &LoopbackBroker,
    master: &DeviceIdentity,
    slave: &DeviceIdentity,
    slave_master_type: &str,
    watchdog: Duration,
) -> (PairingOutcome, PairingOutcome) {
    let master_client = broker.client();
    let slave_client = broker.client();
    let master_engine =
        PairingEngine::new(&master_client, master, "Display").with_timing(FIRST, REPUBLISH, POLL);
    let slave_engine = PairingEngine::new(&slave_client, slave, slave_master_type)
        .with_timing(FIRST, REPUBLISH, POLL);
    let cancel = CancellationToken::new();
    let done = Arc::new(AtomicBool::new(false));

    thread::scope(|scope| {
        let master_cancel = cancel.clone();
        let master_handle = scope.spawn(move || {
            master_engine.pair(
                &[0u8; 32],
                PairingRole::Master,
                Arc::new(IndexSelector(1)),
                &master_cancel,
            )
        });
        let slave_cancel = cancel.clone();
        let slave_handle = scope.spawn(move || {
            slave_engine.pair(
                &[],
                PairingRole::Slave,
                Arc::new(IndexSelector(1)),
                &slave_cancel,
            )
        });
        {
            let cancel = cancel.clone();
            let done = Arc::clone(&done);
            scope.spawn(move || {
                let deadline = Instant::now() + watchdog;
                while !done.load(Ordering::SeqCst) && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
                cancel.cancel();
            });
        }
        let master_outcome = master_handle.join().expect("master thread").expect("master");
        let slave_outcome = slave_handle.join().expect("slave thread").expect("slave");
        done.store(true, Ordering::SeqCst);
        (master_outcome, slave_outcome)
    })
}

#[test]
fn happy_path_pairing_binds_both_sides() {
    let broker = LoopbackBroker::new();
    let master = master_identity();
    let slave = slave_identity();
    let (master_outcome, slave_outcome) =
        pair_both(&broker, &master, &slave, "Sensor", Duration::from_secs(20));

    let PairingOutcome::Paired(master_binding) = master_outcome else {
        panic!("master did not pair");
    };
    let PairingOutcome::Paired(slave_binding) = slave_outcome else {
        panic!("slave did not pair");
    };
    assert_eq!(master_binding.device_id, "Display-01");
    assert_eq!(master_binding.public_key, slave.public_key());
    assert_eq!(slave_binding.device_id, "Sensor-01");
    assert_eq!(slave_binding.public_key, master.public_key());

    // Both sides persist the peer under the well-known settings keys.
    let master_store = MemorySettings::new();
    master_binding.persist(&master_store).unwrap();
    assert_eq!(
        master_store.get(KEY_PAIR_PUBLIC).as_deref(),
        Some(slave.public_base64().as_str())
    );
    assert_eq!(master_store.get(KEY_PAIR_ID).as_deref(), Some("Display-01"));
}

#[test]
fn pairing_completes_under_fifty_percent_loss() {
    let broker = LoopbackBroker::with_loss(0.5, b"pairing-loss-seed");
    let master = master_identity();
    let slave = slave_identity();
    let (master_outcome, slave_outcome) =
        pair_both(&broker, &master, &slave, "Sensor", Duration::from_secs(30));

    assert!(matches!(master_outcome, PairingOutcome::Paired(_)));
    assert!(matches!(slave_outcome, PairingOutcome::Paired(_)));
}

#[test]
fn slave_refuses_wrong_master_type() {
    // The slave expects a "Thermostat" master; the real master announces
    // as "Sensor". Even with valid signatures nothing can complete.
    let broker = LoopbackBroker::new();
    let master = master_identity();
    let slave = slave_identity();
    let (master_outcome, slave_outcome) = pair_both(
        &broker,
        &master,
        &slave,
        "Thermostat",
        Duration::from_secs(2),
    );

    assert!(matches!(master_outcome, PairingOutcome::Cancelled));
    assert!(matches!(slave_outcome, PairingOutcome::Cancelled));
}

#[test]
fn cancellation_returns_without_binding() {
    let broker = LoopbackBroker::new();
    let master = master_identity();
    let client = broker.client();
    let engine = PairingEngine::new(&client, &master, "Display").with_timing(FIRST, REPUBLISH, POLL);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = engine
        .pair(
            &[0u8; 32],
            PairingRole::Master,
            Arc::new(IndexSelector(1)),
            &cancel,
        )
        .unwrap();
    assert!(matches!(outcome, PairingOutcome::Cancelled));
}

#[test]
fn repersisting_the_final_binding_is_idempotent() {
    let slave = slave_identity();
    let binding = PeerBinding {
        public_key: slave.public_key(),
        device_id: "Display-01".into(),
    };
    let store = MemorySettings::new();
    binding.persist(&store).unwrap();
    let first_key = store.get(KEY_PAIR_PUBLIC);
    let first_id = store.get(KEY_PAIR_ID);
    // Applying the same completed record again changes nothing.
    binding.persist(&store).unwrap();
    assert_eq!(store.get(KEY_PAIR_PUBLIC), first_key);
    assert_eq!(store.get(KEY_PAIR_ID), first_id);
    assert_eq!(PeerBinding::load(&store).unwrap().unwrap(), binding);
}
