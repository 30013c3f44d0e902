use criterion::{black_box, criterion_group, criterion_main, Criterion};
use harden_mqtt_core::{
    decrypt_frame, derive_channel_key, encrypt_frame, render_payload, sign_fields_at,
    verify_signed_payload, DeviceIdentity, InteroperableField, PairingRecord, SensorReading,
};
use time::macros::datetime;

fn sample_reading() -> SensorReading {
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
        wind_speed_mps: Some(3.4),
        description: Some("clear".into()),
    }
}

fn sample_fields() -> Vec<InteroperableField> {
    sample_reading().interoperable_fields()
}

fn bench_canonical(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonical");
    let fields = sample_fields();
    group.bench_function("render-interoperable", |b| {
        b.iter(|| render_payload(black_box(&fields)))
    });
    let record = PairingRecord {
        nonce: Some("AAAA".into()),
        master_public_key: Some("m-key".into()),
        master_id: Some("Sensor-01".into()),
        master_type: Some("Sensor".into()),
        slave_public_key: Some("s-key".into()),
        slave_id: Some("Display-01".into()),
        slave_type: Some("Display".into()),
        ..PairingRecord::default()
    };
    group.bench_function("render-pairing", |b| {
        b.iter(|| black_box(&record).canonical_bytes())
    });
    group.finish();
}

fn bench_signing(c: &mut Criterion) {
    let mut group = c.benchmark_group("signing");
    let identity = DeviceIdentity::from_scalar([41; 32], "Sensor-01", "Sensor");
    let fields = sample_fields();
    let signed_at = datetime!(2026-08-02 07:00:06 UTC);
    group.bench_function("sign", |b| {
        b.iter(|| sign_fields_at(black_box(&fields), &identity, signed_at).unwrap())
    });
    let signed = sign_fields_at(&fields, &identity, signed_at).unwrap();
    let public = identity.public_key();
    group.bench_function("verify", |b| {
        b.iter(|| verify_signed_payload(black_box(&signed), &public).unwrap())
    });
    group.finish();
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");
    let sensor = DeviceIdentity::from_scalar([42; 32], "Sensor-01", "Sensor");
    let display = DeviceIdentity::from_scalar([43; 32], "Display-01", "Display");
    let key = derive_channel_key(&sensor, &display.public_key()).unwrap();
    let signed = sign_fields_at(
        &sample_fields(),
        &sensor,
        datetime!(2026-08-02 07:00:06 UTC),
    )
    .unwrap();
    group.bench_function("derive-key", |b| {
        b.iter(|| derive_channel_key(&sensor, &display.public_key()).unwrap())
    });
    group.bench_function("encrypt", |b| {
        b.iter(|| encrypt_frame(black_box(&signed), &key))
    });
    let frame = encrypt_frame(&signed, &key);
    group.bench_function("decrypt", |b| {
        b.iter(|| decrypt_frame(black_box(&frame), &key).unwrap())
    });
    group.finish();
}

fn bench_troll(c: &mut Criterion) {
    let mut group = c.benchmark_group("troll");
    let interoperable = render_payload(&sample_fields());
    group.bench_function("classify-xml", |b| {
        b.iter(|| harden_mqtt_core::classify(black_box(&interoperable)))
    });
    group.bench_function("classify-integer", |b| {
        b.iter(|| harden_mqtt_core::classify(black_box(b"100")))
    });
    group.finish();
}

criterion_group!(benches, bench_canonical, bench_signing, bench_frames, bench_troll);
criterion_main!(benches);
