//! Encode/decode cost for the two wire formats (C2), run against a
//! representative `Event` envelope of the size typically seen on
//! `events.*` subjects.

use beacon_core::{Event, WireFormat};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::collections::BTreeMap;

fn sample_event() -> Event {
    let mut payload = BTreeMap::new();
    for i in 0..16 {
        payload.insert(format!("field_{i}"), serde_json::json!(i * 7));
    }
    Event::new("bench-instance", "orders", "created", "1.0.0", payload)
}

fn bench_binary_round_trip(c: &mut Criterion) {
    let event = sample_event();
    c.bench_function("serialize_binary_encode", |b| {
        b.iter(|| black_box(beacon_core::serialization::encode(&event, WireFormat::Binary).unwrap()))
    });

    let bytes = beacon_core::serialization::encode(&event, WireFormat::Binary).unwrap();
    c.bench_function("serialize_binary_decode", |b| {
        b.iter(|| black_box(beacon_core::serialization::decode::<Event>(&bytes).unwrap()))
    });
}

fn bench_text_round_trip(c: &mut Criterion) {
    let event = sample_event();
    c.bench_function("serialize_text_encode", |b| {
        b.iter(|| black_box(beacon_core::serialization::encode(&event, WireFormat::Text).unwrap()))
    });

    let bytes = beacon_core::serialization::encode(&event, WireFormat::Text).unwrap();
    c.bench_function("serialize_text_decode", |b| {
        b.iter(|| black_box(beacon_core::serialization::decode::<Event>(&bytes).unwrap()))
    });
}

fn bench_format_detection(c: &mut Criterion) {
    let event = sample_event();
    let binary = beacon_core::serialization::encode(&event, WireFormat::Binary).unwrap();
    c.bench_function("serialize_is_binary_detect", |b| {
        b.iter(|| black_box(beacon_core::serialization::is_binary(&binary)))
    });
}

criterion_group!(
    serialization_benches,
    bench_binary_round_trip,
    bench_text_round_trip,
    bench_format_detection
);
criterion_main!(serialization_benches);
