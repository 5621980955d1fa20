use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quill_collab::awareness::{CursorRange, PresenceState, PresenceUpdate};
use quill_collab::broadcast::BroadcastGroup;
use quill_collab::document::{MergeableDocument, TextDocument};
use quill_collab::protocol::{Command, Event};
use std::sync::Arc;
use uuid::Uuid;

fn bench_command_encode(c: &mut Criterion) {
    let note = Uuid::new_v4();
    let payload = vec![0u8; 64]; // Typical small fragment

    c.bench_function("command_encode_64B", |b| {
        b.iter(|| {
            let command = Command::UpdateFragment {
                note_id: black_box(note),
                payload: black_box(payload.clone()),
            };
            black_box(command.encode().unwrap());
        })
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let event = Event::UpdateFragment {
        note_id: Uuid::new_v4(),
        connection_id: Uuid::new_v4(),
        payload: vec![0u8; 64],
    };
    let encoded = event.encode().unwrap();

    c.bench_function("event_decode_64B", |b| {
        b.iter(|| {
            black_box(Event::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_presence_encode(c: &mut Criterion) {
    let update = PresenceUpdate {
        clock: 42,
        state: Some(PresenceState {
            user_id: Uuid::new_v4(),
            name: "Bench".into(),
            cursor: Some(CursorRange::caret(128)),
        }),
    };

    c.bench_function("presence_encode", |b| {
        b.iter(|| {
            black_box(black_box(&update).encode().unwrap());
        })
    });
}

fn bench_fragment_apply(c: &mut Criterion) {
    // One writer produces a small edit; receivers merge it.
    let mut writer = TextDocument::new();
    writer.append_content("collaborative note-taking at speed");
    let fragment = writer.append_content(" and more");

    c.bench_function("fragment_apply", |b| {
        b.iter_batched(
            TextDocument::new,
            |mut doc| {
                black_box(doc.apply_fragment(black_box(&fragment)).unwrap());
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let mut doc = TextDocument::new();
    doc.set_title("Benchmark note");
    for _ in 0..100 {
        doc.append_content("The quick brown fox jumps over the lazy dog. ");
    }

    c.bench_function("snapshot_encode_4KB", |b| {
        b.iter(|| {
            black_box(doc.encode_snapshot());
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    // Keep receivers alive so publishes fan out to them.
    let _receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let data = Arc::new(vec![0u8; 64]);

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            black_box(group.publish(black_box(data.clone())));
        })
    });
}

criterion_group!(
    benches,
    bench_command_encode,
    bench_event_decode,
    bench_presence_encode,
    bench_fragment_apply,
    bench_snapshot_encode,
    bench_broadcast_fan_out,
);
criterion_main!(benches);
