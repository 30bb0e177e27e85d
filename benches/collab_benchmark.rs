use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use uuid::Uuid;
use vellum_collab::presence::{build_roster, Participant, ParticipantColor, RosterView};
use vellum_collab::protocol::{CursorFrame, Envelope};
use vellum_collab::room::Room;
use vellum_collab::storage::{MemoryStore, SnapshotStore};

fn bench_delta_encode(c: &mut Criterion) {
    let sender = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let payload = vec![0u8; 64]; // typical small change

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let env = Envelope::delta(black_box(sender), black_box(doc), black_box(payload.clone()));
            black_box(env.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let env = Envelope::delta(Uuid::new_v4(), Uuid::new_v4(), vec![0u8; 64]);
    let encoded = env.encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| {
            black_box(Envelope::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let frame = CursorFrame {
        participant_id: Uuid::new_v4(),
        range: vec![0u8; 16],
    };

    c.bench_function("cursor_encode", |b| {
        b.iter(|| {
            black_box(
                Envelope::cursor(
                    black_box(Uuid::new_v4()),
                    black_box(Uuid::new_v4()),
                    black_box(&frame),
                )
                .unwrap(),
            );
        })
    });
}

fn bench_participant_color(c: &mut Criterion) {
    let id = Uuid::new_v4();

    c.bench_function("participant_color_from_uuid", |b| {
        b.iter(|| {
            black_box(ParticipantColor::from_uuid(black_box(id)));
        })
    });
}

fn bench_build_roster_100(c: &mut Criterion) {
    let participants: Vec<Participant> = (0..100)
        .map(|_| Participant::anonymous(Uuid::new_v4()))
        .collect();

    c.bench_function("build_roster_100_members", |b| {
        b.iter(|| {
            black_box(build_roster(black_box(&participants).iter()));
        })
    });
}

fn bench_roster_view_apply(c: &mut Criterion) {
    let participants: Vec<Participant> = (0..100)
        .map(|_| Participant::anonymous(Uuid::new_v4()))
        .collect();
    let roster = build_roster(participants.iter());

    c.bench_function("roster_view_apply_100_members", |b| {
        b.iter(|| {
            let mut view = RosterView::new(Uuid::new_v4());
            view.apply_roster(black_box(&roster));
            black_box(view.len());
        })
    });
}

fn bench_room_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("relay_1000_deltas_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = Room::new(Uuid::new_v4(), 2048);

                let mut receivers = Vec::new();
                let mut sender = Uuid::nil();
                for _ in 0..100 {
                    let p = Participant::anonymous(Uuid::new_v4());
                    sender = p.connection_id;
                    receivers.push(room.add(p).await);
                }

                for i in 0..1000u64 {
                    room.relay_delta(black_box(sender), vec![i as u8; 64]).unwrap();
                }
            });
        })
    });
}

fn bench_memory_store_write(c: &mut Criterion) {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let content = vec![42u8; 4096]; // 4KB page snapshot

    c.bench_function("memory_store_write_4KB", |b| {
        b.iter(|| {
            store
                .write_snapshot(black_box(doc), black_box(&content))
                .unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_cursor_encode,
    bench_participant_color,
    bench_build_roster_100,
    bench_roster_view_apply,
    bench_room_fan_out,
    bench_memory_store_write,
);
criterion_main!(benches);
