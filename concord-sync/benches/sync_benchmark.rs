use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use concord_sync::command::{apply, Command, ListStore};
use concord_sync::crdt::{Anchor, Rga};
use concord_sync::envelope::{ClientMessage, DocCmdBody, ServerMessage, Timestamper};

fn filled_rga(n: usize) -> Rga {
    let mut rga = Rga::new("bench");
    for i in 0..n {
        let after = rga.last_id();
        rga.insert(after, json!(i), None).unwrap();
    }
    rga
}

fn bench_linearize(c: &mut Criterion) {
    let mut group = c.benchmark_group("rga_to_array");
    for n in [100usize, 1_000, 10_000] {
        let rga = filled_rga(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &rga, |b, rga| {
            b.iter(|| black_box(rga.to_array()));
        });
    }
    group.finish();
}

fn bench_concurrent_inserts(c: &mut Criterion) {
    c.bench_function("rga_100_actors_at_root", |b| {
        b.iter(|| {
            let mut rga = Rga::new("local");
            for actor in 0..100u64 {
                let id = format!("{actor}:actor{actor}").parse().unwrap();
                rga.insert(Anchor::Root, json!(actor), Some(id)).unwrap();
            }
            black_box(rga.to_array());
        })
    });
}

fn bench_command_parse(c: &mut Criterion) {
    let args: Vec<String> = ["lins", "doc", "todo", "41:alice", "42:bob", "{\"title\":\"milk\"}"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    c.bench_function("command_parse_lins", |b| {
        b.iter(|| black_box(Command::parse(black_box(&args)).unwrap()))
    });
}

fn bench_remote_apply(c: &mut Criterion) {
    let cmds: Vec<Command> = (0..1_000)
        .map(|i| {
            let after = if i == 0 {
                "root".to_string()
            } else {
                format!("{}:peer", i - 1)
            };
            let args: Vec<String> = vec![
                "lins".into(),
                "doc".into(),
                "todo".into(),
                after,
                format!("{i}:peer"),
                i.to_string(),
            ];
            Command::parse(&args).unwrap()
        })
        .collect();

    c.bench_function("apply_1k_remote_inserts", |b| {
        b.iter(|| {
            let mut store = ListStore::new("doc", "todo", "local");
            for cmd in &cmds {
                apply(&mut store, cmd).unwrap();
            }
            black_box(store.len());
        })
    });
}

fn bench_envelope(c: &mut Criterion) {
    let msg = ClientMessage::DocCmd(DocCmdBody {
        room: "room-1".into(),
        args: vec!["mput".into(), "doc".into(), "prefs".into(), "theme".into(), "\"dark\"".into()],
    });
    let mut stamper = Timestamper::new();

    c.bench_function("envelope_encode_doc_cmd", |b| {
        b.iter(|| black_box(msg.encode(&stamper.stamp()).unwrap()))
    });

    let inbound = r#"{"type":"doc:fwd","ver":0,"body":{"from":"bob","room":"room-1","args":["ldel","doc","todo","3:bob"],"vs":"AAAAAAAAAAEAAA=="}}"#;
    c.bench_function("envelope_decode_doc_fwd", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(inbound)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_linearize,
    bench_concurrent_inserts,
    bench_command_parse,
    bench_remote_apply,
    bench_envelope,
);
criterion_main!(benches);
