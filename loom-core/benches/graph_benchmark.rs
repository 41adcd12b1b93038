use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use loom_core::{DocumentPayload, NodeKind, Snapshot};

fn build_payload(nodes: usize) -> DocumentPayload {
    let mut payload = DocumentPayload::new();
    let mut previous: Option<String> = None;
    for i in 0..nodes {
        let kind = NodeKind::ALL[i % NodeKind::ALL.len()];
        let id = payload.add_node(kind, None, None);
        if let Some(prev) = previous {
            payload.connect(&prev, &id, None, None).unwrap();
        }
        previous = Some(id);
    }
    payload
}

fn bench_change_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("Change Detection");
    group.throughput(Throughput::Elements(1));

    let payload = build_payload(200);
    let baseline = Snapshot::of(&payload);
    let mut churned = payload.clone();
    for node in churned.nodes.iter_mut() {
        node.selected = true;
    }

    group.bench_function("snapshot_200_nodes", |b| {
        b.iter(|| black_box(Snapshot::of(black_box(&payload))))
    });

    group.bench_function("compare_ui_churn_200_nodes", |b| {
        b.iter(|| black_box(baseline.differs_from(black_box(&churned))))
    });

    group.finish();
}

fn bench_graph_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("Graph Operations");

    group.bench_function("add_node_spiral", |b| {
        let mut payload = build_payload(100);
        b.iter(|| {
            let id = payload.add_node(black_box(NodeKind::Agent), None, None);
            payload.delete_node(&id);
        })
    });

    group.bench_function("duplicate_payload_fresh_ids_200", |b| {
        let payload = build_payload(200);
        b.iter(|| black_box(payload.with_fresh_ids()))
    });

    group.finish();
}

criterion_group!(benches, bench_change_detection, bench_graph_ops);
criterion_main!(benches);
