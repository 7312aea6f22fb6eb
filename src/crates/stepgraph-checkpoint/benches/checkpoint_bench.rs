use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use stepgraph_checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointSource, CheckpointStore, InMemoryCheckpointStore,
    PendingWork, StateSnapshot, SuperstepFrontier,
};

fn sample_checkpoint(lineage: &str) -> Checkpoint {
    let mut snapshot = StateSnapshot::new();
    for i in 0..32 {
        snapshot.insert(format!("field_{}", i), json!({"value": i, "tags": ["a", "b"]}));
    }

    Checkpoint::new(
        lineage,
        None,
        snapshot,
        PendingWork::Superstep(SuperstepFrontier {
            step: 3,
            planned: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        }),
        CheckpointMetadata::new(CheckpointSource::Step, 3),
    )
}

fn checkpoint_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryCheckpointStore::new();

    c.bench_function("checkpoint save", |b| {
        b.iter(|| {
            runtime.block_on(async {
                store
                    .save(black_box(sample_checkpoint("bench-lineage")))
                    .await
                    .unwrap();
            })
        });
    });
}

fn checkpoint_load_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryCheckpointStore::new();
    let id = runtime
        .block_on(store.save(sample_checkpoint("bench-lineage")))
        .unwrap();

    c.bench_function("checkpoint load", |b| {
        b.iter(|| {
            runtime.block_on(async {
                store.load("bench-lineage", black_box(&id)).await.unwrap();
            })
        });
    });
}

criterion_group!(benches, checkpoint_save_benchmark, checkpoint_load_benchmark);
criterion_main!(benches);
