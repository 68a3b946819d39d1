//! Wire codec and broadcast benchmarks
//!
//! Covers:
//! - encode/decode of findAll responses in text and binary mode
//! - tx submission through a full pipeline
//! - broadcast compaction of large batches
//!
//! Run: cargo bench --bench codec_bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use serde_json::{json, Map};

use txsync::codec::{decode_response, encode_response, ReqId};
use txsync::middleware::Identity;
use txsync::model::core::class_def;
use txsync::model::{classes, AccountRole, FindResult, TxFactory};
use txsync::pipeline::SessionContext;
use txsync::session::compact_broadcast;
use txsync::workspace_manager::{WorkspaceManager, WorkspaceOptions};
use txsync::{Doc, Response, Tx};

const TASK: &str = "task:class:Task";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_docs(count: usize) -> Vec<Doc> {
    (0..count)
        .map(|i| {
            let mut doc = Doc::new(&format!("task-{}", i), TASK, &format!("space-{}", i % 10));
            doc.set("title", json!(format!("Task number {}", i)));
            doc.set("rank", json!(i));
            doc
        })
        .collect()
}

fn find_response(count: usize) -> Response {
    let result = FindResult::new(make_docs(count), count as i64);
    Response::ok(Some(ReqId::Num(1)), serde_json::to_value(result).unwrap())
}

fn make_txes(count: usize) -> Vec<Tx> {
    let factory = TxFactory::new("alice");
    (0..count)
        .map(|i| factory.create_doc(TASK, "space-1", &format!("t{}", i), Map::new()))
        .collect()
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_find_response");

    for size in [10, 1000, 10000] {
        let response = find_response(size);
        for (mode, binary) in [("text", false), ("binary", true)] {
            group.bench_with_input(BenchmarkId::new(mode, size), &response, |b, response| {
                b.iter(|| encode_response(black_box(response), binary).unwrap());
            });
        }
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_find_response");

    for size in [10, 1000, 10000] {
        let response = find_response(size);
        for (mode, binary) in [("text", false), ("binary", true)] {
            let bytes = encode_response(&response, binary).unwrap();
            group.bench_with_input(BenchmarkId::new(mode, size), &bytes, |b, bytes| {
                b.iter(|| decode_response(black_box(bytes), binary).unwrap());
            });
        }
    }

    group.finish();
}

fn bench_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_submit");

    for size in [100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let manager = WorkspaceManager::new(WorkspaceOptions::default());
                    let ws = manager
                        .create_workspace("bench", vec![class_def(TASK, Some(classes::DOC), Some("task"))])
                        .unwrap();
                    (manager, ws, make_txes(size))
                },
                |(_manager, ws, txes)| {
                    let pipeline = ws.pipeline();
                    let mut ctx = SessionContext::new("bench", Identity::new("alice", AccountRole::User));
                    for tx in &txes {
                        black_box(pipeline.submit(&mut ctx, tx).unwrap());
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact_broadcast");

    for size in [9_999, 10_001, 50_000] {
        let txes = Arc::new(make_txes(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &txes, |b, txes| {
            b.iter_batched(
                || txes.as_ref().clone(),
                |batch| compact_broadcast(black_box(batch), 10_000),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_submit, bench_compaction);
criterion_main!(benches);
