//! Benchmark for waiter rule evaluation
//!
//! Every poll runs path extraction and rule matching over the response, so
//! both should stay well under the cost of the remote call.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use snapshot_migrator::waiter::{ExtractPath, Matcher, RuleSet};
use snapshot_migrator::RemoteError;
use std::time::Duration;

fn snapshots(count: usize, status: &str) -> Value {
    let items: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "DBClusterSnapshotIdentifier": format!("events-{:04}", i),
                "Status": status,
                "PercentProgress": 100,
            })
        })
        .collect();
    json!({ "DBClusterSnapshots": items })
}

fn snapshot_rules() -> RuleSet {
    RuleSet::new("ClusterSnapshotAvailable", Duration::from_secs(30), 60)
        .success(Matcher::all("DBClusterSnapshots[].Status", "available"))
        .failure(Matcher::any("DBClusterSnapshots[].Status", "failed"))
        .failure(Matcher::any("DBClusterSnapshots[].Status", "deleted"))
        .failure(Matcher::error("DBClusterSnapshotNotFoundFault"))
}

fn bench_path_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_path");

    let path = ExtractPath::parse("DBClusterSnapshots[].Status").unwrap();
    for count in [1usize, 16, 256] {
        let response = snapshots(count, "available");
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("projection", count), &response, |b, response| {
            b.iter(|| path.evaluate_strings(black_box(response)));
        });
    }

    group.bench_function("parse", |b| {
        b.iter(|| ExtractPath::parse(black_box("TaskExecution.Result.ErrorDetail")));
    });

    group.finish();
}

fn bench_rule_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_set");
    group.throughput(Throughput::Elements(1));

    let rules = snapshot_rules();

    let settled: Result<Value, RemoteError> = Ok(snapshots(4, "available"));
    group.bench_function("success_match", |b| {
        b.iter(|| rules.evaluate(black_box(&settled), None));
    });

    // walks every rule before falling through to "keep polling"
    let pending: Result<Value, RemoteError> = Ok(snapshots(4, "creating"));
    group.bench_function("no_match", |b| {
        b.iter(|| rules.evaluate(black_box(&pending), None));
    });

    let missing: Result<Value, RemoteError> = Err(RemoteError::new(
        "DBClusterSnapshotNotFoundFault",
        "snapshot not found",
    ));
    group.bench_function("error_code_match", |b| {
        b.iter(|| rules.evaluate(black_box(&missing), None));
    });

    group.finish();
}

criterion_group!(benches, bench_path_extraction, bench_rule_matching);
criterion_main!(benches);
