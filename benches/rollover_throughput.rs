//! Rollover hot path benchmark: policy checks, segment appends and sealing

use shardlog::chunk::{content_hash, decode_segment, IndexWriter, LogMessage, SegmentWriter};
use shardlog::rollover::{RolloverPolicy, RolloverStats};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::time::Duration;

fn create_messages(count: usize) -> Vec<LogMessage> {
    (0..count)
        .map(|i| LogMessage {
            id: format!("msg-{:08}", i),
            timestamp_ms: 1_705_323_600_000 + i as i64,
            source: match i % 3 {
                0 => "api-gateway".to_string(),
                1 => "auth-service".to_string(),
                _ => "order-service".to_string(),
            },
            body: serde_json::json!({
                "level": if i % 10 == 0 { "error" } else { "info" },
                "message": format!("request {} handled", i),
                "latency_ms": i % 250,
            }),
        })
        .collect()
}

fn benchmark_policy_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollover_policy");
    let policies = [
        ("disk_or_count", RolloverPolicy::disk_or_message_count(1 << 30, 5_000_000)),
        (
            "disk_count_or_age",
            RolloverPolicy::DiskMessageCountOrAge {
                max_bytes: 1 << 30,
                max_messages: 5_000_000,
                max_age: Duration::from_secs(600),
            },
        ),
    ];

    for (name, policy) in policies {
        group.throughput(Throughput::Elements(10_000));
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut stats = RolloverStats::default();
                for _ in 0..10_000 {
                    stats.record(black_box(512));
                    black_box(policy.should_rollover_stats(&stats, Duration::from_secs(1)));
                }
            });
        });
    }

    group.finish();
}

fn benchmark_segment_append(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("segment_append");

    for count in [1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        let messages = create_messages(count);

        group.bench_function(format!("{}_messages", count), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let dir = tempfile::TempDir::new().unwrap();
                    let mut writer = SegmentWriter::create(dir.path().join("segment.log"))
                        .await
                        .unwrap();
                    for message in &messages {
                        writer.append(message).await.unwrap();
                    }
                    black_box(writer.seal().await.unwrap());
                })
            });
        });
    }

    group.finish();
}

fn benchmark_verify_sealed(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("verify_sealed");

    let dir = tempfile::TempDir::new().unwrap();
    let sealed = rt.block_on(async {
        let mut writer = SegmentWriter::create(dir.path().join("segment.log"))
            .await
            .unwrap();
        for message in &create_messages(10_000) {
            writer.append(message).await.unwrap();
        }
        writer.seal().await.unwrap()
    });

    group.throughput(Throughput::Bytes(sealed.size_bytes));
    group.bench_function("hash_and_decode_10000", |b| {
        b.iter(|| {
            black_box(content_hash(&sealed.bytes));
            black_box(decode_segment(&sealed.bytes).unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_policy_check,
    benchmark_segment_append,
    benchmark_verify_sealed,
);

criterion_main!(benches);
