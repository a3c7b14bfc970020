use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hyper::Method;
use recproxy::matcher::RecordMatcher;
use recproxy::model::RecordEntry;

fn entry(index: usize) -> RecordEntry {
    let mut entry = RecordEntry::new(
        Method::PUT,
        format!("https://account.blob.core.windows.net/container/blob{index}?comp=block&timeout=30"),
    );
    entry.request.headers.set("Content-Type", "application/json");
    entry.request.headers.set("x-ms-date", "Mon, 01 Jan 2024 00:00:00 GMT");
    entry.request.headers.set("x-ms-version", "2023-11-03");
    entry.request.body = Some(format!(r#"{{"name":"blob{index}","size":{index},"tags":["a","b"]}}"#).into_bytes());
    entry.status_code = 201;
    entry
}

fn bench_find_match_pool_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_match");
    let matcher = RecordMatcher::default();

    for size in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let pool: Vec<RecordEntry> = (0..size).map(entry).collect();
            let request = entry(size - 1);

            b.iter(|| matcher.find_match(black_box(&request), black_box(&pool)));
        });
    }

    group.finish();
}

fn bench_mismatch_diagnostic(c: &mut Criterion) {
    let matcher = RecordMatcher::default();
    let pool: Vec<RecordEntry> = (0..100).map(entry).collect();
    let request = entry(1_000);

    c.bench_function("mismatch_diagnostic", |b| {
        b.iter(|| matcher.find_match(black_box(&request), black_box(&pool)));
    });
}

criterion_group!(benches, bench_find_match_pool_sizes, bench_mismatch_diagnostic);
criterion_main!(benches);
