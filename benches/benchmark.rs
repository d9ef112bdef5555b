use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use price_lens::{Config, PriceExtractor, PriceStatistics, SearchRequest};
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

/// OCR-like text with `listings` price lines and some noise between them.
fn sample_text(listings: usize) -> String {
    (0..listings)
        .map(|i| {
            format!(
                "Listing {i} 128GB Black\n*****  ({i} reviews)\nR {},{:03}.{:02}\nAdd to cart\n",
                1 + i % 9,
                (i * 37) % 1000,
                i % 100
            )
        })
        .collect()
}

fn benchmark_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("extraction");
    configure_fast_group(&mut group);

    let extractor = PriceExtractor::new("R").unwrap();
    for listings in [10, 100, 1000] {
        let text = sample_text(listings);
        group.bench_with_input(BenchmarkId::from_parameter(listings), &text, |b, text| {
            b.iter(|| black_box(extractor.extract(black_box(text))));
        });
    }

    group.finish();
}

fn benchmark_statistics(c: &mut Criterion) {
    let mut group = c.benchmark_group("statistics");
    configure_fast_group(&mut group);

    for count in [10, 1000] {
        let prices: Vec<f64> = (0..count).map(|i| ((i * 7919) % 10_000) as f64 + 0.99).collect();
        group.bench_with_input(BenchmarkId::from_parameter(count), &prices, |b, prices| {
            b.iter(|| black_box(PriceStatistics::from_prices(black_box(prices))));
        });
    }

    group.finish();
}

fn benchmark_request_preparation(c: &mut Criterion) {
    let mut group = c.benchmark_group("request");
    configure_fast_group(&mut group);

    let config = Config::default();

    group.bench_function("validate_term", |b| {
        b.iter(|| black_box(SearchRequest::new(black_box("  air fryer  "))));
    });

    group.bench_function("search_url", |b| {
        b.iter(|| black_box(config.site.search_url(black_box("4k tv & soundbar"))));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_extraction,
    benchmark_statistics,
    benchmark_request_preparation
);
criterion_main!(benches);
