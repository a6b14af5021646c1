use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata_themes::{fit, BackgroundModel, Document, EmConfig, TimeInterval, TimePartition};

fn synthetic_partition(n_docs: usize, vocab: usize, words_per_doc: usize, seed: u64) -> TimePartition {
    let mut state = seed;
    let mut next = move |bound: u64| {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        (state >> 33) % bound
    };
    let documents = (0..n_docs)
        .map(|d| {
            let mut counts: HashMap<usize, u32> = HashMap::new();
            // Each document draws from a vocabulary slice, so themes exist.
            let offset = (d % 4) * (vocab / 4);
            for _ in 0..words_per_doc {
                let word = offset + next((vocab / 4) as u64) as usize;
                *counts.entry(word).or_insert(0) += 1;
            }
            Document::new(format!("doc-{d}"), counts)
        })
        .collect();
    TimePartition {
        id: 0,
        interval: TimeInterval { start: 0, end: 604_800 },
        documents,
    }
}

fn uniform_background(vocab: usize) -> BackgroundModel {
    BackgroundModel::new((0..vocab).map(|w| (w, 1.0 / vocab as f64)).collect()).unwrap()
}

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("em_fit");
    group.sample_size(10);

    let partition = synthetic_partition(200, 2000, 150, 42);
    let background = uniform_background(2000);
    let config = EmConfig {
        num_themes: 8,
        max_iterations: 10,
        convergence_eps: 1e-300,
        ..EmConfig::default()
    };

    group.bench_function("200docs_2kvocab_k8", |bencher| {
        bencher.iter(|| fit(black_box(&partition), &background, &config).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_fit);
criterion_main!(benches);
