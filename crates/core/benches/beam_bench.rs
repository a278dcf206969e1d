//! Criterion benchmarks for beam search.
//!
//! Covers candidate selection, the default processor chain and a full
//! `generate` call against the mock scorer on CPU.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{Device, Tensor};
use mmgen_core::beam::select_top_candidates;
use mmgen_core::logits::LogitsProcessorList;
use mmgen_core::testing::MockScorer;
use mmgen_core::{
    generate, GenerateRequest, GenerationConfig, GenerationOverrides, GenerationParams,
    SourceInputs,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Deterministic cumulative scores, `rows x vocab_size`.
fn make_scores(rows: usize, vocab_size: usize) -> Vec<Vec<f32>> {
    (0..rows)
        .map(|r| {
            (0..vocab_size)
                .map(|i| ((r * vocab_size + i) as f32 * 0.013).sin() * 5.0 - 10.0)
                .collect()
        })
        .collect()
}

fn make_histories(rows: usize, len: usize, vocab_size: usize) -> Vec<Vec<u32>> {
    (0..rows)
        .map(|r| (0..len).map(|i| ((r * 31 + i * 7) % vocab_size) as u32).collect())
        .collect()
}

fn bench_config(num_beams: usize) -> GenerationConfig {
    GenerationConfig {
        eos_token_id: Some(2),
        pad_token_id: Some(1),
        num_beams,
        max_length: 24,
        no_repeat_ngram_size: 3,
        repetition_penalty: 1.2,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_select_top_candidates(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_top_candidates");

    for &num_beams in &[4, 8] {
        for &vocab_size in &[32_000, 50_265] {
            let scores = make_scores(4 * num_beams, vocab_size);
            let label = format!("b4_n{num_beams}_v{vocab_size}");
            group.bench_with_input(BenchmarkId::new("size", &label), &label, |b, _| {
                b.iter(|| select_top_candidates(black_box(&scores), num_beams));
            });
        }
    }
    group.finish();
}

fn bench_processor_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("processor_chain");
    let vocab_size = 32_000;

    for &len in &[8, 64] {
        let params = GenerationParams::resolve(
            &bench_config(4),
            &GenerationOverrides::default(),
            0,
            true,
        )
        .expect("invalid bench config");
        let processors = LogitsProcessorList::from_params(&params, None, None, Vec::new())
            .expect("failed to build processors");
        let histories = make_histories(16, len, vocab_size);
        let scores = make_scores(16, vocab_size);

        group.bench_with_input(BenchmarkId::new("history", len), &len, |b, _| {
            b.iter(|| {
                let mut scores = scores.clone();
                processors.process(black_box(&histories), &mut scores);
                scores
            });
        });
    }
    group.finish();
}

fn bench_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate");
    group.sample_size(20);
    let vocab_size = 512;

    for &num_beams in &[2, 4] {
        let scorer = MockScorer::new(
            vocab_size,
            0,
            Arc::new(move |source, history| {
                let seed = source[0] as usize + history.len();
                (0..vocab_size)
                    .map(|i| (((seed * 17 + i) as f32) * 0.031).sin())
                    .collect()
            }),
        )
        .with_cache();
        let inputs = SourceInputs::new(
            Tensor::new(&[[7u32, 8, 9, 10], [4, 5, 6, 11]], &Device::Cpu)
                .expect("failed to create source tensor"),
        );
        let config = bench_config(num_beams);

        group.bench_with_input(BenchmarkId::new("beams", num_beams), &num_beams, |b, _| {
            b.iter(|| {
                generate(&scorer, black_box(&inputs), &config, GenerateRequest::new())
                    .expect("generate failed")
            });
        });
    }
    group.finish();
}

criterion_group!(
    beam_search,
    bench_select_top_candidates,
    bench_processor_chain,
    bench_generate,
);

criterion_main!(beam_search);
