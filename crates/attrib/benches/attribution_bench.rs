//! Benchmarks for attribution map computation.
//!
//! Run with: cargo bench --bench attribution_bench

use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{ArrayD, IxDyn};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use attrib::prelude::*;

type BenchBackend = Autodiff<NdArray>;

/// Create a random image batch for benchmarking.
fn create_images(batch: usize, size: usize) -> ArrayD<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    ArrayD::from_shape_fn(IxDyn(&[batch, size, size, 3]), |_| rng.gen::<f32>())
}

fn create_model(size: usize) -> ConvNet<BenchBackend> {
    ConvNetConfig::new(size, size, 3, 10)
        .with_filters(vec![16, 32])
        .init::<BenchBackend>(&Default::default())
        .expect("valid config")
}

fn bench_saliency(c: &mut Criterion) {
    let mut group = c.benchmark_group("saliency");
    group.sample_size(10);

    for size in [16, 32] {
        let saliency = Saliency::new(create_model(size));
        let x = create_images(4, size);

        group.bench_with_input(BenchmarkId::new("vanilla", size), &x, |b, x| {
            let config = SaliencyConfig::default();
            b.iter(|| {
                saliency
                    .compute(Score::categorical(0), black_box(x.clone()), &config)
                    .expect("saliency")
            })
        });

        group.bench_with_input(BenchmarkId::new("smoothgrad_8", size), &x, |b, x| {
            let config = SaliencyConfig::default()
                .with_smoothing(8, 0.2)
                .with_seed(Seed::new(1));
            b.iter(|| {
                saliency
                    .compute(Score::categorical(0), black_box(x.clone()), &config)
                    .expect("smoothgrad")
            })
        });
    }

    group.finish();
}

fn bench_gradcam(c: &mut Criterion) {
    let mut group = c.benchmark_group("gradcam");
    group.sample_size(10);

    for size in [16, 32] {
        let model = create_model(size);
        let x = create_images(4, size);
        let config = GradcamConfig::default();

        let gradcam = Gradcam::new(model.clone());
        group.bench_with_input(BenchmarkId::new("gradcam", size), &x, |b, x| {
            b.iter(|| {
                gradcam
                    .compute(Score::categorical(0), black_box(x.clone()), &config)
                    .expect("gradcam")
            })
        });

        let plus = GradcamPlusPlus::new(model);
        group.bench_with_input(BenchmarkId::new("gradcam_plus_plus", size), &x, |b, x| {
            b.iter(|| {
                plus.compute(Score::categorical(0), black_box(x.clone()), &config)
                    .expect("gradcam++")
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_saliency, bench_gradcam);
criterion_main!(benches);
