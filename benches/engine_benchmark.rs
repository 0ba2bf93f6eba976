use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mklight::api::SVMLight;
use mklight::{CombinedKernel, LinearKernel, MklConfig, RbfKernel, SparseVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn clouds(n: usize, seed: u64) -> (Vec<SparseVector>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let y = if i % 2 == 0 { 1.0 } else { -1.0 };
            let x: Vec<f64> = (0..10).map(|_| 0.3 * y + rng.gen_range(-1.0..1.0)).collect();
            (SparseVector::from_dense(&x), y)
        })
        .unzip()
}

fn bench_rbf_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("rbf_rows");
    group.sample_size(10);
    for &n in &[250usize, 1000] {
        let (features, labels) = clouds(n, 7);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let mut svm = SVMLight::new(RbfKernel::new(features.clone(), 0.1).unwrap())
                    .with_threads(1);
                black_box(svm.train(&labels).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_linear_linadd(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear_linadd");
    group.sample_size(10);
    let (features, labels) = clouds(2000, 11);
    for &threads in &[1usize, 4] {
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &t| {
            b.iter(|| {
                let mut svm =
                    SVMLight::new(LinearKernel::new(features.clone()).unwrap()).with_threads(t);
                black_box(svm.train(&labels).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_mkl(c: &mut Criterion) {
    let (features, labels) = clouds(300, 3);
    c.bench_function("mkl_linear_rbf", |b| {
        b.iter(|| {
            let kernel = CombinedKernel::new(vec![
                Box::new(LinearKernel::new(features.clone()).unwrap()),
                Box::new(RbfKernel::new(features.clone(), 0.1).unwrap()),
            ])
            .unwrap();
            let mut svm = SVMLight::new(kernel).with_mkl(MklConfig::default());
            black_box(svm.train(&labels).unwrap())
        })
    });
}

criterion_group!(benches, bench_rbf_rows, bench_linear_linadd, bench_mkl);
criterion_main!(benches);
