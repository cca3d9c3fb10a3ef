use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use hic_calibrate::design::{DesignTable, Parameter, ParameterSpace};
use hic_calibrate::emulator::{EmulatorConfig, MultiGpEmulator};
use hic_calibrate::gp::TrainingOptions;
use hic_calibrate::observables::{FeatureScale, TrainingMatrix};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const FEATURES: usize = 24;

fn model(p: ArrayView1<f64>) -> Array1<f64> {
    Array1::from_shape_fn(FEATURES, |k| {
        let t = k as f64 / FEATURES as f64;
        (1.0 + p[0]) * (-t * p[1]).exp() + p[2] * t * t
    })
}

fn space() -> ParameterSpace {
    ParameterSpace::new(vec![
        Parameter::new("norm", 0.5, 2.0),
        Parameter::new("slope", 0.0, 3.0),
        Parameter::new("curve", -1.0, 1.0),
    ])
    .unwrap()
}

fn random_points(space: &ParameterSpace, n: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let lower = space.lower();
    let upper = space.upper();
    Array2::from_shape_fn((n, space.dim()), |(_, j)| {
        rng.gen_range(lower[j]..upper[j])
    })
}

fn trained_emulator(n_design: usize) -> MultiGpEmulator {
    let space = space();
    let points = random_points(&space, n_design, 0x5EED);
    let mut y = Array2::zeros((n_design, FEATURES));
    for (i, row) in points.rows().into_iter().enumerate() {
        y.row_mut(i).assign(&model(row));
    }
    let design = DesignTable::new(space, points).unwrap();
    let training = TrainingMatrix::new(y.view(), FeatureScale::identity()).unwrap();
    let config = EmulatorConfig {
        npc: 4,
        training: TrainingOptions {
            nstarts: 2,
            max_iterations: 50,
            ..TrainingOptions::default()
        },
        ..EmulatorConfig::default()
    };
    MultiGpEmulator::train(&training, &design, &config).unwrap()
}

fn benchmark_predict(c: &mut Criterion) {
    let sizes = [50_usize, 100, 200];
    let emulators: Vec<_> = sizes
        .iter()
        .map(|&size| (size, trained_emulator(size)))
        .collect();
    let queries = random_points(&space(), 256, 7);

    let mut group = c.benchmark_group("emulator_predict");
    for (size, emulator) in emulators.iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("point", size), emulator, |b, emu| {
            let q = queries.row(0);
            b.iter(|| {
                let prediction = emu.predict(black_box(q)).unwrap();
                black_box(prediction);
            });
        });

        group.throughput(Throughput::Elements(queries.nrows() as u64));
        group.bench_with_input(BenchmarkId::new("mean_rows", size), emulator, |b, emu| {
            b.iter(|| {
                let means = emu.predict_mean_rows(black_box(queries.view())).unwrap();
                black_box(means);
            });
        });
    }
    group.finish();
}

criterion_group!(emulator_predict, benchmark_predict);
criterion_main!(emulator_predict);
