//! Benchmarks for linear-subset discovery and the learning loop.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use linmodes::config::LearnerConfig;
use linmodes::learner::Learner;
use linmodes::relation::RelationTable;
use linmodes::sig::{SigEntry, Signature};
use linmodes::subset;

/// Half the rows follow one line, half another, shuffled together.
fn mixed_data(n: usize, rng: &mut StdRng) -> (DMatrix<f64>, DVector<f64>) {
    let mut x = DMatrix::zeros(n, 2);
    let mut y = DVector::zeros(n);
    for i in 0..n {
        let v: f64 = rng.gen_range(-10.0..10.0);
        x[(i, 0)] = v;
        x[(i, 1)] = 1.0;
        y[i] = if i % 2 == 0 { 3.0 * v + 1.0 } else { -2.0 * v + 7.0 };
    }
    (x, y)
}

fn bench_find_linear_subset(c: &mut Criterion) {
    let cfg = LearnerConfig {
        new_mode_thresh: 100,
        ..Default::default()
    };
    let mut rng = StdRng::seed_from_u64(0);
    let (x, y) = mixed_data(400, &mut rng);

    c.bench_function("find_linear_subset_400x2", |bench| {
        bench.iter(|| {
            let mut r = StdRng::seed_from_u64(1);
            black_box(subset::find_linear_subset(&x, &y, &cfg, &mut r).unwrap())
        })
    });
}

fn bench_learn_and_run(c: &mut Criterion) {
    let mut scene = Signature::new();
    scene.add(SigEntry {
        id: 10,
        name: "obj10".into(),
        kind: 0,
        props: vec!["px".into()],
        start: 0,
    });
    let none = RelationTable::new();

    c.bench_function("learn_run_100x1", |bench| {
        bench.iter(|| {
            let cfg = LearnerConfig {
                new_mode_thresh: 50,
                seed: 7,
                ..Default::default()
            };
            let mut l = Learner::new(cfg).unwrap();
            for i in 1..=100 {
                let v = i as f64;
                l.learn(0, &scene, &none, DVector::from_vec(vec![v]), 3.0 * v + 1.0)
                    .unwrap();
            }
            black_box(l.run(20).unwrap())
        })
    });
}

criterion_group!(benches, bench_find_linear_subset, bench_learn_and_run);
criterion_main!(benches);
