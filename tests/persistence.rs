//! Save/load round-trip tests.
//!
//! Persisted state covers observations, signatures, modes, relations and
//! the discovery watermark; fallback regressors are replayed from the
//! stored observations and the classifier ensemble is rebuilt lazily after
//! loading.

use linmodes::config::LearnerConfig;
use linmodes::learner::Learner;
use linmodes::relation::RelationTable;
use linmodes::sig::{SigEntry, Signature};
use nalgebra::DVector;

fn scene() -> Signature {
    let mut s = Signature::new();
    s.add(SigEntry {
        id: 10,
        name: "obj10".into(),
        kind: 0,
        props: vec!["px".into()],
        start: 0,
    });
    s
}

fn cfg() -> LearnerConfig {
    LearnerConfig {
        new_mode_thresh: 8,
        seed: 7,
        ..Default::default()
    }
}

#[test]
fn round_trip_preserves_modes_and_predictions() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    let sc = scene();
    let none = RelationTable::new();

    let mut l = Learner::new(cfg()).unwrap();
    for i in 1..=12 {
        let v = i as f64;
        l.learn(0, &sc, &none, DVector::from_vec(vec![v]), 3.0 * v + 1.0)
            .unwrap();
    }
    assert!(l.run(30).unwrap());
    let x = DVector::from_vec(vec![20.0]);
    let before = l.predict(0, &sc, &none, &x).unwrap().unwrap();
    l.save(&path).unwrap();

    let mut loaded = Learner::load(&path).unwrap();
    assert_eq!(loaded.nmodes(), l.nmodes());
    assert_eq!(loaded.ndata(), l.ndata());
    assert_eq!(loaded.map_modes(), l.map_modes());
    assert_eq!(loaded.check_after(), l.check_after());
    // The ensemble is rebuilt on the first classification after loading.
    let after = loaded.predict(0, &sc, &none, &x).unwrap().unwrap();
    assert_eq!(before, after);
}

#[test]
fn fallback_regressor_replayed_on_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    let sc = scene();
    let none = RelationTable::new();

    // Too little data for discovery; predictions come from the
    // per-signature fallback, which is not serialized.
    let mut l = Learner::new(cfg()).unwrap();
    for (v, y) in [(1.0, 4.0), (2.0, 9.5), (3.0, 7.25)] {
        l.learn(0, &sc, &none, DVector::from_vec(vec![v]), y).unwrap();
    }
    l.run(10).unwrap();
    let x = DVector::from_vec(vec![2.5]);
    let before = l.predict(0, &sc, &none, &x).unwrap().unwrap();
    assert_eq!(before.0, 0);
    l.save(&path).unwrap();

    let mut loaded = Learner::load(&path).unwrap();
    let after = loaded.predict(0, &sc, &none, &x).unwrap().unwrap();
    assert_eq!(before, after);
}

#[test]
fn load_rejects_garbage() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    std::fs::write(&path, b"not a model").unwrap();
    assert!(Learner::load(&path).is_err());
}

#[test]
fn learning_continues_after_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    let sc = scene();
    let none = RelationTable::new();

    let mut l = Learner::new(cfg()).unwrap();
    for i in 1..=12 {
        let v = i as f64;
        l.learn(0, &sc, &none, DVector::from_vec(vec![v]), 3.0 * v + 1.0)
            .unwrap();
    }
    assert!(l.run(30).unwrap());
    l.save(&path).unwrap();

    let mut loaded = Learner::load(&path).unwrap();
    for i in 13..=16 {
        let v = i as f64;
        loaded
            .learn(0, &sc, &none, DVector::from_vec(vec![v]), 3.0 * v + 1.0)
            .unwrap();
    }
    assert!(loaded.run(30).unwrap());
    // New observations join the existing mode rather than spawning one.
    assert_eq!(loaded.nmodes(), 2);
    assert_eq!(loaded.mode_members(1).unwrap().len(), 16);
}
