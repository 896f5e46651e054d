//! # linmodes
//!
//! An online mixture-of-local-linear-experts learner: observations about a
//! target property in a structured scene are clustered incrementally into a
//! noise mode plus linear modes, each tying a linear model to a reduced set
//! of relevant object roles.
//!
//! ## Architecture
//!
//! - **EM controller** (`learner`): lazy E-step / M-step loop with mode
//!   discovery, unification and degenerate-mode removal
//! - **Modes** (`mode`): role signatures, combinatorial role assignment,
//!   Gaussian likelihood scoring
//! - **Discovery** (`subset`): RANSAC-style linear-subset search over the
//!   accumulated noise, seeded by blocks or a weighted mini-EM
//! - **Classification** (`classifier`): pairwise clause / numeric-fallback
//!   classifiers, rebuilt lazily and combined by round-robin voting
//! - **Relational layer** (`relation`, `clause`): time-tagged fact tuples
//!   and backtracking clause satisfaction over them
//! - **Regression** (`regress`, `lwr`): OLS / ridge / forward-stepwise
//!   linear fits and a locally weighted fallback per signature
//!
//! ## Library usage
//!
//! ```no_run
//! use linmodes::config::LearnerConfig;
//! use linmodes::learner::Learner;
//! use linmodes::relation::RelationTable;
//! use linmodes::sig::{SigEntry, Signature};
//! use nalgebra::DVector;
//!
//! let mut scene = Signature::new();
//! scene.add(SigEntry { id: 1, name: "block".into(), kind: 0, props: vec!["x".into()], start: 0 });
//! let mut learner = Learner::new(LearnerConfig::default()).unwrap();
//! learner.learn(0, &scene, &RelationTable::new(), DVector::from_vec(vec![1.0]), 2.0).unwrap();
//! learner.run(10).unwrap();
//! ```

pub mod classifier;
pub mod clause;
pub mod config;
pub mod data;
pub mod error;
pub mod learner;
pub mod lwr;
pub mod mode;
pub mod numeric;
pub mod params;
pub mod regress;
pub mod relation;
pub mod sig;
pub mod subset;
pub mod timing;

pub use config::LearnerConfig;
pub use error::{ModelError, ModelResult};
pub use learner::Learner;
