//! Mixture components: local linear models over object roles.
//!
//! A mode owns a reduced signature listing only the objects that influence
//! its prediction, with the target pinned to role 0. Scoring an observation
//! means enumerating injective assignments of scene objects to roles and
//! keeping the best Gaussian likelihood. The noise mode is a degenerate
//! component with constant likelihood that absorbs everything unexplained.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clause::Clause;
use crate::config::LearnerConfig;
use crate::error::{ModelError, ModelResult, RegressError};
use crate::regress::{self, Algo, LinearFit};
use crate::relation::Relation;
use crate::sig::Signature;

/// Gaussian density of `x` under mean `mean` and variance `var`.
pub(crate) fn gausspdf(x: f64, mean: f64, var: f64) -> f64 {
    let d = x - mean;
    (-d * d / (2.0 * var)).exp() / (2.0 * std::f64::consts::PI * var).sqrt()
}

/// Best role assignment found for one observation against one mode.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleFit {
    /// Membership likelihood, already scaled by the non-noise prior.
    pub prob: f64,
    /// Absolute prediction error under the assignment.
    pub error: f64,
    /// Role index to scene entry index.
    pub assign: Vec<usize>,
}

/// Enumerates injective role assignments in lexicographic order.
///
/// Role 0 is pinned to the target entry; other roles range over scene
/// entries of matching shape. No scene entry is used twice.
pub struct AssignGen {
    candidates: Vec<Vec<usize>>,
    pos: Vec<usize>,
    exhausted: bool,
}

impl AssignGen {
    pub fn new(roles: &Signature, scene: &Signature, target: usize) -> Self {
        let mut candidates = Vec::with_capacity(roles.len());
        for (r, role) in roles.entries().iter().enumerate() {
            let cands: Vec<usize> = if r == 0 {
                if role.same_shape(scene.entry(target)) {
                    vec![target]
                } else {
                    Vec::new()
                }
            } else {
                scene
                    .entries()
                    .iter()
                    .enumerate()
                    .filter(|&(i, e)| i != target && role.same_shape(e))
                    .map(|(i, _)| i)
                    .collect()
            };
            candidates.push(cands);
        }
        let exhausted = candidates.iter().any(|c| c.is_empty());
        Self {
            pos: vec![0; candidates.len()],
            candidates,
            exhausted,
        }
    }
}

impl Iterator for AssignGen {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        loop {
            if self.exhausted {
                return None;
            }
            let assign: Vec<usize> = self
                .pos
                .iter()
                .zip(&self.candidates)
                .map(|(&p, c)| c[p])
                .collect();
            // Advance the odometer, rightmost role fastest.
            let mut i = self.pos.len();
            loop {
                if i == 0 {
                    self.exhausted = true;
                    break;
                }
                i -= 1;
                self.pos[i] += 1;
                if self.pos[i] < self.candidates[i].len() {
                    break;
                }
                self.pos[i] = 0;
            }
            let mut seen = assign.clone();
            seen.sort_unstable();
            if seen.windows(2).all(|w| w[0] != w[1]) {
                return Some(assign);
            }
        }
    }
}

/// One mixture component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mode {
    noise: bool,
    /// Reduced role signature; entry 0 is the target role.
    sig: Signature,
    fit: LinearFit,
    /// Observation ids currently assigned here.
    members: BTreeSet<usize>,
    /// Positive examples `(obs id, target object id)` for clause induction.
    member_rel: Relation,
    /// Per-role identifying clauses; role 0 carries none.
    obj_clauses: Vec<Vec<Clause>>,
    /// A member's error exceeded the model threshold; refit next M-step.
    pub stale: bool,
    /// Freshly created or reseeded; the next E-step re-scores every
    /// observation against this mode regardless of staleness.
    pub new_fit: bool,
    /// Membership changed since the ensemble last trained against this mode.
    pub classifier_stale: bool,
}

impl Mode {
    /// The noise component. Constant likelihood, no linear model.
    pub fn noise() -> Self {
        Self {
            noise: true,
            sig: Signature::new(),
            fit: LinearFit::constant(0.0),
            members: BTreeSet::new(),
            member_rel: Relation::new(2),
            obj_clauses: Vec::new(),
            stale: false,
            new_fit: false,
            classifier_stale: true,
        }
    }

    /// A regular component from an initial fit over seed rows.
    ///
    /// The fit runs forward-stepwise over the full scene layout; entries
    /// whose columns all receive zero coefficients are dropped from the
    /// role signature, except the target which always stays as role 0.
    pub fn from_seed(
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        scene: &Signature,
        target: usize,
    ) -> ModelResult<(Self, Vec<usize>)> {
        let full = regress::fit(Algo::Forward, x, y)?;

        let mut roles: Vec<usize> = vec![target];
        for (i, e) in scene.entries().iter().enumerate() {
            if i == target {
                continue;
            }
            let used = (e.start..e.start + e.props.len()).any(|j| full.coefs[j] != 0.0);
            if used {
                roles.push(i);
            }
        }

        let mut sig = Signature::new();
        let mut coefs = Vec::new();
        for &i in &roles {
            let e = scene.entry(i);
            sig.add(e.clone());
            for j in e.start..e.start + e.props.len() {
                coefs.push(full.coefs[j]);
            }
        }

        let mode = Self {
            noise: false,
            sig,
            fit: LinearFit {
                coefs: DVector::from_vec(coefs),
                intercept: full.intercept,
            },
            members: BTreeSet::new(),
            member_rel: Relation::new(2),
            obj_clauses: Vec::new(),
            stale: false,
            new_fit: true,
            classifier_stale: true,
        };
        Ok((mode, roles))
    }

    /// Replace the linear model and role signature from fresh seed rows
    /// while keeping the membership. Used when a discovered subset unifies
    /// with an existing mode.
    pub fn reinit_from_seed(
        &mut self,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        scene: &Signature,
        target: usize,
    ) -> ModelResult<Vec<usize>> {
        let (fresh, roles) = Self::from_seed(x, y, scene, target)?;
        self.sig = fresh.sig;
        self.fit = fresh.fit;
        self.obj_clauses.clear();
        self.stale = false;
        self.new_fit = true;
        self.classifier_stale = true;
        Ok(roles)
    }

    pub fn is_noise(&self) -> bool {
        self.noise
    }

    pub fn sig(&self) -> &Signature {
        &self.sig
    }

    pub fn fit(&self) -> &LinearFit {
        &self.fit
    }

    pub fn members(&self) -> &BTreeSet<usize> {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn member_rel(&self) -> &Relation {
        &self.member_rel
    }

    pub fn obj_clauses(&self) -> &[Vec<Clause>] {
        &self.obj_clauses
    }

    pub fn set_obj_clauses(&mut self, clauses: Vec<Vec<Clause>>) {
        self.obj_clauses = clauses;
    }

    /// Gather the reduced input vector for an assignment of scene entries
    /// to roles.
    pub fn gather(&self, x: &DVector<f64>, scene: &Signature, assign: &[usize]) -> DVector<f64> {
        let mut out = Vec::with_capacity(self.sig.dim());
        for &i in assign {
            let e = scene.entry(i);
            for j in e.start..e.start + e.props.len() {
                out.push(x[j]);
            }
        }
        DVector::from_vec(out)
    }

    /// Predicted target under an assignment.
    pub fn predict(&self, x: &DVector<f64>, scene: &Signature, assign: &[usize]) -> f64 {
        self.fit.predict(&self.gather(x, scene, assign))
    }

    /// Score an observation: the best role assignment by likelihood, or
    /// `None` when no injective assignment exists.
    pub fn likelihood(
        &self,
        x: &DVector<f64>,
        y: f64,
        scene: &Signature,
        target: usize,
        cfg: &LearnerConfig,
    ) -> Option<RoleFit> {
        if self.noise {
            return Some(RoleFit {
                prob: cfg.pnoise,
                error: f64::INFINITY,
                assign: Vec::new(),
            });
        }
        let mut best: Option<RoleFit> = None;
        for assign in AssignGen::new(&self.sig, scene, target) {
            let py = self.predict(x, scene, &assign);
            let error = (y - py).abs();
            let prob = (1.0 - cfg.epsilon) * gausspdf(y, py, cfg.measure_var);
            if best.as_ref().is_none_or(|b| prob > b.prob) {
                best = Some(RoleFit {
                    prob,
                    error,
                    assign,
                });
            }
        }
        best
    }

    /// Register observation `i` as a member. A regular mode goes stale when
    /// the member's error exceeds the model threshold.
    pub fn add_example(
        &mut self,
        i: usize,
        target_id: i64,
        error: f64,
        cfg: &LearnerConfig,
    ) -> ModelResult<()> {
        self.members.insert(i);
        self.member_rel.add(i as i64, &[target_id])?;
        if !self.noise && error > cfg.model_error_thresh {
            self.stale = true;
        }
        self.classifier_stale = true;
        Ok(())
    }

    /// Drop observation `i` from the membership.
    pub fn del_example(&mut self, i: usize, target_id: i64) {
        self.members.remove(&i);
        self.member_rel.del(i as i64, &[target_id]);
        self.classifier_stale = true;
    }

    /// Refit the linear model over the members' reduced rows.
    ///
    /// Returns `Ok(false)` and stays stale when the system is still
    /// underdetermined; the next M-step retries with more data.
    pub fn refit(&mut self, x: &DMatrix<f64>, y: &DVector<f64>, algo: Algo) -> ModelResult<bool> {
        match regress::fit(algo, x, y) {
            Ok(fit) => {
                self.fit = fit;
                self.stale = false;
                self.new_fit = true;
                self.classifier_stale = true;
                Ok(true)
            }
            Err(ModelError::Regress(
                RegressError::RankDeficient { .. } | RegressError::NoConvergence,
            )) => {
                debug!(members = self.members.len(), "refit underdetermined, keeping old model");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
