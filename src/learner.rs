//! The EM controller: owns all engine state and drives the learning loop.
//!
//! `learn` ingests observations into the noise mode; `run` iterates
//! E-step / M-step / lifecycle (degenerate-mode removal, discovery,
//! unification) until quiescence or an iteration cap; `predict` and
//! `classify` answer queries through the pairwise classifier ensemble,
//! which is rebuilt lazily whenever mode membership has changed.
//!
//! Invariants maintained across every public call: observation ids
//! partition exactly over mode memberships, `map_mode` equals the argmax of
//! `mode_prob` after each completed E-step, and per-observation probability
//! vectors stay in lock-step with the mode list.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::classifier::{ClauseCase, EnsembleTable, PairClassifier, PairVote};
use crate::clause::{ClauseLearner, ClauseSplit, NullClauseLearner, VarDomains, test_clause_vec};
use crate::config::LearnerConfig;
use crate::data::{Observation, ObservationStore};
use crate::error::{DataError, ModelResult, RelationError, StoreError};
use crate::mode::{Mode, RoleFit};
use crate::numeric::{NoNumeric, NumericModel, NumericTrainer};
use crate::relation::{Relation, RelationTable, extend_table};
use crate::sig::{SigId, Signature, SignatureRegistry};
use crate::subset;
use crate::timing::Timers;

/// Diagnostic snapshot of engine scale.
#[derive(Debug, Clone, Serialize)]
pub struct LearnerInfo {
    pub nmodes: usize,
    pub ndata: usize,
    pub nsigs: usize,
    pub noise_size: usize,
    pub check_after: usize,
}

/// Serializable engine state. Fallback regressors, numeric classifiers and
/// the ensemble are rebuilt after loading rather than persisted.
#[derive(Serialize, Deserialize)]
struct SavedState {
    cfg: LearnerConfig,
    sigs: SignatureRegistry,
    store: ObservationStore,
    modes: Vec<Mode>,
    noise_by_sig: BTreeMap<SigId, BTreeSet<usize>>,
    rels: RelationTable,
    check_after: usize,
}

/// Online mixture-of-local-linear-experts learner.
pub struct Learner {
    cfg: LearnerConfig,
    sigs: SignatureRegistry,
    store: ObservationStore,
    /// Mixture components; index 0 is always the noise mode.
    modes: Vec<Mode>,
    /// Noise-mode members grouped by signature, driving discovery.
    noise_by_sig: BTreeMap<SigId, BTreeSet<usize>>,
    rels: RelationTable,
    ensemble: EnsembleTable,
    /// Noise volume required before the next discovery attempt.
    check_after: usize,
    /// Role assignments computed during E-steps, keyed by (mode, obs).
    assignments: BTreeMap<(usize, usize), RoleFit>,
    timers: Timers,
    rng: StdRng,
    clause_learner: Box<dyn ClauseLearner>,
    numeric_trainer: Box<dyn NumericTrainer>,
}

fn fill_xy(store: &ObservationStore, rows: &[usize]) -> (DMatrix<f64>, DVector<f64>) {
    if rows.is_empty() {
        return (DMatrix::zeros(0, 0), DVector::zeros(0));
    }
    let dim = store.get(rows[0]).x.len();
    let mut x = DMatrix::zeros(rows.len(), dim);
    let mut y = DVector::zeros(rows.len());
    for (k, &i) in rows.iter().enumerate() {
        let o = store.get(i);
        x.row_mut(k).copy_from(&o.x.transpose());
        y[k] = o.y;
    }
    (x, y)
}

impl Learner {
    pub fn new(cfg: LearnerConfig) -> ModelResult<Self> {
        Self::with_collaborators(cfg, Box::new(NullClauseLearner), Box::new(NoNumeric))
    }

    /// Construct with an injected relational learner and numeric trainer.
    pub fn with_collaborators(
        cfg: LearnerConfig,
        clause_learner: Box<dyn ClauseLearner>,
        numeric_trainer: Box<dyn NumericTrainer>,
    ) -> ModelResult<Self> {
        cfg.validate()?;
        Ok(Self {
            sigs: SignatureRegistry::new(),
            store: ObservationStore::new(cfg.lwr_k),
            modes: vec![Mode::noise()],
            noise_by_sig: BTreeMap::new(),
            rels: RelationTable::new(),
            ensemble: EnsembleTable::new(),
            check_after: cfg.new_mode_thresh,
            assignments: BTreeMap::new(),
            timers: Timers::new(),
            rng: StdRng::seed_from_u64(cfg.seed),
            clause_learner,
            numeric_trainer,
            cfg,
        })
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.cfg
    }

    pub fn nmodes(&self) -> usize {
        self.modes.len()
    }

    pub fn ndata(&self) -> usize {
        self.store.len()
    }

    pub fn check_after(&self) -> usize {
        self.check_after
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn relations(&self) -> &RelationTable {
        &self.rels
    }

    pub fn info(&self) -> LearnerInfo {
        LearnerInfo {
            nmodes: self.modes.len(),
            ndata: self.store.len(),
            nsigs: self.sigs.len(),
            noise_size: self.modes[0].size(),
            check_after: self.check_after,
        }
    }

    /// Membership of mode `m`.
    pub fn mode_members(&self, m: usize) -> ModelResult<&BTreeSet<usize>> {
        let mode = self.modes.get(m).ok_or(DataError::ModeOutOfRange {
            mode: m,
            len: self.modes.len(),
        })?;
        Ok(mode.members())
    }

    /// Current MAP mode of every observation, in id order.
    pub fn map_modes(&self) -> Vec<usize> {
        self.store.iter().map(|o| o.map_mode).collect()
    }

    /// Ingest one observation. New observations always start in the noise
    /// mode; `run` later migrates them.
    pub fn learn(
        &mut self,
        target: usize,
        scene: &Signature,
        rels: &RelationTable,
        x: DVector<f64>,
        y: f64,
    ) -> ModelResult<()> {
        let t0 = Instant::now();
        if scene.dim() != x.len() {
            return Err(DataError::DimMismatch {
                expected: scene.dim(),
                actual: x.len(),
            }
            .into());
        }
        if target >= scene.len() {
            return Err(DataError::TargetOutOfRange {
                target,
                len: scene.len(),
            }
            .into());
        }
        let sig = self.sigs.intern(scene);

        let nmodes = self.modes.len();
        let mut mode_prob = vec![0.0; nmodes];
        mode_prob[0] = self.cfg.pnoise;
        let mut prob_stale = vec![true; nmodes];
        prob_stale[0] = false;
        let id = self.store.push(Observation {
            x,
            y,
            target,
            sig,
            mode_prob,
            prob_stale,
            map_mode: 0,
            obj_map: Vec::new(),
        });

        let target_id = scene.entry(target).id;
        self.modes[0].add_example(id, target_id, 0.0, &self.cfg)?;
        self.noise_by_sig.entry(sig).or_default().insert(id);
        extend_table(&mut self.rels, rels, id as i64)?;
        self.timers.add("learn", t0.elapsed());
        Ok(())
    }

    /// One E-step: refresh stale (observation, mode) probabilities and
    /// migrate observations whose MAP mode changed.
    fn estep(&mut self) -> ModelResult<()> {
        let t0 = Instant::now();
        for i in 0..self.store.len() {
            // Probabilities needing refresh: the per-slot stale flag, or a
            // freshly (re)fitted mode which invalidates everyone.
            let updates: Vec<(usize, Option<RoleFit>)> = {
                let obs = self.store.get(i);
                let scene = self.sigs.get(obs.sig);
                (1..self.modes.len())
                    .filter(|&j| obs.prob_stale[j] || self.modes[j].new_fit)
                    .map(|j| {
                        let fit =
                            self.modes[j].likelihood(&obs.x, obs.y, scene, obs.target, &self.cfg);
                        (j, fit)
                    })
                    .collect()
            };

            let mut dirty = false;
            {
                let obs = self.store.get_mut(i);
                for (j, fit) in &updates {
                    let now = fit.as_ref().map(|f| f.prob).unwrap_or(0.0);
                    let map_prob = obs.mode_prob[obs.map_mode];
                    if (obs.map_mode == *j && now < map_prob)
                        || (obs.map_mode != *j && now > map_prob)
                    {
                        dirty = true;
                    }
                    obs.mode_prob[*j] = now;
                    obs.prob_stale[*j] = false;
                }
            }
            for (j, fit) in updates {
                match fit {
                    Some(f) => {
                        self.assignments.insert((j, i), f);
                    }
                    None => {
                        self.assignments.remove(&(j, i));
                    }
                }
            }

            if dirty {
                let (prev, now) = {
                    let obs = self.store.get(i);
                    (obs.map_mode, obs.argmax_mode())
                };
                if now != prev {
                    let (sig, target) = {
                        let o = self.store.get(i);
                        (o.sig, o.target)
                    };
                    let target_id = self.sigs.get(sig).entry(target).id;
                    self.modes[prev].del_example(i, target_id);
                    if prev == 0 {
                        if let Some(s) = self.noise_by_sig.get_mut(&sig) {
                            s.remove(&i);
                        }
                    }
                    let (error, assign) = match self.assignments.get(&(now, i)) {
                        Some(f) => (f.error, Some(f.assign.clone())),
                        None => (0.0, None),
                    };
                    {
                        let o = self.store.get_mut(i);
                        o.map_mode = now;
                        if now == 0 {
                            o.obj_map.clear();
                        } else if let Some(a) = assign {
                            o.obj_map = a;
                        }
                    }
                    self.modes[now].add_example(
                        i,
                        target_id,
                        if now == 0 { 0.0 } else { error },
                        &self.cfg,
                    )?;
                    if now == 0 {
                        self.noise_by_sig.entry(sig).or_default().insert(i);
                    }
                    debug!(obs = i, from = prev, to = now, "observation migrated");
                } else if let Some(f) = self.assignments.get(&(now, i)) {
                    // The MAP mode kept the observation but was refitted;
                    // its role assignment may have shifted.
                    self.store.get_mut(i).obj_map = f.assign.clone();
                }
            }

            debug_assert_eq!(self.store.get(i).map_mode, self.store.get(i).argmax_mode());
        }
        for m in self.modes.iter_mut().skip(1) {
            m.new_fit = false;
        }
        self.timers.add("e-step", t0.elapsed());
        Ok(())
    }

    /// One M-step: refit every stale mode from its members' reduced rows.
    fn mstep(&mut self) -> ModelResult<bool> {
        let t0 = Instant::now();
        let mut changed = false;
        for j in 1..self.modes.len() {
            if !self.modes[j].stale {
                continue;
            }
            let nroles = self.modes[j].sig().len();
            let dim = self.modes[j].sig().dim();
            let members: Vec<usize> = self.modes[j].members().iter().copied().collect();
            let mut rows = Vec::with_capacity(members.len());
            let mut ys = Vec::with_capacity(members.len());
            for &i in &members {
                let obs = self.store.get(i);
                if obs.obj_map.len() != nroles {
                    continue;
                }
                let scene = self.sigs.get(obs.sig);
                rows.push(self.modes[j].gather(&obs.x, scene, &obs.obj_map));
                ys.push(obs.y);
            }
            if rows.is_empty() {
                continue;
            }
            let mut x = DMatrix::zeros(rows.len(), dim);
            for (k, r) in rows.iter().enumerate() {
                x.row_mut(k).copy_from(&r.transpose());
            }
            let y = DVector::from_vec(ys);
            changed |= self.modes[j].refit(&x, &y, self.cfg.regression)?;
        }
        self.timers.add("m-step", t0.elapsed());
        Ok(changed)
    }

    /// Remove degenerate modes (at most `degenerate_size` members),
    /// returning their members to the noise mode and compacting every
    /// mode-indexed structure in lock-step.
    fn remove_modes(&mut self) -> ModelResult<bool> {
        if self.modes.len() == 1 {
            return Ok(false);
        }
        let nmodes = self.modes.len();
        let mut index_map = vec![0usize; nmodes];
        let mut removed = Vec::new();
        let mut next = 1;
        for j in 1..nmodes {
            if self.modes[j].size() > self.cfg.degenerate_size {
                index_map[j] = next;
                next += 1;
            } else {
                removed.push(j);
            }
        }
        if removed.is_empty() {
            return Ok(false);
        }
        info!(removed = ?removed, "removing degenerate modes");

        let mut orphans = Vec::new();
        for &j in &removed {
            orphans.extend(self.modes[j].members().iter().copied());
        }

        let old = std::mem::take(&mut self.modes);
        self.modes = old
            .into_iter()
            .enumerate()
            .filter(|(j, _)| *j == 0 || !removed.contains(j))
            .map(|(_, m)| m)
            .collect();

        self.ensemble.remove_modes(&index_map);
        self.store.compact_modes(&removed, &index_map);
        let assignments = std::mem::take(&mut self.assignments);
        for ((m, i), fit) in assignments {
            if m != 0 && index_map[m] == 0 {
                continue;
            }
            self.assignments.insert((index_map[m], i), fit);
        }

        for i in orphans {
            let (sig, target) = {
                let o = self.store.get(i);
                (o.sig, o.target)
            };
            let target_id = self.sigs.get(sig).entry(target).id;
            {
                let o = self.store.get_mut(i);
                o.obj_map.clear();
                o.mode_prob[0] = self.cfg.pnoise;
                for s in o.prob_stale.iter_mut() {
                    *s = true;
                }
                o.prob_stale[0] = false;
            }
            self.modes[0].add_example(i, target_id, 0.0, &self.cfg)?;
            self.noise_by_sig.entry(sig).or_default().insert(i);
        }
        Ok(true)
    }

    /// Try to mint a mode from the accumulated noise: first the largest
    /// constant-value group, then per-signature linear-subset discovery.
    /// A discovered subset first tries to unify with an existing mode over
    /// the same signature and target; otherwise it becomes a new mode.
    fn unify_or_add_mode(&mut self) -> ModelResult<bool> {
        let t0 = Instant::now();
        if self.modes[0].size() < self.check_after {
            return Ok(false);
        }

        let mut seed: Vec<usize> = Vec::new();
        let buckets: Vec<(SigId, Vec<usize>)> = self
            .noise_by_sig
            .iter()
            .map(|(&s, m)| (s, m.iter().copied().collect()))
            .collect();
        for (_, members) in &buckets {
            let mut by_target: BTreeMap<usize, Vec<(usize, f64)>> = BTreeMap::new();
            for &i in members {
                let o = self.store.get(i);
                by_target.entry(o.target).or_default().push((i, o.y));
            }
            for group in by_target.values() {
                let cand = subset::largest_const_subset(group);
                if cand.len() > seed.len() {
                    seed = cand;
                }
            }
        }
        if seed.len() < self.cfg.new_mode_thresh {
            for (_, members) in &buckets {
                if members.len() < self.check_after {
                    continue;
                }
                let (x, y) = fill_xy(&self.store, members);
                let sub = subset::find_linear_subset(&x, &y, &self.cfg, &mut self.rng)?;
                if sub.len() > seed.len() {
                    seed = sub.iter().map(|&k| members[k]).collect();
                }
                if seed.len() >= self.cfg.new_mode_thresh {
                    break;
                }
            }
        }

        if seed.len() < self.cfg.new_mode_thresh {
            // Don't look again until enough fresh noise covers the gap.
            self.check_after += self.cfg.new_mode_thresh - seed.len();
            debug!(
                largest = seed.len(),
                check_after = self.check_after,
                "discovery failed, raising watermark"
            );
            self.timers.add("discover", t0.elapsed());
            return Ok(false);
        }
        // The seed is leaving the noise mode one way or another.
        self.check_after = self.cfg.new_mode_thresh;

        let seed_sig = self.store.get(seed[0]).sig;
        let seed_target = self.store.get(seed[0]).target;
        let scene = self.sigs.get(seed_sig).clone();

        // A mode whose members all share the seed's signature and target
        // may really be the same regime; accept a joint refit when nearly
        // all combined rows are inliers.
        for j in 1..self.modes.len() {
            if !self.members_uniform(j, seed_sig, seed_target) {
                continue;
            }
            let mut combined: Vec<usize> = self.modes[j].members().iter().copied().collect();
            combined.extend(seed.iter().copied());
            let (x, y) = fill_xy(&self.store, &combined);
            let sub = subset::find_linear_subset(&x, &y, &self.cfg, &mut self.rng)?;
            if sub.len() as f64 >= self.cfg.unify_inlier_ratio * combined.len() as f64 {
                let rows: Vec<usize> = sub.into_iter().map(|k| combined[k]).collect();
                let (sx, sy) = fill_xy(&self.store, &rows);
                self.modes[j].reinit_from_seed(&sx, &sy, &scene, seed_target)?;
                info!(mode = j, size = rows.len(), "unified noise subset into existing mode");
                self.timers.add("discover", t0.elapsed());
                return Ok(true);
            }
        }

        let (sx, sy) = fill_xy(&self.store, &seed);
        let (mode, _) = Mode::from_seed(&sx, &sy, &scene, seed_target)?;
        info!(
            mode = self.modes.len(),
            size = seed.len(),
            roles = mode.sig().len(),
            "adding discovered mode"
        );
        self.modes.push(mode);
        self.store.grow_mode_slot();
        self.timers.add("discover", t0.elapsed());
        Ok(true)
    }

    fn members_uniform(&self, m: usize, sig: SigId, target: usize) -> bool {
        self.modes[m].members().iter().all(|&i| {
            let o = self.store.get(i);
            o.sig == sig && o.target == target
        })
    }

    /// Iterate the learning loop until quiescence (no refits, removals, or
    /// discoveries in a pass) or the iteration cap. Returns whether
    /// quiescence was reached. A no-op when `use_em` is off.
    pub fn run(&mut self, max_iters: usize) -> ModelResult<bool> {
        if !self.cfg.use_em {
            return Ok(false);
        }
        for _ in 0..max_iters {
            self.estep()?;
            let changed = self.mstep()?;
            if !changed && !self.remove_modes()? && !self.unify_or_add_mode()? {
                return Ok(true);
            }
        }
        debug!("reached iteration cap without quiescence");
        Ok(false)
    }

    // -----------------------------------------------------------------
    // Classification
    // -----------------------------------------------------------------

    /// Rebuild per-role clauses and pairwise classifiers for every mode
    /// whose membership changed since the last rebuild.
    fn update_ensemble(&mut self) -> ModelResult<()> {
        let t0 = Instant::now();
        let needs: Vec<bool> = self.modes.iter().map(|m| m.classifier_stale).collect();
        if !needs.iter().any(|&n| n) {
            return Ok(());
        }
        for m in &mut self.modes {
            m.classifier_stale = false;
        }
        for (j, &n) in needs.iter().enumerate() {
            if n {
                self.learn_role_clauses(j)?;
            }
        }
        for i in 0..self.modes.len() {
            for j in i + 1..self.modes.len() {
                if needs[i] || needs[j] {
                    self.rebuild_pair(i, j)?;
                }
            }
        }
        self.timers.add("classifier", t0.elapsed());
        Ok(())
    }

    /// Learn identifying clauses for each non-target role of mode `m`:
    /// positives are the objects members actually bound to the role,
    /// negatives every same-typed object they did not.
    fn learn_role_clauses(&mut self, m: usize) -> ModelResult<()> {
        if self.modes[m].is_noise() {
            return Ok(());
        }
        let nroles = self.modes[m].sig().len();
        let mut all: Vec<Vec<crate::clause::Clause>> = vec![Vec::new(); nroles];
        if self.cfg.use_foil {
            for r in 1..nroles {
                let kind = self.modes[m].sig().entry(r).kind;
                let mut pos = Relation::new(3);
                let mut neg = Relation::new(3);
                for &i in self.modes[m].members() {
                    let obs = self.store.get(i);
                    if obs.obj_map.len() != nroles {
                        continue;
                    }
                    let scene = self.sigs.get(obs.sig);
                    let target_id = scene.entry(obs.target).id;
                    let oid = scene.entry(obs.obj_map[r]).id;
                    pos.add(i as i64, &[target_id, oid])?;
                    for (k, e) in scene.entries().iter().enumerate() {
                        if e.kind == kind && k != obs.target && e.id != oid {
                            neg.add(i as i64, &[target_id, e.id])?;
                        }
                    }
                }
                let split = self.clause_learner.learn_separating(&pos, &neg, &self.rels);
                all[r] = split.clauses;
            }
        }
        self.modes[m].set_obj_clauses(all);
        Ok(())
    }

    /// Rebuild the classifier for the ordered pair (i, j) from scratch.
    fn rebuild_pair(&mut self, i: usize, j: usize) -> ModelResult<()> {
        let size_i = self.modes[i].size();
        let size_j = self.modes[j].size();
        let default_vote = if size_i > size_j {
            PairVote::First
        } else {
            PairVote::Second
        };
        if size_i == 0 || size_j == 0 {
            self.ensemble.set(i, j, PairClassifier::constant(default_vote));
            return Ok(());
        }

        let split = if self.cfg.use_foil {
            self.clause_learner.learn_separating(
                self.modes[i].member_rel(),
                self.modes[j].member_rel(),
                &self.rels,
            )
        } else {
            ClauseSplit::unseparated(self.modes[i].member_rel())
        };

        let nclauses = split.clauses.len();
        let mut residuals = split.residuals;
        let fallback_residual = if residuals.len() > nclauses {
            residuals.pop().unwrap_or_else(|| Relation::new(2))
        } else {
            Relation::new(2)
        };

        let mem_i = self.modes[i].member_rel().clone();
        let mem_j = self.modes[j].member_rel().clone();
        let mut cases = Vec::with_capacity(nclauses);
        for (k, clause) in split.clauses.into_iter().enumerate() {
            let residual = residuals
                .get(k)
                .cloned()
                .unwrap_or_else(|| Relation::new(2));
            // False positives for this clause are members of j; train a
            // numeric model to tell them from the true members of i.
            let numeric = if residual.is_empty() {
                None
            } else {
                self.train_numeric(&mem_i, &residual)
            };
            cases.push(ClauseCase {
                clause,
                residual,
                numeric,
            });
        }
        let fallback_numeric = if fallback_residual.is_empty() {
            None
        } else {
            self.train_numeric(&fallback_residual, &mem_j)
        };

        self.ensemble.set(
            i,
            j,
            PairClassifier {
                default_vote,
                cases,
                fallback_residual,
                fallback_numeric,
            },
        );
        Ok(())
    }

    /// Train a numeric classifier separating `pos` rows (label true) from
    /// `neg` rows, keeping it only when its held-out success rate beats the
    /// majority-class baseline.
    fn train_numeric(&mut self, pos: &Relation, neg: &Relation) -> Option<Box<dyn NumericModel>> {
        if !self.cfg.use_numeric {
            return None;
        }
        let mut pi: Vec<usize> = pos.at_pos(0).into_iter().map(|t| t as usize).collect();
        let mut ni: Vec<usize> = neg.at_pos(0).into_iter().map(|t| t as usize).collect();
        let npos = pi.len();
        let nneg = ni.len();
        let mut pos_train = (self.cfg.numeric_train_ratio * npos as f64) as usize;
        if pos_train == npos {
            pos_train -= 1;
        }
        let mut neg_train = (self.cfg.numeric_train_ratio * nneg as f64) as usize;
        if neg_train == nneg {
            neg_train -= 1;
        }
        if pos_train < 2 || neg_train < 2 {
            return None;
        }
        pi.shuffle(&mut self.rng);
        ni.shuffle(&mut self.rng);

        let dim = self.store.get(pi[0]).x.len();
        let usable = |i: usize| self.store.get(i).x.len() == dim;

        let mut rows = Vec::with_capacity(pos_train + neg_train);
        let mut labels = Vec::with_capacity(pos_train + neg_train);
        for &i in pi.iter().take(pos_train).filter(|&&i| usable(i)) {
            rows.push(self.store.get(i).x.clone());
            labels.push(true);
        }
        for &i in ni.iter().take(neg_train).filter(|&&i| usable(i)) {
            rows.push(self.store.get(i).x.clone());
            labels.push(false);
        }
        let model = self.numeric_trainer.train(&rows, &labels)?;

        let mut ntest = 0;
        let mut correct = 0;
        for &i in pi.iter().skip(pos_train).filter(|&&i| usable(i)) {
            ntest += 1;
            if model.classify(&self.store.get(i).x) {
                correct += 1;
            }
        }
        for &i in ni.iter().skip(neg_train).filter(|&&i| usable(i)) {
            ntest += 1;
            if !model.classify(&self.store.get(i).x) {
                correct += 1;
            }
        }
        if ntest == 0 {
            return None;
        }
        let success = correct as f64 / ntest as f64;
        let baseline = npos.max(nneg) as f64 / (npos + nneg) as f64;
        if success > baseline {
            Some(model)
        } else {
            debug!(success, baseline, "numeric classifier below baseline, dropped");
            None
        }
    }

    /// Bind scene objects to mode `m`'s roles for a query. Same-typed
    /// candidates are disambiguated by the role's clauses; a role that
    /// cannot be resolved to exactly one object eliminates the mode.
    fn map_roles(
        &self,
        m: usize,
        target: usize,
        scene: &Signature,
        rels: &RelationTable,
    ) -> Option<Vec<usize>> {
        let mode = &self.modes[m];
        let msig = mode.sig();
        if msig.is_empty() || !msig.entry(0).same_shape(scene.entry(target)) {
            return None;
        }
        let mut mapping = vec![target];
        let mut used = vec![false; scene.len()];
        used[target] = true;

        let mut base = VarDomains::new();
        base.insert(0, BTreeSet::from([0]));
        base.insert(1, BTreeSet::from([scene.entry(target).id]));

        for r in 1..msig.len() {
            let role = msig.entry(r);
            let cands: Vec<usize> = scene
                .entries()
                .iter()
                .enumerate()
                .filter(|&(k, e)| !used[k] && e.kind == role.kind)
                .map(|(k, _)| k)
                .collect();
            let clauses = mode.obj_clauses().get(r).map(|c| c.as_slice()).unwrap_or(&[]);
            let pick = if cands.is_empty() {
                return None;
            } else if cands.len() == 1 || clauses.is_empty() {
                cands[0]
            } else {
                let mut domains = base.clone();
                domains.insert(2, cands.iter().map(|&k| scene.entry(k).id).collect());
                test_clause_vec(clauses, rels, &mut domains)?;
                let id = domains.get(&2).and_then(|d| d.first().copied())?;
                scene.find_id(id)?
            };
            mapping.push(pick);
            used[pick] = true;
        }
        Some(mapping)
    }

    /// Pick the mode best explaining a query, returning it with its role
    /// mapping. Candidates must fit the scene structurally and resolve all
    /// their roles; a single surviving candidate answers directly,
    /// otherwise pairwise round-robin voting decides, ties going to the
    /// lowest mode index.
    pub fn classify(
        &mut self,
        target: usize,
        scene: &Signature,
        rels: &RelationTable,
        x: &DVector<f64>,
    ) -> ModelResult<(usize, Vec<usize>)> {
        if scene.dim() != x.len() {
            return Err(DataError::DimMismatch {
                expected: scene.dim(),
                actual: x.len(),
            }
            .into());
        }
        if target >= scene.len() {
            return Err(DataError::TargetOutOfRange {
                target,
                len: scene.len(),
            }
            .into());
        }
        self.update_ensemble()?;

        let mut possible = vec![0usize];
        let mut mappings: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for m in 1..self.modes.len() {
            if self.modes[m].sig().len() > scene.len() {
                continue;
            }
            match self.map_roles(m, target, scene, rels) {
                Some(mapping) => {
                    mappings.insert(m, mapping);
                    possible.push(m);
                }
                None => debug!(mode = m, "role mapping failed, candidate eliminated"),
            }
        }
        if possible.len() == 1 {
            return Ok((0, Vec::new()));
        }

        let target_id = scene.entry(target).id;
        let mut votes: BTreeMap<usize, usize> = possible.iter().map(|&m| (m, 0)).collect();
        for ai in 0..possible.len() {
            for bi in ai + 1..possible.len() {
                let (a, b) = (possible[ai], possible[bi]);
                if let Some(c) = self.ensemble.get(a, b) {
                    let winner = match c.vote(target_id, rels, x) {
                        PairVote::First => a,
                        PairVote::Second => b,
                    };
                    if let Some(v) = votes.get_mut(&winner) {
                        *v += 1;
                    }
                }
            }
        }
        let mut best = possible[0];
        for &m in &possible {
            if votes[&m] > votes[&best] {
                best = m;
            }
        }
        debug!(best, ?votes, "classification vote");
        Ok((best, mappings.remove(&best).unwrap_or_default()))
    }

    /// Predict the target value for a query. Classification into a learned
    /// mode answers through its linear model; a noise classification falls
    /// back to the signature's nonparametric regressor, and `None` means
    /// the engine cannot commit to a value yet.
    pub fn predict(
        &mut self,
        target: usize,
        scene: &Signature,
        rels: &RelationTable,
        x: &DVector<f64>,
    ) -> ModelResult<Option<(usize, f64)>> {
        if self.store.is_empty() {
            return Ok(None);
        }
        let (mode, mapping) = self.classify(target, scene, rels, x)?;
        if mode == 0 {
            if let Some(sig) = self.sigs.find(scene) {
                if let Some(bucket) = self.store.bucket(sig) {
                    if let Some(y) = bucket.lwr.predict(x) {
                        return Ok(Some((0, y)));
                    }
                }
            }
            return Ok(None);
        }
        let y = self.modes[mode].predict(x, scene, &mapping);
        Ok(Some((mode, y)))
    }

    /// Diagnostic: the mode with the highest likelihood for a labeled
    /// example, with its prediction error. Bypasses the classifier
    /// ensemble entirely.
    pub fn best_mode(
        &self,
        target: usize,
        scene: &Signature,
        x: &DVector<f64>,
        y: f64,
    ) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64, f64)> = None;
        for (m, mode) in self.modes.iter().enumerate() {
            if let Some(fit) = mode.likelihood(x, y, scene, target, &self.cfg) {
                if best.is_none_or(|(_, bp, _)| fit.prob > bp) {
                    best = Some((m, fit.prob, fit.error));
                }
            }
        }
        best.map(|(m, _, e)| (m, e))
    }

    // -----------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------

    /// Per-observation probability table.
    pub fn dump_ptable(&self) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = self
            .store
            .iter()
            .enumerate()
            .map(|(i, o)| json!({ "obs": i, "map": o.map_mode, "probs": o.mode_prob }))
            .collect();
        json!(rows)
    }

    /// Everything about one mode: membership, role signature, model,
    /// clauses.
    pub fn dump_mode(&self, m: usize) -> ModelResult<serde_json::Value> {
        let mode = self.modes.get(m).ok_or(DataError::ModeOutOfRange {
            mode: m,
            len: self.modes.len(),
        })?;
        let clauses: Vec<Vec<String>> = mode
            .obj_clauses()
            .iter()
            .map(|per_role| {
                per_role
                    .iter()
                    .map(|c| {
                        c.iter()
                            .map(|l| l.to_string())
                            .collect::<Vec<_>>()
                            .join(" & ")
                    })
                    .collect()
            })
            .collect();
        Ok(json!({
            "noise": mode.is_noise(),
            "members": mode.members().iter().collect::<Vec<_>>(),
            "roles": mode.sig().entries().iter().map(|e| e.kind).collect::<Vec<_>>(),
            "coefs": mode.fit().coefs.as_slice(),
            "intercept": mode.fit().intercept,
            "clauses": clauses,
        }))
    }

    /// Tuples of a named relation matching a wildcard pattern.
    pub fn dump_relation(&self, name: &str, pattern: &[Option<i64>]) -> ModelResult<Relation> {
        let rel = self
            .rels
            .get(name)
            .ok_or_else(|| RelationError::Unknown { name: name.into() })?;
        rel.matches(pattern)
    }

    /// Push all but `keep` members of a mode back to the noise mode.
    /// Diagnostic hook for exercising degenerate-mode removal.
    #[doc(hidden)]
    pub fn evict_members(&mut self, m: usize, keep: usize) -> ModelResult<()> {
        if m == 0 || m >= self.modes.len() {
            return Err(DataError::ModeOutOfRange {
                mode: m,
                len: self.modes.len(),
            }
            .into());
        }
        let victims: Vec<usize> = self.modes[m].members().iter().skip(keep).copied().collect();
        for i in victims {
            let (sig, target) = {
                let o = self.store.get(i);
                (o.sig, o.target)
            };
            let target_id = self.sigs.get(sig).entry(target).id;
            self.modes[m].del_example(i, target_id);
            {
                let o = self.store.get_mut(i);
                o.map_mode = 0;
                o.mode_prob[m] = 0.0;
                o.mode_prob[0] = self.cfg.pnoise;
                o.obj_map.clear();
            }
            self.modes[0].add_example(i, target_id, 0.0, &self.cfg)?;
            self.noise_by_sig.entry(sig).or_default().insert(i);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    /// Serialize engine state to `path`.
    pub fn save(&self, path: &Path) -> ModelResult<()> {
        let state = SavedState {
            cfg: self.cfg.clone(),
            sigs: self.sigs.clone(),
            store: self.store.clone(),
            modes: self.modes.clone(),
            noise_by_sig: self.noise_by_sig.clone(),
            rels: self.rels.clone(),
            check_after: self.check_after,
        };
        let file = File::create(path).map_err(StoreError::from)?;
        bincode::serialize_into(BufWriter::new(file), &state).map_err(|e| {
            StoreError::Serialization {
                message: e.to_string(),
            }
        })?;
        Ok(())
    }

    /// Load engine state saved by [`save`](Self::save), with default
    /// collaborators.
    pub fn load(path: &Path) -> ModelResult<Self> {
        Self::load_with_collaborators(path, Box::new(NullClauseLearner), Box::new(NoNumeric))
    }

    /// Load engine state with injected collaborators. Fallback regressors
    /// are rebuilt by replaying stored observations; clauses and numeric
    /// classifiers are retrained lazily at the next classification.
    pub fn load_with_collaborators(
        path: &Path,
        clause_learner: Box<dyn ClauseLearner>,
        numeric_trainer: Box<dyn NumericTrainer>,
    ) -> ModelResult<Self> {
        let file = File::open(path).map_err(StoreError::from)?;
        let state: SavedState =
            bincode::deserialize_from(BufReader::new(file)).map_err(|e| {
                StoreError::Serialization {
                    message: e.to_string(),
                }
            })?;
        state.cfg.validate()?;

        let mut store = state.store;
        store.replay_fallbacks();
        let mut modes = state.modes;
        for m in &mut modes {
            m.classifier_stale = true;
        }
        let rng = StdRng::seed_from_u64(state.cfg.seed);
        Ok(Self {
            sigs: state.sigs,
            store,
            modes,
            noise_by_sig: state.noise_by_sig,
            rels: state.rels,
            ensemble: EnsembleTable::new(),
            check_after: state.check_after,
            assignments: BTreeMap::new(),
            timers: Timers::new(),
            rng,
            clause_learner,
            numeric_trainer,
            cfg: state.cfg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig::SigEntry;

    fn entry(id: i64, kind: i64, props: &[&str]) -> SigEntry {
        SigEntry {
            id,
            name: format!("o{id}"),
            kind,
            props: props.iter().map(|p| p.to_string()).collect(),
            start: 0,
        }
    }

    fn scene1() -> Signature {
        let mut s = Signature::new();
        s.add(entry(1, 0, &["px"]));
        s
    }

    fn small_cfg() -> LearnerConfig {
        LearnerConfig {
            new_mode_thresh: 8,
            seed: 42,
            ..Default::default()
        }
    }

    #[test]
    fn new_observations_start_in_noise() {
        let mut l = Learner::new(small_cfg()).unwrap();
        let sc = scene1();
        l.learn(0, &sc, &RelationTable::new(), DVector::from_vec(vec![1.0]), 2.0)
            .unwrap();
        assert_eq!(l.nmodes(), 1);
        assert_eq!(l.map_modes(), vec![0]);
        assert_eq!(l.mode_members(0).unwrap().len(), 1);
        assert_eq!(l.info().noise_size, 1);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut l = Learner::new(small_cfg()).unwrap();
        let sc = scene1();
        let err = l
            .learn(0, &sc, &RelationTable::new(), DVector::from_vec(vec![1.0, 2.0]), 0.0)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ModelError::Data(DataError::DimMismatch { .. })
        ));
    }

    #[test]
    fn bad_target_rejected() {
        let mut l = Learner::new(small_cfg()).unwrap();
        let sc = scene1();
        let err = l
            .learn(3, &sc, &RelationTable::new(), DVector::from_vec(vec![1.0]), 0.0)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ModelError::Data(DataError::TargetOutOfRange { .. })
        ));
    }

    #[test]
    fn run_is_noop_when_em_disabled() {
        let cfg = LearnerConfig {
            use_em: false,
            ..small_cfg()
        };
        let mut l = Learner::new(cfg).unwrap();
        assert!(!l.run(10).unwrap());
    }

    #[test]
    fn predict_without_data_is_none() {
        let mut l = Learner::new(small_cfg()).unwrap();
        let sc = scene1();
        let out = l
            .predict(0, &sc, &RelationTable::new(), &DVector::from_vec(vec![1.0]))
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn discovery_promotes_linear_noise_to_a_mode() {
        let mut l = Learner::new(small_cfg()).unwrap();
        let sc = scene1();
        let rels = RelationTable::new();
        for i in 0..12 {
            let v = i as f64;
            l.learn(0, &sc, &rels, DVector::from_vec(vec![v]), 3.0 * v + 1.0)
                .unwrap();
        }
        assert!(l.run(20).unwrap());
        assert_eq!(l.nmodes(), 2);
        // Every observation fits the line exactly, so all migrate.
        assert!(l.map_modes().iter().all(|&m| m == 1));
        assert_eq!(l.mode_members(0).unwrap().len(), 0);
        assert_eq!(l.mode_members(1).unwrap().len(), 12);
    }

    #[test]
    fn membership_partitions_observations() {
        let mut l = Learner::new(small_cfg()).unwrap();
        let sc = scene1();
        let rels = RelationTable::new();
        for i in 0..20 {
            let v = i as f64;
            let y = if i % 2 == 0 { 2.0 * v } else { 17.0 + (v * 31.0) % 7.0 };
            l.learn(0, &sc, &rels, DVector::from_vec(vec![v]), y).unwrap();
        }
        l.run(30).unwrap();
        let mut seen = BTreeSet::new();
        for m in 0..l.nmodes() {
            for &i in l.mode_members(m).unwrap() {
                assert!(seen.insert(i), "observation {i} in two modes");
            }
        }
        assert_eq!(seen.len(), l.ndata());
    }

    #[test]
    fn dump_mode_rejects_bad_index() {
        let l = Learner::new(small_cfg()).unwrap();
        assert!(l.dump_mode(5).is_err());
    }

    #[test]
    fn dump_relation_unknown_name_errors() {
        let l = Learner::new(small_cfg()).unwrap();
        assert!(l.dump_relation("on", &[]).is_err());
    }
}
