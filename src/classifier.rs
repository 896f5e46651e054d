//! Pairwise mode classifiers and the table that holds them.
//!
//! For every ordered mode pair i < j the ensemble keeps one classifier that
//! votes which of the two better explains a query. Each classifier is a
//! sequence of clause cases (clauses separating members of i from members of
//! j, each with a false-positive residual and an optional numeric
//! disambiguator), a trailing false-negative residual with its own numeric
//! fallback, and a default vote by membership size. Classifiers are always
//! rebuilt from scratch when either side's membership changed; they are
//! never patched in place and never persisted.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::DVector;

use crate::clause::{Clause, VarDomains, test_clause};
use crate::numeric::NumericModel;
use crate::relation::{Relation, RelationTable};

/// Which side of an ordered mode pair a classifier favors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairVote {
    First,
    Second,
}

/// One separating clause with its false-positive residual. When the
/// residual is non-empty, `numeric` disambiguates rows the clause matches.
pub struct ClauseCase {
    pub clause: Clause,
    pub residual: Relation,
    pub numeric: Option<Box<dyn NumericModel>>,
}

impl std::fmt::Debug for ClauseCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClauseCase")
            .field("clause", &self.clause)
            .field("residual", &self.residual.len())
            .field("numeric", &self.numeric.is_some())
            .finish()
    }
}

/// Classifier for one ordered mode pair.
pub struct PairClassifier {
    /// Vote when nothing else applies; the larger membership wins.
    pub default_vote: PairVote,
    pub cases: Vec<ClauseCase>,
    /// Members of the first mode no clause covered.
    pub fallback_residual: Relation,
    /// Numeric catch-all trained on the false negatives, when any exist.
    pub fallback_numeric: Option<Box<dyn NumericModel>>,
}

impl std::fmt::Debug for PairClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairClassifier")
            .field("default_vote", &self.default_vote)
            .field("cases", &self.cases)
            .field("fallback_residual", &self.fallback_residual.len())
            .field("fallback_numeric", &self.fallback_numeric.is_some())
            .finish()
    }
}

impl PairClassifier {
    /// A classifier that only ever returns the default vote.
    pub fn constant(default_vote: PairVote) -> Self {
        Self {
            default_vote,
            cases: Vec::new(),
            fallback_residual: Relation::new(2),
            fallback_numeric: None,
        }
    }

    /// Vote on a query. Clauses are evaluated in order against the relation
    /// table with time pinned to 0 and the target bound; the first matching
    /// clause answers, through its numeric disambiguator when it has one.
    /// Unmatched queries fall to the catch-all numeric model, then to the
    /// default vote.
    pub fn vote(&self, target_id: i64, rels: &RelationTable, x: &DVector<f64>) -> PairVote {
        let mut domains = VarDomains::new();
        domains.insert(0, BTreeSet::from([0]));
        domains.insert(1, BTreeSet::from([target_id]));

        for case in &self.cases {
            let mut scratch = domains.clone();
            if test_clause(&case.clause, rels, &mut scratch) {
                return match &case.numeric {
                    Some(m) => numeric_vote(m.as_ref(), x),
                    None => PairVote::First,
                };
            }
        }
        if let Some(m) = &self.fallback_numeric {
            return numeric_vote(m.as_ref(), x);
        }
        self.default_vote
    }
}

fn numeric_vote(m: &dyn NumericModel, x: &DVector<f64>) -> PairVote {
    if m.classify(x) {
        PairVote::First
    } else {
        PairVote::Second
    }
}

/// All pairwise classifiers, keyed by ordered mode pair (i, j) with i < j.
#[derive(Debug, Default)]
pub struct EnsembleTable {
    pairs: BTreeMap<(usize, usize), PairClassifier>,
}

impl EnsembleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, i: usize, j: usize) -> Option<&PairClassifier> {
        debug_assert!(i < j);
        self.pairs.get(&(i, j))
    }

    pub fn set(&mut self, i: usize, j: usize, c: PairClassifier) {
        debug_assert!(i < j);
        self.pairs.insert((i, j), c);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(usize, usize), &PairClassifier)> {
        self.pairs.iter()
    }

    /// Drop classifiers touching removed modes and renumber the rest, in
    /// lock-step with mode compaction. `index_map[j]` is old mode `j`'s
    /// surviving index; removed modes map to 0.
    pub fn remove_modes(&mut self, index_map: &[usize]) {
        let old = std::mem::take(&mut self.pairs);
        for ((i, j), c) in old {
            let removed =
                |m: usize| -> bool { m != 0 && index_map[m] == 0 };
            if removed(i) || removed(j) {
                continue;
            }
            self.pairs.insert((index_map[i], index_map[j]), c);
        }
    }
}
