//! Horn clauses over the relation table, and the contract for learning them.
//!
//! The engine never induces clauses itself; it evaluates clauses produced by
//! an external relational learner (role disambiguation, pairwise mode
//! classifiers) against the accumulated [`RelationTable`]. Evaluation is a
//! small backtracking search over variable bindings: callers pre-seed the
//! domains of the bound variables (time, target, role candidates) and read
//! back the narrowed bindings on success.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::relation::{Relation, RelationTable};

/// One literal: a (possibly negated) application of a named relation to
/// clause variables. Variable 0 is the time index by convention, variable 1
/// the target object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Literal {
    pub name: String,
    pub args: Vec<usize>,
    pub negated: bool,
}

impl Literal {
    pub fn new(name: impl Into<String>, args: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            args,
            negated: false,
        }
    }

    pub fn negated(name: impl Into<String>, args: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            args,
            negated: true,
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.negated {
            write!(f, "~")?;
        }
        write!(f, "{}(", self.name)?;
        for (i, a) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "?{a}")?;
        }
        write!(f, ")")
    }
}

/// A conjunction of literals.
pub type Clause = Vec<Literal>;

/// Candidate value sets per clause variable.
pub type VarDomains = BTreeMap<usize, BTreeSet<i64>>;

/// Test whether `clause` is satisfiable against `rels` under `domains`.
///
/// On success, every variable's domain is narrowed to the single binding of
/// the first satisfying assignment found (variables are tried in ascending
/// order, values in ascending order, so the result is deterministic). On
/// failure the domains are left untouched.
pub fn test_clause(clause: &Clause, rels: &RelationTable, domains: &mut VarDomains) -> bool {
    // Collect every variable with its candidate values.
    let mut vars: BTreeMap<usize, BTreeSet<i64>> = domains.clone();
    for lit in clause {
        for (pos, &var) in lit.args.iter().enumerate() {
            if vars.contains_key(&var) {
                continue;
            }
            if lit.negated {
                // A variable appearing only under negation has no generator.
                continue;
            }
            let candidates = rels
                .get(&lit.name)
                .map(|r| r.at_pos(pos))
                .unwrap_or_default();
            vars.entry(var).or_default().extend(candidates);
        }
    }
    for lit in clause {
        for &var in &lit.args {
            if !vars.contains_key(&var) || vars[&var].is_empty() {
                return false;
            }
        }
    }

    let order: Vec<usize> = vars.keys().copied().collect();
    let mut binding: BTreeMap<usize, i64> = BTreeMap::new();
    if search(&order, 0, &vars, clause, rels, &mut binding) {
        for (&var, &val) in &binding {
            domains.insert(var, BTreeSet::from([val]));
        }
        true
    } else {
        false
    }
}

fn search(
    order: &[usize],
    depth: usize,
    vars: &BTreeMap<usize, BTreeSet<i64>>,
    clause: &Clause,
    rels: &RelationTable,
    binding: &mut BTreeMap<usize, i64>,
) -> bool {
    if depth == order.len() {
        return clause.iter().all(|lit| literal_holds(lit, rels, binding));
    }
    let var = order[depth];
    for &val in &vars[&var] {
        binding.insert(var, val);
        // Prune on literals whose variables are all bound.
        let consistent = clause
            .iter()
            .filter(|lit| lit.args.iter().all(|a| binding.contains_key(a)))
            .all(|lit| literal_holds(lit, rels, binding));
        if consistent && search(order, depth + 1, vars, clause, rels, binding) {
            return true;
        }
        binding.remove(&var);
    }
    false
}

fn literal_holds(lit: &Literal, rels: &RelationTable, binding: &BTreeMap<usize, i64>) -> bool {
    let tuple: Vec<i64> = lit.args.iter().map(|a| binding[a]).collect();
    let present = rels
        .get(&lit.name)
        .map(|r| r.contains(&tuple))
        .unwrap_or(false);
    present != lit.negated
}

/// Test a disjunction of clauses; returns the index of the first satisfied
/// clause, narrowing `domains` to its binding, or `None`.
pub fn test_clause_vec(
    clauses: &[Clause],
    rels: &RelationTable,
    domains: &mut VarDomains,
) -> Option<usize> {
    for (i, clause) in clauses.iter().enumerate() {
        let mut scratch = domains.clone();
        if test_clause(clause, rels, &mut scratch) {
            *domains = scratch;
            return Some(i);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Learner contract
// ---------------------------------------------------------------------------

/// Output of the relational clause learner: separating clauses plus one
/// residual relation per clause (false positives) and one trailing residual
/// (false negatives of the whole clause list).
#[derive(Debug, Clone)]
pub struct ClauseSplit {
    pub clauses: Vec<Clause>,
    pub residuals: Vec<Relation>,
}

impl ClauseSplit {
    /// A split with no clauses: the whole positive side is left as the
    /// trailing residual.
    pub fn unseparated(pos: &Relation) -> Self {
        Self {
            clauses: Vec::new(),
            residuals: vec![pos.clone()],
        }
    }
}

/// External relational rule learner (a Horn-clause induction procedure).
///
/// Implementations receive the membership relations of two modes (positive
/// and negative examples, time-first tuples) and the accumulated relation
/// table, and return clauses covering the positive side.
pub trait ClauseLearner {
    fn learn_separating(
        &mut self,
        pos: &Relation,
        neg: &Relation,
        rels: &RelationTable,
    ) -> ClauseSplit;
}

/// Default collaborator: learns nothing, leaving disambiguation entirely to
/// the numeric fallback and default votes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClauseLearner;

impl ClauseLearner for NullClauseLearner {
    fn learn_separating(
        &mut self,
        pos: &Relation,
        _neg: &Relation,
        _rels: &RelationTable,
    ) -> ClauseSplit {
        ClauseSplit::unseparated(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(name: &str, arity: usize, tuples: &[&[i64]]) -> RelationTable {
        let mut r = Relation::new(arity);
        for t in tuples {
            r.add(t[0], &t[1..]).unwrap();
        }
        let mut tbl = RelationTable::new();
        tbl.insert(name.into(), r);
        tbl
    }

    fn domains(pairs: &[(usize, &[i64])]) -> VarDomains {
        pairs
            .iter()
            .map(|(v, vals)| (*v, vals.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn positive_literal_narrows_domain() {
        let tbl = table_with("left-of", 3, &[[0, 1, 7].as_slice()]);
        let clause = vec![Literal::new("left-of", vec![0, 1, 2])];
        let mut doms = domains(&[(0, &[0]), (1, &[1]), (2, &[7, 9])]);
        assert!(test_clause(&clause, &tbl, &mut doms));
        assert_eq!(doms[&2], BTreeSet::from([7]));
    }

    #[test]
    fn unsatisfiable_clause_fails_and_preserves_domains() {
        let tbl = table_with("left-of", 3, &[[0, 1, 7].as_slice()]);
        let clause = vec![Literal::new("left-of", vec![0, 1, 2])];
        let mut doms = domains(&[(0, &[0]), (1, &[1]), (2, &[9])]);
        assert!(!test_clause(&clause, &tbl, &mut doms));
        assert_eq!(doms[&2], BTreeSet::from([9]));
    }

    #[test]
    fn negated_literal_requires_absence() {
        let tbl = table_with("touching", 3, &[[0, 1, 7].as_slice()]);
        let clause = vec![Literal::negated("touching", vec![0, 1, 2])];
        let mut doms = domains(&[(0, &[0]), (1, &[1]), (2, &[7])]);
        assert!(!test_clause(&clause, &tbl, &mut doms));
        let mut doms = domains(&[(0, &[0]), (1, &[1]), (2, &[9])]);
        assert!(test_clause(&clause, &tbl, &mut doms));
    }

    #[test]
    fn missing_relation_fails_positive_literals() {
        let tbl = RelationTable::new();
        let clause = vec![Literal::new("on", vec![0, 1])];
        let mut doms = domains(&[(0, &[0]), (1, &[1])]);
        assert!(!test_clause(&clause, &tbl, &mut doms));
    }

    #[test]
    fn clause_vec_returns_first_match() {
        let tbl = table_with("on", 2, &[[0, 4].as_slice()]);
        let miss = vec![Literal::new("under", vec![0, 1])];
        let hit = vec![Literal::new("on", vec![0, 1])];
        let mut doms = domains(&[(0, &[0]), (1, &[4])]);
        assert_eq!(test_clause_vec(&[miss, hit], &tbl, &mut doms), Some(1));
    }

    #[test]
    fn free_variable_generated_from_relation_column() {
        // Variable 2 has no seeded domain; candidates come from the table.
        let tbl = table_with("left-of", 3, &[[0, 1, 7].as_slice(), [0, 1, 8].as_slice()]);
        let clause = vec![Literal::new("left-of", vec![0, 1, 2])];
        let mut doms = domains(&[(0, &[0]), (1, &[1])]);
        assert!(test_clause(&clause, &tbl, &mut doms));
        // First satisfying binding in ascending order.
        assert_eq!(doms[&2], BTreeSet::from([7]));
    }
}
