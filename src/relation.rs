//! Time-indexed relational facts.
//!
//! A [`Relation`] is a named, arity-fixed set of integer tuples whose first
//! element is always a time index. The controller accumulates one relation
//! per name in a [`RelationTable`]; facts arriving from the environment each
//! tick are merged by dropping their leading time component and re-adding
//! them under the store's own numbering.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ModelResult, RelationError};

/// One fact: an ordered tuple of integers, time first.
pub type Tuple = Vec<i64>;

/// An arity-fixed set of tuples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    arity: usize,
    tuples: BTreeSet<Tuple>,
}

impl Relation {
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            tuples: BTreeSet::new(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Add the tuple `(time, rest...)`.
    pub fn add(&mut self, time: i64, rest: &[i64]) -> ModelResult<bool> {
        if rest.len() + 1 != self.arity {
            return Err(RelationError::ArityMismatch {
                expected: self.arity,
                actual: rest.len() + 1,
            }
            .into());
        }
        let mut t = Vec::with_capacity(self.arity);
        t.push(time);
        t.extend_from_slice(rest);
        Ok(self.tuples.insert(t))
    }

    /// Remove the tuple `(time, rest...)` if present.
    pub fn del(&mut self, time: i64, rest: &[i64]) -> bool {
        let mut t = Vec::with_capacity(self.arity);
        t.push(time);
        t.extend_from_slice(rest);
        self.tuples.remove(&t)
    }

    pub fn contains(&self, tuple: &[i64]) -> bool {
        self.tuples.contains(tuple)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.iter()
    }

    /// Distinct values occurring at position `pos`.
    pub fn at_pos(&self, pos: usize) -> BTreeSet<i64> {
        self.tuples.iter().map(|t| t[pos]).collect()
    }

    /// Tuples with the leading time component stripped. All tuples from one
    /// tick share a time value, so the result collapses per-tick copies.
    pub fn drop_first(&self) -> BTreeSet<Tuple> {
        self.tuples.iter().map(|t| t[1..].to_vec()).collect()
    }

    /// Tuples matching a wildcard pattern (`None` matches anything). The
    /// pattern may be shorter than the arity; trailing positions are free.
    pub fn matches(&self, pattern: &[Option<i64>]) -> ModelResult<Relation> {
        if pattern.len() > self.arity {
            return Err(RelationError::PatternTooLong {
                pattern: pattern.len(),
                arity: self.arity,
            }
            .into());
        }
        let mut out = Relation::new(self.arity);
        for t in &self.tuples {
            let ok = pattern
                .iter()
                .zip(t.iter())
                .all(|(p, v)| p.is_none_or(|p| p == *v));
            if ok {
                out.tuples.insert(t.clone());
            }
        }
        Ok(out)
    }
}

/// Named relations accumulated over the run.
pub type RelationTable = BTreeMap<String, Relation>;

/// Merge one tick's facts into the accumulated table under time `time`.
///
/// Unknown relation names are copied wholesale; known ones get the incoming
/// tuples re-stamped with `time`.
pub fn extend_table(tbl: &mut RelationTable, delta: &RelationTable, time: i64) -> ModelResult<()> {
    for (name, incoming) in delta {
        match tbl.get_mut(name) {
            None => {
                tbl.insert(name.clone(), incoming.clone());
            }
            Some(accum) => {
                for rest in incoming.drop_first() {
                    accum.add(time, &rest)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_contains() {
        let mut r = Relation::new(3);
        assert!(r.add(0, &[1, 2]).unwrap());
        assert!(!r.add(0, &[1, 2]).unwrap()); // duplicate
        assert!(r.contains(&[0, 1, 2]));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn arity_mismatch_rejected() {
        let mut r = Relation::new(2);
        assert!(r.add(0, &[1, 2]).is_err());
    }

    #[test]
    fn del_removes() {
        let mut r = Relation::new(2);
        r.add(3, &[7]).unwrap();
        assert!(r.del(3, &[7]));
        assert!(r.is_empty());
    }

    #[test]
    fn at_pos_collects_column() {
        let mut r = Relation::new(2);
        r.add(0, &[5]).unwrap();
        r.add(1, &[5]).unwrap();
        r.add(2, &[9]).unwrap();
        let vals = r.at_pos(1);
        assert_eq!(vals, BTreeSet::from([5, 9]));
    }

    #[test]
    fn matches_with_wildcards() {
        let mut r = Relation::new(3);
        r.add(0, &[1, 2]).unwrap();
        r.add(1, &[1, 3]).unwrap();
        r.add(2, &[4, 2]).unwrap();
        let m = r.matches(&[None, Some(1)]).unwrap();
        assert_eq!(m.len(), 2);
        let too_long = r.matches(&[None, None, None, None]);
        assert!(too_long.is_err());
    }

    #[test]
    fn extend_restamps_time() {
        let mut tbl = RelationTable::new();
        let mut delta = RelationTable::new();
        let mut on = Relation::new(3);
        on.add(0, &[10, 20]).unwrap();
        delta.insert("on".into(), on.clone());

        extend_table(&mut tbl, &delta, 5).unwrap();
        // First merge copies wholesale, original stamp preserved.
        assert!(tbl["on"].contains(&[0, 10, 20]));

        extend_table(&mut tbl, &delta, 6).unwrap();
        assert!(tbl["on"].contains(&[6, 10, 20]));
        assert_eq!(tbl["on"].len(), 2);
    }
}
