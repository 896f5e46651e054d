//! The append-only observation store.
//!
//! Observations are owned exclusively by the store and addressed by dense
//! integer ids; modes reference them by id only, never by pointer, so mode
//! removal and compaction are pure data operations. Per-signature buckets
//! group observations for noise binning and the fallback regressor.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::lwr::Lwr;
use crate::params;
use crate::sig::SigId;

/// One training example and its current mixture bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Raw input vector laid out per the signature.
    pub x: DVector<f64>,
    /// Target scalar.
    pub y: f64,
    /// Index of the target object within the signature.
    pub target: usize,
    /// Interned signature id.
    pub sig: SigId,
    /// Per-mode membership probability, one entry per mode.
    pub mode_prob: Vec<f64>,
    /// Per-mode staleness: true when `mode_prob[j]` may be outdated.
    pub prob_stale: Vec<bool>,
    /// MAP mode; equals `argmax(mode_prob)` after every completed E-step.
    pub map_mode: usize,
    /// Role assignment for the MAP mode (model role -> signature entry).
    pub obj_map: Vec<usize>,
}

impl Observation {
    /// Index of the largest probability, lowest index winning ties.
    pub fn argmax_mode(&self) -> usize {
        let mut best = 0;
        for (j, &p) in self.mode_prob.iter().enumerate() {
            if p > self.mode_prob[best] {
                best = j;
            }
        }
        best
    }
}

fn default_lwr() -> Lwr {
    Lwr::new(params::LWR_K)
}

/// All observations sharing one signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigBucket {
    /// Observation ids in arrival order.
    pub members: Vec<usize>,
    /// Fallback regressor over the bucket; rebuilt on load by replay.
    #[serde(skip, default = "default_lwr")]
    pub lwr: Lwr,
}

/// Arena of observations plus per-signature buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationStore {
    obs: Vec<Observation>,
    buckets: Vec<SigBucket>,
    lwr_k: usize,
}

impl ObservationStore {
    pub fn new(lwr_k: usize) -> Self {
        Self {
            obs: Vec::new(),
            buckets: Vec::new(),
            lwr_k,
        }
    }

    pub fn len(&self) -> usize {
        self.obs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obs.is_empty()
    }

    pub fn get(&self, i: usize) -> &Observation {
        &self.obs[i]
    }

    pub fn get_mut(&mut self, i: usize) -> &mut Observation {
        &mut self.obs[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.obs.iter()
    }

    /// Append an observation, updating its signature bucket and the
    /// bucket's fallback regressor. Returns the new id.
    pub fn push(&mut self, obs: Observation) -> usize {
        let id = self.obs.len();
        while self.buckets.len() <= obs.sig {
            self.buckets.push(SigBucket {
                members: Vec::new(),
                lwr: Lwr::new(self.lwr_k),
            });
        }
        let bucket = &mut self.buckets[obs.sig];
        bucket.members.push(id);
        bucket.lwr.learn(obs.x.clone(), obs.y);
        self.obs.push(obs);
        id
    }

    pub fn bucket(&self, sig: SigId) -> Option<&SigBucket> {
        self.buckets.get(sig)
    }

    /// Grow every observation's probability vector by one zeroed, stale
    /// slot. Called when a mode is created.
    pub fn grow_mode_slot(&mut self) {
        for o in &mut self.obs {
            o.mode_prob.push(0.0);
            o.prob_stale.push(true);
        }
    }

    /// Compact probability vectors and MAP indices after mode removal.
    ///
    /// `index_map[j]` gives the surviving index of old mode `j` (removed
    /// modes map to the noise mode, 0).
    pub fn compact_modes(&mut self, removed: &[usize], index_map: &[usize]) {
        for o in &mut self.obs {
            o.map_mode = index_map[o.map_mode];
            remove_indices(&mut o.mode_prob, removed);
            remove_indices(&mut o.prob_stale, removed);
        }
    }

    /// Rebuild all fallback regressors by replaying stored observations,
    /// after deserialization.
    pub fn replay_fallbacks(&mut self) {
        for bucket in &mut self.buckets {
            bucket.lwr = Lwr::new(self.lwr_k);
            for &i in &bucket.members {
                let o = &self.obs[i];
                bucket.lwr.learn(o.x.clone(), o.y);
            }
        }
    }
}

/// Remove the elements at `inds` (sorted ascending) from `v` in one pass.
pub fn remove_indices<T>(v: &mut Vec<T>, inds: &[usize]) {
    let mut next = 0;
    let mut write = 0;
    for read in 0..v.len() {
        if next < inds.len() && read == inds[next] {
            next += 1;
        } else {
            if write < read {
                v.swap(write, read);
            }
            write += 1;
        }
    }
    debug_assert_eq!(next, inds.len());
    v.truncate(write);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(sig: SigId, x: f64, y: f64) -> Observation {
        Observation {
            x: DVector::from_vec(vec![x]),
            y,
            target: 0,
            sig,
            mode_prob: vec![0.5, 0.2, 0.9],
            prob_stale: vec![false, false, false],
            map_mode: 2,
            obj_map: Vec::new(),
        }
    }

    #[test]
    fn push_assigns_dense_ids_and_buckets() {
        let mut store = ObservationStore::new(5);
        assert_eq!(store.push(obs(0, 1.0, 2.0)), 0);
        assert_eq!(store.push(obs(1, 2.0, 3.0)), 1);
        assert_eq!(store.push(obs(0, 3.0, 4.0)), 2);
        assert_eq!(store.bucket(0).unwrap().members, vec![0, 2]);
        assert_eq!(store.bucket(1).unwrap().members, vec![1]);
    }

    #[test]
    fn grow_mode_slot_extends_all() {
        let mut store = ObservationStore::new(5);
        store.push(obs(0, 1.0, 2.0));
        store.grow_mode_slot();
        let o = store.get(0);
        assert_eq!(o.mode_prob.len(), 4);
        assert_eq!(o.mode_prob[3], 0.0);
        assert!(o.prob_stale[3]);
    }

    #[test]
    fn compact_modes_remaps_map_and_probs() {
        let mut store = ObservationStore::new(5);
        store.push(obs(0, 1.0, 2.0));
        // Remove mode 1; old mode 2 becomes mode 1.
        store.compact_modes(&[1], &[0, 0, 1]);
        let o = store.get(0);
        assert_eq!(o.map_mode, 1);
        assert_eq!(o.mode_prob, vec![0.5, 0.9]);
    }

    #[test]
    fn remove_indices_skips_sorted_positions() {
        let mut v = vec![10, 11, 12, 13, 14];
        remove_indices(&mut v, &[1, 3]);
        assert_eq!(v, vec![10, 12, 14]);
    }

    #[test]
    fn replay_rebuilds_fallbacks() {
        let mut store = ObservationStore::new(5);
        store.push(obs(0, 1.0, 2.0));
        store.push(obs(0, 2.0, 3.0));
        store.replay_fallbacks();
        let bucket = store.bucket(0).unwrap();
        assert_eq!(bucket.lwr.len(), 2);
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        let mut o = obs(0, 1.0, 2.0);
        o.mode_prob = vec![0.9, 0.9, 0.1];
        assert_eq!(o.argmax_mode(), 0);
    }
}
