//! Scene signatures: the structural shape of an observation's input vector.
//!
//! A signature lists which typed objects the vector encodes and which named
//! properties each contributes. Two observations share a signature when
//! their entries agree in count, order, type, and property lists; object
//! identities and display names do not participate in equality, since the
//! same structural situation can recur with different concrete objects.

use serde::{Deserialize, Serialize};

/// Stable identifier of an interned signature.
pub type SigId = usize;

/// One object's slice of the input vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigEntry {
    /// Concrete object identity in the environment.
    pub id: i64,
    /// Display name, diagnostic only.
    pub name: String,
    /// Object type; role matching is by type.
    pub kind: i64,
    /// Ordered property names this object contributes.
    pub props: Vec<String>,
    /// Offset of the first property in the input vector.
    pub start: usize,
}

impl SigEntry {
    /// Structural comparison: type and property list only.
    pub fn same_shape(&self, other: &SigEntry) -> bool {
        self.kind == other.kind && self.props == other.props
    }
}

/// Ordered sequence of object entries describing an input vector.
///
/// Immutable once interned; the registry only ever appends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signature {
    entries: Vec<SigEntry>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, recomputing its start offset to keep the layout
    /// contiguous.
    pub fn add(&mut self, mut entry: SigEntry) {
        entry.start = self.dim();
        self.entries.push(entry);
    }

    /// Total input dimension: sum of property-list lengths.
    pub fn dim(&self) -> usize {
        self.entries.iter().map(|e| e.props.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SigEntry] {
        &self.entries
    }

    pub fn entry(&self, i: usize) -> &SigEntry {
        &self.entries[i]
    }

    /// Index of the entry carrying object identity `id`.
    pub fn find_id(&self, id: i64) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Structural equality, ignoring object identities and names.
    pub fn same_shape(&self, other: &Signature) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.same_shape(b))
    }
}

/// Append-only registry deduplicating signatures by structural shape.
///
/// Historical observations keep referring to their `SigId` forever, so
/// entries are never removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureRegistry {
    sigs: Vec<Signature>,
}

impl SignatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id of a structurally equal signature, interning a copy if
    /// none exists yet.
    pub fn intern(&mut self, sig: &Signature) -> SigId {
        if let Some(id) = self.find(sig) {
            return id;
        }
        self.sigs.push(sig.clone());
        self.sigs.len() - 1
    }

    /// Look up a structurally equal signature without interning.
    pub fn find(&self, sig: &Signature) -> Option<SigId> {
        self.sigs.iter().position(|s| s.same_shape(sig))
    }

    pub fn get(&self, id: SigId) -> &Signature {
        &self.sigs[id]
    }

    pub fn len(&self) -> usize {
        self.sigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigs.is_empty()
    }
}
