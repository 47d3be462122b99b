//! Vector-clock algebra.
//!
//! A clock maps each actor to the highest sequence number of that actor's
//! changes we hold. Comparison and merge are the only two operations the
//! sync protocol needs: `less_or_equal` decides who is ahead, `merge` is the
//! pointwise maximum. Neither is antisymmetric; two clocks that are not
//! mutually ordered are concurrent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use yrs::StateVector;

/// An actor authors changes. One device may use many actors over time;
/// the CRDT engine assigns one per replica.
pub type ActorId = u64;

/// Per-actor maximum sequence number.
///
/// Backed by a `BTreeMap` so JSON encoding always emits keys in ascending
/// order, which keeps the wire form byte-deterministic across peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(pub BTreeMap<ActorId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, actor: ActorId) -> u64 {
        self.0.get(&actor).copied().unwrap_or(0)
    }

    pub fn set(&mut self, actor: ActorId, seq: u64) {
        if seq > 0 {
            self.0.insert(actor, seq);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build the engine-native state vector for diff extraction.
    pub fn to_state_vector(&self) -> StateVector {
        let mut sv = StateVector::default();
        for (&actor, &seq) in &self.0 {
            sv.set_max(actor, seq as u32);
        }
        sv
    }
}

impl From<&StateVector> for VectorClock {
    fn from(sv: &StateVector) -> Self {
        let mut clock = VectorClock::new();
        for (&actor, &seq) in sv.iter() {
            clock.set(actor, seq as u64);
        }
        clock
    }
}

/// True iff every entry of `a` is covered by `b` (absent keys read as zero).
pub fn less_or_equal(a: &VectorClock, b: &VectorClock) -> bool {
    a.0.iter().all(|(&actor, &seq)| seq <= b.get(actor))
}

/// Pointwise maximum over the union of both key sets.
pub fn merge(a: &VectorClock, b: &VectorClock) -> VectorClock {
    let mut out = a.clone();
    for (&actor, &seq) in &b.0 {
        if seq > out.get(actor) {
            out.set(actor, seq);
        }
    }
    out
}
