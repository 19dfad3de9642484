//! The state reducer seam
//!
//! The resource-graph reducer is an external collaborator: pure,
//! synchronous, deterministic, failing only on malformed deltas. The
//! reconciliation engine re-derives state by replaying deltas from the
//! last confirmed point forward; it never computes an inverse delta.
//!
//! [`RegisterReducer`] is the in-tree reference implementation driving the
//! tests and the harness.

use std::collections::BTreeMap;

use fabula_core::{DeltaAspect, DeltaBody, FabulaError, FabulaResult, Mutation, MutationOp};

/// Structural side effect of applying one delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassageKind {
    Created,
    Updated,
    Removed,
}

/// One structural passage: which register changed shape and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Passage {
    pub kind: PassageKind,
    pub register: String,
}

/// Deterministic, replayable state transformation.
pub trait Reducer: Send + Sync {
    type State: Clone + Send + Sync;

    fn initial(&self) -> Self::State;

    /// Apply one delta, returning the new state and the structural
    /// passages it caused. Fails only on a malformed delta, which is
    /// fatal.
    fn apply(
        &self,
        state: &Self::State,
        delta: &DeltaAspect,
    ) -> FabulaResult<(Self::State, Vec<Passage>)>;
}

/// Reference state: a flat map of named registers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterMap {
    registers: BTreeMap<String, String>,
}

impl RegisterMap {
    pub fn get(&self, register: &str) -> Option<&str> {
        self.registers.get(register).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

/// Reference reducer over [`RegisterMap`] states.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterReducer;

impl RegisterReducer {
    fn apply_mutation(
        state: &mut RegisterMap,
        passages: &mut Vec<Passage>,
        mutation: &Mutation,
    ) -> FabulaResult<()> {
        if mutation.register.is_empty() {
            return Err(FabulaError::MalformedDelta(
                "mutation of unnamed register".to_string(),
            ));
        }
        match &mutation.op {
            MutationOp::Set(value) => {
                let kind = if state.registers.contains_key(&mutation.register) {
                    PassageKind::Updated
                } else {
                    PassageKind::Created
                };
                state
                    .registers
                    .insert(mutation.register.clone(), value.clone());
                passages.push(Passage {
                    kind,
                    register: mutation.register.clone(),
                });
            }
            MutationOp::Append(value) => {
                let kind = if state.registers.contains_key(&mutation.register) {
                    PassageKind::Updated
                } else {
                    PassageKind::Created
                };
                state
                    .registers
                    .entry(mutation.register.clone())
                    .or_default()
                    .push_str(value);
                passages.push(Passage {
                    kind,
                    register: mutation.register.clone(),
                });
            }
            MutationOp::Remove => {
                // Removing an absent register is a no-op so replay stays
                // insensitive to confirmed/speculative interleaving.
                if state.registers.remove(&mutation.register).is_some() {
                    passages.push(Passage {
                        kind: PassageKind::Removed,
                        register: mutation.register.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_body(
        state: &mut RegisterMap,
        passages: &mut Vec<Passage>,
        delta: &DeltaAspect,
    ) -> FabulaResult<()> {
        match &delta.body {
            DeltaBody::Mutate(mutation) => Self::apply_mutation(state, passages, mutation),
            DeltaBody::Transacted { actions } => {
                for action in actions {
                    Self::apply_body(state, passages, action)?;
                }
                Ok(())
            }
        }
    }
}

impl Reducer for RegisterReducer {
    type State = RegisterMap;

    fn initial(&self) -> RegisterMap {
        RegisterMap::default()
    }

    fn apply(
        &self,
        state: &RegisterMap,
        delta: &DeltaAspect,
    ) -> FabulaResult<(RegisterMap, Vec<Passage>)> {
        let mut next = state.clone();
        let mut passages = Vec::new();
        Self::apply_body(&mut next, &mut passages, delta)?;
        Ok((next, passages))
    }
}
