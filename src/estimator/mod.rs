//! The estimator interface (spec.md §2, §4.8 in SPEC_FULL.md): a
//! transactional graph of variables and constraints, external to the
//! core per spec.md §1, modeled here as a trait plus one reference
//! implementation good enough to make the crate buildable and
//! testable end to end.

pub mod reference;

use std::sync::Arc;

use crate::transaction::{Transaction, VariableId, VariableValue};

/// A read-only snapshot of the graph's variable values after an
/// optimization pass. Front-ends hold these by `Arc` clone only —
/// never a live reference into the estimator's state (spec.md §5).
#[derive(Clone, Debug, Default)]
pub struct GraphSnapshot {
    pub values: std::collections::HashMap<VariableId, VariableValue>,
}

impl GraphSnapshot {
    pub fn get(&self, id: &VariableId) -> Option<&VariableValue> {
        self.values.get(id)
    }
}

/// The transactional graph contract every front-end programs against.
/// A real deployment backs this with GTSAM/g2o/Ceres; this crate ships
/// `reference::ReferenceGraph` so it is runnable standalone.
pub trait GraphEstimator {
    /// Apply a transaction atomically. Honors `override_variables` /
    /// `override_constraints` (spec.md §9): with both set, applying
    /// the same transaction twice yields identical state, never
    /// duplicate variables or constraints.
    fn apply(&mut self, txn: Transaction);

    /// Run (or continue) optimization, bounded by `deadline` wall
    /// clock seconds if `Some`.
    fn optimize(&mut self, deadline_s: Option<f64>);

    /// Current value of a single variable, if present.
    fn variable(&self, id: &VariableId) -> Option<VariableValue>;

    /// A read-only snapshot of every variable, handed out by `Arc` so
    /// holders never block the estimator's next mutation.
    fn snapshot(&self) -> Arc<GraphSnapshot>;

    fn num_variables(&self) -> usize;
    fn num_constraints(&self) -> usize;
}
