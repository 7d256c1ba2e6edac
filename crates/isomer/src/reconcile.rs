//! Reconciliation of desired bindings against the live bindings table.
//!
//! Both sides are reduced to a map from [`BindingKey`] to label. A desired
//! key that is missing from the live table, or live under another label, is
//! added. A live key whose label is not the desired one is removed. A label
//! change therefore shows up as a removal followed by an addition of the same
//! key. Removals are applied before additions.

use std::collections::HashMap;
use std::fmt;

use crate::binding::Binding;
use crate::error::{IsomerError, Result};
use crate::key::BindingKey;

/// Bindings keyed by their trie key.
pub type KeyLabels = HashMap<BindingKey, String>;

/// Reduces desired bindings to a key map.
///
/// Fails with [`IsomerError::ConflictingBinding`] if two bindings share a key
/// but not a label, since only one of them could be stored.
pub fn desired_keys(bindings: &[Binding]) -> Result<KeyLabels> {
    let mut keys = KeyLabels::with_capacity(bindings.len());
    for binding in bindings {
        let key = BindingKey::from(binding);
        if let Some(other) = keys.get(&key) {
            if other != binding.label() {
                return Err(IsomerError::ConflictingBinding {
                    binding: binding.to_string(),
                    other: other.clone(),
                });
            }
            continue;
        }
        keys.insert(key, binding.label().to_string());
    }
    Ok(keys)
}

/// Changes needed to turn the live table into the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingDiff {
    /// Bindings to write, most specific first.
    pub added: Vec<Binding>,
    /// Bindings to delete, most specific first.
    pub removed: Vec<Binding>,
}

impl BindingDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Operations in the order they must be applied.
    pub fn operations(&self) -> impl Iterator<Item = ReconcileOp> + '_ {
        self.removed
            .iter()
            .cloned()
            .map(ReconcileOp::Remove)
            .chain(self.added.iter().cloned().map(ReconcileOp::Add))
    }
}

/// Computes the difference between `live` and `desired`.
///
/// # Errors
///
/// [`IsomerError::MalformedKey`] if a key cannot be decoded back into a
/// binding.
pub fn diff_bindings(live: &KeyLabels, desired: &KeyLabels) -> Result<BindingDiff> {
    let mut diff = BindingDiff::default();

    for (key, label) in desired {
        if live.get(key) != Some(label) {
            diff.added.push(key.to_binding(label)?);
        }
    }

    for (key, label) in live {
        if desired.get(key) != Some(label) {
            diff.removed.push(key.to_binding(label)?);
        }
    }

    diff.added.sort();
    diff.removed.sort();
    Ok(diff)
}

/// Convenience wrapper: diff desired bindings against a live snapshot.
pub fn reconcile(desired: &[Binding], live: &KeyLabels) -> Result<BindingDiff> {
    diff_bindings(live, &desired_keys(desired)?)
}

/// A single kernel table operation produced by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOp {
    Add(Binding),
    Remove(Binding),
}

impl ReconcileOp {
    pub fn binding(&self) -> &Binding {
        match self {
            ReconcileOp::Add(binding) | ReconcileOp::Remove(binding) => binding,
        }
    }
}

impl fmt::Display for ReconcileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileOp::Add(binding) => write!(f, "add {}", binding),
            ReconcileOp::Remove(binding) => write!(f, "remove {}", binding),
        }
    }
}

/// Outcome of applying a [`BindingDiff`].
///
/// Nothing is rolled back: the caller decides whether to retry the failed
/// operations.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub succeeded: Vec<ReconcileOp>,
    pub failed: Vec<(ReconcileOp, IsomerError)>,
}

impl ReconcileReport {
    /// True if every operation succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn added(&self) -> impl Iterator<Item = &Binding> {
        self.succeeded.iter().filter_map(|op| match op {
            ReconcileOp::Add(binding) => Some(binding),
            ReconcileOp::Remove(_) => None,
        })
    }

    pub fn removed(&self) -> impl Iterator<Item = &Binding> {
        self.succeeded.iter().filter_map(|op| match op {
            ReconcileOp::Remove(binding) => Some(binding),
            ReconcileOp::Add(_) => None,
        })
    }
}
