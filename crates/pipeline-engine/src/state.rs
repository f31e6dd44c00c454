//! Immutable `(generation, value)` pairs.

use crate::erasure::StateValue;
use crate::generation::Generation;

/// The authoritative state of a key at a point in the pipeline.
///
/// `State` is immutable; [`State::with_value`] and [`State::with_gens`]
/// return a modified copy rather than mutating in place, matching the
/// donor's `with_changes` pattern for its config/profile value types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State<V> {
    pub gens: Generation,
    pub value: StateValue<V>,
}

impl<V> State<V> {
    pub fn new(gens: Generation, value: StateValue<V>) -> Self {
        Self { gens, value }
    }

    pub fn present(gens: Generation, value: V) -> Self {
        Self {
            gens,
            value: StateValue::Present(value),
        }
    }

    pub fn erased(gens: Generation) -> Self {
        Self {
            gens,
            value: StateValue::Erased,
        }
    }

    /// Returns a copy with `gens` replaced, value unchanged.
    #[must_use]
    pub fn with_gens(&self, gens: Generation) -> Self
    where
        V: Clone,
    {
        Self {
            gens,
            value: self.value.clone(),
        }
    }

    /// Returns a copy with `value` replaced, generation unchanged.
    #[must_use]
    pub fn with_value(&self, value: StateValue<V>) -> Self
    where
        V: Clone,
    {
        Self {
            gens: self.gens.clone(),
            value,
        }
    }
}
