//! The erasure sentinel: the value a step uses to say "this key is
//! withdrawn" rather than forwarding a replacement.

use std::fmt;

/// The value half of a [`State`](crate::state::State).
///
/// A step may only ever produce [`StateValue::Erased`] for a key it
/// introduced itself (never for a key it merely accepted from upstream —
/// see spec §3's invariants). Downstream steps and the sink treat an erased
/// key as withdrawn; the engine does not filter erased keys out of the
/// final result on its own, since whether "withdrawn" means "drop it" or
/// "show it as removed" is a caller decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValue<V> {
    /// A live value produced or passed through by a step.
    Present(V),
    /// This key has been withdrawn.
    Erased,
}

impl<V> StateValue<V> {
    pub fn is_erased(&self) -> bool {
        matches!(self, StateValue::Erased)
    }

    pub fn as_ref(&self) -> StateValue<&V> {
        match self {
            StateValue::Present(v) => StateValue::Present(v),
            StateValue::Erased => StateValue::Erased,
        }
    }

    /// Returns the present value, or `None` if erased.
    pub fn into_option(self) -> Option<V> {
        match self {
            StateValue::Present(v) => Some(v),
            StateValue::Erased => None,
        }
    }
}

impl<V: fmt::Debug> fmt::Display for StateValue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Present(v) => write!(f, "{v:?}"),
            StateValue::Erased => write!(f, "<erased>"),
        }
    }
}
