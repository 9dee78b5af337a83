//! Mutation state machine.
//!
//! ```text
//! Idle -> Applying -> Pending -> Reconciling -> Idle
//!            |           |
//!            +-----------+----> RollingBack -> Idle
//! ```

use qsync_core::StateError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationState {
    Idle,
    /// Optimistic patches are being written.
    Applying,
    /// The transport call is in flight.
    Pending,
    /// The server accepted the mutation; affected entries are refreshed.
    Reconciling,
    /// Optimistic patches are being reverted.
    RollingBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationEvent {
    Begin,
    Applied,
    Succeeded,
    Failed,
    Aborted,
    Settled,
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for MutationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Next state for `event`, or an error for transitions the machine does not
/// allow.
pub fn transition(state: MutationState, event: MutationEvent) -> Result<MutationState, StateError> {
    use MutationEvent as E;
    use MutationState as S;

    match (state, event) {
        (S::Idle, E::Begin) => Ok(S::Applying),
        (S::Applying, E::Applied) => Ok(S::Pending),
        (S::Applying, E::Failed) => Ok(S::RollingBack),
        (S::Pending, E::Succeeded) => Ok(S::Reconciling),
        (S::Pending, E::Failed) | (S::Pending, E::Aborted) => Ok(S::RollingBack),
        (S::Reconciling, E::Settled) | (S::RollingBack, E::Settled) => Ok(S::Idle),
        (from, event) => Err(StateError::IllegalTransition {
            from: from.to_string(),
            event: event.to_string(),
        }),
    }
}
