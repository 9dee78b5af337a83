//! qsync Mutation
//!
//! Turns mutation payloads into cache effects:
//! - [`PayloadWalker`] decomposes a nested payload into an [`EffectDescription`](qsync_core::EffectDescription)
//! - [`AffectedEntryResolver`] finds the cached queries a mutation may change
//! - [`OptimisticPatcher`] computes provisional values for those queries
//! - [`MutationCoordinator`] applies patches, sends the request, and then
//!   reconciles or rolls back

pub mod coordinator;
pub mod filter;
pub mod hook;
pub mod ledger;
pub mod patcher;
pub mod resolver;
pub mod state;
pub mod walker;

pub use coordinator::{MutationCoordinator, MutationRequest, PendingMutation};
pub use hook::{MutationOptions, OptimisticDataProvider, ProviderContext, ProviderResult};
pub use ledger::{LedgerEntry, PatchLedger, Replay};
pub use patcher::OptimisticPatcher;
pub use resolver::AffectedEntryResolver;
pub use state::{transition, MutationEvent, MutationState};
pub use walker::{NestedOp, PayloadWalker};
