//! # Reconciler
//!
//! The bootstrap state machine and its supporting pieces.
//!
//! - `bootstrap`: [`BootstrapReconciler`], the step sequence
//! - `state`: [`BootstrapState`]
//! - `retry`: exponential backoff for transient failures
//! - `report`: the structured [`BootstrapReport`] returned by a run

mod bootstrap;
pub mod report;
pub mod retry;
pub mod state;

pub use bootstrap::BootstrapReconciler;
pub use report::{BootstrapReport, CommitReport, FailureReport, StepOutcome, StepReport};
pub use retry::RetryPolicy;
pub use state::BootstrapState;
