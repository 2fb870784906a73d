//! Structured error types for the reaction dispatcher.
//!
//! `ReactorError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//!
//! # The Flow Boundary Rule
//!
//! > **No error ever unwinds past a single flow.**
//!
//! - `anyhow` is internal transport (ergonomic for reactions and performers)
//! - `ReactorError` is the only externalized error, carried in [`FlowOutcome`]
//!
//! Guard violations (`CycleDetected`, `DepthExceeded`) abort only the offending
//! action. Its parent resumes as if that child had finished with no further work.
//!
//! # Example
//!
//! ```ignore
//! use reaction::{FlowOutcome, ReactorError};
//!
//! match reactor.submit_and_await(action).await {
//!     FlowOutcome::Completed => {}
//!     FlowOutcome::Aborted(ReactorError::CycleDetected { cycle, .. }) => {
//!         eprintln!("reaction loop: {}", cycle.join(" -> "));
//!     }
//!     FlowOutcome::Aborted(err) => eprintln!("flow aborted: {err}"),
//! }
//! ```
//!
//! [`FlowOutcome`]: crate::FlowOutcome

use thiserror::Error;

use crate::core::ReactionSlot;
use crate::flow::FlowPhase;

/// Errors produced by the reaction dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactorError {
    /// The action's identity is already in flight.
    #[error("cycle detected at {kind}: {}", .cycle.join(" -> "))]
    CycleDetected {
        /// Kind of the action whose entry was refused.
        kind: &'static str,
        /// Every kind currently in flight, outermost first.
        chain: Vec<&'static str>,
        /// From the first in-flight entry of `kind` through the refused attempt.
        cycle: Vec<&'static str>,
    },

    /// The number of in-flight flows reached the configured maximum.
    #[error("flow depth {depth} reached the limit of {max} at {kind}")]
    DepthExceeded {
        /// Kind of the action whose entry was refused.
        kind: &'static str,
        /// In-flight count at the time of the attempt.
        depth: usize,
        /// Configured maximum flow depth.
        max: usize,
    },

    /// The performer returned an error or panicked.
    #[error("performer for {kind} failed: {message}")]
    PerformerFailed {
        /// Kind of the action being performed.
        kind: &'static str,
        /// Rendered error chain or panic message.
        message: String,
    },

    /// The action's identity hook panicked, so the flow never entered.
    #[error("identity for {kind} could not be computed: {message}")]
    IdentityFailed {
        /// Kind of the action whose identity was requested.
        kind: &'static str,
        /// Panic message from the identity hook.
        message: String,
    },

    /// A child was added to a reaction slot whose phase already started.
    #[error("{slot} reactions are closed once the flow reaches {phase}")]
    SlotClosed {
        /// The slot that was written to.
        slot: ReactionSlot,
        /// Phase the parent action was in.
        phase: FlowPhase,
    },

    /// A child's lineage is shallower than its parent's.
    #[error("child chain depth {child_depth} is shallower than parent chain depth {parent_depth}")]
    LineageRegressed {
        /// Chain depth of the parent action.
        parent_depth: usize,
        /// Chain depth of the rejected child.
        child_depth: usize,
    },

    /// The flow runner stopped before the submission completed.
    #[error("flow runner stopped before the submission completed")]
    RunnerStopped,
}

impl ReactorError {
    /// Returns true for the two guard violations (cycle and depth).
    pub fn is_guard_violation(&self) -> bool {
        matches!(
            self,
            ReactorError::CycleDetected { .. } | ReactorError::DepthExceeded { .. }
        )
    }
}
