//! # Reaction
//!
//! A reaction-driven action dispatcher for turn-based, card-game-style rule
//! engines.
//!
//! ## Core Concepts
//!
//! Reaction separates **what happens** from **what it sets off**:
//! - [`Action`] = A typed unit of work, carried by an [`ActionPayload`]
//! - [`Reaction`] = Code subscribed to an action kind, run before or after it
//! - [`Performer`] = The single handler that does an action kind's work
//!
//! Reactions don't call each other. They append child actions to the
//! in-flight action's reaction slots, and the dispatcher runs those children
//! as nested flows.
//!
//! ## Architecture
//!
//! ```text
//! Host (game loop / UI)
//!     │
//!     ▼ submit()
//! Reactor queue ─────────────────────────────────┐
//!     │                                          │
//!     ▼                                          │
//! FlowRunner (one root at a time)                │
//!     │                                          │
//!     ▼ flow(action)                             │
//!   Guard ─► depth + cycle check                 │
//!     │                                          │
//!     ├─► pre reactions ─► add_pre_reaction()    │
//!     ├─► pre children (nested flows)            │
//!     ├─► Performer.perform()                    │
//!     ├─► during children (nested flows)         │
//!     ├─► post reactions ─► add_post_reaction()  │
//!     ├─► post children (nested flows)           │
//!     │                                          │
//!     └─► Unguard ─► ctx.submit(new root) ───────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single logical thread** - One flow advances at a time; roots queue
//! 2. **Strict phase order** - Children run to completion before the next phase
//! 3. **Lineage identity** - Same kind + same lineage = same identity
//! 4. **Guarded recursion** - An identity already in flight is a cycle; the
//!    in-flight count is bounded by `max_flow_depth`
//! 5. **Local failure** - A refused or failed child never aborts its parent
//!
//! ## Example
//!
//! ```ignore
//! use reaction::{Action, ActionPayload, Reactor};
//!
//! #[derive(Debug)]
//! struct Draw { count: u32 }
//! impl ActionPayload for Draw {}
//!
//! #[derive(Debug)]
//! struct Discard { count: u32 }
//! impl ActionPayload for Discard {}
//!
//! let (reactor, runner) = Reactor::builder().build();
//!
//! // "Whenever you draw, discard one."
//! reactor.subscribe_post::<Draw, _>(|action, _ctx| {
//!     let discard = action.derive(Discard { count: 1 });
//!     action.add_post_reaction(discard)?;
//!     Ok(())
//! });
//! reactor.attach_performer_fn::<Draw, _>(|action, _ctx| {
//!     let draw = action.payload::<Draw>().expect("draw payload");
//!     tracing::info!(count = draw.count, "drawing");
//!     Ok(())
//! });
//!
//! let _task = runner.start();
//! let outcome = reactor.submit_and_await(Action::new(Draw { count: 2 })).await;
//! assert!(outcome.is_completed());
//! ```
//!
//! ## What This Is Not
//!
//! Reaction is **not**:
//! - A parallel task scheduler
//! - A persistence or replay layer
//! - A rules engine (the rules live in your reactions)

// Core modules
mod config;
mod core;
mod engine;
mod error;
mod flow;
mod identity;
mod registry;

// Flow auditing for tooling
pub mod audit;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{Action, ActionKind, ActionPayload, Lineage, OriginId, ReactionSlot};

// Re-export identity types
pub use identity::{FlowStack, Identity, InFlightEntry};

// Re-export registry types
pub use registry::{
    Performer, PerformerFn, Reaction, SubscriptionRegistry, SubscriptionToken, Timing,
};

// Re-export flow types
pub use flow::{FlowContext, FlowOutcome, FlowPhase};

// Re-export engine types (primary entry point)
pub use engine::{CompletionCallback, FlowRunner, Reactor, ReactorBuilder};

// Re-export configuration
pub use config::{ReactorConfig, DEFAULT_MAX_FLOW_DEPTH};

// Re-export error types
pub use crate::error::ReactorError;

// Re-export audit types
pub use audit::{AbortReason, AuditEntry, AuditStats, FlowAuditLog, DEFAULT_AUDIT_CAPACITY};

// Re-export commonly used external types
pub use async_trait::async_trait;
