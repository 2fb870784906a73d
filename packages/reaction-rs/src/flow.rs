//! The flow: one full execution of an action through all of its phases.
//!
//! ```text
//! Guard ─► PreCallbacks ─► PreChildren ─► Perform ─► DuringChildren
//!                                                         │
//! Complete ◄─ Unguard ◄─ PostChildren ◄─ PostCallbacks ◄──┘
//! ```
//!
//! Phases run strictly in order. Each child in a `*Children` phase runs its
//! entire flow, descendants included, before the next sibling starts. There
//! is no fan-out.
//!
//! # Failure Policy
//!
//! Degrade, don't crash:
//! - A guard violation aborts only that action; its parent resumes.
//! - A failing or panicking reaction is logged; the remaining reactions run.
//! - A failing or panicking performer skips the action's remaining phases,
//!   but the identity still leaves the flow stack.
//! - A panicking identity hook aborts that action before it enters.

use std::fmt;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::audit::AuditEntry;
use crate::core::{Action, ReactionSlot};
use crate::engine::Reactor;
use crate::error::ReactorError;
use crate::identity::{FlowGuard, Identity, InFlightEntry};
use crate::registry::{SubscriptionToken, Timing};

/// Phase of an action's flow.
///
/// Ordered: a phase compares greater than every phase before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FlowPhase {
    /// Constructed, not yet submitted or reached.
    Pending,
    /// Checking depth and cycle guards.
    Guard,
    /// Invoking pre-subscribed reactions.
    PreCallbacks,
    /// Running `pre_reactions` children.
    PreChildren,
    /// Running the performer.
    Perform,
    /// Running `during_reactions` children.
    DuringChildren,
    /// Invoking post-subscribed reactions.
    PostCallbacks,
    /// Running `post_reactions` children.
    PostChildren,
    /// Leaving the flow stack.
    Unguard,
    /// Done.
    Complete,
}

impl fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowPhase::Pending => "pending",
            FlowPhase::Guard => "guard",
            FlowPhase::PreCallbacks => "pre_callbacks",
            FlowPhase::PreChildren => "pre_children",
            FlowPhase::Perform => "perform",
            FlowPhase::DuringChildren => "during_children",
            FlowPhase::PostCallbacks => "post_callbacks",
            FlowPhase::PostChildren => "post_children",
            FlowPhase::Unguard => "unguard",
            FlowPhase::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// How a flow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Every phase ran.
    Completed,
    /// The flow stopped early.
    Aborted(ReactorError),
}

impl FlowOutcome {
    /// True if every phase ran.
    pub fn is_completed(&self) -> bool {
        matches!(self, FlowOutcome::Completed)
    }

    /// The abort reason, if any.
    pub fn error(&self) -> Option<&ReactorError> {
        match self {
            FlowOutcome::Completed => None,
            FlowOutcome::Aborted(err) => Some(err),
        }
    }
}

/// Context passed to reactions and performers.
///
/// Cheap to clone. Gives callbacks the reactor handle so they can submit new
/// roots or change subscriptions without capturing the reactor themselves.
#[derive(Clone)]
pub struct FlowContext {
    reactor: Reactor,
    identity: Identity,
    depth: usize,
    subscription: Option<SubscriptionToken>,
}

impl FlowContext {
    pub(crate) fn new(reactor: Reactor, identity: Identity, depth: usize) -> Self {
        Self {
            reactor,
            identity,
            depth,
            subscription: None,
        }
    }

    fn for_subscription(&self, token: SubscriptionToken) -> Self {
        Self {
            subscription: Some(token),
            ..self.clone()
        }
    }

    /// The reactor running this flow.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Identity of the in-flight action.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// In-flight count including this action.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Token of the reaction being invoked. `None` inside a performer.
    pub fn subscription(&self) -> Option<SubscriptionToken> {
        self.subscription
    }

    /// Unsubscribe the reaction being invoked.
    ///
    /// The current invocation is unaffected; later firings won't include it.
    pub fn unsubscribe_self(&self) -> bool {
        match &self.subscription {
            Some(token) => self.reactor.unsubscribe(token),
            None => false,
        }
    }

    /// Submit a new root action, queued after the current root finishes.
    pub fn submit(&self, action: Action) {
        self.reactor.submit(action);
    }
}

impl fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowContext")
            .field("identity", &self.identity)
            .field("depth", &self.depth)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

/// Run an action's flow to completion, descendants included.
pub(crate) fn run_flow<'a>(reactor: &'a Reactor, action: &'a mut Action) -> BoxFuture<'a, FlowOutcome> {
    async move {
        let started_at = Utc::now();
        let kind = action.kind_name();

        action.set_phase(FlowPhase::Guard);
        // The identity hook is user code; a panic there must not unwind past the flow
        let computed = std::panic::catch_unwind(AssertUnwindSafe(|| InFlightEntry::for_action(action)));
        let entry = match computed {
            Ok(entry) => entry,
            Err(panic_info) => {
                let message = extract_panic_message(&panic_info);
                error!(kind, panic = %message, "identity hook panicked");
                let err = ReactorError::IdentityFailed { kind, message };
                reactor
                    .audit()
                    .record(AuditEntry::new(action, None, 0, started_at, false, Some(&err)));
                return FlowOutcome::Aborted(err);
            }
        };
        let identity = entry.identity;
        let guard = match FlowGuard::enter(reactor.flow_stack(), entry, reactor.max_flow_depth()) {
            Ok(guard) => guard,
            Err(err) => {
                warn!(
                    kind,
                    %identity,
                    chain_depth = action.chain_depth(),
                    error = %err,
                    "flow aborted at guard"
                );
                reactor
                    .audit()
                    .record(AuditEntry::new(action, Some(identity), 0, started_at, false, Some(&err)));
                return FlowOutcome::Aborted(err);
            }
        };

        let depth = guard.depth();
        let ctx = FlowContext::new(reactor.clone(), identity, depth);
        debug!(kind, %identity, depth, "flow entered");

        action.set_phase(FlowPhase::PreCallbacks);
        invoke_reactions(reactor, action, Timing::Pre, &ctx);

        action.set_phase(FlowPhase::PreChildren);
        run_children(reactor, action, ReactionSlot::Pre).await;

        action.set_phase(FlowPhase::Perform);
        if let Err(err) = perform(reactor, action, &ctx).await {
            action.set_phase(FlowPhase::Unguard);
            guard.release();
            reactor
                .audit()
                .record(AuditEntry::new(action, Some(identity), depth, started_at, true, Some(&err)));
            return FlowOutcome::Aborted(err);
        }

        action.set_phase(FlowPhase::DuringChildren);
        run_children(reactor, action, ReactionSlot::During).await;

        action.set_phase(FlowPhase::PostCallbacks);
        invoke_reactions(reactor, action, Timing::Post, &ctx);

        action.set_phase(FlowPhase::PostChildren);
        run_children(reactor, action, ReactionSlot::Post).await;

        action.set_phase(FlowPhase::Unguard);
        guard.release();
        debug!(kind, %identity, depth, "flow left");

        action.set_phase(FlowPhase::Complete);
        reactor
            .audit()
            .record(AuditEntry::new(action, Some(identity), depth, started_at, true, None));
        FlowOutcome::Completed
    }
    .boxed()
}

/// Invoke reactions against a snapshot of the registry.
fn invoke_reactions(reactor: &Reactor, action: &mut Action, timing: Timing, ctx: &FlowContext) {
    let snapshot = reactor.registry().snapshot(action.kind(), timing);
    if snapshot.is_empty() {
        return;
    }
    trace!(kind = action.kind_name(), %timing, count = snapshot.len(), "invoking reactions");

    for subscription in snapshot {
        let ctx = ctx.for_subscription(subscription.token);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            subscription.reaction.react(action, &ctx)
        }));

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    kind = action.kind_name(),
                    %timing,
                    subscription = %subscription.token.id(),
                    error = %e,
                    "reaction failed"
                );
            }
            Err(panic_info) => {
                error!(
                    kind = action.kind_name(),
                    %timing,
                    subscription = %subscription.token.id(),
                    panic = %extract_panic_message(&panic_info),
                    "reaction panicked"
                );
            }
        }
    }
}

/// Run each child in a slot to completion, in order.
async fn run_children(reactor: &Reactor, action: &mut Action, slot: ReactionSlot) {
    let children = action.take_reactions(slot);
    for mut child in children {
        let outcome = run_flow(reactor, &mut child).await;
        if let FlowOutcome::Aborted(err) = outcome {
            debug!(
                parent = action.kind_name(),
                child = child.kind_name(),
                %slot,
                error = %err,
                "child flow aborted, parent resumes"
            );
        }
    }
}

/// Run the kind's performer, if one is attached.
async fn perform(reactor: &Reactor, action: &mut Action, ctx: &FlowContext) -> Result<(), ReactorError> {
    let Some(performer) = reactor.registry().performer(action.kind()) else {
        trace!(kind = action.kind_name(), "no performer attached");
        return Ok(());
    };

    let kind = action.kind_name();
    // AssertUnwindSafe is required because the action and context are not UnwindSafe
    let result = AssertUnwindSafe(performer.perform(action, ctx))
        .catch_unwind()
        .await;

    let message = match result {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => {
            error!(kind, error = %e, "performer failed");
            format!("{e:#}")
        }
        Err(panic_info) => {
            let panic_msg = extract_panic_message(&panic_info);
            error!(kind, panic = %panic_msg, "performer panicked");
            format!("performer panicked: {panic_msg}")
        }
    };

    Err(ReactorError::PerformerFailed { kind, message })
}

/// Extract a readable message from a panic payload.
pub(crate) fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
