//! Reactor - the entry point for registering reactions and submitting actions.
//!
//! The reactor is the central coordinator:
//!
//! ```text
//! submit(action) ─► queue ─► FlowRunner ─► flow(action)
//!                     ▲                         │
//!                     └──── ctx.submit(new) ◄───┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use reaction::{Action, Reactor};
//!
//! let (reactor, runner) = Reactor::builder().max_flow_depth(64).build();
//!
//! reactor.subscribe_pre::<DealDamage, _>(|action, _ctx| {
//!     // inspect, or append children
//!     Ok(())
//! });
//! reactor.attach_performer::<DealDamage, _>(DamagePerformer::new(board));
//!
//! // Run the flow runner (single logical thread of control)
//! let _task = runner.start();
//!
//! // Fire-and-forget, or wait for the completion callback
//! reactor.submit(Action::new(DealDamage { target, amount: 3 }));
//! let outcome = reactor.submit_and_await(Action::new(DrawCard { count: 1 })).await;
//! ```
//!
//! # Single Logical Thread
//!
//! Every root is processed by one `FlowRunner`, strictly one after another.
//! Actions submitted while a flow runs become new roots queued after it.
//! There is no parallel execution of flows.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::FlowAuditLog;
use crate::config::{clamp_flow_depth, ReactorConfig};
use crate::core::{Action, ActionKind, ActionPayload};
use crate::error::ReactorError;
use crate::flow::{extract_panic_message, run_flow, FlowContext, FlowOutcome};
use crate::identity::{lock_stack, FlowStack, InFlightEntry, SharedFlowStack};
use crate::registry::{
    Performer, PerformerFn, Reaction, SubscriptionRegistry, SubscriptionToken, Timing,
};

/// Callback invoked when a submitted root's flow ends.
pub type CompletionCallback = Box<dyn FnOnce(FlowOutcome) + Send + 'static>;

/// A queued root action.
struct Submission {
    action: Action,
    on_complete: Option<CompletionCallback>,
}

enum QueueItem {
    Submit(Submission),
    Shutdown,
}

struct ReactorInner {
    registry: SubscriptionRegistry,
    flows: SharedFlowStack,
    max_flow_depth: AtomicUsize,
    pending: AtomicUsize,
    queue: mpsc::UnboundedSender<QueueItem>,
    audit: FlowAuditLog,
}

/// Handle to the dispatcher.
///
/// Cheap to clone; every clone refers to the same registries, flow stack,
/// and queue. Construct one per game session and pass it to the systems that
/// need it.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    /// Create a new reactor builder.
    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::new()
    }

    /// Create a reactor and its runner from a configuration.
    pub fn new(config: ReactorConfig) -> (Reactor, FlowRunner) {
        ReactorBuilder::new().with_config(config).build()
    }

    pub(crate) fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub(crate) fn flow_stack(&self) -> &SharedFlowStack {
        &self.inner.flows
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe a closure to run before actions of kind `A` are performed.
    pub fn subscribe_pre<A, F>(&self, f: F) -> SubscriptionToken
    where
        A: ActionPayload,
        F: Fn(&mut Action, &FlowContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe::<A, _>(Timing::Pre, f)
    }

    /// Subscribe a closure to run after actions of kind `A` are performed.
    pub fn subscribe_post<A, F>(&self, f: F) -> SubscriptionToken
    where
        A: ActionPayload,
        F: Fn(&mut Action, &FlowContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe::<A, _>(Timing::Post, f)
    }

    /// Subscribe a reaction to kind `A` at the given timing.
    pub fn subscribe<A: ActionPayload, R: Reaction>(
        &self,
        timing: Timing,
        reaction: R,
    ) -> SubscriptionToken {
        self.subscribe_kind(ActionKind::of::<A>(), timing, reaction)
    }

    /// Subscribe a reaction to a kind known only at runtime.
    ///
    /// Zero-sized reactions (fn items, closures capturing nothing) are keyed
    /// by type, so subscribing the same one twice returns the original token.
    pub fn subscribe_kind<R: Reaction>(
        &self,
        kind: ActionKind,
        timing: Timing,
        reaction: R,
    ) -> SubscriptionToken {
        let token = self.inner.registry.subscribe_callback(kind, timing, reaction);
        debug!(kind = kind.name(), %timing, subscription = %token.id(), "reaction subscribed");
        token
    }

    /// Subscribe a shared reaction.
    ///
    /// Subscribing the same `Arc` twice for the same kind and timing is a
    /// no-op returning the original token.
    pub fn subscribe_shared(
        &self,
        kind: ActionKind,
        timing: Timing,
        reaction: Arc<dyn Reaction>,
    ) -> SubscriptionToken {
        let token = self.inner.registry.subscribe(kind, timing, reaction);
        debug!(kind = kind.name(), %timing, subscription = %token.id(), "reaction subscribed");
        token
    }

    /// Cancel a registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let removed = self.inner.registry.unsubscribe(token);
        if removed {
            debug!(
                kind = token.kind().name(),
                timing = %token.timing(),
                subscription = %token.id(),
                "reaction unsubscribed"
            );
        }
        removed
    }

    /// Remove a shared reaction by pointer identity.
    pub fn unsubscribe_shared(
        &self,
        kind: ActionKind,
        timing: Timing,
        reaction: &Arc<dyn Reaction>,
    ) -> bool {
        self.inner.registry.unsubscribe_reaction(kind, timing, reaction)
    }

    // -------------------------------------------------------------------------
    // Performers
    // -------------------------------------------------------------------------

    /// Attach the performer for kind `A`, replacing any existing one.
    pub fn attach_performer<A: ActionPayload, P: Performer>(&self, performer: P) {
        self.attach_performer_kind(ActionKind::of::<A>(), Arc::new(performer));
    }

    /// Attach a synchronous closure as the performer for kind `A`.
    pub fn attach_performer_fn<A, F>(&self, f: F)
    where
        A: ActionPayload,
        F: Fn(&mut Action, &FlowContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.attach_performer::<A, _>(PerformerFn::new(f));
    }

    /// Attach a performer for a kind known only at runtime.
    ///
    /// Returns the performer it replaced.
    pub fn attach_performer_kind(
        &self,
        kind: ActionKind,
        performer: Arc<dyn Performer>,
    ) -> Option<Arc<dyn Performer>> {
        let replaced = self.inner.registry.attach_performer(kind, performer);
        if replaced.is_some() {
            debug!(kind = kind.name(), "performer replaced");
        }
        replaced
    }

    /// Detach the performer for kind `A`.
    pub fn detach_performer<A: ActionPayload>(&self) -> bool {
        self.detach_performer_kind(ActionKind::of::<A>())
    }

    /// Detach the performer for a kind known only at runtime.
    pub fn detach_performer_kind(&self, kind: ActionKind) -> bool {
        self.inner.registry.detach_performer(kind).is_some()
    }

    /// Drop every subscription, performer, and in-flight record.
    pub fn clear_all(&self) {
        self.inner.registry.clear();
        lock_stack(&self.inner.flows).clear();
        self.inner.audit.clear();
        info!("reactor cleared");
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Queue a root action. Returns immediately.
    pub fn submit(&self, action: Action) {
        self.enqueue(Submission {
            action,
            on_complete: None,
        });
    }

    /// Queue a root action with a completion callback.
    ///
    /// The callback fires once the flow ends, completed or aborted.
    pub fn submit_with<F>(&self, action: Action, on_complete: F)
    where
        F: FnOnce(FlowOutcome) + Send + 'static,
    {
        self.enqueue(Submission {
            action,
            on_complete: Some(Box::new(on_complete)),
        });
    }

    /// Queue a root action and wait for its flow to end.
    ///
    /// Requires a running [`FlowRunner`]. Never call this from inside a
    /// reaction or performer: the runner is busy with the caller's flow and
    /// the wait would never end.
    pub async fn submit_and_await(&self, action: Action) -> FlowOutcome {
        let (tx, rx) = oneshot::channel();
        self.submit_with(action, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await
            .unwrap_or(FlowOutcome::Aborted(ReactorError::RunnerStopped))
    }

    fn enqueue(&self, submission: Submission) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let kind = submission.action.kind_name();
        if let Err(mpsc::error::SendError(item)) =
            self.inner.queue.send(QueueItem::Submit(submission))
        {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(kind, "flow runner is gone, submission dropped");
            if let QueueItem::Submit(submission) = item {
                complete(submission.on_complete, FlowOutcome::Aborted(ReactorError::RunnerStopped));
            }
            return;
        }
        debug!(kind, "action submitted");
    }

    /// Ask the runner to stop after the current root.
    ///
    /// Roots still queued are dropped; their completion callbacks receive
    /// `RunnerStopped`.
    pub fn shutdown(&self) {
        let _ = self.inner.queue.send(QueueItem::Shutdown);
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// True while a submission is queued or its flow is running.
    ///
    /// Hosts use this to gate user input during processing.
    pub fn is_running(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire) > 0
    }

    /// Current maximum flow depth.
    pub fn max_flow_depth(&self) -> usize {
        self.inner.max_flow_depth.load(Ordering::Acquire)
    }

    /// Set the maximum flow depth, clamped to at least 1.
    pub fn set_max_flow_depth(&self, max_flow_depth: usize) {
        self.inner
            .max_flow_depth
            .store(clamp_flow_depth(max_flow_depth), Ordering::Release);
    }

    /// Snapshot of the flows currently in flight, outermost first.
    pub fn in_flight(&self) -> Vec<InFlightEntry> {
        lock_stack(&self.inner.flows).entries().to_vec()
    }

    /// Number of flows currently in flight.
    pub fn in_flight_count(&self) -> usize {
        lock_stack(&self.inner.flows).len()
    }

    /// Tokens of every registered reaction.
    pub fn subscriptions(&self) -> Vec<SubscriptionToken> {
        self.inner.registry.tokens()
    }

    /// Number of reactions registered for kind `A` at the given timing.
    pub fn subscriber_count<A: ActionPayload>(&self, timing: Timing) -> usize {
        self.inner
            .registry
            .subscriber_count(ActionKind::of::<A>(), timing)
    }

    /// Kinds with a performer attached.
    pub fn performers(&self) -> Vec<ActionKind> {
        self.inner.registry.performer_kinds()
    }

    /// The flow audit log.
    pub fn audit(&self) -> &FlowAuditLog {
        &self.inner.audit
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registry", &self.inner.registry)
            .field("max_flow_depth", &self.max_flow_depth())
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Invoke a completion callback, containing panics.
fn complete(on_complete: Option<CompletionCallback>, outcome: FlowOutcome) {
    let Some(on_complete) = on_complete else {
        return;
    };
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_complete(outcome)));
    if let Err(panic_info) = result {
        error!(panic = %extract_panic_message(&panic_info), "completion callback panicked");
    }
}

/// RAII guard for one queued root's share of the pending count.
///
/// Decrements on drop, so a flow that unwinds can't leave
/// [`Reactor::is_running`] stuck at true.
struct PendingGuard<'a> {
    pending: &'a AtomicUsize,
}

impl<'a> PendingGuard<'a> {
    fn new(pending: &'a AtomicUsize) -> Self {
        Self { pending }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run one root's flow, then fire its completion callback.
async fn process(reactor: &Reactor, submission: Submission) {
    let Submission {
        mut action,
        on_complete,
    } = submission;
    let pending = PendingGuard::new(&reactor.inner.pending);

    let outcome = run_flow(reactor, &mut action).await;
    drop(action);

    // Idle before the host hears about it
    drop(pending);
    complete(on_complete, outcome);
}

// =============================================================================
// Flow Runner
// =============================================================================

/// The single logical thread of control that executes submitted roots.
///
/// Either spawn it with [`start`](FlowRunner::start), or drive it yourself
/// with [`run_until_idle`](FlowRunner::run_until_idle) from a host loop.
pub struct FlowRunner {
    reactor: Reactor,
    queue: mpsc::UnboundedReceiver<QueueItem>,
    stopped: bool,
}

impl FlowRunner {
    /// The reactor this runner serves.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Process roots until [`Reactor::shutdown`] is called.
    pub async fn run(mut self) {
        info!(max_flow_depth = self.reactor.max_flow_depth(), "flow runner starting");

        while let Some(item) = self.queue.recv().await {
            match item {
                QueueItem::Submit(submission) => process(&self.reactor, submission).await,
                QueueItem::Shutdown => {
                    self.stop();
                    break;
                }
            }
        }

        info!("flow runner stopped");
    }

    /// Spawn [`run`](FlowRunner::run) on the tokio runtime.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process every queued root, including roots queued along the way.
    ///
    /// Returns the number of roots processed.
    pub async fn run_until_idle(&mut self) -> usize {
        let mut processed = 0;
        if self.stopped {
            return processed;
        }

        while let Ok(item) = self.queue.try_recv() {
            match item {
                QueueItem::Submit(submission) => {
                    process(&self.reactor, submission).await;
                    processed += 1;
                }
                QueueItem::Shutdown => {
                    self.stop();
                    break;
                }
            }
        }
        processed
    }

    /// Close the queue and fail anything still in it.
    fn stop(&mut self) {
        self.stopped = true;
        self.queue.close();
        let mut dropped = 0;
        while let Ok(item) = self.queue.try_recv() {
            if let QueueItem::Submit(submission) = item {
                self.reactor.inner.pending.fetch_sub(1, Ordering::AcqRel);
                complete(
                    submission.on_complete,
                    FlowOutcome::Aborted(ReactorError::RunnerStopped),
                );
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, "flow runner stopped with queued submissions");
        }
    }
}

impl std::fmt::Debug for FlowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRunner")
            .field("reactor", &self.reactor)
            .field("stopped", &self.stopped)
            .finish()
    }
}

// =============================================================================
// Reactor Builder
// =============================================================================

/// Builder for constructing a [`Reactor`] and its [`FlowRunner`].
///
/// # Example
///
/// ```ignore
/// let (reactor, runner) = ReactorBuilder::new()
///     .with_config(ReactorConfig::from_env()?)
///     .max_flow_depth(32)
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct ReactorBuilder {
    config: ReactorConfig,
}

impl ReactorBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: ReactorConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// Set the maximum flow depth, clamped to at least 1.
    pub fn max_flow_depth(mut self, max_flow_depth: usize) -> Self {
        self.config = self.config.with_max_flow_depth(max_flow_depth);
        self
    }

    /// Set the audit log capacity. Zero disables auditing.
    pub fn audit_capacity(mut self, audit_capacity: usize) -> Self {
        self.config = self.config.with_audit_capacity(audit_capacity);
        self
    }

    /// Build the reactor handle and the runner that executes its flows.
    pub fn build(self) -> (Reactor, FlowRunner) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reactor = Reactor {
            inner: Arc::new(ReactorInner {
                registry: SubscriptionRegistry::new(),
                flows: Arc::new(Mutex::new(FlowStack::new())),
                max_flow_depth: AtomicUsize::new(clamp_flow_depth(self.config.max_flow_depth)),
                pending: AtomicUsize::new(0),
                queue: tx,
                audit: FlowAuditLog::new(self.config.audit_capacity),
            }),
        };

        let runner = FlowRunner {
            reactor: reactor.clone(),
            queue: rx,
            stopped: false,
        };

        (reactor, runner)
    }
}
