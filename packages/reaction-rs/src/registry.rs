//! Subscription registry: reaction callbacks and performers per action kind.
//!
//! The registry holds, for every [`ActionKind`]:
//! - An ordered, deduplicated list of pre-reactions
//! - An ordered, deduplicated list of post-reactions
//! - At most one performer (last write wins)
//!
//! # Registration Handles
//!
//! Every subscribe call returns a [`SubscriptionToken`]. Unsubscribing takes
//! the token, never a reconstructed closure, so a registration can always be
//! cancelled exactly.
//!
//! Duplicates are detected by `Arc` pointer for shared reactions, and by type
//! for zero-sized callbacks handed over by value (fn items, closures that
//! capture nothing). Two values of such a type are indistinguishable.
//!
//! # Snapshot Isolation
//!
//! The flow reads reactions through [`SubscriptionRegistry::snapshot`], which
//! clones the list before any callback runs. A callback that subscribes or
//! unsubscribes during invocation affects the next firing, not the current one.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::core::{Action, ActionKind};
use crate::flow::FlowContext;

/// When a reaction callback fires relative to the performer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Timing {
    /// Before pre-reaction children and the performer.
    Pre,
    /// After the performer and its during-reaction children.
    Post,
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timing::Pre => write!(f, "pre"),
            Timing::Post => write!(f, "post"),
        }
    }
}

/// Handle for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    id: Uuid,
    kind: ActionKind,
    timing: Timing,
}

impl SubscriptionToken {
    fn new(kind: ActionKind, timing: Timing) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timing,
        }
    }

    /// Unique id of the registration.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Kind the reaction listens to.
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Timing the reaction fires at.
    pub fn timing(&self) -> Timing {
        self.timing
    }
}

/// A reaction callback.
///
/// Reactions inspect the in-flight action and may append child actions to
/// any reaction slot that is still open. Errors are logged and do not stop
/// the flow.
///
/// Implemented for every `Fn(&mut Action, &FlowContext) -> Result<()>`.
pub trait Reaction: Send + Sync + 'static {
    /// Called with the in-flight action.
    fn react(&self, action: &mut Action, ctx: &FlowContext) -> Result<()>;
}

impl<F> Reaction for F
where
    F: Fn(&mut Action, &FlowContext) -> Result<()> + Send + Sync + 'static,
{
    fn react(&self, action: &mut Action, ctx: &FlowContext) -> Result<()> {
        self(action, ctx)
    }
}

/// The single handler responsible for an action kind's actual effect.
///
/// A performer may be long-running; the flow suspends until it returns. It
/// may append during- and post-reactions before returning.
///
/// # Example
///
/// ```ignore
/// struct DrawPerformer { deck: Arc<Mutex<Deck>> }
///
/// #[async_trait]
/// impl Performer for DrawPerformer {
///     async fn perform(&self, action: &mut Action, _ctx: &FlowContext) -> Result<()> {
///         let draw = action.payload::<Draw>().context("not a draw")?;
///         self.deck.lock().unwrap().draw(draw.count)?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Performer: Send + Sync + 'static {
    /// Perform the action.
    async fn perform(&self, action: &mut Action, ctx: &FlowContext) -> Result<()>;
}

/// Adapter turning a synchronous closure into a [`Performer`].
pub struct PerformerFn<F>(F);

impl<F> PerformerFn<F>
where
    F: Fn(&mut Action, &FlowContext) -> Result<()> + Send + Sync + 'static,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Performer for PerformerFn<F>
where
    F: Fn(&mut Action, &FlowContext) -> Result<()> + Send + Sync + 'static,
{
    async fn perform(&self, action: &mut Action, ctx: &FlowContext) -> Result<()> {
        (self.0)(action, ctx)
    }
}

/// A registered reaction with its token.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) token: SubscriptionToken,
    pub(crate) reaction: Arc<dyn Reaction>,
    /// Type of a zero-sized callback, for by-value dedup.
    callback_type: Option<TypeId>,
}

/// Pointer identity of a shared reaction, ignoring vtables.
fn same_reaction(a: &Arc<dyn Reaction>, b: &Arc<dyn Reaction>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Per-kind reaction lists and performers.
#[derive(Default)]
pub struct SubscriptionRegistry {
    reactions: DashMap<(ActionKind, Timing), Vec<Subscription>>,
    performers: DashMap<ActionKind, Arc<dyn Performer>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reaction.
    ///
    /// Subscribing the same `Arc` twice for the same `(kind, timing)` is a
    /// no-op that returns the original token.
    pub fn subscribe(
        &self,
        kind: ActionKind,
        timing: Timing,
        reaction: Arc<dyn Reaction>,
    ) -> SubscriptionToken {
        self.insert(kind, timing, reaction, None)
    }

    /// Register a reaction handed over by value.
    ///
    /// A zero-sized callback already registered for `(kind, timing)` is a
    /// no-op that returns the original token. Callbacks carrying state are
    /// always distinct.
    pub fn subscribe_callback<R: Reaction>(
        &self,
        kind: ActionKind,
        timing: Timing,
        reaction: R,
    ) -> SubscriptionToken {
        let callback_type = (std::mem::size_of::<R>() == 0).then(TypeId::of::<R>);
        self.insert(kind, timing, Arc::new(reaction), callback_type)
    }

    fn insert(
        &self,
        kind: ActionKind,
        timing: Timing,
        reaction: Arc<dyn Reaction>,
        callback_type: Option<TypeId>,
    ) -> SubscriptionToken {
        let mut list = self.reactions.entry((kind, timing)).or_default();
        let duplicate = list.iter().find(|s| {
            same_reaction(&s.reaction, &reaction)
                || (callback_type.is_some() && s.callback_type == callback_type)
        });
        if let Some(existing) = duplicate {
            return existing.token;
        }

        let token = SubscriptionToken::new(kind, timing);
        list.push(Subscription {
            token,
            reaction,
            callback_type,
        });
        token
    }

    /// Remove a registration. Returns false if the token is unknown.
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.remove_where(token.kind, token.timing, |s| s.token.id == token.id)
    }

    /// Remove a shared reaction by the same pointer rule `subscribe` dedups by.
    pub fn unsubscribe_reaction(
        &self,
        kind: ActionKind,
        timing: Timing,
        reaction: &Arc<dyn Reaction>,
    ) -> bool {
        self.remove_where(kind, timing, |s| same_reaction(&s.reaction, reaction))
    }

    fn remove_where(
        &self,
        kind: ActionKind,
        timing: Timing,
        matches: impl Fn(&Subscription) -> bool,
    ) -> bool {
        let key = (kind, timing);
        let removed = match self.reactions.get_mut(&key) {
            Some(mut list) => match list.iter().position(|s| matches(s)) {
                Some(pos) => {
                    list.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        };
        self.reactions.remove_if(&key, |_, list| list.is_empty());
        removed
    }

    /// Copy of the reactions for `(kind, timing)`, in subscribe order.
    pub(crate) fn snapshot(&self, kind: ActionKind, timing: Timing) -> Vec<Subscription> {
        self.reactions
            .get(&(kind, timing))
            .map(|list| list.value().clone())
            .unwrap_or_default()
    }

    /// Number of reactions registered for `(kind, timing)`.
    pub fn subscriber_count(&self, kind: ActionKind, timing: Timing) -> usize {
        self.reactions
            .get(&(kind, timing))
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Tokens of every registration. Subscribe order within a `(kind, timing)`.
    pub fn tokens(&self) -> Vec<SubscriptionToken> {
        self.reactions
            .iter()
            .flat_map(|entry| entry.value().iter().map(|s| s.token).collect::<Vec<_>>())
            .collect()
    }

    /// Set the performer for a kind, returning the one it replaced.
    pub fn attach_performer(
        &self,
        kind: ActionKind,
        performer: Arc<dyn Performer>,
    ) -> Option<Arc<dyn Performer>> {
        self.performers.insert(kind, performer)
    }

    /// Remove the performer for a kind.
    pub fn detach_performer(&self, kind: ActionKind) -> Option<Arc<dyn Performer>> {
        self.performers.remove(&kind).map(|(_, performer)| performer)
    }

    /// The performer for a kind, if any.
    pub fn performer(&self, kind: ActionKind) -> Option<Arc<dyn Performer>> {
        self.performers.get(&kind).map(|p| p.value().clone())
    }

    /// Kinds that have a performer attached.
    pub fn performer_kinds(&self) -> Vec<ActionKind> {
        self.performers.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop every subscription and performer.
    pub fn clear(&self) {
        self.reactions.clear();
        self.performers.clear();
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("reaction_lists", &self.reactions.len())
            .field("performers", &self.performers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ActionPayload;

    #[derive(Debug)]
    struct Draw;
    impl ActionPayload for Draw {}

    #[derive(Debug)]
    struct Discard;
    impl ActionPayload for Discard {}

    fn noop() -> Arc<dyn Reaction> {
        fn react(_action: &mut Action, _ctx: &FlowContext) -> Result<()> {
            Ok(())
        }
        Arc::new(react)
    }

    struct NoopPerformer;

    #[async_trait]
    impl Performer for NoopPerformer {
        async fn perform(&self, _action: &mut Action, _ctx: &FlowContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_subscribe_same_arc_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let kind = ActionKind::of::<Draw>();
        let reaction = noop();

        let first = registry.subscribe(kind, Timing::Pre, reaction.clone());
        let second = registry.subscribe(kind, Timing::Pre, reaction.clone());

        assert_eq!(first, second);
        assert_eq!(registry.subscriber_count(kind, Timing::Pre), 1);

        // A different timing is a different list.
        let post = registry.subscribe(kind, Timing::Post, reaction);
        assert_ne!(first, post);
        assert_eq!(registry.subscriber_count(kind, Timing::Post), 1);
    }

    #[test]
    fn test_distinct_closures_are_distinct_subscriptions() {
        let registry = SubscriptionRegistry::new();
        let kind = ActionKind::of::<Draw>();

        registry.subscribe(kind, Timing::Pre, noop());
        registry.subscribe(kind, Timing::Pre, noop());

        assert_eq!(registry.subscriber_count(kind, Timing::Pre), 2);
    }

    #[test]
    fn test_fn_item_subscribed_by_value_is_idempotent() {
        fn react(_action: &mut Action, _ctx: &FlowContext) -> Result<()> {
            Ok(())
        }

        let registry = SubscriptionRegistry::new();
        let kind = ActionKind::of::<Draw>();

        let first = registry.subscribe_callback(kind, Timing::Pre, react);
        let second = registry.subscribe_callback(kind, Timing::Pre, react);
        assert_eq!(first, second);
        assert_eq!(registry.subscriber_count(kind, Timing::Pre), 1);

        // A different timing is a different list.
        let post = registry.subscribe_callback(kind, Timing::Post, react);
        assert_ne!(first, post);

        assert!(registry.unsubscribe(&first));
        let again = registry.subscribe_callback(kind, Timing::Pre, react);
        assert_ne!(first, again);
        assert_eq!(registry.subscriber_count(kind, Timing::Pre), 1);
    }

    #[test]
    fn test_callbacks_with_state_are_never_merged() {
        let registry = SubscriptionRegistry::new();
        let kind = ActionKind::of::<Draw>();
        let reaction = |label: &'static str| {
            move |_action: &mut Action, _ctx: &FlowContext| -> Result<()> {
                let _ = label;
                Ok(())
            }
        };

        let a = registry.subscribe_callback(kind, Timing::Pre, reaction("a"));
        let b = registry.subscribe_callback(kind, Timing::Pre, reaction("a"));
        assert_ne!(a, b);
        assert_eq!(registry.subscriber_count(kind, Timing::Pre), 2);
    }

    #[test]
    fn test_unsubscribe_by_token() {
        let registry = SubscriptionRegistry::new();
        let kind = ActionKind::of::<Draw>();
        let a = registry.subscribe(kind, Timing::Pre, noop());
        let b = registry.subscribe(kind, Timing::Pre, noop());

        assert!(registry.unsubscribe(&a));
        assert!(!registry.unsubscribe(&a));

        let remaining: Vec<_> = registry
            .snapshot(kind, Timing::Pre)
            .iter()
            .map(|s| s.token)
            .collect();
        assert_eq!(remaining, vec![b]);
    }

    #[test]
    fn test_unsubscribe_reaction_by_pointer() {
        let registry = SubscriptionRegistry::new();
        let kind = ActionKind::of::<Draw>();
        let reaction = noop();
        registry.subscribe(kind, Timing::Post, reaction.clone());

        assert!(!registry.unsubscribe_reaction(kind, Timing::Post, &noop()));
        assert!(registry.unsubscribe_reaction(kind, Timing::Post, &reaction));
        assert_eq!(registry.subscriber_count(kind, Timing::Post), 0);
        assert!(registry.tokens().is_empty());
    }

    #[test]
    fn test_snapshot_preserves_subscribe_order() {
        let registry = SubscriptionRegistry::new();
        let kind = ActionKind::of::<Draw>();
        let tokens: Vec<_> = (0..4)
            .map(|_| registry.subscribe(kind, Timing::Pre, noop()))
            .collect();

        let snapshot: Vec<_> = registry
            .snapshot(kind, Timing::Pre)
            .iter()
            .map(|s| s.token)
            .collect();
        assert_eq!(snapshot, tokens);
    }

    #[test]
    fn test_performer_last_write_wins() {
        let registry = SubscriptionRegistry::new();
        let kind = ActionKind::of::<Draw>();

        assert!(registry.attach_performer(kind, Arc::new(NoopPerformer)).is_none());
        assert!(registry.attach_performer(kind, Arc::new(NoopPerformer)).is_some());
        assert_eq!(registry.performer_kinds(), vec![kind]);

        assert!(registry.detach_performer(kind).is_some());
        assert!(registry.detach_performer(kind).is_none());
        assert!(registry.performer(kind).is_none());
        assert!(registry.performer(ActionKind::of::<Discard>()).is_none());
    }

    #[test]
    fn test_clear_drops_everything() {
        let registry = SubscriptionRegistry::new();
        let kind = ActionKind::of::<Draw>();
        registry.subscribe(kind, Timing::Pre, noop());
        registry.attach_performer(kind, Arc::new(NoopPerformer));

        registry.clear();

        assert!(registry.tokens().is_empty());
        assert!(registry.performer_kinds().is_empty());
    }
}
