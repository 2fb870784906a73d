//! Core types for the reaction dispatcher.
//!
//! # Overview
//!
//! An [`Action`] is a typed unit of work. It carries:
//! - A payload implementing [`ActionPayload`] (what to do)
//! - A [`Lineage`] (how it came to exist)
//! - Three ordered lists of child actions to run before, during, and after
//!   its own performer
//!
//! The payload's concrete type is the action's [`ActionKind`], which keys
//! subscriptions and performers.
//!
//! # Lineage
//!
//! Lineage is declarative, semantically-relevant state: whether the action was
//! generated by another action's reaction, and the ordered path of origins
//! that produced it. By default it is what an action's identity is computed
//! from, so two unrelated actions of the same kind don't collide while two
//! recurrences of the same logical action do.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::ReactorError;
use crate::flow::FlowPhase;
use crate::identity::Identity;

/// Payload of an action.
///
/// Implement this for every kind of work the dispatcher should route:
///
/// ```ignore
/// #[derive(Debug)]
/// struct DealDamage { target: u32, amount: u32 }
///
/// impl ActionPayload for DealDamage {}
/// ```
///
/// Override [`identity_context`](ActionPayload::identity_context) when part
/// of the payload should distinguish otherwise identical recurrences.
pub trait ActionPayload: Any + Send + Sync + fmt::Debug {
    /// Context string folded into the action's identity.
    ///
    /// Defaults to the canonical rendering of the lineage.
    fn identity_context(&self, lineage: &Lineage) -> String {
        lineage.canonical()
    }
}

/// Type-erased payload, blanket-implemented for every `ActionPayload`.
trait ErasedPayload: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn identity_context(&self, lineage: &Lineage) -> String;
    fn fmt_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<A: ActionPayload> ErasedPayload for A {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn identity_context(&self, lineage: &Lineage) -> String {
        ActionPayload::identity_context(self, lineage)
    }

    fn fmt_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Type tag identifying a category of work.
///
/// Equality and hashing use the payload's `TypeId` only.
#[derive(Clone, Copy)]
pub struct ActionKind {
    type_id: TypeId,
    type_name: &'static str,
}

impl ActionKind {
    /// The kind of payload type `A`.
    pub fn of<A: ActionPayload>() -> Self {
        Self {
            type_id: TypeId::of::<A>(),
            type_name: std::any::type_name::<A>(),
        }
    }

    /// The payload's `TypeId`.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully-qualified payload type name. This is what identities hash.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Short name for logs and diagnostics (`DealDamage`, `Wrapper<a::B>`).
    pub fn name(&self) -> &'static str {
        let path_end = self.type_name.find('<').unwrap_or(self.type_name.len());
        let start = self.type_name[..path_end]
            .rfind("::")
            .map(|i| i + 2)
            .unwrap_or(0);
        &self.type_name[start..]
    }
}

impl PartialEq for ActionKind {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ActionKind {}

impl Hash for ActionKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionKind({})", self.name())
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lineage identifier: the id of a triggering collection, effect, or card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OriginId(Uuid);

impl OriginId {
    /// Create a new random origin id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic origin id derived from a stable name.
    ///
    /// The same name always yields the same id, across runs.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OriginId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OriginId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an action came to exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Lineage {
    is_generated: bool,
    origin_path: SmallVec<[OriginId; 4]>,
}

impl Lineage {
    /// Lineage of a top-level action: not generated, empty origin path.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this action was synthesized by another action's reaction.
    ///
    /// Consumers use this to filter self-triggering chains; the engine never
    /// consults it.
    pub fn is_generated(&self) -> bool {
        self.is_generated
    }

    /// Ordered lineage identifiers, outermost first.
    pub fn origin_path(&self) -> &[OriginId] {
        &self.origin_path
    }

    /// Number of lineage hops from the ultimate top-level trigger.
    pub fn chain_depth(&self) -> usize {
        self.origin_path.len()
    }

    /// Append an origin to the path.
    pub fn push(&mut self, origin: OriginId) {
        self.origin_path.push(origin);
    }

    /// Lineage for a child derived from this one: generated, same path.
    pub fn derive(&self) -> Self {
        Self {
            is_generated: true,
            origin_path: self.origin_path.clone(),
        }
    }

    /// Canonical rendering, used as the default identity context.
    pub fn canonical(&self) -> String {
        let path = self
            .origin_path
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("generated={};origin=[{}]", self.is_generated, path)
    }
}

/// Which of an action's child lists a reaction is appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReactionSlot {
    /// Runs after pre-callbacks, before the performer.
    Pre,
    /// Runs right after the performer.
    During,
    /// Runs after post-callbacks.
    Post,
}

impl ReactionSlot {
    /// The phase that consumes this slot. The slot closes when it begins.
    pub fn consuming_phase(&self) -> FlowPhase {
        match self {
            ReactionSlot::Pre => FlowPhase::PreChildren,
            ReactionSlot::During => FlowPhase::DuringChildren,
            ReactionSlot::Post => FlowPhase::PostChildren,
        }
    }
}

impl fmt::Display for ReactionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactionSlot::Pre => write!(f, "pre"),
            ReactionSlot::During => write!(f, "during"),
            ReactionSlot::Post => write!(f, "post"),
        }
    }
}

/// A unit of work submitted to the dispatcher.
///
/// An action is executed exactly once. Between construction and the end of
/// its flow it may only grow: reactions append children to the slot whose
/// phase has not started yet.
pub struct Action {
    kind: ActionKind,
    payload: Box<dyn ErasedPayload>,
    lineage: Lineage,
    phase: FlowPhase,
    pre_reactions: Vec<Action>,
    during_reactions: Vec<Action>,
    post_reactions: Vec<Action>,
}

impl Action {
    /// Create a top-level action.
    pub fn new<A: ActionPayload>(payload: A) -> Self {
        Self::with_lineage(payload, Lineage::new())
    }

    /// Create an action with explicit lineage.
    pub fn with_lineage<A: ActionPayload>(payload: A, lineage: Lineage) -> Self {
        Self {
            kind: ActionKind::of::<A>(),
            payload: Box::new(payload),
            lineage,
            phase: FlowPhase::Pending,
            pre_reactions: Vec::new(),
            during_reactions: Vec::new(),
            post_reactions: Vec::new(),
        }
    }

    /// Create a generated child carrying a copy of this action's lineage.
    ///
    /// Chain with [`with_origin`](Action::with_origin) to record the effect
    /// that produced it.
    pub fn derive<A: ActionPayload>(&self, payload: A) -> Self {
        Self::with_lineage(payload, self.lineage.derive())
    }

    /// Append an origin to this action's lineage.
    pub fn with_origin(mut self, origin: OriginId) -> Self {
        self.lineage.push(origin);
        self
    }

    /// Mark this action as generated.
    pub fn generated(mut self) -> Self {
        self.lineage.is_generated = true;
        self
    }

    /// The action's kind.
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Short kind name.
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// The action's lineage.
    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    /// True if this action was synthesized by another action's reaction.
    pub fn is_generated(&self) -> bool {
        self.lineage.is_generated()
    }

    /// Ordered lineage identifiers.
    pub fn origin_path(&self) -> &[OriginId] {
        self.lineage.origin_path()
    }

    /// Length of the origin path.
    pub fn chain_depth(&self) -> usize {
        self.lineage.chain_depth()
    }

    /// Deterministic identity, derived from kind and identity context.
    pub fn identity(&self) -> Identity {
        Identity::compute(self.kind, &self.identity_context())
    }

    /// The context string identity is computed from.
    pub fn identity_context(&self) -> String {
        self.payload.identity_context(&self.lineage)
    }

    /// Phase the action's flow has reached.
    pub fn phase(&self) -> FlowPhase {
        self.phase
    }

    /// Downcast the payload to a concrete type.
    pub fn payload<A: ActionPayload>(&self) -> Option<&A> {
        self.payload.as_any().downcast_ref()
    }

    /// Downcast the payload mutably.
    pub fn payload_mut<A: ActionPayload>(&mut self) -> Option<&mut A> {
        self.payload.as_any_mut().downcast_mut()
    }

    /// True if the payload is of type `A`.
    pub fn is<A: ActionPayload>(&self) -> bool {
        self.kind.type_id() == TypeId::of::<A>()
    }

    /// Append a child action to a reaction slot.
    ///
    /// Fails if the slot's phase already started, or if the child's chain
    /// depth is shallower than this action's.
    pub fn add_reaction(&mut self, slot: ReactionSlot, child: Action) -> Result<(), ReactorError> {
        if self.phase >= slot.consuming_phase() {
            return Err(ReactorError::SlotClosed {
                slot,
                phase: self.phase,
            });
        }
        if child.chain_depth() < self.chain_depth() {
            return Err(ReactorError::LineageRegressed {
                parent_depth: self.chain_depth(),
                child_depth: child.chain_depth(),
            });
        }
        self.slot_mut(slot).push(child);
        Ok(())
    }

    /// Append a child to run before the performer.
    pub fn add_pre_reaction(&mut self, child: Action) -> Result<(), ReactorError> {
        self.add_reaction(ReactionSlot::Pre, child)
    }

    /// Append a child to run right after the performer.
    pub fn add_during_reaction(&mut self, child: Action) -> Result<(), ReactorError> {
        self.add_reaction(ReactionSlot::During, child)
    }

    /// Append a child to run after post-callbacks.
    pub fn add_post_reaction(&mut self, child: Action) -> Result<(), ReactorError> {
        self.add_reaction(ReactionSlot::Post, child)
    }

    /// Children currently queued in a slot.
    pub fn reactions(&self, slot: ReactionSlot) -> &[Action] {
        match slot {
            ReactionSlot::Pre => &self.pre_reactions,
            ReactionSlot::During => &self.during_reactions,
            ReactionSlot::Post => &self.post_reactions,
        }
    }

    pub(crate) fn set_phase(&mut self, phase: FlowPhase) {
        self.phase = phase;
    }

    pub(crate) fn take_reactions(&mut self, slot: ReactionSlot) -> Vec<Action> {
        std::mem::take(self.slot_mut(slot))
    }

    fn slot_mut(&mut self, slot: ReactionSlot) -> &mut Vec<Action> {
        match slot {
            ReactionSlot::Pre => &mut self.pre_reactions,
            ReactionSlot::During => &mut self.during_reactions,
            ReactionSlot::Post => &mut self.post_reactions,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Payload<'a>(&'a dyn ErasedPayload);
        impl fmt::Debug for Payload<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt_debug(f)
            }
        }

        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("payload", &Payload(self.payload.as_ref()))
            .field("lineage", &self.lineage)
            .field("phase", &self.phase)
            .field("pre_reactions", &self.pre_reactions.len())
            .field("during_reactions", &self.during_reactions.len())
            .field("post_reactions", &self.post_reactions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Draw {
        count: u32,
    }
    impl ActionPayload for Draw {}

    #[derive(Debug)]
    struct Discard;
    impl ActionPayload for Discard {}

    mod nested {
        #[derive(Debug)]
        pub struct Wrapper<T>(pub T);
        impl<T: std::fmt::Debug + Send + Sync + 'static> crate::core::ActionPayload for Wrapper<T> {}
    }

    #[test]
    fn test_kind_short_name() {
        assert_eq!(ActionKind::of::<Draw>().name(), "Draw");
        assert_eq!(
            ActionKind::of::<nested::Wrapper<Draw>>().name(),
            format!("Wrapper<{}>", std::any::type_name::<Draw>())
        );
    }

    #[test]
    fn test_kind_equality_is_by_type() {
        assert_eq!(ActionKind::of::<Draw>(), ActionKind::of::<Draw>());
        assert_ne!(ActionKind::of::<Draw>(), ActionKind::of::<Discard>());
    }

    #[test]
    fn test_payload_downcast() {
        let mut action = Action::new(Draw { count: 1 });
        assert!(action.is::<Draw>());
        assert!(!action.is::<Discard>());
        assert_eq!(action.payload::<Draw>(), Some(&Draw { count: 1 }));
        assert!(action.payload::<Discard>().is_none());

        action.payload_mut::<Draw>().unwrap().count = 3;
        assert_eq!(action.payload::<Draw>().unwrap().count, 3);
    }

    #[test]
    fn test_derive_copies_lineage_and_marks_generated() {
        let root = Action::new(Draw { count: 1 }).with_origin(OriginId::from_name("deck"));
        let child = root.derive(Discard).with_origin(OriginId::from_name("discard-effect"));

        assert!(!root.is_generated());
        assert!(child.is_generated());
        assert_eq!(child.chain_depth(), 2);
        assert_eq!(child.origin_path()[0], root.origin_path()[0]);
    }

    #[test]
    fn test_origin_from_name_is_stable() {
        assert_eq!(OriginId::from_name("fireball"), OriginId::from_name("fireball"));
        assert_ne!(OriginId::from_name("fireball"), OriginId::from_name("frostbolt"));
    }

    #[test]
    fn test_canonical_lineage_rendering() {
        let mut lineage = Lineage::new();
        assert_eq!(lineage.canonical(), "generated=false;origin=[]");

        let id = OriginId::from(Uuid::nil());
        lineage.push(id);
        lineage.push(id);
        assert_eq!(
            lineage.derive().canonical(),
            format!("generated=true;origin=[{},{}]", Uuid::nil(), Uuid::nil())
        );
    }

    #[test]
    fn test_add_reaction_respects_slot_phase() {
        let mut action = Action::new(Draw { count: 1 });
        assert!(action.add_pre_reaction(Action::new(Discard)).is_ok());

        action.set_phase(FlowPhase::Perform);
        let err = action.add_pre_reaction(Action::new(Discard)).unwrap_err();
        assert_eq!(
            err,
            ReactorError::SlotClosed {
                slot: ReactionSlot::Pre,
                phase: FlowPhase::Perform,
            }
        );
        assert!(action.add_during_reaction(Action::new(Discard)).is_ok());
        assert!(action.add_post_reaction(Action::new(Discard)).is_ok());

        assert_eq!(action.reactions(ReactionSlot::Pre).len(), 1);
        assert_eq!(action.reactions(ReactionSlot::During).len(), 1);
        assert_eq!(action.reactions(ReactionSlot::Post).len(), 1);
    }

    #[test]
    fn test_add_reaction_rejects_lineage_regression() {
        let mut parent = Action::new(Draw { count: 1 }).with_origin(OriginId::new());
        let err = parent.add_post_reaction(Action::new(Discard)).unwrap_err();
        assert_eq!(
            err,
            ReactorError::LineageRegressed {
                parent_depth: 1,
                child_depth: 0,
            }
        );

        let child = parent.derive(Discard);
        assert!(parent.add_post_reaction(child).is_ok());
    }

    #[test]
    fn test_take_reactions_drains_in_order() {
        let mut action = Action::new(Draw { count: 1 });
        action.add_post_reaction(Action::new(Draw { count: 2 })).unwrap();
        action.add_post_reaction(Action::new(Draw { count: 3 })).unwrap();

        let taken = action.take_reactions(ReactionSlot::Post);
        let counts: Vec<u32> = taken
            .iter()
            .map(|a| a.payload::<Draw>().unwrap().count)
            .collect();
        assert_eq!(counts, vec![2, 3]);
        assert!(action.reactions(ReactionSlot::Post).is_empty());
    }
}
