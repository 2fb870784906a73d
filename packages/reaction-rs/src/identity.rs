//! Action identity and in-flight tracking.
//!
//! Every action has a deterministic [`Identity`] derived from its kind and
//! identity context. While an action's flow runs, its identity sits on the
//! [`FlowStack`]. Entering an identity that is already on the stack is a
//! cycle; entering when the stack is full is a depth violation.
//!
//! ```text
//! PlayCard ─► DealDamage ─► Thorns ─► DealDamage (same identity)
//!                 ▲                        │
//!                 └──── CycleDetected ─────┘
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::core::{Action, ActionKind};
use crate::error::ReactorError;

/// Separator between kind name and context in the identity hash input.
const IDENTITY_SEPARATOR: u8 = 0x1f;

/// Deterministic identity of an action.
///
/// The first 16 bytes of `SHA-256(type_name || 0x1f || context)`, presented
/// as a UUID. A pure function of declarative state, never of object address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Identity(Uuid);

impl Identity {
    /// Compute the identity for a kind and context string.
    pub fn compute(kind: ActionKind, context: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.type_name().as_bytes());
        hasher.update([IDENTITY_SEPARATOR]);
        hasher.update(context.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    /// Identity of an action.
    pub fn of(action: &Action) -> Self {
        action.identity()
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One in-flight flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightEntry {
    /// Identity of the action.
    pub identity: Identity,
    /// Kind of the action.
    pub kind: ActionKind,
    /// Lineage chain depth of the action.
    pub chain_depth: usize,
}

impl InFlightEntry {
    /// Entry for an action about to begin its flow.
    pub fn for_action(action: &Action) -> Self {
        Self {
            identity: action.identity(),
            kind: action.kind(),
            chain_depth: action.chain_depth(),
        }
    }
}

/// Set and ordered list of identities currently in flight.
#[derive(Debug, Default)]
pub struct FlowStack {
    members: HashSet<Identity>,
    stack: Vec<InFlightEntry>,
}

impl FlowStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities in flight.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// True if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// True if `identity` is in flight.
    pub fn contains(&self, identity: &Identity) -> bool {
        self.members.contains(identity)
    }

    /// In-flight entries, outermost first.
    pub fn entries(&self) -> &[InFlightEntry] {
        &self.stack
    }

    /// Kind names currently in flight, outermost first.
    pub fn chain(&self) -> Vec<&'static str> {
        self.stack.iter().map(|e| e.kind.name()).collect()
    }

    /// Push an entry, failing if its identity is already in flight.
    pub fn enter(&mut self, entry: InFlightEntry) -> Result<(), ReactorError> {
        if self.members.contains(&entry.identity) {
            let chain = self.chain();
            let first = self
                .stack
                .iter()
                .position(|e| e.kind == entry.kind)
                .unwrap_or(0);
            let mut cycle = chain[first..].to_vec();
            cycle.push(entry.kind.name());

            return Err(ReactorError::CycleDetected {
                kind: entry.kind.name(),
                chain,
                cycle,
            });
        }

        self.members.insert(entry.identity);
        self.stack.push(entry);
        Ok(())
    }

    /// Remove an identity.
    ///
    /// Normally the identity is the most recent entry. If it isn't, it is
    /// removed from wherever it sits. Returns false if it was not in flight.
    pub fn leave(&mut self, identity: &Identity) -> bool {
        if !self.members.remove(identity) {
            return false;
        }

        if self.stack.last().map(|e| &e.identity) == Some(identity) {
            self.stack.pop();
            return true;
        }

        warn!(
            %identity,
            chain = ?self.chain(),
            "in-flight order corrupted, removing identity out of order"
        );
        if let Some(pos) = self.stack.iter().position(|e| &e.identity == identity) {
            self.stack.remove(pos);
        }
        true
    }

    /// Drop all in-flight bookkeeping.
    pub fn clear(&mut self) {
        self.members.clear();
        self.stack.clear();
    }
}

pub(crate) type SharedFlowStack = Arc<Mutex<FlowStack>>;

/// Lock the stack, recovering from poison.
pub(crate) fn lock_stack(stack: &SharedFlowStack) -> MutexGuard<'_, FlowStack> {
    stack.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// RAII guard holding an identity on the flow stack.
///
/// Leaves the stack on `release()` or on drop, so a dropped or panicking
/// flow never strands its identity.
pub(crate) struct FlowGuard {
    stack: SharedFlowStack,
    identity: Identity,
    depth: usize,
    released: bool,
}

impl FlowGuard {
    /// Check the depth bound, then enter the identity.
    pub(crate) fn enter(
        stack: &SharedFlowStack,
        entry: InFlightEntry,
        max_depth: usize,
    ) -> Result<Self, ReactorError> {
        let mut guarded = lock_stack(stack);
        let depth = guarded.len();
        if depth >= max_depth {
            return Err(ReactorError::DepthExceeded {
                kind: entry.kind.name(),
                depth,
                max: max_depth,
            });
        }

        let identity = entry.identity;
        guarded.enter(entry)?;

        Ok(Self {
            stack: stack.clone(),
            identity,
            depth: depth + 1,
            released: false,
        })
    }

    /// In-flight count including this flow.
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    /// Leave the stack now.
    pub(crate) fn release(mut self) {
        self.leave();
    }

    fn leave(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !lock_stack(&self.stack).leave(&self.identity) {
            warn!(identity = %self.identity, "identity already left the flow stack");
        }
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.leave();
    }
}
