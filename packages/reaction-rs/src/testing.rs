//! Testing utilities for reactions, performers, and flows.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! reaction = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Using `FlowRecorder` for Ordering Tests
//!
//! ```ignore
//! use reaction::testing::FlowRecorder;
//!
//! let recorder = FlowRecorder::new();
//! reactor.subscribe_pre::<Draw, _>(recorder.reaction("pre"));
//! reactor.attach_performer::<Draw, _>(recorder.performer("perform"));
//! reactor.submit_with(Action::new(Draw), recorder.completion("done"));
//!
//! runner.run_until_idle().await;
//! recorder.assert_sequence(&["pre", "perform", "done"]);
//! ```
//!
//! ## Using `FlowLatch` with a Spawned Runner
//!
//! ```ignore
//! let latch = Arc::new(FlowLatch::new(3));
//! for _ in 0..3 {
//!     let latch = latch.clone();
//!     reactor.submit_with(Action::new(Draw), move |_| latch.dec());
//! }
//! latch.await_zero().await;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use tokio::sync::Notify;

use crate::core::Action;
use crate::flow::{FlowContext, FlowOutcome};
use crate::registry::PerformerFn;

/// Shared, ordered record of labels written by reactions and performers.
#[derive(Debug, Clone, Default)]
pub struct FlowRecorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl FlowRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_events(&self) -> MutexGuard<'_, Vec<String>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a label.
    pub fn record(&self, label: impl Into<String>) {
        self.lock_events().push(label.into());
    }

    /// All labels recorded so far, in order.
    pub fn events(&self) -> Vec<String> {
        self.lock_events().clone()
    }

    /// Number of labels recorded.
    pub fn len(&self) -> usize {
        self.lock_events().len()
    }

    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock_events().is_empty()
    }

    /// How many times `label` was recorded.
    pub fn count(&self, label: &str) -> usize {
        self.lock_events().iter().filter(|e| *e == label).count()
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        self.lock_events().clear();
    }

    /// A reaction that records `label`.
    pub fn reaction(
        &self,
        label: impl Into<String>,
    ) -> impl Fn(&mut Action, &FlowContext) -> Result<()> + Send + Sync + 'static {
        let recorder = self.clone();
        let label = label.into();
        move |_action: &mut Action, _ctx: &FlowContext| {
            recorder.record(label.clone());
            Ok(())
        }
    }

    /// A performer that records `label`.
    pub fn performer(
        &self,
        label: impl Into<String>,
    ) -> PerformerFn<impl Fn(&mut Action, &FlowContext) -> Result<()> + Send + Sync + 'static>
    {
        PerformerFn::new(self.reaction(label))
    }

    /// A completion callback recording `label` or `label!aborted`.
    pub fn completion(&self, label: impl Into<String>) -> impl FnOnce(FlowOutcome) + Send + 'static {
        let recorder = self.clone();
        let label = label.into();
        move |outcome: FlowOutcome| {
            if outcome.is_completed() {
                recorder.record(label);
            } else {
                recorder.record(format!("{label}!aborted"));
            }
        }
    }

    /// Assert the exact recorded sequence.
    ///
    /// # Panics
    ///
    /// Panics with both sequences if they differ.
    pub fn assert_sequence(&self, expected: &[&str]) {
        let actual = self.events();
        assert_eq!(
            actual, expected,
            "Unexpected flow sequence\n  expected: {:?}\n  actual: {:?}",
            expected, actual
        );
    }
}

/// Countdown latch for awaiting a known number of completions.
#[derive(Debug)]
pub struct FlowLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl FlowLatch {
    /// Create a new latch expecting `expected` completions.
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            notify: Notify::new(),
        }
    }

    /// Decrement the remaining count.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected (underflow protection).
    pub fn dec(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("FlowLatch decremented below zero - more completions than expected");
        }
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero.
    ///
    /// Returns immediately if the count is already zero.
    pub async fn await_zero(&self) {
        loop {
            // Register for notification BEFORE checking count
            let notified = self.notify.notified();

            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Get the current remaining count.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Check if the latch has reached zero.
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}
