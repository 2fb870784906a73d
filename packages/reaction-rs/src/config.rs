//! Reactor configuration.
//!
//! Values come from a host's own config file (via `Deserialize`) or from the
//! environment:
//!
//! - `REACTOR_MAX_FLOW_DEPTH`: in-flight bound, clamped to at least 1
//! - `REACTOR_AUDIT_CAPACITY`: retained audit entries, 0 disables the log

use std::env;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::audit::DEFAULT_AUDIT_CAPACITY;

/// Reference bound on concurrently in-flight flows.
pub const DEFAULT_MAX_FLOW_DEPTH: usize = 200;

/// Reactor configuration.
///
/// Deserializable so hosts can embed it in their own config files, or loaded
/// from environment variables with [`ReactorConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Maximum number of concurrently in-flight flows. Clamped to at least 1.
    pub max_flow_depth: usize,
    /// Number of flows retained in the audit log. Zero disables auditing.
    pub audit_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_flow_depth: DEFAULT_MAX_FLOW_DEPTH,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl ReactorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Reads `REACTOR_MAX_FLOW_DEPTH` and `REACTOR_AUDIT_CAPACITY`; missing
    /// keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("REACTOR_MAX_FLOW_DEPTH") {
            config.max_flow_depth = raw
                .trim()
                .parse()
                .context("REACTOR_MAX_FLOW_DEPTH must be a valid number")?;
        }
        if let Some(raw) = lookup("REACTOR_AUDIT_CAPACITY") {
            config.audit_capacity = raw
                .trim()
                .parse()
                .context("REACTOR_AUDIT_CAPACITY must be a valid number")?;
        }

        Ok(config.normalized())
    }

    /// Set the maximum flow depth, clamped to at least 1.
    pub fn with_max_flow_depth(mut self, max_flow_depth: usize) -> Self {
        self.max_flow_depth = clamp_flow_depth(max_flow_depth);
        self
    }

    /// Set the audit log capacity.
    pub fn with_audit_capacity(mut self, audit_capacity: usize) -> Self {
        self.audit_capacity = audit_capacity;
        self
    }

    /// Apply clamping to values that came from outside.
    pub fn normalized(mut self) -> Self {
        self.max_flow_depth = clamp_flow_depth(self.max_flow_depth);
        self
    }
}

pub(crate) fn clamp_flow_depth(max_flow_depth: usize) -> usize {
    max_flow_depth.max(1)
}
