//! Lifecycle state and the exclusivity guard
//!
//! Initialize, RenewIntermediate and UpdateConfiguration each claim the
//! single in-flight slot before doing anything. A second claimant fails
//! immediately with [`Error::Busy`]; nothing queues. Dropping the guard
//! without completing it restores the state observed when it was claimed,
//! whatever was shown in between.

use std::fmt;

use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Result};

/// Externally visible lifecycle state; never persisted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// No signing material loaded
    Uninitialized,
    /// Initialize is running
    Initializing,
    /// Ready to sign
    Initialized,
    /// RenewIntermediate is running; signing stays available
    RenewingIntermediate,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::RenewingIntermediate => "renewing intermediate",
        };
        f.write_str(name)
    }
}

/// Operations that take the exclusivity guard
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Initial load or generation of signing material
    Initialize,
    /// Intermediate renewal
    RenewIntermediate,
    /// Configuration change, possibly rotating the root
    UpdateConfiguration,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::RenewIntermediate => "renew intermediate",
            Self::UpdateConfiguration => "update configuration",
        };
        f.write_str(name)
    }
}

struct Slot {
    state: LifecycleState,
    in_flight: Option<Operation>,
}

pub(crate) struct Lifecycle {
    slot: Mutex<Slot>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: LifecycleState::Uninitialized,
                in_flight: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.slot.lock().state
    }

    pub(crate) fn in_flight(&self) -> Option<Operation> {
        self.slot.lock().in_flight
    }

    /// Claim the guard for `operation` without changing the visible state
    pub(crate) fn begin(&self, operation: Operation) -> Result<OperationGuard<'_>> {
        let mut slot = self.slot.lock();
        if let Some(running) = slot.in_flight {
            return Err(Error::Busy { operation: running });
        }
        slot.in_flight = Some(operation);
        debug!(%operation, state = %slot.state, "lifecycle operation started");
        Ok(OperationGuard {
            lifecycle: self,
            operation,
            prior: slot.state,
            outcome: None,
        })
    }
}

/// Holds the in-flight slot until dropped
pub(crate) struct OperationGuard<'a> {
    lifecycle: &'a Lifecycle,
    operation: Operation,
    prior: LifecycleState,
    outcome: Option<LifecycleState>,
}

impl OperationGuard<'_> {
    /// State observed when the guard was claimed
    pub(crate) fn prior(&self) -> LifecycleState {
        self.prior
    }

    /// Show `state` while the operation runs
    pub(crate) fn show(&self, state: LifecycleState) {
        self.lifecycle.slot.lock().state = state;
    }

    /// Release the guard, leaving the manager in `state`
    pub(crate) fn complete(mut self, state: LifecycleState) {
        self.outcome = Some(state);
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let state = self.outcome.unwrap_or(self.prior);
        let mut slot = self.lifecycle.slot.lock();
        slot.state = state;
        slot.in_flight = None;
        debug!(operation = %self.operation, state = %state, "lifecycle operation finished");
    }
}
