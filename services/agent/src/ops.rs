//! Per-container operation slots.
//!
//! Lifecycle mutations on the same container name must never overlap: a
//! reconnect-triggered reconfiguration racing a cloud delete would leave the
//! engine in an inconsistent state. Each name owns one slot that an operation
//! claims with `begin` and releases with `end`.
//!
//! Failed operations leave a sticky terminal state (surfaced by
//! `get_device_status`) that does not block the next `begin`.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Kinds of exclusive per-container operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Delete,
    Reconfigure,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Delete => "delete",
            OpKind::Reconfigure => "reconfigure",
        }
    }

    /// Progressive status string used in replies.
    pub fn status_str(&self) -> &'static str {
        match self {
            OpKind::Create => "creating",
            OpKind::Delete => "deleting",
            OpKind::Reconfigure => "reconfiguring",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPhase {
    Active,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OpState {
    pub op: OpKind,
    pub phase: OpPhase,
    pub step: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The operation currently holding a slot, returned on a busy `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy {
    pub current: OpKind,
}

#[derive(Default)]
pub struct OpsTracker {
    slots: Mutex<HashMap<String, OpState>>,
}

impl OpsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `name`, transitioning idle -> `op`.
    ///
    /// Returns the current operation if an active one already holds the
    /// slot. A sticky failed state is overwritten.
    pub fn begin(&self, name: &str, op: OpKind) -> Result<(), Busy> {
        let mut slots = self.lock();
        if let Some(state) = slots.get(name) {
            if state.phase == OpPhase::Active {
                return Err(Busy { current: state.op });
            }
        }
        let now = Utc::now();
        slots.insert(
            name.to_string(),
            OpState {
                op,
                phase: OpPhase::Active,
                step: None,
                error: None,
                started_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    /// Release the slot on success.
    pub fn end(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Annotate the active operation's current step.
    pub fn set_step(&self, name: &str, step: &str) {
        let mut slots = self.lock();
        if let Some(state) = slots.get_mut(name) {
            state.step = Some(step.to_string());
            state.updated_at = Utc::now();
        }
    }

    /// Mark the operation failed. The state is sticky until the next
    /// `begin` for the same name.
    pub fn fail(&self, name: &str, op: OpKind, error: &str) {
        let mut slots = self.lock();
        let now = Utc::now();
        let state = slots.entry(name.to_string()).or_insert(OpState {
            op,
            phase: OpPhase::Failed,
            step: None,
            error: None,
            started_at: now,
            updated_at: now,
        });
        state.op = op;
        state.phase = OpPhase::Failed;
        state.error = Some(error.to_string());
        state.updated_at = now;
    }

    /// The active operation on `name`, if any.
    pub fn in_progress(&self, name: &str) -> Option<OpKind> {
        self.lock()
            .get(name)
            .filter(|state| state.phase == OpPhase::Active)
            .map(|state| state.op)
    }

    /// Full tracked state (active or sticky-failed) for status queries.
    pub fn state(&self, name: &str) -> Option<OpState> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OpState>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}
