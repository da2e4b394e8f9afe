//! Tenant lifecycle states and the transitions allowed between them.

use crate::error::StateConflict;
use std::fmt;

/// Lifecycle state of a tenant TSDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TenantState {
    /// Accepting pushes.
    Active,
    /// Accepting pushes while blocks are being shipped.
    ActiveShipping,
    /// Head compaction in progress; pushes are rejected.
    ForceCompacting,
    /// Being closed; pushes are rejected.
    Closing,
    /// Closed. Terminal, so a racing idle check cannot reopen it.
    Closed,
}

impl TenantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantState::Active => "active",
            TenantState::ActiveShipping => "active_shipping",
            TenantState::ForceCompacting => "force_compacting",
            TenantState::Closing => "closing",
            TenantState::Closed => "closed",
        }
    }

    /// Whether appends may proceed in this state.
    pub fn allows_pushes(&self) -> bool {
        matches!(self, TenantState::Active | TenantState::ActiveShipping)
    }

    /// Whether `self -> to` is a permitted transition.
    pub fn can_transition_to(&self, to: TenantState) -> bool {
        use TenantState::*;
        matches!(
            (*self, to),
            (Active, ActiveShipping)
                | (ActiveShipping, Active)
                | (Active, ForceCompacting)
                | (ForceCompacting, Active)
                | (Active, Closing)
                | (ActiveShipping, Closing)
                | (Closing, Closed)
                | (Closing, Active)
        )
    }

    /// Validate a compare-and-swap from `from` to `to` given the `actual` state.
    pub fn transition(
        actual: TenantState,
        from: TenantState,
        to: TenantState,
    ) -> Result<TenantState, StateConflict> {
        if actual != from || !from.can_transition_to(to) {
            return Err(StateConflict { from, to, actual });
        }
        Ok(to)
    }
}

impl fmt::Display for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
