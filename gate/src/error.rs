// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    // Ledger read failed (network, RPC timeout, revert on a read call).
    // The invocation aborts with no state mutation; the sweep retries.
    OracleUnavailable(String),
    // The local identity/group store failed. Fatal for the invocation:
    // durable state may be inconsistent, so this is never swallowed.
    StoreFault(String),
    // A membership action (evict/invite/admin query) failed on the
    // platform side. The link is left intact for the next sweep.
    AdminActionFailed(String),
    // Group or contract configuration is missing for the requested group.
    ConfigNotFound(String),
}

impl GateError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            GateError::OracleUnavailable(_) => "oracle_unavailable",
            GateError::StoreFault(_) => "store_fault",
            GateError::AdminActionFailed(_) => "admin_action_failed",
            GateError::ConfigNotFound(_) => "config_not_found",
        }
    }

    /// Whether the failure is expected to resolve on the next sweep cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GateError::OracleUnavailable(_) | GateError::AdminActionFailed(_)
        )
    }
}

pub type GateResult<T> = Result<T, GateError>;
