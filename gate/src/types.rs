// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core types shared across the gate
//!
//! All token amounts are `u128` in the token's smallest unit. Conversion to
//! human-readable units happens only at presentation boundaries (message
//! text, log lines), never inside the reconciliation core.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A locked stake position with an expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timelock {
    pub amount: u128,
    /// Unix timestamp in seconds
    pub expires_at: u64,
}

/// Point-in-time view of one address's stake. Never persisted; recomputed
/// on every reconciliation to avoid staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StakeSnapshot {
    /// Total staked balance
    pub balance: u128,
    /// Sum of currently-unexpired locked amounts
    pub locked: u128,
}

impl StakeSnapshot {
    pub fn withdrawable(&self) -> u128 {
        self.balance.saturating_sub(self.locked)
    }
}

/// Access tier derived from a stake snapshot and a group's thresholds.
/// Lower numeric rank = higher privilege; rank 0 is reserved for admins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Admin,
    Rank(u32),
    Ineligible,
}

impl Tier {
    pub fn rank(&self) -> Option<u32> {
        match self {
            Tier::Admin => Some(0),
            Tier::Rank(n) => Some(*n),
            Tier::Ineligible => None,
        }
    }

    pub fn is_eligible(&self) -> bool {
        !matches!(self, Tier::Ineligible)
    }

    // Desirability score: higher is better. Admin (rank 0) beats rank 1,
    // which beats rank 2, and so on; ineligible is the floor.
    fn score(&self) -> i64 {
        match self {
            Tier::Admin => 0,
            Tier::Rank(n) => -(*n as i64),
            Tier::Ineligible => i64::MIN,
        }
    }
}

impl PartialOrd for Tier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score().cmp(&other.score())
    }
}

/// Result of one reconciliation invocation. Logged and counted, never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoOp,
    InviteIssued,
    Removed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::NoOp => "noop",
            Outcome::InviteIssued => "invite_issued",
            Outcome::Removed => "removed",
        }
    }
}

/// Normalized ledger event, used as a reconciliation trigger only.
/// The payload amount is informational: balances are always re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeEvent {
    pub kind: StakeEventKind,
    pub address: String,
    pub amount: u128,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakeEventKind {
    Deposit,
    Withdraw,
}

impl StakeEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            StakeEventKind::Deposit => "Deposit",
            StakeEventKind::Withdraw => "Withdraw",
        }
    }
}

/// A single-use, time-limited group invite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub link: String,
    /// Unix timestamp in seconds
    pub expires_at: u64,
}

/// Per-tier membership counts for one group
#[derive(Debug, Clone, Default)]
pub struct TierCensus {
    pub admins: usize,
    /// rank -> member count, ranks 1..N
    pub ranks: std::collections::BTreeMap<u32, usize>,
    pub ineligible: usize,
    pub members: Vec<MemberStake>,
}

/// One member's stake as seen during a census pass
#[derive(Debug, Clone)]
pub struct MemberStake {
    pub identity_id: String,
    pub tier: Tier,
    pub balance: u128,
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Normalize an on-chain address to canonical lowercase hex with 0x prefix
pub fn normalize_address(address: &str) -> String {
    let hex = address.trim().trim_start_matches("0x").to_lowercase();
    format!("0x{}", hex)
}

/// Compare addresses (case-insensitive, with or without 0x prefix)
pub fn addresses_match(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}
