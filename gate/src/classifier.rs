// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Tier classification
//!
//! Pure mapping from a stake snapshot to an access tier. No I/O, no side
//! effects; everything the decision needs arrives as an argument.

use crate::types::{StakeSnapshot, Tier};

/// Classify a stake snapshot against a group's thresholds.
///
/// Admins bypass stake requirements entirely and always land at rank 0.
/// Otherwise the total staked balance (locked stake still counts toward
/// entitlement) is compared against the thresholds in descending order;
/// the first threshold met wins, inclusively at the exact boundary.
/// Below the lowest threshold the holder is ineligible.
pub fn classify(snapshot: &StakeSnapshot, thresholds: &[u128], is_admin: bool) -> Tier {
    if is_admin {
        return Tier::Admin;
    }

    for (index, threshold) in thresholds.iter().enumerate() {
        if snapshot.balance >= *threshold {
            return Tier::Rank(index as u32 + 1);
        }
    }

    Tier::Ineligible
}
