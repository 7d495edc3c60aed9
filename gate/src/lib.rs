// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Stake-gated group membership reconciliation
//!
//! Gates membership in a community messaging group on an on-chain token
//! stake, reconciling three asynchronous sources of truth: the stake
//! ledger (balances, timelocks), the group roster (via the platform's
//! membership API), and the local identity-linking store.
//!
//! ```text
//!   chain event ──▶ watcher ──▶ engine.reconcile(identity, group)
//!                                 │
//!                ┌────────────────┼───────────────────┐
//!                ▼                ▼                   ▼
//!          oracle (balance,  store (identity     classifier
//!          timelocks)        link, group cfg)    (tier)
//!                └────────────────┬───────────────────┘
//!                                 ▼
//!                   group admin (evict / invite)
//! ```
//!
//! A periodic sweep re-evaluates every linked identity independently of
//! events, as the correctness backstop against missed or duplicated
//! deliveries.

pub mod admin;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod oracle;
pub mod store;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub mod test_utils;
