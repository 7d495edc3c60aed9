// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation engine
//!
//! For one (identity, group) pair, decide and apply the single correct
//! membership action. State is never tracked as a stored machine: every
//! invocation infers it fresh from a ledger snapshot, the identity link,
//! and the platform admin role. Event payloads are triggers only.
//!
//! ## Decision table
//!
//! ```text
//!   tier          | linked | action
//!   --------------+--------+------------------------------------------
//!   ineligible    | yes    | evict via GroupAdmin, then unlink
//!   ineligible    | no     | no-op
//!   eligible/admin| no     | issue single-use invite; link is persisted
//!                 |        | only once the join is confirmed
//!   eligible/admin| yes    | no-op
//! ```
//!
//! Invocations for the same (identity, group) key are serialized behind a
//! per-key mutex so an event-triggered reconciliation can never interleave
//! with the sweep for the same member. Distinct keys run in parallel.

use crate::admin::GroupAdmin;
use crate::classifier::classify;
use crate::error::GateResult;
use crate::metrics::GateMetrics;
use crate::oracle::LedgerOracle;
use crate::store::IdentityStore;
use crate::types::{normalize_address, unix_now, MemberStake, Outcome, Tier, TierCensus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const EVICT_REASON_STAKE: &str = "they didn't have enough tokens staked";
const EVICT_REASON_GATECRASH: &str = "they shouldn't have had access to this group";

type Key = (String, String);

/// Invite issued but not yet accepted. The identity link is written only
/// when the join is confirmed, so an unclaimed invite leaves no durable
/// trace.
#[derive(Debug, Clone)]
struct PendingInvite {
    address: String,
    expires_at: u64,
}

pub struct ReconciliationEngine {
    store: Arc<IdentityStore>,
    oracle: Arc<dyn LedgerOracle>,
    admin: Arc<dyn GroupAdmin>,
    metrics: Arc<GateMetrics>,
    locks: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
    pending_invites: RwLock<HashMap<Key, PendingInvite>>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<IdentityStore>,
        oracle: Arc<dyn LedgerOracle>,
        admin: Arc<dyn GroupAdmin>,
        metrics: Arc<GateMetrics>,
    ) -> Self {
        Self {
            store,
            oracle,
            admin,
            metrics,
            locks: Mutex::new(HashMap::new()),
            pending_invites: RwLock::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, identity_id: &str, group_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((identity_id.to_string(), group_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn record(&self, identity_id: &str, group_id: &str, result: &GateResult<Outcome>) {
        match result {
            Ok(outcome) => {
                self.metrics
                    .reconcile_outcomes
                    .with_label_values(&[group_id, outcome.as_str()])
                    .inc();
                match outcome {
                    Outcome::NoOp => debug!(
                        "[Engine] reconcile({}, {}) -> {:?}",
                        identity_id, group_id, outcome
                    ),
                    _ => info!(
                        "[Engine] reconcile({}, {}) -> {:?}",
                        identity_id, group_id, outcome
                    ),
                }
            }
            Err(e) => {
                self.metrics
                    .reconcile_failures
                    .with_label_values(&[group_id, e.error_type()])
                    .inc();
                warn!(
                    "[Engine] reconcile({}, {}) failed: {:?}",
                    identity_id, group_id, e
                );
            }
        }
    }

    /// Reconcile one member's group access with their current stake.
    /// Idempotent: repeating the call with unchanged chain state yields
    /// NoOp.
    pub async fn reconcile(&self, identity_id: &str, group_id: &str) -> GateResult<Outcome> {
        let key_lock = self.key_lock(identity_id, group_id).await;
        let _guard = key_lock.lock().await;
        let result = self.reconcile_locked(identity_id, group_id).await;
        self.record(identity_id, group_id, &result);
        result
    }

    async fn reconcile_locked(&self, identity_id: &str, group_id: &str) -> GateResult<Outcome> {
        if self.store.group(group_id).await.is_none() {
            debug!("[Engine] Group {} not configured, skipping", group_id);
            return Ok(Outcome::NoOp);
        }

        // No identity link means nothing to evaluate: we never granted
        // this identity access in the first place.
        let Some(address) = self.store.resolve_identity(identity_id, group_id).await else {
            return Ok(Outcome::NoOp);
        };

        // All ledger reads happen before any membership action; a failed
        // read aborts the invocation with the roster untouched.
        let snapshot = self.oracle.snapshot(group_id, &address).await?;
        let thresholds = self.oracle.stake_thresholds(group_id).await?;
        let is_admin = self.admin.is_admin(identity_id, group_id).await?;
        let tier = classify(&snapshot, &thresholds, is_admin);

        if tier.is_eligible() {
            debug!(
                "[Engine] {} in {} holds tier {:?} (balance {}, locked {})",
                identity_id,
                group_id,
                tier,
                snapshot.balance,
                snapshot.locked
            );
            return Ok(Outcome::NoOp);
        }

        info!(
            "[Engine] {} in {} is below the entry threshold (balance {}), removing",
            identity_id, group_id, snapshot.balance
        );
        // Evict must succeed before the link is dropped; a failed evict
        // leaves the link intact for the next sweep to retry.
        self.admin
            .evict(identity_id, group_id, EVICT_REASON_STAKE)
            .await?;
        self.store.unlink(identity_id, group_id).await?;
        Ok(Outcome::Removed)
    }

    /// New-identity-link trigger: the user proved ownership of `address`.
    /// Eligible newcomers get a single-use invite; the link itself is
    /// persisted only once the join is confirmed via `on_member_joined`.
    pub async fn link_and_reconcile(
        &self,
        identity_id: &str,
        address: &str,
        group_id: &str,
    ) -> GateResult<Outcome> {
        let key_lock = self.key_lock(identity_id, group_id).await;
        let _guard = key_lock.lock().await;
        let result = self
            .link_and_reconcile_locked(identity_id, address, group_id)
            .await;
        self.record(identity_id, group_id, &result);
        result
    }

    async fn link_and_reconcile_locked(
        &self,
        identity_id: &str,
        address: &str,
        group_id: &str,
    ) -> GateResult<Outcome> {
        if self.store.group(group_id).await.is_none() {
            debug!("[Engine] Group {} not configured, skipping", group_id);
            return Ok(Outcome::NoOp);
        }

        let address = normalize_address(address);
        let was_linked = self
            .store
            .resolve_identity(identity_id, group_id)
            .await
            .is_some();

        let snapshot = self.oracle.snapshot(group_id, &address).await?;
        let thresholds = self.oracle.stake_thresholds(group_id).await?;
        let is_admin = self.admin.is_admin(identity_id, group_id).await?;
        let tier = classify(&snapshot, &thresholds, is_admin);

        if tier.is_eligible() {
            if was_linked {
                // Existing member re-proving with a (possibly new)
                // address: last write wins.
                self.store
                    .link_identity(identity_id, &address, group_id)
                    .await?;
                return Ok(Outcome::NoOp);
            }

            let invite = self.admin.issue_invite(identity_id, group_id).await?;
            let mut pending = self.pending_invites.write().await;
            pending.insert(
                (identity_id.to_string(), group_id.to_string()),
                PendingInvite {
                    address,
                    expires_at: invite.expires_at,
                },
            );
            return Ok(Outcome::InviteIssued);
        }

        if was_linked {
            // An existing member re-proved an address that no longer
            // qualifies; same removal path as any other reconciliation.
            self.admin
                .evict(identity_id, group_id, EVICT_REASON_STAKE)
                .await?;
            self.store.unlink(identity_id, group_id).await?;
            return Ok(Outcome::Removed);
        }

        info!(
            "[Engine] {} proved {} for group {} but stake {} is below the entry threshold",
            identity_id, address, group_id, snapshot.balance
        );
        Ok(Outcome::NoOp)
    }

    /// Join confirmation. A joiner redeeming an unexpired invite gets
    /// their identity link persisted; anyone else without a link is a
    /// gatecrasher and is evicted on the spot.
    pub async fn on_member_joined(&self, identity_id: &str, group_id: &str) -> GateResult<Outcome> {
        let key_lock = self.key_lock(identity_id, group_id).await;
        let _guard = key_lock.lock().await;
        let result = self.on_member_joined_locked(identity_id, group_id).await;
        self.record(identity_id, group_id, &result);
        result
    }

    async fn on_member_joined_locked(
        &self,
        identity_id: &str,
        group_id: &str,
    ) -> GateResult<Outcome> {
        if self.store.group(group_id).await.is_none() {
            return Ok(Outcome::NoOp);
        }

        let key = (identity_id.to_string(), group_id.to_string());
        let pending = {
            let mut invites = self.pending_invites.write().await;
            invites.remove(&key)
        };

        if let Some(invite) = pending {
            if invite.expires_at >= unix_now() {
                self.store
                    .link_identity(identity_id, &invite.address, group_id)
                    .await?;
                info!(
                    "[Engine] {} joined group {}, link to {} confirmed",
                    identity_id, group_id, invite.address
                );
                return Ok(Outcome::NoOp);
            }
            warn!(
                "[Engine] {} joined group {} on an expired invite",
                identity_id, group_id
            );
        }

        if self
            .store
            .resolve_identity(identity_id, group_id)
            .await
            .is_some()
        {
            return Ok(Outcome::NoOp);
        }

        info!(
            "[Engine] {} joined group {} without an invite, evicting",
            identity_id, group_id
        );
        self.admin
            .evict(identity_id, group_id, EVICT_REASON_GATECRASH)
            .await?;
        Ok(Outcome::Removed)
    }

    /// Voluntary leave: drop the identity link and any pending invite
    pub async fn on_member_left(&self, identity_id: &str, group_id: &str) -> GateResult<()> {
        let key_lock = self.key_lock(identity_id, group_id).await;
        let _guard = key_lock.lock().await;

        {
            let mut invites = self.pending_invites.write().await;
            invites.remove(&(identity_id.to_string(), group_id.to_string()));
        }
        self.store.unlink(identity_id, group_id).await?;
        info!("[Engine] {} left group {}, link removed", identity_id, group_id);
        Ok(())
    }

    /// Per-tier membership counts for one group. Read-only; supplies the
    /// data the stats/chart surface formats.
    pub async fn tier_census(&self, group_id: &str) -> GateResult<TierCensus> {
        let mut census = TierCensus::default();
        if self.store.group(group_id).await.is_none() {
            return Ok(census);
        }

        let thresholds = self.oracle.stake_thresholds(group_id).await?;
        for identity_id in self.store.list_linked(group_id).await {
            let Some(address) = self.store.resolve_identity(&identity_id, group_id).await else {
                continue;
            };
            let snapshot = self.oracle.snapshot(group_id, &address).await?;
            let is_admin = self.admin.is_admin(&identity_id, group_id).await?;
            let tier = classify(&snapshot, &thresholds, is_admin);

            match tier {
                Tier::Admin => census.admins += 1,
                Tier::Rank(n) => *census.ranks.entry(n).or_default() += 1,
                Tier::Ineligible => census.ineligible += 1,
            }
            census.members.push(MemberStake {
                identity_id,
                tier,
                balance: snapshot.balance,
            });
        }

        Ok(census)
    }
}
