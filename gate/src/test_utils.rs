// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared mock collaborators for unit tests

use crate::admin::GroupAdmin;
use crate::error::{GateError, GateResult};
use crate::oracle::LedgerOracle;
use crate::types::{unix_now, Invite, StakeEvent, Timelock};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Programmable in-memory ledger. Instruments reads so tests can assert
/// that per-key serialization prevents overlapping reconciliations.
pub struct MockLedgerOracle {
    balances: RwLock<HashMap<String, u128>>,
    timelocks: RwLock<HashMap<String, Vec<Timelock>>>,
    thresholds: RwLock<HashMap<String, Vec<u128>>>,
    queued_events: RwLock<VecDeque<Vec<StakeEvent>>>,
    head: AtomicU64,
    fail_reads: AtomicBool,
    fail_polls: AtomicBool,
    read_calls: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    read_delay: RwLock<Option<Duration>>,
}

impl MockLedgerOracle {
    pub fn new() -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
            timelocks: RwLock::new(HashMap::new()),
            thresholds: RwLock::new(HashMap::new()),
            queued_events: RwLock::new(VecDeque::new()),
            head: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_polls: AtomicBool::new(false),
            read_calls: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
            read_delay: RwLock::new(None),
        }
    }

    pub async fn set_balance(&self, address: &str, balance: u128) {
        let mut balances = self.balances.write().await;
        balances.insert(address.to_string(), balance);
    }

    pub async fn set_timelocks(&self, address: &str, locks: Vec<Timelock>) {
        let mut timelocks = self.timelocks.write().await;
        timelocks.insert(address.to_string(), locks);
    }

    pub async fn set_thresholds(&self, group_id: &str, thresholds: Vec<u128>) {
        let mut map = self.thresholds.write().await;
        map.insert(group_id.to_string(), thresholds);
    }

    pub async fn push_events(&self, batch: Vec<StakeEvent>) {
        let mut queued = self.queued_events.write().await;
        queued.push_back(batch);
    }

    pub fn set_head(&self, block: u64) {
        self.head.store(block, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    pub async fn set_read_delay(&self, delay: Duration) {
        let mut guard = self.read_delay.write().await;
        *guard = Some(delay);
    }

    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Highest number of ledger reads that were ever in flight at once
    pub fn max_in_flight(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter_read(&self) -> GateResult<()> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if self.fail_reads.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(GateError::OracleUnavailable("mock read failure".to_string()));
        }

        let delay = { *self.read_delay.read().await };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn exit_read(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockLedgerOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerOracle for MockLedgerOracle {
    async fn balance_of(&self, _group_id: &str, address: &str) -> GateResult<u128> {
        self.enter_read().await?;
        let balance = {
            let balances = self.balances.read().await;
            balances.get(address).copied().unwrap_or(0)
        };
        self.exit_read();
        Ok(balance)
    }

    async fn active_timelocks(&self, _group_id: &str, address: &str) -> GateResult<Vec<Timelock>> {
        self.enter_read().await?;
        let now = unix_now();
        let locks = {
            let timelocks = self.timelocks.read().await;
            timelocks
                .get(address)
                .map(|locks| {
                    locks
                        .iter()
                        .filter(|l| l.expires_at > now)
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        self.exit_read();
        Ok(locks)
    }

    async fn stake_thresholds(&self, group_id: &str) -> GateResult<Vec<u128>> {
        let map = self.thresholds.read().await;
        map.get(group_id).cloned().ok_or_else(|| {
            GateError::ConfigNotFound(format!("no thresholds for group {}", group_id))
        })
    }

    async fn head_block(&self, _group_id: &str) -> GateResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn poll_events(
        &self,
        _group_id: &str,
        from_block: u64,
    ) -> GateResult<(Vec<StakeEvent>, u64)> {
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(GateError::OracleUnavailable("mock poll failure".to_string()));
        }
        let batch = {
            let mut queued = self.queued_events.write().await;
            queued.pop_front().unwrap_or_default()
        };
        Ok((batch, from_block + 1))
    }
}

/// Recording group admin with programmable admin roles and failures
pub struct MockGroupAdmin {
    admins: RwLock<HashSet<(String, String)>>,
    evictions: RwLock<Vec<(String, String, String)>>,
    invites: RwLock<Vec<(String, String)>>,
    fail_evict: AtomicBool,
    calls: AtomicU64,
    invite_counter: AtomicU64,
}

impl MockGroupAdmin {
    pub fn new() -> Self {
        Self {
            admins: RwLock::new(HashSet::new()),
            evictions: RwLock::new(Vec::new()),
            invites: RwLock::new(Vec::new()),
            fail_evict: AtomicBool::new(false),
            calls: AtomicU64::new(0),
            invite_counter: AtomicU64::new(0),
        }
    }

    pub async fn grant_admin(&self, identity_id: &str, group_id: &str) {
        let mut admins = self.admins.write().await;
        admins.insert((identity_id.to_string(), group_id.to_string()));
    }

    pub fn fail_evict(&self, fail: bool) {
        self.fail_evict.store(fail, Ordering::SeqCst);
    }

    /// Total calls across all trait methods
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// (identity, group, reason) triples, in order
    pub async fn evictions(&self) -> Vec<(String, String, String)> {
        self.evictions.read().await.clone()
    }

    pub async fn invites(&self) -> Vec<(String, String)> {
        self.invites.read().await.clone()
    }
}

impl Default for MockGroupAdmin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupAdmin for MockGroupAdmin {
    async fn is_admin(&self, identity_id: &str, group_id: &str) -> GateResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let admins = self.admins.read().await;
        Ok(admins.contains(&(identity_id.to_string(), group_id.to_string())))
    }

    async fn evict(&self, identity_id: &str, group_id: &str, reason: &str) -> GateResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_evict.load(Ordering::SeqCst) {
            return Err(GateError::AdminActionFailed(
                "mock evict failure".to_string(),
            ));
        }
        let mut evictions = self.evictions.write().await;
        evictions.push((
            identity_id.to_string(),
            group_id.to_string(),
            reason.to_string(),
        ));
        Ok(())
    }

    async fn issue_invite(&self, identity_id: &str, group_id: &str) -> GateResult<Invite> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = self.invite_counter.fetch_add(1, Ordering::SeqCst);
        let mut invites = self.invites.write().await;
        invites.push((identity_id.to_string(), group_id.to_string()));
        Ok(Invite {
            link: format!("https://t.me/+mock{}", n),
            expires_at: unix_now() + 600,
        })
    }
}
