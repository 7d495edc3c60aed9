// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable identity/group store
//!
//! Holds the two record kinds the gate owns: group configurations
//! (contract addresses + tier thresholds) and identity links
//! ((identity, group) -> on-chain address). Backed by a single JSON
//! document rewritten on every mutation; reads are served from memory.
//!
//! Storage-layer faults are fatal for the current invocation and surface
//! as `GateError::StoreFault` - they are never retried here, since they
//! indicate a corrupted or unavailable local store.

use crate::error::{GateError, GateResult};
use crate::types::{normalize_address, unix_now};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One managed community group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub pool_address: String,
    pub token_address: String,
    /// Stake amounts mapped to ranks 1..N, strictly decreasing
    pub thresholds: Vec<u128>,
}

/// Binding of one external identity to one on-chain address, scoped to a
/// group. At most one address per (identity, group); upsert overwrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub identity_id: String,
    pub address: String,
    pub group_id: String,
    /// Unix timestamp in seconds
    pub linked_at: u64,
}

/// Complete persisted document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GateState {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    groups: HashMap<String, Group>,
    #[serde(default)]
    links: Vec<IdentityLink>,
}

const STATE_VERSION: u32 = 1;

/// Identity store with thread-safe access
#[derive(Debug)]
pub struct IdentityStore {
    file_path: PathBuf,
    state: Arc<RwLock<GateState>>,
}

impl IdentityStore {
    /// Open the store, loading existing state from disk if present
    pub fn open(file_path: PathBuf) -> GateResult<Self> {
        let state = if file_path.exists() {
            let contents = std::fs::read_to_string(&file_path)
                .map_err(|e| GateError::StoreFault(format!("failed to read state file: {}", e)))?;
            let state: GateState = serde_json::from_str(&contents)
                .map_err(|e| GateError::StoreFault(format!("failed to parse state file: {}", e)))?;
            info!(
                "[Store] Loaded state from {:?}: {} groups, {} links",
                file_path,
                state.groups.len(),
                state.links.len()
            );
            state
        } else {
            info!("[Store] No state file at {:?}, starting fresh", file_path);
            GateState {
                version: STATE_VERSION,
                ..Default::default()
            }
        };

        Ok(Self {
            file_path,
            state: Arc::new(RwLock::new(state)),
        })
    }

    fn save(&self, state: &GateState) -> GateResult<()> {
        let contents = serde_json::to_string_pretty(state)
            .map_err(|e| GateError::StoreFault(format!("failed to serialize state: {}", e)))?;
        std::fs::write(&self.file_path, contents)
            .map_err(|e| GateError::StoreFault(format!("failed to write state file: {}", e)))
    }

    /// Add or update a group configuration
    pub async fn upsert_group(&self, group: Group) -> GateResult<()> {
        let mut state = self.state.write().await;
        let existed = state
            .groups
            .insert(group.group_id.clone(), group.clone())
            .is_some();
        self.save(&state)?;
        info!(
            "[Store] Group {} {} (thresholds: {:?})",
            group.group_id,
            if existed { "updated" } else { "registered" },
            group.thresholds
        );
        Ok(())
    }

    /// Look up a group's configuration
    pub async fn group(&self, group_id: &str) -> Option<Group> {
        let state = self.state.read().await;
        state.groups.get(group_id).cloned()
    }

    /// All configured groups
    pub async fn groups(&self) -> Vec<Group> {
        let state = self.state.read().await;
        state.groups.values().cloned().collect()
    }

    /// Upsert the link for (identity, group). Last write wins; calling
    /// twice with identical arguments yields identical stored state.
    pub async fn link_identity(
        &self,
        identity_id: &str,
        address: &str,
        group_id: &str,
    ) -> GateResult<()> {
        let address = normalize_address(address);
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .links
            .iter_mut()
            .find(|l| l.identity_id == identity_id && l.group_id == group_id)
        {
            if existing.address != address {
                warn!(
                    "[Store] Relinking {} in group {}: {} -> {}",
                    identity_id, group_id, existing.address, address
                );
            }
            existing.address = address;
            existing.linked_at = unix_now();
        } else {
            state.links.push(IdentityLink {
                identity_id: identity_id.to_string(),
                address,
                group_id: group_id.to_string(),
                linked_at: unix_now(),
            });
        }

        self.save(&state)
    }

    /// Resolve the linked address for an identity in a group
    pub async fn resolve_identity(&self, identity_id: &str, group_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .links
            .iter()
            .find(|l| l.identity_id == identity_id && l.group_id == group_id)
            .map(|l| l.address.clone())
    }

    /// Reverse lookup: ledger events carry addresses, not identities
    pub async fn resolve_address(&self, address: &str, group_id: &str) -> Option<String> {
        let address = normalize_address(address);
        let state = self.state.read().await;
        state
            .links
            .iter()
            .find(|l| l.address == address && l.group_id == group_id)
            .map(|l| l.identity_id.clone())
    }

    /// Remove the link; no-op if absent
    pub async fn unlink(&self, identity_id: &str, group_id: &str) -> GateResult<()> {
        let mut state = self.state.write().await;
        let before = state.links.len();
        state
            .links
            .retain(|l| !(l.identity_id == identity_id && l.group_id == group_id));

        if state.links.len() == before {
            return Ok(());
        }
        self.save(&state)
    }

    /// Identities linked in a group, used by the periodic sweep
    pub async fn list_linked(&self, group_id: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .links
            .iter()
            .filter(|l| l.group_id == group_id)
            .map(|l| l.identity_id.clone())
            .collect()
    }
}
