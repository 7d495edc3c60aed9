// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ledger oracle
//!
//! Read-only query interface over each group's staking pool and token
//! contracts, plus event polling for the watcher. Contract handles live in
//! an explicit per-group registry populated when a group's configuration
//! is loaded and invalidated when it changes.
//!
//! Timelock enumeration: the pool exposes locked positions by index with
//! no length accessor, so the oracle probes sequentially and treats the
//! first out-of-range revert as the natural end of the sequence. The probe
//! may race a concurrent lock mutation on-chain; an off-by-one undercount
//! is tolerated and corrected by the next sweep.

use crate::error::{GateError, GateResult};
use crate::store::Group;
use crate::types::{normalize_address, unix_now, StakeEvent, StakeEventKind, StakeSnapshot, Timelock};
use async_trait::async_trait;
use ethers::contract::ContractError;
use ethers::prelude::abigen;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address as EthAddress, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

abigen!(
    StakePool,
    r#"[
        function timelocks(address account, uint256 index) external view returns (uint256 amount, uint256 expires)
        event Deposit(address indexed account, uint256 amount)
        event Withdraw(address indexed account, uint256 amount)
    ]"#
);

abigen!(
    StakeToken,
    r#"[
        function balanceOf(address account) external view returns (uint256)
        function decimals() external view returns (uint8)
    ]"#
);

// Runaway guard for the index probe. Groups with more live locks than this
// are undercounted until the next sweep.
const MAX_TIMELOCK_PROBE: u64 = 1024;

/// Read-only view of the stake ledger, scoped per group
#[async_trait]
pub trait LedgerOracle: Send + Sync {
    /// Current total staked balance of an address, in smallest token units
    async fn balance_of(&self, group_id: &str, address: &str) -> GateResult<u128>;

    /// Unexpired locked positions of an address
    async fn active_timelocks(&self, group_id: &str, address: &str) -> GateResult<Vec<Timelock>>;

    /// The group's configured tier thresholds, cached for the process
    /// lifetime unless the group registration is invalidated
    async fn stake_thresholds(&self, group_id: &str) -> GateResult<Vec<u128>>;

    /// Latest ledger block number
    async fn head_block(&self, group_id: &str) -> GateResult<u64>;

    /// Deposit/Withdraw events in [from_block, head]. Returns the events
    /// and the next from_block to poll. At-least-once; no cross-address
    /// ordering guarantee.
    async fn poll_events(
        &self,
        group_id: &str,
        from_block: u64,
    ) -> GateResult<(Vec<StakeEvent>, u64)>;

    /// Fresh stake snapshot: balance plus the active locked sum
    async fn snapshot(&self, group_id: &str, address: &str) -> GateResult<StakeSnapshot> {
        let balance = self.balance_of(group_id, address).await?;
        let timelocks = self.active_timelocks(group_id, address).await?;
        let locked = timelocks
            .iter()
            .fold(0u128, |acc, lock| acc.saturating_add(lock.amount));
        Ok(StakeSnapshot { balance, locked })
    }
}

#[derive(Clone)]
struct GroupHandles {
    pool: StakePool<Provider<Http>>,
    token: StakeToken<Provider<Http>>,
    thresholds: Vec<u128>,
}

/// Ethereum-backed oracle over an HTTP JSON-RPC provider
pub struct EthLedgerOracle {
    provider: Arc<Provider<Http>>,
    handles: RwLock<HashMap<String, GroupHandles>>,
}

impl EthLedgerOracle {
    pub fn new(rpc_url: &str) -> GateResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| GateError::OracleUnavailable(format!("failed to create provider: {}", e)))?;
        Ok(Self {
            provider: Arc::new(provider),
            handles: RwLock::new(HashMap::new()),
        })
    }

    /// Register (or refresh) contract handles for a group
    pub async fn register_group(&self, group: &Group) -> GateResult<()> {
        let pool_address: EthAddress = group.pool_address.parse().map_err(|e| {
            GateError::ConfigNotFound(format!(
                "group {} has invalid pool address {}: {}",
                group.group_id, group.pool_address, e
            ))
        })?;
        let token_address: EthAddress = group.token_address.parse().map_err(|e| {
            GateError::ConfigNotFound(format!(
                "group {} has invalid token address {}: {}",
                group.group_id, group.token_address, e
            ))
        })?;

        let handles = GroupHandles {
            pool: StakePool::new(pool_address, self.provider.clone()),
            token: StakeToken::new(token_address, self.provider.clone()),
            thresholds: group.thresholds.clone(),
        };

        let mut map = self.handles.write().await;
        map.insert(group.group_id.clone(), handles);
        info!(
            "[Oracle] Registered group {} (pool: {}, token: {})",
            group.group_id, group.pool_address, group.token_address
        );
        Ok(())
    }

    /// Drop a group's handles, forcing re-registration on config change
    pub async fn invalidate_group(&self, group_id: &str) {
        let mut map = self.handles.write().await;
        if map.remove(group_id).is_some() {
            info!("[Oracle] Invalidated group {}", group_id);
        }
    }

    async fn group_handles(&self, group_id: &str) -> GateResult<GroupHandles> {
        let map = self.handles.read().await;
        map.get(group_id).cloned().ok_or_else(|| {
            GateError::ConfigNotFound(format!("no contracts registered for group {}", group_id))
        })
    }

    fn parse_account(address: &str) -> GateResult<EthAddress> {
        normalize_address(address).parse().map_err(|e| {
            GateError::OracleUnavailable(format!("invalid account address {}: {}", address, e))
        })
    }
}

// Out-of-range probes on a public array getter surface as reverts; that is
// the sequence terminator, not a failure. Anything else is transport-level
// and must abort the read.
fn is_out_of_range<M: Middleware>(error: &ContractError<M>) -> bool {
    if error.is_revert() {
        return true;
    }
    let text = error.to_string().to_lowercase();
    text.contains("revert") || text.contains("invalid opcode") || text.contains("out of gas")
}

fn to_u128(value: U256) -> GateResult<u128> {
    if value.bits() > 128 {
        return Err(GateError::OracleUnavailable(format!(
            "amount {} does not fit in u128",
            value
        )));
    }
    Ok(value.as_u128())
}

fn to_unix_secs(value: U256) -> u64 {
    if value.bits() > 64 {
        u64::MAX
    } else {
        value.as_u64()
    }
}

#[async_trait]
impl LedgerOracle for EthLedgerOracle {
    async fn balance_of(&self, group_id: &str, address: &str) -> GateResult<u128> {
        let handles = self.group_handles(group_id).await?;
        let account = Self::parse_account(address)?;

        let balance = handles.token.balance_of(account).call().await.map_err(|e| {
            GateError::OracleUnavailable(format!("balanceOf({}) failed: {}", address, e))
        })?;
        to_u128(balance)
    }

    async fn active_timelocks(&self, group_id: &str, address: &str) -> GateResult<Vec<Timelock>> {
        let handles = self.group_handles(group_id).await?;
        let account = Self::parse_account(address)?;

        let mut timelocks = Vec::new();
        let mut index = 0u64;
        loop {
            if index >= MAX_TIMELOCK_PROBE {
                warn!(
                    "[Oracle] Timelock probe for {} hit cap at {} entries, truncating",
                    address, MAX_TIMELOCK_PROBE
                );
                break;
            }
            match handles
                .pool
                .timelocks(account, U256::from(index))
                .call()
                .await
            {
                Ok((amount, expires)) => {
                    timelocks.push(Timelock {
                        amount: to_u128(amount)?,
                        expires_at: to_unix_secs(expires),
                    });
                    index += 1;
                }
                Err(e) if is_out_of_range(&e) => break,
                Err(e) => {
                    return Err(GateError::OracleUnavailable(format!(
                        "timelock probe for {} failed at index {}: {}",
                        address, index, e
                    )));
                }
            }
        }

        let now = unix_now();
        let total = timelocks.len();
        timelocks.retain(|lock| lock.expires_at > now);
        debug!(
            "[Oracle] {} timelocks for {} ({} active)",
            total,
            address,
            timelocks.len()
        );
        Ok(timelocks)
    }

    async fn stake_thresholds(&self, group_id: &str) -> GateResult<Vec<u128>> {
        let handles = self.group_handles(group_id).await?;
        Ok(handles.thresholds)
    }

    async fn head_block(&self, _group_id: &str) -> GateResult<u64> {
        let block = self.provider.get_block_number().await.map_err(|e| {
            GateError::OracleUnavailable(format!("failed to fetch head block: {}", e))
        })?;
        Ok(block.as_u64())
    }

    async fn poll_events(
        &self,
        group_id: &str,
        from_block: u64,
    ) -> GateResult<(Vec<StakeEvent>, u64)> {
        let handles = self.group_handles(group_id).await?;
        let head = self.head_block(group_id).await?;
        if from_block > head {
            return Ok((Vec::new(), from_block));
        }

        let deposits = handles
            .pool
            .deposit_filter()
            .from_block(from_block)
            .to_block(head)
            .query_with_meta()
            .await
            .map_err(|e| {
                GateError::OracleUnavailable(format!("deposit log query failed: {}", e))
            })?;
        let withdraws = handles
            .pool
            .withdraw_filter()
            .from_block(from_block)
            .to_block(head)
            .query_with_meta()
            .await
            .map_err(|e| {
                GateError::OracleUnavailable(format!("withdraw log query failed: {}", e))
            })?;

        let mut events = Vec::with_capacity(deposits.len() + withdraws.len());
        for (event, meta) in deposits {
            events.push(StakeEvent {
                kind: StakeEventKind::Deposit,
                address: normalize_address(&format!("{:?}", event.account)),
                amount: to_u128(event.amount)?,
                block_number: meta.block_number.as_u64(),
            });
        }
        for (event, meta) in withdraws {
            events.push(StakeEvent {
                kind: StakeEventKind::Withdraw,
                address: normalize_address(&format!("{:?}", event.account)),
                amount: to_u128(event.amount)?,
                block_number: meta.block_number.as_u64(),
            });
        }
        events.sort_by_key(|e| e.block_number);

        Ok((events, head + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_u128_bounds() {
        assert_eq!(to_u128(U256::from(0)).unwrap(), 0);
        assert_eq!(
            to_u128(U256::from(u128::MAX)).unwrap(),
            u128::MAX
        );
        assert!(to_u128(U256::from(u128::MAX) + U256::one()).is_err());
    }

    #[test]
    fn test_to_unix_secs_saturates() {
        assert_eq!(to_unix_secs(U256::from(1_700_000_000u64)), 1_700_000_000);
        assert_eq!(to_unix_secs(U256::from(u64::MAX) + U256::one()), u64::MAX);
    }

    #[tokio::test]
    async fn test_unregistered_group_is_config_not_found() {
        let oracle = EthLedgerOracle::new("http://localhost:8545").unwrap();
        match oracle.balance_of("-999", "0xabcd").await {
            Err(GateError::ConfigNotFound(_)) => {}
            other => panic!("expected ConfigNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalidate_group_drops_handles() {
        let oracle = EthLedgerOracle::new("http://localhost:8545").unwrap();
        let group = Group {
            group_id: "-100".to_string(),
            pool_address: "0x00000000000000000000000000000000000000aa".to_string(),
            token_address: "0x00000000000000000000000000000000000000bb".to_string(),
            thresholds: vec![1000, 100, 10],
        };
        oracle.register_group(&group).await.unwrap();
        assert_eq!(
            oracle.stake_thresholds("-100").await.unwrap(),
            vec![1000, 100, 10]
        );

        oracle.invalidate_group("-100").await;
        assert!(matches!(
            oracle.stake_thresholds("-100").await,
            Err(GateError::ConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_addresses() {
        let oracle = EthLedgerOracle::new("http://localhost:8545").unwrap();
        let group = Group {
            group_id: "-100".to_string(),
            pool_address: "not-an-address".to_string(),
            token_address: "0x00000000000000000000000000000000000000bb".to_string(),
            thresholds: vec![10],
        };
        assert!(matches!(
            oracle.register_group(&group).await,
            Err(GateError::ConfigNotFound(_))
        ));
    }
}
