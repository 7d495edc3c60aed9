// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Gate configuration
//!
//! YAML file with `${ENV_VAR}` substitution. Group entries are the
//! configuration/admin action that creates and mutates Group records; the
//! daemon loads them into the identity store and the oracle registry at
//! startup.

use crate::admin::TelegramAdminConfig;
use crate::store::Group;
use crate::watcher::WatcherConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Complete daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Ledger JSON-RPC endpoint
    pub rpc_url: String,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub telegram: TelegramSettings,
    pub groups: Vec<GroupSettings>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("gate-state.json")
}

fn default_poll_interval() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    1800
}

/// Telegram bot settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramSettings {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_invite_ttl")]
    pub invite_ttl_secs: u64,
}

fn default_invite_ttl() -> u64 {
    600
}

impl TelegramSettings {
    pub fn to_admin_config(&self) -> TelegramAdminConfig {
        TelegramAdminConfig {
            bot_token: self.bot_token.clone(),
            invite_ttl_secs: self.invite_ttl_secs,
        }
    }
}

/// One managed group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    pub group_id: String,
    pub pool_address: String,
    pub token_address: String,
    /// Stake thresholds for ranks 1..N, strictly decreasing. Accepts
    /// plain numbers or strings; amounts beyond u64 range (18-decimal
    /// tokens) must be quoted.
    #[serde(deserialize_with = "de_thresholds")]
    pub thresholds: Vec<u128>,
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub start_block: Option<u64>,
}

fn de_thresholds<'de, D>(deserializer: D) -> Result<Vec<u128>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    let raw: Vec<Raw> = Vec::deserialize(deserializer)?;
    raw.into_iter()
        .map(|value| match value {
            Raw::Num(n) => Ok(n as u128),
            Raw::Text(s) => s.trim().parse::<u128>().map_err(serde::de::Error::custom),
        })
        .collect()
}

impl GroupSettings {
    pub fn to_group(&self) -> Group {
        Group {
            group_id: self.group_id.clone(),
            pool_address: self.pool_address.clone(),
            token_address: self.token_address.clone(),
            thresholds: self.thresholds.clone(),
        }
    }

    pub fn watcher_config(&self, config: &GateConfig) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            sweep_interval: Duration::from_secs(
                self.sweep_interval_secs
                    .unwrap_or(config.sweep_interval_secs),
            ),
            start_block: self.start_block,
        }
    }
}

impl GateConfig {
    /// Load configuration from YAML file with environment variable
    /// substitution
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read gate config file: {:?}", path))?;

        let contents = substitute_env_vars(&contents)?;

        let config: GateConfig =
            serde_yaml::from_str(&contents).context("Failed to parse gate config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            bail!("rpc_url must be set");
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            if !seen.insert(&group.group_id) {
                bail!("duplicate group id {}", group.group_id);
            }
            if group.thresholds.is_empty() {
                bail!("group {} has no tier thresholds", group.group_id);
            }
            // Rank ordering invariant: threshold(rank=1) > threshold(rank=2) > ...
            for pair in group.thresholds.windows(2) {
                if pair[0] <= pair[1] {
                    bail!(
                        "group {} thresholds must be strictly decreasing, got {} then {}",
                        group.group_id,
                        pair[0],
                        pair[1]
                    );
                }
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> Result<String> {
    use regex::Regex;

    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    let mut result = content.to_string();

    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];

        if let Ok(var_value) = std::env::var(var_name) {
            result = result.replace(full_match, &var_value);
        } else {
            tracing::warn!(
                "Environment variable {} not found, keeping placeholder",
                var_name
            );
        }
    }

    Ok(result)
}
