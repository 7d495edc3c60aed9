// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Group membership administration
//!
//! The chat platform's membership surface, consumed by the reconciliation
//! engine: admin-list query, eviction, and single-use time-limited invite
//! links. The Telegram implementation talks to the Bot API over HTTPS and
//! owns its own bounded retry policy - the engine never retries these
//! calls itself.

use crate::error::{GateError, GateResult};
use crate::types::{unix_now, Invite};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

/// Membership actions the engine can take against a group
#[async_trait]
pub trait GroupAdmin: Send + Sync {
    /// Whether the identity holds the platform admin role in the group
    async fn is_admin(&self, identity_id: &str, group_id: &str) -> GateResult<bool>;

    /// Remove the identity from the group, with a human-readable reason.
    /// Must only return Ok once the removal is confirmed.
    async fn evict(&self, identity_id: &str, group_id: &str, reason: &str) -> GateResult<()>;

    /// Issue a single-use, time-limited invite and deliver it to the user
    async fn issue_invite(&self, identity_id: &str, group_id: &str) -> GateResult<Invite>;
}

/// Telegram group admin configuration
#[derive(Debug, Clone)]
pub struct TelegramAdminConfig {
    pub bot_token: String,
    /// Invite links expire this many seconds after issuance
    pub invite_ttl_secs: u64,
}

impl Default for TelegramAdminConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            invite_ttl_secs: 600,
        }
    }
}

impl TelegramAdminConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    user: TgUser,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    first_name: String,
}

#[derive(Debug, Deserialize)]
struct ChatInviteLink {
    invite_link: String,
}

/// Telegram Bot API implementation of `GroupAdmin`
pub struct TelegramGroupAdmin {
    config: TelegramAdminConfig,
    client: Client,
    api_base: String,
}

impl std::fmt::Debug for TelegramGroupAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramGroupAdmin")
            .field("configured", &self.config.is_configured())
            .field("api_base", &"<redacted>")
            .finish()
    }
}

impl TelegramGroupAdmin {
    pub fn new(config: TelegramAdminConfig) -> Self {
        let api_base = format!("https://api.telegram.org/bot{}", config.bot_token);
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap();

        Self {
            config,
            client,
            api_base,
        }
    }

    fn parse_user_id(identity_id: &str) -> GateResult<i64> {
        identity_id.parse::<i64>().map_err(|_| {
            GateError::AdminActionFailed(format!("identity id {} is not a chat id", identity_id))
        })
    }

    /// Call a Bot API method with bounded retries
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &serde_json::Value,
    ) -> GateResult<T> {
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(format!("{}/{}", self.api_base, method))
                .json(payload)
                .send()
                .await
            {
                Ok(resp) => match resp.json::<ApiEnvelope<T>>().await {
                    Ok(envelope) if envelope.ok => {
                        if let Some(result) = envelope.result {
                            return Ok(result);
                        }
                        last_error = format!("{}: ok response with no result", method);
                    }
                    Ok(envelope) => {
                        last_error = format!(
                            "{}: {}",
                            method,
                            envelope.description.unwrap_or_else(|| "rejected".to_string())
                        );
                    }
                    Err(e) => {
                        last_error = format!("{}: malformed response: {}", method, e);
                    }
                },
                Err(e) => {
                    last_error = format!("{}: {}", method, e);
                }
            }

            warn!(
                "[GroupAdmin] Attempt {}/{} failed: {}",
                attempt + 1,
                MAX_RETRIES,
                last_error
            );
            if attempt < MAX_RETRIES - 1 {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS * (attempt as u64 + 1)))
                    .await;
            }
        }

        Err(GateError::AdminActionFailed(last_error))
    }

    /// Send a message, swallowing failures. Informational traffic only -
    /// never gate state changes on this.
    async fn notify(&self, chat_id: &str, text: &str) {
        let result: GateResult<serde_json::Value> = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }),
            )
            .await;
        if let Err(e) = result {
            warn!("[GroupAdmin] Failed to send message to {}: {:?}", chat_id, e);
        }
    }
}

#[async_trait]
impl GroupAdmin for TelegramGroupAdmin {
    async fn is_admin(&self, identity_id: &str, group_id: &str) -> GateResult<bool> {
        let admins: Vec<ChatMember> = self
            .call("getChatAdministrators", &json!({ "chat_id": group_id }))
            .await?;
        Ok(admins
            .iter()
            .any(|member| member.user.id.to_string() == identity_id))
    }

    async fn evict(&self, identity_id: &str, group_id: &str, reason: &str) -> GateResult<()> {
        let user_id = Self::parse_user_id(identity_id)?;

        // First name is for the group notice; fetch it before the ban
        let first_name = self
            .call::<ChatMember>(
                "getChatMember",
                &json!({ "chat_id": group_id, "user_id": user_id }),
            )
            .await
            .map(|member| member.user.first_name)
            .unwrap_or_else(|_| "A member".to_string());

        let _: bool = self
            .call(
                "banChatMember",
                &json!({ "chat_id": group_id, "user_id": user_id }),
            )
            .await?;
        info!(
            "[GroupAdmin] Evicted {} from group {} ({})",
            identity_id, group_id, reason
        );

        // Everything past the confirmed ban is informational
        match self
            .call::<i64>("getChatMemberCount", &json!({ "chat_id": group_id }))
            .await
        {
            Ok(count) => {
                self.notify(
                    group_id,
                    &format!(
                        "{} has been kicked because {}, {} survivors remaining",
                        first_name, reason, count
                    ),
                )
                .await;
            }
            Err(e) => {
                warn!("[GroupAdmin] Could not fetch member count: {:?}", e);
                self.notify(
                    group_id,
                    &format!("{} has been kicked because {}", first_name, reason),
                )
                .await;
            }
        }

        Ok(())
    }

    async fn issue_invite(&self, identity_id: &str, group_id: &str) -> GateResult<Invite> {
        let user_id = Self::parse_user_id(identity_id)?;

        // Lift any earlier eviction ban so the link is actually usable
        let _: bool = self
            .call(
                "unbanChatMember",
                &json!({
                    "chat_id": group_id,
                    "user_id": user_id,
                    "only_if_banned": true,
                }),
            )
            .await?;

        let expires_at = unix_now() + self.config.invite_ttl_secs;
        let link: ChatInviteLink = self
            .call(
                "createChatInviteLink",
                &json!({
                    "chat_id": group_id,
                    "expire_date": expires_at,
                    "member_limit": 1,
                }),
            )
            .await?;

        info!(
            "[GroupAdmin] Issued invite for {} to group {} (expires at {})",
            identity_id, group_id, expires_at
        );

        self.notify(
            identity_id,
            &format!(
                "Congratulations!🎉 Now you can join our super secret group:\n{}",
                link.invite_link
            ),
        )
        .await;
        self.notify(
            identity_id,
            &format!(
                "PS.: Hurry, you only have {} minutes until the invitation link expires! 😱",
                self.config.invite_ttl_secs / 60
            ),
        )
        .await;

        Ok(Invite {
            link: link.invite_link,
            expires_at,
        })
    }
}
