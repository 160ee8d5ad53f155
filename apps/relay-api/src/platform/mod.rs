//! Contract between the supervisor and a chat platform SDK.
//!
//! A [`PlatformConnector`] turns a credential into an authenticated
//! [`PlatformClient`]. The supervisor only ever talks to the platform through
//! these two traits, so any SDK (or the in-memory fake) can back it.

pub mod discord;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use relay_common::Snowflake;
use serde::Serialize;
use utoipa::ToSchema;

use crate::supervisor::credential::Credential;

/// A role defined in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct RoleInfo {
    #[schema(value_type = String)]
    pub id: Snowflake,
    pub name: String,
}

/// A group (guild) visible to an authenticated session.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: Snowflake,
    pub name: String,
    pub icon_url: Option<String>,
    pub owner_name: Option<String>,
    pub member_count: u64,
    /// Members currently online, when the platform reports it.
    pub online_count: Option<u64>,
    /// Number of bot accounts, once known.
    pub bot_count: Option<u64>,
    pub roles: Vec<RoleInfo>,
    pub channel_count: u64,
    pub emoji_count: u64,
    pub boost_tier: u8,
    pub boost_count: u64,
}

/// A group member as seen by the broadcast engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: Snowflake,
    /// Account name, used in logs.
    pub username: String,
    /// Name substituted for `{user}` in message templates.
    pub display_name: String,
    pub is_bot: bool,
    pub role_ids: Vec<Snowflake>,
}

/// Result of a single direct-message attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The recipient does not accept direct messages from this account.
    Denied(String),
    /// The platform rejected the request but the next recipient may succeed.
    Transient(String),
    /// The client is unusable; the running job must stop.
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("credential rejected by the platform")]
    Unauthorized,
    #[error("platform request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected platform payload: {0}")]
    Decode(String),
    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

/// Authenticates credentials against the platform.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    async fn authenticate(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError>;
}

/// One authenticated platform session.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Name of the authenticated account.
    fn account_name(&self) -> &str;

    /// Groups currently visible to the account, in platform order.
    async fn list_groups(&self) -> Result<Vec<Group>, PlatformError>;

    /// One group by id, or `None` if the account cannot see it.
    async fn find_group(&self, group_id: Snowflake) -> Result<Option<Group>, PlatformError>;

    /// Members of a group, in platform order.
    async fn list_members(&self, group_id: Snowflake) -> Result<Vec<Member>, PlatformError>;

    async fn send_direct_message(&self, member: &Member, text: &str) -> SendOutcome;

    /// Release platform resources. Called once on shutdown.
    async fn close(&self) {}
}
