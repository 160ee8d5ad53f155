//! Discord REST implementation of the platform contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_common::Snowflake;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    Group, Member, PlatformClient, PlatformConnector, PlatformError, RoleInfo, SendOutcome,
};
use crate::supervisor::credential::Credential;

/// Page size for `GET /users/@me/guilds`.
const GUILD_PAGE_LIMIT: usize = 200;

/// Page size for `GET /guilds/{id}/members`.
const MEMBER_PAGE_LIMIT: usize = 1000;

const CDN_BASE: &str = "https://cdn.discordapp.com";

#[derive(Debug, Deserialize)]
struct CurrentUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct PartialGuild {
    id: Snowflake,
}

#[derive(Debug, Deserialize)]
struct RolePayload {
    id: Snowflake,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GuildPayload {
    id: Snowflake,
    name: String,
    icon: Option<String>,
    owner_id: Snowflake,
    #[serde(default)]
    approximate_member_count: Option<u64>,
    #[serde(default)]
    approximate_presence_count: Option<u64>,
    #[serde(default)]
    roles: Vec<RolePayload>,
    #[serde(default)]
    emojis: Vec<serde_json::Value>,
    #[serde(default)]
    premium_tier: u8,
    #[serde(default)]
    premium_subscription_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: Snowflake,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct MemberPayload {
    user: UserPayload,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    roles: Vec<Snowflake>,
}

impl GuildPayload {
    fn into_group(
        self,
        channel_count: u64,
        owner_name: Option<String>,
        bot_count: Option<u64>,
    ) -> Group {
        Group {
            id: self.id,
            icon_url: self
                .icon
                .map(|hash| format!("{CDN_BASE}/icons/{}/{hash}.png", self.id)),
            name: self.name,
            owner_name,
            member_count: self.approximate_member_count.unwrap_or(0),
            online_count: self.approximate_presence_count,
            bot_count,
            roles: self
                .roles
                .into_iter()
                .map(|r| RoleInfo { id: r.id, name: r.name })
                .collect(),
            channel_count,
            emoji_count: self.emojis.len() as u64,
            boost_tier: self.premium_tier,
            boost_count: self.premium_subscription_count.unwrap_or(0),
        }
    }
}

impl MemberPayload {
    fn into_member(self) -> Member {
        let display_name = self
            .nick
            .or(self.user.global_name)
            .unwrap_or_else(|| self.user.username.clone());
        Member {
            id: self.user.id,
            username: self.user.username,
            display_name,
            is_bot: self.user.bot,
            role_ids: self.roles,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DmChannel {
    id: Snowflake,
}

/// Authenticates bot tokens against the Discord HTTP API.
#[derive(Clone)]
pub struct DiscordConnector {
    api_base: String,
    http: reqwest::Client,
}

impl DiscordConnector {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PlatformConnector for DiscordConnector {
    async fn authenticate(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        let mut client = DiscordClient {
            api_base: self.api_base.clone(),
            http: self.http.clone(),
            authorization: format!("Bot {}", credential.expose()),
            account: String::new(),
            bot_counts: Mutex::new(HashMap::new()),
        };
        let me: CurrentUser = client.get_json("/users/@me").await?;
        tracing::info!(account = %me.username, credential = %credential, "platform handshake ok");
        client.account = me.username;
        Ok(Arc::new(client))
    }
}

struct DiscordClient {
    api_base: String,
    http: reqwest::Client,
    authorization: String,
    account: String,
    /// Bot counts seen on the last full member listing of each guild. The
    /// guild endpoint does not report them.
    bot_counts: Mutex<HashMap<Snowflake, u64>>,
}

impl DiscordClient {
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PlatformError> {
        let resp = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .send()
            .await?;
        decode(resp).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, PlatformError> {
        let resp = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }

    async fn guild_ids(&self) -> Result<Vec<Snowflake>, PlatformError> {
        let mut ids = Vec::new();
        let mut after: Option<Snowflake> = None;
        loop {
            let path = match after {
                Some(a) => format!("/users/@me/guilds?limit={GUILD_PAGE_LIMIT}&after={a}"),
                None => format!("/users/@me/guilds?limit={GUILD_PAGE_LIMIT}"),
            };
            let page: Vec<PartialGuild> = self.get_json(&path).await?;
            let full = page.len() == GUILD_PAGE_LIMIT;
            after = page.last().map(|g| g.id);
            ids.extend(page.into_iter().map(|g| g.id));
            if !full {
                return Ok(ids);
            }
        }
    }

    async fn guild(&self, guild_id: Snowflake) -> Result<Group, PlatformError> {
        let guild: GuildPayload = self
            .get_json(&format!("/guilds/{guild_id}?with_counts=true"))
            .await?;
        let channels: Vec<serde_json::Value> =
            self.get_json(&format!("/guilds/{guild_id}/channels")).await?;

        // The owner's name is cosmetic; a failed lookup leaves it unknown.
        let owner_name = match self
            .get_json::<MemberPayload>(&format!("/guilds/{guild_id}/members/{}", guild.owner_id))
            .await
        {
            Ok(owner) => Some(owner.into_member().display_name),
            Err(e) => {
                tracing::debug!(%guild_id, error = %e, "owner lookup failed");
                None
            }
        };

        let bot_count = self.bot_counts.lock().get(&guild_id).copied();
        Ok(guild.into_group(channels.len() as u64, owner_name, bot_count))
    }

    async fn open_dm(&self, member: &Member) -> Result<DmChannel, PlatformError> {
        self.post_json(
            "/users/@me/channels",
            &serde_json::json!({ "recipient_id": member.id }),
        )
        .await
    }
}

#[async_trait]
impl PlatformClient for DiscordClient {
    fn account_name(&self) -> &str {
        &self.account
    }

    async fn list_groups(&self) -> Result<Vec<Group>, PlatformError> {
        let mut groups = Vec::new();
        for id in self.guild_ids().await? {
            groups.push(self.guild(id).await?);
        }
        Ok(groups)
    }

    async fn find_group(&self, group_id: Snowflake) -> Result<Option<Group>, PlatformError> {
        match self.guild(group_id).await {
            Ok(group) => Ok(Some(group)),
            // Discord answers 403 for guilds the bot is not in and 404 for
            // unknown ids.
            Err(PlatformError::Status { status: 403 | 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_members(&self, group_id: Snowflake) -> Result<Vec<Member>, PlatformError> {
        let mut members = Vec::new();
        let mut after = Snowflake(0);
        loop {
            let page: Vec<MemberPayload> = self
                .get_json(&format!(
                    "/guilds/{group_id}/members?limit={MEMBER_PAGE_LIMIT}&after={after}"
                ))
                .await?;
            let full = page.len() == MEMBER_PAGE_LIMIT;
            if let Some(last) = page.last() {
                after = last.user.id;
            }
            members.extend(page.into_iter().map(MemberPayload::into_member));
            if !full {
                let bots = count_bots(&members);
                self.bot_counts.lock().insert(group_id, bots);
                return Ok(members);
            }
        }
    }

    async fn send_direct_message(&self, member: &Member, text: &str) -> SendOutcome {
        let channel = match self.open_dm(member).await {
            Ok(channel) => channel,
            Err(e) => return classify(e),
        };
        let sent: Result<serde_json::Value, _> = self
            .post_json(
                &format!("/channels/{}/messages", channel.id),
                &serde_json::json!({ "content": text }),
            )
            .await;
        match sent {
            Ok(_) => SendOutcome::Delivered,
            Err(e) => classify(e),
        }
    }
}

fn count_bots(members: &[Member]) -> u64 {
    members.iter().filter(|m| m.is_bot).count() as u64
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, PlatformError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(PlatformError::Unauthorized);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(PlatformError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| PlatformError::Decode(e.to_string()))
}

/// Map a failed DM request onto the per-recipient outcome taxonomy.
///
/// HTTP-level rejections only affect the current recipient; anything that
/// means the client itself is broken stops the job.
fn classify(err: PlatformError) -> SendOutcome {
    match err {
        PlatformError::Status { status: 403, body } => SendOutcome::Denied(body),
        PlatformError::Status { status, body } => {
            SendOutcome::Transient(format!("HTTP {status}: {body}"))
        }
        PlatformError::Unavailable(reason) => SendOutcome::Transient(reason),
        other @ (PlatformError::Unauthorized
        | PlatformError::Http(_)
        | PlatformError::Decode(_)) => SendOutcome::Fatal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_is_denied() {
        let outcome = classify(PlatformError::Status {
            status: 403,
            body: "Cannot send messages to this user".to_string(),
        });
        assert_eq!(
            outcome,
            SendOutcome::Denied("Cannot send messages to this user".to_string())
        );
    }

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        for status in [400, 429, 500, 503] {
            let outcome = classify(PlatformError::Status {
                status,
                body: String::new(),
            });
            assert!(matches!(outcome, SendOutcome::Transient(_)), "status {status}");
        }
    }

    #[test]
    fn revoked_token_and_bad_payloads_are_fatal() {
        assert!(matches!(classify(PlatformError::Unauthorized), SendOutcome::Fatal(_)));
        assert!(matches!(
            classify(PlatformError::Decode("eof".to_string())),
            SendOutcome::Fatal(_)
        ));
    }

    #[test]
    fn display_name_prefers_nick_then_global_name() {
        let with_nick: MemberPayload = serde_json::from_value(serde_json::json!({
            "user": { "id": "10", "username": "ana", "global_name": "Ana G" },
            "nick": "Aninha",
            "roles": ["7"]
        }))
        .unwrap();
        let member = with_nick.into_member();
        assert_eq!(member.display_name, "Aninha");
        assert_eq!(member.role_ids, vec![Snowflake(7)]);
        assert!(!member.is_bot);

        let global_only: MemberPayload = serde_json::from_value(serde_json::json!({
            "user": { "id": "11", "username": "bruno", "global_name": "Bruno" }
        }))
        .unwrap();
        assert_eq!(global_only.into_member().display_name, "Bruno");

        let bare: MemberPayload = serde_json::from_value(serde_json::json!({
            "user": { "id": "12", "username": "helper", "bot": true }
        }))
        .unwrap();
        let member = bare.into_member();
        assert_eq!(member.display_name, "helper");
        assert!(member.is_bot);
    }

    #[test]
    fn guild_payload_maps_counts_and_icon() {
        let payload: GuildPayload = serde_json::from_value(serde_json::json!({
            "id": "175928847299117063",
            "name": "Guild1",
            "icon": "abc",
            "owner_id": "10",
            "approximate_member_count": 42,
            "approximate_presence_count": 7,
            "roles": [{ "id": "1", "name": "@everyone" }],
            "emojis": [{}, {}],
            "premium_tier": 2,
            "premium_subscription_count": 9
        }))
        .unwrap();

        let group = payload.into_group(5, Some("Ana".to_string()), Some(3));
        assert_eq!(group.member_count, 42);
        assert_eq!(group.online_count, Some(7));
        assert_eq!(group.bot_count, Some(3));
        assert_eq!(group.channel_count, 5);
        assert_eq!(group.emoji_count, 2);
        assert_eq!((group.boost_tier, group.boost_count), (2, 9));
        assert_eq!(group.roles[0].name, "@everyone");
        assert_eq!(
            group.icon_url.as_deref(),
            Some("https://cdn.discordapp.com/icons/175928847299117063/abc.png")
        );
    }

    #[test]
    fn bots_are_counted_from_member_pages() {
        let page: Vec<MemberPayload> = serde_json::from_value(serde_json::json!([
            { "user": { "id": "1", "username": "ana" } },
            { "user": { "id": "2", "username": "helper", "bot": true } },
            { "user": { "id": "3", "username": "mod", "bot": true } }
        ]))
        .unwrap();
        let members: Vec<Member> = page.into_iter().map(MemberPayload::into_member).collect();

        assert_eq!(count_bots(&members), 2);
    }
}
