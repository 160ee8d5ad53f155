//! In-memory platform with scripted groups, members and send outcomes.
//!
//! Backs local runs (`PLATFORM=memory`) and every test. All credentials see
//! the same set of groups unless they are explicitly rejected.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_common::{Snowflake, SnowflakeGenerator};

use super::{
    Group, Member, PlatformClient, PlatformConnector, PlatformError, RoleInfo, SendOutcome,
};
use crate::supervisor::credential::Credential;

/// A message accepted by the in-memory platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub account: String,
    pub member_id: Snowflake,
    pub text: String,
}

struct MemoryGroup {
    group: Group,
    members: Vec<Member>,
    members_unavailable: bool,
}

#[derive(Default)]
struct World {
    groups: Vec<MemoryGroup>,
    rejected: HashSet<String>,
    outcomes: HashMap<Snowflake, SendOutcome>,
    deliveries: Vec<Delivery>,
    attempts: Vec<Snowflake>,
    handshake_delay: Duration,
    send_latency: Duration,
    groups_unavailable: bool,
}

struct Shared {
    world: Mutex<World>,
    ids: SnowflakeGenerator,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Scriptable in-memory platform. Cloning shares the same world.
#[derive(Clone)]
pub struct MemoryPlatform {
    shared: Arc<Shared>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                world: Mutex::new(World::default()),
                ids: SnowflakeGenerator::new(1),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// A small demo world used by `PLATFORM=memory` local runs.
    pub fn demo() -> Self {
        let platform = Self::new();
        let guild = platform.add_group("Demo Guild");
        let staff = platform.add_role(guild, "Staff");
        platform.add_member(guild, "Ana", false, &[staff]);
        platform.add_member(guild, "Bruno", false, &[]);
        platform.add_member(guild, "HelperBot", true, &[staff]);
        platform
    }

    pub fn add_group(&self, name: &str) -> Snowflake {
        let id = self.shared.ids.generate();
        let mut world = self.shared.world.lock();
        world.groups.push(MemoryGroup {
            group: Group {
                id,
                name: name.to_string(),
                icon_url: None,
                owner_name: None,
                member_count: 0,
                online_count: None,
                bot_count: Some(0),
                roles: Vec::new(),
                channel_count: 1,
                emoji_count: 0,
                boost_tier: 0,
                boost_count: 0,
            },
            members: Vec::new(),
            members_unavailable: false,
        });
        id
    }

    pub fn remove_group(&self, group_id: Snowflake) {
        self.shared.world.lock().groups.retain(|g| g.group.id != group_id);
    }

    pub fn add_role(&self, group_id: Snowflake, name: &str) -> Snowflake {
        let id = self.shared.ids.generate();
        if let Some(g) = self.shared.world.lock().group_mut(group_id) {
            g.group.roles.push(RoleInfo {
                id,
                name: name.to_string(),
            });
        }
        id
    }

    /// Add a member; the first member added to a group becomes its owner.
    pub fn add_member(
        &self,
        group_id: Snowflake,
        display_name: &str,
        is_bot: bool,
        role_ids: &[Snowflake],
    ) -> Snowflake {
        let id = self.shared.ids.generate();
        if let Some(g) = self.shared.world.lock().group_mut(group_id) {
            g.members.push(Member {
                id,
                username: display_name.to_lowercase(),
                display_name: display_name.to_string(),
                is_bot,
                role_ids: role_ids.to_vec(),
            });
            g.group.member_count = g.members.len() as u64;
            g.group.bot_count = Some(g.members.iter().filter(|m| m.is_bot).count() as u64);
            if g.group.owner_name.is_none() {
                g.group.owner_name = Some(display_name.to_string());
            }
        }
        id
    }

    /// Make member listing fail for a group.
    pub fn fail_member_listing(&self, group_id: Snowflake) {
        if let Some(g) = self.shared.world.lock().group_mut(group_id) {
            g.members_unavailable = true;
        }
    }

    /// Make group lookups fail as if the platform were down.
    pub fn set_groups_unavailable(&self, unavailable: bool) {
        self.shared.world.lock().groups_unavailable = unavailable;
    }

    pub fn reject_credential(&self, raw: &str) {
        self.shared.world.lock().rejected.insert(raw.to_string());
    }

    /// Script the outcome of every send to `member_id`.
    pub fn set_outcome(&self, member_id: Snowflake, outcome: SendOutcome) {
        self.shared.world.lock().outcomes.insert(member_id, outcome);
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        self.shared.world.lock().handshake_delay = delay;
    }

    pub fn set_send_latency(&self, latency: Duration) {
        self.shared.world.lock().send_latency = latency;
    }

    /// Messages successfully delivered so far, in delivery order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.shared.world.lock().deliveries.clone()
    }

    /// Every member a send was attempted for, in attempt order.
    pub fn attempts(&self) -> Vec<Snowflake> {
        self.shared.world.lock().attempts.clone()
    }

    /// Highest number of sends that were in progress at the same time.
    pub fn peak_concurrent_sends(&self) -> usize {
        self.shared.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl World {
    fn check_groups_available(&self) -> Result<(), PlatformError> {
        if self.groups_unavailable {
            return Err(PlatformError::Unavailable("groups unavailable".to_string()));
        }
        Ok(())
    }

    fn group_mut(&mut self, group_id: Snowflake) -> Option<&mut MemoryGroup> {
        self.groups.iter_mut().find(|g| g.group.id == group_id)
    }
}

#[async_trait]
impl PlatformConnector for MemoryPlatform {
    async fn authenticate(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        let (delay, rejected) = {
            let world = self.shared.world.lock();
            (world.handshake_delay, world.rejected.contains(credential.expose()))
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if rejected {
            return Err(PlatformError::Unauthorized);
        }
        Ok(Arc::new(MemoryClient {
            account: format!("relay-{}", credential.redacted().trim_end_matches('…')),
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryClient {
    account: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl PlatformClient for MemoryClient {
    fn account_name(&self) -> &str {
        &self.account
    }

    async fn list_groups(&self) -> Result<Vec<Group>, PlatformError> {
        let world = self.shared.world.lock();
        world.check_groups_available()?;
        Ok(world.groups.iter().map(|g| g.group.clone()).collect())
    }

    async fn find_group(&self, group_id: Snowflake) -> Result<Option<Group>, PlatformError> {
        let world = self.shared.world.lock();
        world.check_groups_available()?;
        Ok(world
            .groups
            .iter()
            .find(|g| g.group.id == group_id)
            .map(|g| g.group.clone()))
    }

    async fn list_members(&self, group_id: Snowflake) -> Result<Vec<Member>, PlatformError> {
        let world = self.shared.world.lock();
        let group = world
            .groups
            .iter()
            .find(|g| g.group.id == group_id)
            .ok_or_else(|| PlatformError::Unavailable(format!("unknown group {group_id}")))?;
        if group.members_unavailable {
            return Err(PlatformError::Unavailable("member list unavailable".to_string()));
        }
        Ok(group.members.clone())
    }

    async fn send_direct_message(&self, member: &Member, text: &str) -> SendOutcome {
        let _in_flight = InFlight::enter(&self.shared);

        let latency = {
            let mut world = self.shared.world.lock();
            world.attempts.push(member.id);
            world.send_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut world = self.shared.world.lock();
        let outcome = world
            .outcomes
            .get(&member.id)
            .cloned()
            .unwrap_or(SendOutcome::Delivered);
        if outcome == SendOutcome::Delivered {
            world.deliveries.push(Delivery {
                account: self.account.clone(),
                member_id: member.id,
                text: text.to_string(),
            });
        }
        outcome
    }
}

/// Counts a send as in progress until dropped, including when the send
/// future is cancelled by a timeout.
struct InFlight<'a> {
    shared: &'a Shared,
}

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
