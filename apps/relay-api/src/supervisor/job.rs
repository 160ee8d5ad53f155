//! Broadcast job values: the unit of work, its key, recipient filtering and
//! message personalisation.

use std::collections::HashSet;
use std::time::Duration;

use relay_common::id::prefix;
use relay_common::{PrefixedId, Snowflake};

use super::credential::Credential;
use super::error::SupervisorError;
use crate::platform::Member;

/// Identifies the stats record and cancel flag of one (credential, group) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub credential: Credential,
    pub group_id: Snowflake,
}

impl JobKey {
    pub fn new(credential: Credential, group_id: Snowflake) -> Self {
        Self {
            credential,
            group_id,
        }
    }
}

/// Operator input for a new broadcast.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub group_id: Snowflake,
    pub message_template: String,
    /// Pause after each recipient, in seconds. `None` uses the configured default.
    pub delay_secs: Option<f64>,
    pub include_bots: bool,
    pub role_filter: HashSet<Snowflake>,
}

/// An accepted broadcast. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct BroadcastJob {
    pub id: String,
    pub group_id: Snowflake,
    pub message_template: String,
    pub delay: Duration,
    pub include_bots: bool,
    pub role_filter: HashSet<Snowflake>,
    /// Stats generation this job writes under, assigned when it is accepted.
    pub generation: u64,
}

impl PrefixedId for BroadcastJob {
    const PREFIX: &'static str = prefix::JOB;
}

impl BroadcastJob {
    /// Validate a request and freeze it into a job.
    pub fn from_request(
        request: JobRequest,
        default_delay: Duration,
    ) -> Result<Self, SupervisorError> {
        if request.message_template.trim().is_empty() {
            return Err(SupervisorError::InvalidJob {
                field: "message",
                message: "must not be empty".to_string(),
            });
        }
        let delay = match request.delay_secs {
            None => default_delay,
            Some(secs) => {
                Duration::try_from_secs_f64(secs).map_err(|_| SupervisorError::InvalidJob {
                    field: "delay_secs",
                    message: "must be a non-negative number of seconds".to_string(),
                })?
            }
        };
        Ok(Self {
            id: Self::generate_id(),
            group_id: request.group_id,
            message_template: request.message_template,
            delay,
            include_bots: request.include_bots,
            role_filter: request.role_filter,
            generation: 0,
        })
    }

    /// Members this job will contact, in platform order.
    pub fn select_recipients(&self, members: Vec<Member>) -> Vec<Member> {
        select_recipients(members, self.include_bots, &self.role_filter)
    }
}

/// Keep humans (and bots when `include_bots`), and when `role_filter` is not
/// empty only members holding at least one of its roles.
pub fn select_recipients(
    members: Vec<Member>,
    include_bots: bool,
    role_filter: &HashSet<Snowflake>,
) -> Vec<Member> {
    members
        .into_iter()
        .filter(|m| include_bots || !m.is_bot)
        .filter(|m| role_filter.is_empty() || m.role_ids.iter().any(|r| role_filter.contains(r)))
        .collect()
}

/// Substitute `{user}` and then `{server}` in a message template.
pub fn render_message(template: &str, user: &str, server: &str) -> String {
    template.replace("{user}", user).replace("{server}", server)
}
