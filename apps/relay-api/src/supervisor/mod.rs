//! Session supervisor and broadcast job engine.
//!
//! [`Supervisor`] is the only entry point the presentation layer uses. It owns
//! the session registry, the stats and cancel-flag stores, and the dispatcher.

pub mod cancel;
pub mod credential;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod job;
pub mod registry;
pub mod session;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_common::Snowflake;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::config::Config;
use crate::platform::{Group, PlatformClient, PlatformConnector, RoleInfo};
use cancel::CancellationRegistry;
use credential::Credential;
use dispatcher::JobDispatcher;
use engine::BroadcastEngine;
use error::SupervisorError;
use job::{BroadcastJob, JobKey, JobRequest};
use registry::SessionRegistry;
use session::{Readiness, SessionContext};
use stats::{JobStats, StatsStore};

/// Result of a Connect request.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConnectOutcome {
    pub ready: bool,
    pub readiness: Readiness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a job submission.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobReceipt {
    pub accepted: bool,
    pub job_id: String,
}

/// Result of a stop request. Always accepted; `signalled` tells whether a
/// queued or running job was actually flagged.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StopReceipt {
    pub accepted: bool,
    pub signalled: bool,
}

/// Snapshot of one group as shown to the operator.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GroupSummary {
    #[schema(value_type = String)]
    pub id: Snowflake,
    pub name: String,
    pub icon_url: Option<String>,
    pub owner: Option<String>,
    pub member_count: u64,
    pub online_count: Option<u64>,
    /// Members not currently online, when the platform reports presence.
    pub offline_count: Option<u64>,
    pub bot_count: Option<u64>,
    pub role_count: usize,
    pub channel_count: u64,
    pub emoji_count: u64,
    pub created_at: DateTime<Utc>,
    pub boost_tier: u8,
    pub boost_count: u64,
    pub roles: Vec<RoleInfo>,
    pub stats: JobStats,
}

impl GroupSummary {
    fn new(group: Group, stats: JobStats) -> Self {
        Self {
            id: group.id,
            created_at: group.id.created_at(),
            name: group.name,
            icon_url: group.icon_url,
            owner: group.owner_name,
            member_count: group.member_count,
            online_count: group.online_count,
            offline_count: group
                .online_count
                .map(|online| group.member_count.saturating_sub(online)),
            bot_count: group.bot_count,
            role_count: group.roles.len(),
            channel_count: group.channel_count,
            emoji_count: group.emoji_count,
            boost_tier: group.boost_tier,
            boost_count: group.boost_count,
            roles: group.roles,
            stats,
        }
    }
}

pub struct Supervisor {
    registry: Arc<SessionRegistry>,
    stats: Arc<StatsStore>,
    cancels: Arc<CancellationRegistry>,
    dispatcher: Arc<JobDispatcher>,
    shutdown: CancellationToken,
    connect_wait: Duration,
    default_delay: Duration,
    shutdown_grace: Duration,
}

impl Supervisor {
    pub fn new(connector: Arc<dyn PlatformConnector>, config: &Config) -> Self {
        let stats = Arc::new(StatsStore::new());
        let cancels = Arc::new(CancellationRegistry::new());
        let shutdown = CancellationToken::new();

        let registry = Arc::new(SessionRegistry::new(SessionContext {
            connector,
            stats: Arc::clone(&stats),
            cancels: Arc::clone(&cancels),
            connect_timeout: config.connect_timeout,
        }));
        let engine = Arc::new(BroadcastEngine::new(
            Arc::clone(&stats),
            Arc::clone(&cancels),
            config.send_timeout,
            shutdown.clone(),
        ));
        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::clone(&registry),
            engine,
            config.dispatch_interval,
            shutdown.clone(),
        ));

        Self {
            registry,
            stats,
            cancels,
            dispatcher,
            shutdown,
            connect_wait: config.connect_wait(),
            default_delay: config.default_delay,
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Start the background dispatcher.
    pub fn start(&self) -> JoinHandle<()> {
        self.dispatcher.spawn()
    }

    /// Create (or reuse) the session for `credential` and wait a bounded time
    /// for it to become ready.
    pub async fn connect(&self, credential: &Credential) -> ConnectOutcome {
        let session = self.registry.get_or_create(credential);
        let readiness = session.wait_ready(self.connect_wait).await;
        ConnectOutcome {
            ready: readiness == Readiness::Ready,
            readiness,
            error: session.failure().map(str::to_string),
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn session_status(&self, credential: &Credential) -> Option<Readiness> {
        self.registry.get(credential).map(|s| s.readiness())
    }

    /// Groups visible to the session, fetched live, each with its current stats.
    pub async fn list_groups(
        &self,
        credential: &Credential,
    ) -> Result<Vec<GroupSummary>, SupervisorError> {
        let client = self.ready_client(credential)?;
        let groups = client.list_groups().await?;
        Ok(groups
            .into_iter()
            .map(|g| {
                let stats = self.stats.get(&JobKey::new(credential.clone(), g.id));
                GroupSummary::new(g, stats)
            })
            .collect())
    }

    /// Accept a broadcast for later execution.
    ///
    /// On success the key's stats are already zeroed and owned by the new
    /// job, even though it only runs on a later dispatcher tick. A job still
    /// running for the key keeps sending but no longer updates them.
    pub fn submit_job(
        &self,
        credential: &Credential,
        request: JobRequest,
    ) -> Result<JobReceipt, SupervisorError> {
        let session = self
            .registry
            .get(credential)
            .filter(|s| s.is_ready())
            .ok_or(SupervisorError::SessionNotReady)?;
        let mut job = BroadcastJob::from_request(request, self.default_delay)?;

        let key = JobKey::new(credential.clone(), job.group_id);
        let job_id = job.id.clone();
        job.generation = self.stats.reset_for_submit(&key, Utc::now());
        self.cancels.arm(&key, job.generation);
        if let Err(e) = session.enqueue(job) {
            self.cancels.finish(&key);
            return Err(e);
        }

        tracing::info!(
            %job_id,
            credential = %credential,
            group_id = %key.group_id,
            "broadcast queued"
        );
        Ok(JobReceipt {
            accepted: true,
            job_id,
        })
    }

    pub fn request_stop(&self, credential: &Credential, group_id: Snowflake) -> StopReceipt {
        let key = JobKey::new(credential.clone(), group_id);
        let signalled = self.cancels.request_stop(&key);
        if signalled {
            tracing::info!(credential = %credential, %group_id, "broadcast stop requested");
        }
        StopReceipt {
            accepted: true,
            signalled,
        }
    }

    pub fn get_stats(&self, credential: &Credential, group_id: Snowflake) -> JobStats {
        self.stats.get(&JobKey::new(credential.clone(), group_id))
    }

    /// Stop dispatching, interrupt running jobs, and stop every session.
    pub async fn shutdown(&self) {
        tracing::info!(sessions = self.registry.len(), "supervisor shutting down");
        self.shutdown.cancel();
        if !self.dispatcher.wait_idle(self.shutdown_grace).await {
            tracing::warn!("broadcasts still running after the shutdown grace period");
        }
        self.registry.shutdown().await;
    }

    fn ready_client(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn PlatformClient>, SupervisorError> {
        self.registry
            .get(credential)
            .and_then(|s| s.client())
            .ok_or(SupervisorError::SessionNotReady)
    }
}
