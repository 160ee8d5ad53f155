//! One supervised platform session: readiness state machine, authenticated
//! client and job queue.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use super::cancel::CancellationRegistry;
use super::credential::Credential;
use super::error::SupervisorError;
use super::job::{BroadcastJob, JobKey};
use super::stats::StatsStore;
use crate::platform::{PlatformClient, PlatformConnector, PlatformError};

/// Session lifecycle state. `Ready` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    Connecting,
    Ready,
    Failed,
}

/// Everything a session needs to come up.
#[derive(Clone)]
pub struct SessionContext {
    pub connector: Arc<dyn PlatformConnector>,
    pub stats: Arc<StatsStore>,
    pub cancels: Arc<CancellationRegistry>,
    pub connect_timeout: Duration,
}

pub struct Session {
    credential: Credential,
    readiness: watch::Sender<Readiness>,
    client: OnceLock<Arc<dyn PlatformClient>>,
    failure: OnceLock<String>,
    jobs_tx: mpsc::UnboundedSender<BroadcastJob>,
    jobs_rx: Mutex<mpsc::UnboundedReceiver<BroadcastJob>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(credential: Credential) -> Arc<Self> {
        let (readiness, _) = watch::channel(Readiness::Connecting);
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            credential,
            readiness,
            client: OnceLock::new(),
            failure: OnceLock::new(),
            jobs_tx,
            jobs_rx: Mutex::new(jobs_rx),
            task: Mutex::new(None),
        })
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    /// Why the session failed, once it has.
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    /// The authenticated client; `None` until the session is ready.
    pub fn client(&self) -> Option<Arc<dyn PlatformClient>> {
        self.client.get().cloned()
    }

    /// Spawn the connection lifecycle. The caller does not wait for it.
    pub fn start(self: &Arc<Self>, ctx: SessionContext) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.connect(ctx).await });
        *self.task.lock() = Some(handle);
    }

    async fn connect(&self, ctx: SessionContext) {
        let handshake = async {
            let client = ctx.connector.authenticate(&self.credential).await?;
            let groups = client.list_groups().await?;
            Ok::<_, PlatformError>((client, groups))
        };

        match tokio::time::timeout(ctx.connect_timeout, handshake).await {
            Ok(Ok((client, groups))) => {
                for group in &groups {
                    let key = JobKey::new(self.credential.clone(), group.id);
                    ctx.stats.init_zero(key.clone());
                    ctx.cancels.init(key);
                }
                tracing::info!(
                    credential = %self.credential,
                    account = %client.account_name(),
                    groups = groups.len(),
                    "session ready"
                );
                let _ = self.client.set(client);
                self.readiness.send_replace(Readiness::Ready);
            }
            Ok(Err(e)) => self.fail(e.to_string()),
            Err(_) => self.fail(format!(
                "handshake did not finish within {}s",
                ctx.connect_timeout.as_secs()
            )),
        }
    }

    fn fail(&self, reason: String) {
        tracing::error!(credential = %self.credential, %reason, "session connection failed");
        let _ = self.failure.set(reason);
        self.readiness.send_replace(Readiness::Failed);
    }

    /// Wait until the session leaves `Connecting` or `timeout` elapses, and
    /// return the state observed at that point.
    pub async fn wait_ready(&self, timeout: Duration) -> Readiness {
        let mut rx = self.readiness.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|r| *r != Readiness::Connecting)).await;
        self.readiness()
    }

    pub fn enqueue(&self, job: BroadcastJob) -> Result<(), SupervisorError> {
        self.jobs_tx
            .send(job)
            .map_err(|_| SupervisorError::SessionNotReady)
    }

    /// Take every queued job without waiting.
    pub fn drain(&self) -> Vec<BroadcastJob> {
        let mut rx = self.jobs_rx.lock();
        let mut jobs = Vec::new();
        while let Ok(job) = rx.try_recv() {
            jobs.push(job);
        }
        jobs
    }

    /// Stop the lifecycle task and release the platform client.
    pub async fn shutdown(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(client) = self.client.get() {
            client.close().await;
        }
        tracing::debug!(credential = %self.credential, "session stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use relay_common::Snowflake;

    use super::*;
    use crate::platform::memory::MemoryPlatform;

    fn context(platform: &MemoryPlatform, connect_timeout: Duration) -> SessionContext {
        SessionContext {
            connector: Arc::new(platform.clone()),
            stats: Arc::new(StatsStore::new()),
            cancels: Arc::new(CancellationRegistry::new()),
            connect_timeout,
        }
    }

    fn job(group_id: Snowflake) -> BroadcastJob {
        BroadcastJob {
            id: "job_1".to_string(),
            group_id,
            message_template: "hi".to_string(),
            delay: Duration::ZERO,
            include_bots: false,
            role_filter: HashSet::new(),
            generation: 0,
        }
    }

    #[tokio::test]
    async fn becomes_ready_and_zeroes_stats_for_each_group() {
        let platform = MemoryPlatform::new();
        let g1 = platform.add_group("One");
        let g2 = platform.add_group("Two");
        let ctx = context(&platform, Duration::from_secs(5));

        let session = Session::new(Credential::new("token").unwrap());
        session.start(ctx.clone());

        assert_eq!(session.wait_ready(Duration::from_secs(5)).await, Readiness::Ready);
        assert!(session.client().is_some());
        for g in [g1, g2] {
            let key = JobKey::new(session.credential().clone(), g);
            assert_eq!(ctx.stats.get(&key), Default::default());
            assert_eq!(ctx.cancels.outstanding(&key), 0);
            assert!(!ctx.cancels.request_stop(&key));
        }
    }

    #[tokio::test]
    async fn rejected_credential_fails() {
        let platform = MemoryPlatform::new();
        platform.reject_credential("bad");
        let session = Session::new(Credential::new("bad").unwrap());
        session.start(context(&platform, Duration::from_secs(5)));

        assert_eq!(session.wait_ready(Duration::from_secs(5)).await, Readiness::Failed);
        assert!(session.client().is_none());
        assert!(session.failure().unwrap().contains("rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handshake_times_out() {
        let platform = MemoryPlatform::new();
        platform.set_handshake_delay(Duration::from_secs(60));
        let session = Session::new(Credential::new("slow").unwrap());
        session.start(context(&platform, Duration::from_secs(20)));

        assert_eq!(session.wait_ready(Duration::from_secs(1)).await, Readiness::Connecting);
        assert_eq!(session.wait_ready(Duration::from_secs(30)).await, Readiness::Failed);
    }

    #[tokio::test]
    async fn drain_returns_jobs_in_submission_order() {
        let session = Session::new(Credential::new("token").unwrap());
        session.enqueue(job(Snowflake(1))).unwrap();
        session.enqueue(job(Snowflake(2))).unwrap();

        let drained: Vec<_> = session.drain().into_iter().map(|j| j.group_id).collect();
        assert_eq!(drained, vec![Snowflake(1), Snowflake(2)]);
        assert!(session.drain().is_empty());
    }
}
