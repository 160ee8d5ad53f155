//! Broadcast execution: a paced, interruptible walk over a group's filtered
//! member list.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::cancel::CancellationRegistry;
use super::error::SupervisorError;
use super::job::{render_message, BroadcastJob, JobKey};
use super::stats::StatsStore;
use crate::platform::{Group, PlatformClient, SendOutcome};

/// How a job's send loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Stopped by an operator request or process shutdown.
    Cancelled,
    /// A fatal platform error ended the job early.
    Aborted(String),
}

/// Summary of one executed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub total: u64,
    pub success: u64,
    pub fails: u64,
    pub outcome: JobOutcome,
}

impl JobReport {
    fn new(total: u64) -> Self {
        Self {
            total,
            success: 0,
            fails: 0,
            outcome: JobOutcome::Completed,
        }
    }
}

pub struct BroadcastEngine {
    stats: Arc<StatsStore>,
    cancels: Arc<CancellationRegistry>,
    send_timeout: Duration,
    shutdown: CancellationToken,
}

impl BroadcastEngine {
    pub fn new(
        stats: Arc<StatsStore>,
        cancels: Arc<CancellationRegistry>,
        send_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stats,
            cancels,
            send_timeout,
            shutdown,
        }
    }

    /// Run `job` for `key` against `client`.
    ///
    /// The cancel flag for `key` is lowered when this returns, whatever the
    /// result.
    pub async fn execute(
        &self,
        client: &dyn PlatformClient,
        key: &JobKey,
        job: &BroadcastJob,
    ) -> Result<JobReport, SupervisorError> {
        let result = self.run(client, key, job).await;
        self.cancels.finish(key);
        result
    }

    /// Release the cancel flag of a job that will never run.
    pub fn discard(&self, key: &JobKey) {
        self.cancels.finish(key);
    }

    async fn run(
        &self,
        client: &dyn PlatformClient,
        key: &JobKey,
        job: &BroadcastJob,
    ) -> Result<JobReport, SupervisorError> {
        let group = match client.find_group(job.group_id).await {
            Ok(Some(group)) => group,
            Ok(None) => return Err(SupervisorError::GroupNotFound(job.group_id)),
            Err(e) => {
                self.stats.finish(key, job.generation, Utc::now());
                return Err(e.into());
            }
        };

        tracing::info!(
            job_id = %job.id,
            credential = %key.credential,
            group = %group.name,
            "starting broadcast"
        );
        self.stats.reset_for_start(key, job.generation, Utc::now());

        let result = self.deliver(client, key, job, &group).await;
        if !self.stats.finish(key, job.generation, Utc::now()) {
            tracing::info!(
                job_id = %job.id,
                group = %group.name,
                "broadcast superseded by a newer submission; its stats were not kept"
            );
        }

        if let Ok(report) = &result {
            tracing::info!(
                job_id = %job.id,
                group = %group.name,
                success = report.success,
                fails = report.fails,
                outcome = ?report.outcome,
                "broadcast finished"
            );
        }
        result
    }

    async fn deliver(
        &self,
        client: &dyn PlatformClient,
        key: &JobKey,
        job: &BroadcastJob,
        group: &Group,
    ) -> Result<JobReport, SupervisorError> {
        let recipients = job.select_recipients(client.list_members(group.id).await?);
        let total = recipients.len();
        self.stats.set_total(key, job.generation, total as u64);

        let mut report = JobReport::new(total as u64);

        for (index, member) in recipients.iter().enumerate() {
            if self.cancels.is_stop_requested(key, job.generation) || self.shutdown.is_cancelled() {
                tracing::warn!(job_id = %job.id, group = %group.name, "broadcast interrupted");
                report.outcome = JobOutcome::Cancelled;
                break;
            }

            let text = render_message(&job.message_template, &member.display_name, &group.name);
            let send = client.send_direct_message(member, &text);
            let outcome = match tokio::time::timeout(self.send_timeout, send).await {
                Ok(outcome) => outcome,
                Err(_) => SendOutcome::Transient(format!(
                    "no response within {}s",
                    self.send_timeout.as_secs_f64()
                )),
            };

            match outcome {
                SendOutcome::Delivered => {
                    self.stats.record_success(key, job.generation);
                    report.success += 1;
                    tracing::info!("+ [{}/{}] {}", index + 1, total, member.username);
                }
                SendOutcome::Denied(reason) | SendOutcome::Transient(reason) => {
                    self.stats.record_failure(key, job.generation);
                    report.fails += 1;
                    tracing::warn!("- [{}/{}] {} - {}", index + 1, total, member.username, reason);
                }
                SendOutcome::Fatal(reason) => {
                    tracing::error!(
                        job_id = %job.id,
                        credential = %key.credential,
                        group = %group.name,
                        %reason,
                        "broadcast aborted"
                    );
                    report.outcome = JobOutcome::Aborted(reason);
                    break;
                }
            }

            // No pause after the final recipient.
            if index + 1 < total {
                tokio::select! {
                    _ = tokio::time::sleep(job.delay) => {}
                    _ = self.shutdown.cancelled() => {
                        tracing::warn!(
                            job_id = %job.id,
                            group = %group.name,
                            "broadcast interrupted by shutdown"
                        );
                        report.outcome = JobOutcome::Cancelled;
                        break;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use relay_common::Snowflake;

    use super::*;
    use crate::platform::memory::MemoryPlatform;
    use crate::platform::PlatformConnector;
    use crate::supervisor::credential::Credential;

    struct Fixture {
        platform: MemoryPlatform,
        client: Arc<dyn PlatformClient>,
        stats: Arc<StatsStore>,
        cancels: Arc<CancellationRegistry>,
        shutdown: CancellationToken,
        guild: Snowflake,
        members: Vec<Snowflake>,
    }

    impl Fixture {
        async fn new(member_count: usize) -> Self {
            let platform = MemoryPlatform::new();
            let guild = platform.add_group("Guild1");
            let members = (0..member_count)
                .map(|i| platform.add_member(guild, &format!("Member{i}"), false, &[]))
                .collect();
            let client = platform
                .authenticate(&Credential::new("token").unwrap())
                .await
                .unwrap();
            Self {
                platform,
                client,
                stats: Arc::new(StatsStore::new()),
                cancels: Arc::new(CancellationRegistry::new()),
                shutdown: CancellationToken::new(),
                guild,
                members,
            }
        }

        fn engine(&self, send_timeout: Duration) -> BroadcastEngine {
            BroadcastEngine::new(
                self.stats.clone(),
                self.cancels.clone(),
                send_timeout,
                self.shutdown.clone(),
            )
        }

        fn key(&self) -> JobKey {
            JobKey::new(Credential::new("token").unwrap(), self.guild)
        }

        fn job(&self, template: &str, delay: Duration) -> BroadcastJob {
            BroadcastJob {
                id: "job_test".to_string(),
                group_id: self.guild,
                message_template: template.to_string(),
                delay,
                include_bots: false,
                role_filter: HashSet::new(),
                generation: 0,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_and_counts_every_recipient() {
        let fx = Fixture::new(3).await;
        fx.platform
            .set_outcome(fx.members[1], SendOutcome::Denied("dms closed".to_string()));
        let key = fx.key();
        fx.cancels.arm(&key, 0);

        let report = fx
            .engine(Duration::from_secs(30))
            .execute(
                fx.client.as_ref(),
                &key,
                &fx.job("Hi {user} from {server}", Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!((report.total, report.success, report.fails), (3, 2, 1));

        let stats = fx.stats.get(&key);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.success + stats.fails, stats.total);
        assert!(stats.start_time.is_some());
        assert!(stats.end_time.is_some());
        assert_eq!(fx.cancels.outstanding(&key), 0);

        let texts: Vec<String> = fx.platform.deliveries().into_iter().map(|d| d.text).collect();
        assert_eq!(texts, vec!["Hi Member0 from Guild1", "Hi Member2 from Guild1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_halts_before_next_recipient() {
        let fx = Fixture::new(5).await;
        let key = fx.key();
        fx.cancels.arm(&key, 0);

        let engine = fx.engine(Duration::from_secs(30));
        let client = fx.client.clone();
        let job = fx.job("hello", Duration::from_secs(1));
        let run_key = key.clone();
        let handle =
            tokio::spawn(async move { engine.execute(client.as_ref(), &run_key, &job).await });

        // Sends happen at t=0 and t=1; the stop lands before the t=2 send.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(fx.cancels.request_stop(&key));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Cancelled);
        assert_eq!(fx.platform.attempts(), fx.members[..2].to_vec());

        let stats = fx.stats.get(&key);
        assert_eq!(stats.total, 5);
        assert!(stats.success + stats.fails < stats.total);
        assert!(stats.end_time.is_some());
        assert!(!fx.cancels.is_stop_requested(&key, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_send_aborts_the_job() {
        let fx = Fixture::new(4).await;
        fx.platform
            .set_outcome(fx.members[1], SendOutcome::Fatal("socket closed".to_string()));
        let key = fx.key();

        let report = fx
            .engine(Duration::from_secs(30))
            .execute(fx.client.as_ref(), &key, &fx.job("hi", Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(report.outcome, JobOutcome::Aborted("socket closed".to_string()));
        assert_eq!(fx.platform.attempts(), fx.members[..2].to_vec());
        let stats = fx.stats.get(&key);
        assert_eq!((stats.success, stats.fails), (1, 0));
        assert!(stats.end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_times_out_as_soft_failure() {
        let fx = Fixture::new(2).await;
        fx.platform.set_send_latency(Duration::from_secs(120));
        let key = fx.key();

        let report = fx
            .engine(Duration::from_secs(5))
            .execute(fx.client.as_ref(), &key, &fx.job("hi", Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!((report.success, report.fails), (0, 2));
    }

    #[tokio::test]
    async fn missing_group_leaves_stats_untouched_and_lowers_flag() {
        let fx = Fixture::new(1).await;
        let key = fx.key();
        fx.stats.init_zero(key.clone());
        fx.cancels.arm(&key, 0);
        fx.cancels.request_stop(&key);
        fx.platform.remove_group(fx.guild);

        let result = fx
            .engine(Duration::from_secs(30))
            .execute(fx.client.as_ref(), &key, &fx.job("hi", Duration::ZERO))
            .await;

        assert!(matches!(result, Err(SupervisorError::GroupNotFound(id)) if id == fx.guild));
        assert_eq!(fx.stats.get(&key), Default::default());
        assert!(!fx.cancels.is_stop_requested(&key, 0));
        assert!(fx.platform.attempts().is_empty());
    }

    #[tokio::test]
    async fn member_listing_failure_ends_job_with_end_time() {
        let fx = Fixture::new(2).await;
        fx.platform.fail_member_listing(fx.guild);
        let key = fx.key();

        let result = fx
            .engine(Duration::from_secs(30))
            .execute(fx.client.as_ref(), &key, &fx.job("hi", Duration::ZERO))
            .await;

        assert!(matches!(result, Err(SupervisorError::Platform(_))));
        assert!(fx.stats.get(&key).end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_pacing() {
        let fx = Fixture::new(3).await;
        let key = fx.key();
        let engine = fx.engine(Duration::from_secs(30));
        let client = fx.client.clone();
        let job = fx.job("hi", Duration::from_secs(3600));
        let run_key = key.clone();
        let handle =
            tokio::spawn(async move { engine.execute(client.as_ref(), &run_key, &job).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        fx.shutdown.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Cancelled);
        assert_eq!(fx.platform.attempts().len(), 1);
    }

    #[tokio::test]
    async fn group_lookup_failure_ends_job_with_end_time() {
        let fx = Fixture::new(2).await;
        let key = fx.key();
        fx.stats.reset_for_submit(&key, Utc::now());
        fx.platform.set_groups_unavailable(true);
        let mut job = fx.job("hi", Duration::ZERO);
        job.generation = 1;

        let result = fx
            .engine(Duration::from_secs(30))
            .execute(fx.client.as_ref(), &key, &job)
            .await;

        assert!(matches!(result, Err(SupervisorError::Platform(_))));
        let stats = fx.stats.get(&key);
        assert!(stats.end_time.is_some());
        assert!(!stats.in_flight());
        assert!(fx.platform.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_job_stops_writing_stats() {
        let fx = Fixture::new(4).await;
        let key = fx.key();
        let mut job = fx.job("hi", Duration::from_secs(1));
        job.generation = fx.stats.reset_for_submit(&key, Utc::now());
        fx.cancels.arm(&key, job.generation);

        let engine = fx.engine(Duration::from_secs(30));
        let client = fx.client.clone();
        let run_key = key.clone();
        let handle =
            tokio::spawn(async move { engine.execute(client.as_ref(), &run_key, &job).await });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let newer = fx.stats.reset_for_submit(&key, Utc::now());
        fx.cancels.arm(&key, newer);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!(report.success, 4);

        // The record still belongs to the queued job: zeroed and in flight.
        let stats = fx.stats.get(&key);
        assert_eq!((stats.total, stats.success, stats.fails), (0, 0, 0));
        assert!(stats.in_flight());
        assert!(!fx.cancels.is_stop_requested(&key, newer));
    }
}
