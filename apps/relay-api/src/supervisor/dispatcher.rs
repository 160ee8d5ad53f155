//! Background loop moving queued jobs from sessions into execution lanes.
//!
//! Every tick the dispatcher drains each session's queue without blocking and
//! hands the jobs to per-key lanes. A lane is a task that runs the jobs of one
//! (credential, group) key strictly one after another, so the send loops of
//! one key never overlap while different keys run concurrently. A lane exits
//! once its queue is empty.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::engine::BroadcastEngine;
use super::error::SupervisorError;
use super::job::{BroadcastJob, JobKey};
use super::registry::SessionRegistry;
use crate::platform::PlatformClient;

struct LaneJob {
    client: Arc<dyn PlatformClient>,
    job: BroadcastJob,
}

type Lanes = Arc<Mutex<HashMap<JobKey, mpsc::UnboundedSender<LaneJob>>>>;

pub struct JobDispatcher {
    registry: Arc<SessionRegistry>,
    engine: Arc<BroadcastEngine>,
    lanes: Lanes,
    tracker: TaskTracker,
    interval: Duration,
    shutdown: CancellationToken,
}

impl JobDispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        engine: Arc<BroadcastEngine>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            engine,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            interval,
            shutdown,
        }
    }

    /// Spawn the dispatch loop. It runs until the shutdown token is cancelled.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.run().await })
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "job dispatcher started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.dispatch_pending();
                }
            }
        }

        tracing::info!("job dispatcher stopped");
    }

    /// Drain every session's queue once. Returns the number of jobs handed
    /// to lanes.
    pub fn dispatch_pending(&self) -> usize {
        let mut dispatched = 0;
        for session in self.registry.sessions() {
            let jobs = session.drain();
            if jobs.is_empty() {
                continue;
            }

            let Some(client) = session.client() else {
                // Submission requires a ready session, so this only happens
                // if the queue was fed directly.
                for job in jobs {
                    tracing::error!(
                        job_id = %job.id,
                        credential = %session.credential(),
                        "dropping job for a session without a client"
                    );
                    self.engine
                        .discard(&JobKey::new(session.credential().clone(), job.group_id));
                }
                continue;
            };

            for job in jobs {
                let key = JobKey::new(session.credential().clone(), job.group_id);
                self.dispatch(key, LaneJob {
                    client: Arc::clone(&client),
                    job,
                });
                dispatched += 1;
            }
        }
        dispatched
    }

    fn dispatch(&self, key: JobKey, lane_job: LaneJob) {
        let mut lanes = self.lanes.lock();

        let lane_job = match lanes.get(&key) {
            Some(tx) => match tx.send(lane_job) {
                Ok(()) => return,
                // The lane task died; open a fresh one below.
                Err(mpsc::error::SendError(returned)) => returned,
            },
            None => lane_job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(lane_job);
        lanes.insert(key.clone(), tx);

        self.tracker.spawn(run_lane(
            key,
            rx,
            Arc::clone(&self.lanes),
            Arc::clone(&self.engine),
        ));
    }

    /// Number of keys with a queued or running job.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Wait up to `grace` for running jobs to finish. Returns `false` on timeout.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        self.tracker.close();
        let idle = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        idle
    }
}

async fn run_lane(
    key: JobKey,
    mut rx: mpsc::UnboundedReceiver<LaneJob>,
    lanes: Lanes,
    engine: Arc<BroadcastEngine>,
) {
    loop {
        let next = match rx.try_recv() {
            Ok(next) => next,
            Err(_) => {
                // Re-check under the lanes lock so no job is sent to a lane
                // that is about to exit.
                let mut map = lanes.lock();
                match rx.try_recv() {
                    Ok(next) => next,
                    Err(_) => {
                        map.remove(&key);
                        return;
                    }
                }
            }
        };

        match engine.execute(next.client.as_ref(), &key, &next.job).await {
            Ok(_) => {}
            Err(SupervisorError::GroupNotFound(group_id)) => {
                tracing::error!(
                    job_id = %next.job.id,
                    %group_id,
                    "broadcast target group not found"
                );
            }
            Err(e) => {
                tracing::error!(
                    job_id = %next.job.id,
                    credential = %key.credential,
                    error = %e,
                    "broadcast failed"
                );
            }
        }
    }
}
