//! Live per-(credential, group) broadcast counters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use utoipa::ToSchema;

use super::job::JobKey;

/// Progress counters of the latest broadcast for one group.
///
/// `start_time` set with `end_time` unset means a job is in flight (or
/// queued); both set means the record is at rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct JobStats {
    pub total: u64,
    pub success: u64,
    pub fails: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl JobStats {
    pub fn attempted(&self) -> u64 {
        self.success + self.fails
    }

    pub fn in_flight(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_none()
    }
}

/// Stats record plus the generation of the job allowed to write it.
#[derive(Default)]
struct Record {
    generation: u64,
    stats: JobStats,
}

/// Shared stats map. One lock for the whole map; every operation is a short
/// critical section so observers can read while jobs write.
///
/// Each submission bumps the key's generation. Writes carry the generation
/// of the job making them and are dropped once a newer job owns the record.
#[derive(Default)]
pub struct StatsStore {
    inner: Mutex<HashMap<JobKey, Record>>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a zeroed record. The generation is kept.
    pub fn init_zero(&self, key: JobKey) {
        self.inner.lock().entry(key).or_default().stats = JobStats::default();
    }

    /// Reset performed when a job is accepted, before it is queued. Returns
    /// the generation the new job writes under.
    pub fn reset_for_submit(&self, key: &JobKey, now: DateTime<Utc>) -> u64 {
        let mut map = self.inner.lock();
        let record = map.entry(key.clone()).or_default();
        record.generation += 1;
        record.stats = started(now);
        record.generation
    }

    /// Reset performed when the engine starts executing a job.
    pub fn reset_for_start(&self, key: &JobKey, generation: u64, now: DateTime<Utc>) -> bool {
        self.update(key, generation, |stats| *stats = started(now))
    }

    pub fn set_total(&self, key: &JobKey, generation: u64, total: u64) -> bool {
        self.update(key, generation, |stats| stats.total = total)
    }

    pub fn record_success(&self, key: &JobKey, generation: u64) -> bool {
        self.update(key, generation, |stats| stats.success += 1)
    }

    pub fn record_failure(&self, key: &JobKey, generation: u64) -> bool {
        self.update(key, generation, |stats| stats.fails += 1)
    }

    pub fn finish(&self, key: &JobKey, generation: u64, now: DateTime<Utc>) -> bool {
        self.update(key, generation, |stats| stats.end_time = Some(now))
    }

    /// Snapshot for `key`; zero-valued if no job ever ran.
    pub fn get(&self, key: &JobKey) -> JobStats {
        self.inner
            .lock()
            .get(key)
            .map(|r| r.stats.clone())
            .unwrap_or_default()
    }

    /// Apply `f` if `generation` still owns the record. Returns whether it did.
    fn update(&self, key: &JobKey, generation: u64, f: impl FnOnce(&mut JobStats)) -> bool {
        let mut map = self.inner.lock();
        let record = map.entry(key.clone()).or_default();
        if record.generation != generation {
            return false;
        }
        f(&mut record.stats);
        true
    }
}

fn started(now: DateTime<Utc>) -> JobStats {
    JobStats {
        start_time: Some(now),
        ..JobStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::credential::Credential;
    use relay_common::Snowflake;

    fn key(group: u64) -> JobKey {
        JobKey::new(Credential::new("token").unwrap(), Snowflake(group))
    }

    #[test]
    fn unknown_key_reads_as_zero() {
        let store = StatsStore::new();
        assert_eq!(store.get(&key(1)), JobStats::default());
    }

    #[test]
    fn reset_zeroes_counters_and_clears_end_time() {
        let store = StatsStore::new();
        let k = key(1);
        let t0 = Utc::now();
        let generation = store.reset_for_submit(&k, t0);
        store.reset_for_start(&k, generation, t0);
        store.set_total(&k, generation, 3);
        store.record_success(&k, generation);
        store.record_failure(&k, generation);
        store.finish(&k, generation, t0);
        assert!(!store.get(&k).in_flight());

        let t1 = Utc::now();
        store.reset_for_submit(&k, t1);
        let stats = store.get(&k);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.attempted(), 0);
        assert_eq!(stats.start_time, Some(t1));
        assert!(stats.end_time.is_none());
        assert!(stats.in_flight());
    }

    #[test]
    fn superseded_generation_cannot_write() {
        let store = StatsStore::new();
        let k = key(1);
        let old = store.reset_for_submit(&k, Utc::now());
        store.set_total(&k, old, 5);
        store.record_success(&k, old);

        let new = store.reset_for_submit(&k, Utc::now());
        assert!(new > old);
        assert!(!store.record_success(&k, old));
        assert!(!store.record_failure(&k, old));
        assert!(!store.set_total(&k, old, 5));
        assert!(!store.finish(&k, old, Utc::now()));

        let stats = store.get(&k);
        assert_eq!((stats.total, stats.success, stats.fails), (0, 0, 0));
        assert!(stats.in_flight());

        assert!(store.record_success(&k, new));
        assert_eq!(store.get(&k).success, 1);
    }

    #[test]
    fn init_zero_keeps_the_generation() {
        let store = StatsStore::new();
        let k = key(1);
        let generation = store.reset_for_submit(&k, Utc::now());
        store.init_zero(k.clone());

        assert!(store.record_success(&k, generation));
        assert!(!store.record_success(&k, 0));
    }

    #[test]
    fn keys_are_independent() {
        let store = StatsStore::new();
        store.record_success(&key(1), 0);
        store.record_success(&key(1), 0);
        store.record_failure(&key(2), 0);

        assert_eq!(store.get(&key(1)).success, 2);
        assert_eq!(store.get(&key(2)).fails, 1);
        assert_eq!(store.get(&key(2)).success, 0);
    }

    #[test]
    fn serializes_timestamps_as_rfc3339() {
        let store = StatsStore::new();
        let k = key(1);
        store.init_zero(k.clone());
        let json = serde_json::to_value(store.get(&k)).unwrap();
        assert_eq!(json["total"], 0);
        assert!(json["start_time"].is_null());

        store.reset_for_start(&k, 0, Utc::now());
        let json = serde_json::to_value(store.get(&k)).unwrap();
        assert!(json["start_time"].as_str().unwrap().contains('T'));
    }
}
