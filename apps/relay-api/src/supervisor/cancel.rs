//! Cooperative stop signals keyed by (credential, group).

use std::collections::HashMap;

use parking_lot::Mutex;

use super::job::JobKey;

#[derive(Debug, Default, Clone, Copy)]
struct CancelFlag {
    /// Jobs armed at or below this generation are stopped.
    stopped_through: Option<u64>,
    /// Highest generation armed for this key.
    latest: u64,
    /// Jobs accepted for this key that have not finished yet (queued or running).
    outstanding: usize,
}

/// Shared cancel-flag map, polled by the engine once per recipient.
///
/// A stop reaches every job of the key that is queued or running when it
/// arrives; jobs accepted afterwards start with a lowered flag.
#[derive(Default)]
pub struct CancellationRegistry {
    inner: Mutex<HashMap<JobKey, CancelFlag>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a lowered flag exists for `key`.
    pub fn init(&self, key: JobKey) {
        self.inner.lock().entry(key).or_default();
    }

    /// Register an accepted job of `generation` and count it as outstanding.
    pub fn arm(&self, key: &JobKey, generation: u64) {
        let mut map = self.inner.lock();
        let flag = map.entry(key.clone()).or_default();
        flag.latest = flag.latest.max(generation);
        flag.outstanding += 1;
    }

    /// Stop every job queued or running for `key`.
    ///
    /// Returns whether a job was signalled. With nothing outstanding the
    /// request is a no-op.
    pub fn request_stop(&self, key: &JobKey) -> bool {
        let mut map = self.inner.lock();
        match map.get_mut(key) {
            Some(flag) if flag.outstanding > 0 => {
                flag.stopped_through = Some(flag.latest);
                true
            }
            _ => false,
        }
    }

    pub fn is_stop_requested(&self, key: &JobKey, generation: u64) -> bool {
        self.inner
            .lock()
            .get(key)
            .and_then(|f| f.stopped_through)
            .is_some_and(|through| generation <= through)
    }

    /// Called once per job when it exits by any path. The flag is lowered
    /// once no job of the key is left.
    pub fn finish(&self, key: &JobKey) {
        let mut map = self.inner.lock();
        let flag = map.entry(key.clone()).or_default();
        flag.outstanding = flag.outstanding.saturating_sub(1);
        if flag.outstanding == 0 {
            flag.stopped_through = None;
        }
    }

    pub fn outstanding(&self, key: &JobKey) -> usize {
        self.inner.lock().get(key).map_or(0, |f| f.outstanding)
    }
}
