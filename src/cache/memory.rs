use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::Clock;
use crate::lookup::Lookup;
use crate::state::JobRecord;

use super::{CacheWrite, EphemeralCache, cutoff, purge_older_than};

struct Entry {
    record: JobRecord,
    expires_at: i64,
}

/// In-process cache. Can be switched unavailable to simulate an outage.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            clock,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drops every record, as a restarted cache server would.
    pub fn flush(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EphemeralCache for MemoryCache {
    fn get(&self, job_id: &str) -> Lookup<JobRecord> {
        if !self.is_available() {
            return Lookup::Unavailable;
        }
        let now = self.clock.unix_now();
        let mut entries = self.lock();
        let expired = match entries.get(job_id) {
            Some(entry) if entry.expires_at > now => return Lookup::Found(entry.record.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(job_id);
        }
        Lookup::Missing
    }

    fn set(&self, record: &JobRecord, ttl: Duration) -> CacheWrite {
        if !self.is_available() {
            return CacheWrite::Unavailable;
        }
        let expires_at = self
            .clock
            .unix_now()
            .saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
        self.lock().insert(
            record.job_id.clone(),
            Entry {
                record: record.clone(),
                expires_at,
            },
        );
        CacheWrite::Stored
    }

    fn delete(&self, job_id: &str) -> Lookup<()> {
        if !self.is_available() {
            return Lookup::Unavailable;
        }
        match self.lock().remove(job_id) {
            Some(_) => Lookup::Found(()),
            None => Lookup::Missing,
        }
    }

    fn records(&self) -> Lookup<Vec<JobRecord>> {
        if !self.is_available() {
            return Lookup::Unavailable;
        }
        let now = self.clock.unix_now();
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        let mut records: Vec<JobRecord> = entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Lookup::Found(records)
    }

    fn cleanup_older_than(&self, age: Duration) -> Lookup<usize> {
        purge_older_than(self, cutoff(self.clock.as_ref(), age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::state::JobState;

    fn setup() -> (Arc<ManualClock>, MemoryCache) {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let cache = MemoryCache::new(clock.clone());
        (clock, cache)
    }

    #[test]
    fn get_set_delete() {
        let (_, cache) = setup();
        assert_eq!(cache.get("j1"), Lookup::Missing);

        let record = JobRecord::new("j1", JobState::Running, 1_000);
        assert_eq!(cache.set(&record, Duration::from_secs(60)), CacheWrite::Stored);
        assert_eq!(cache.get("j1"), Lookup::Found(record));

        assert_eq!(cache.delete("j1"), Lookup::Found(()));
        assert_eq!(cache.delete("j1"), Lookup::Missing);
    }

    #[test]
    fn records_expire_after_ttl() {
        let (clock, cache) = setup();
        cache.set(&JobRecord::new("j1", JobState::Success, 1_000), Duration::from_secs(60));
        clock.advance(chrono::Duration::seconds(59));
        assert!(cache.get("j1").found().is_some());
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(cache.get("j1"), Lookup::Missing);
        assert!(cache.is_empty());
    }

    #[test]
    fn outage_reports_unavailable_not_missing() {
        let (_, cache) = setup();
        cache.set(&JobRecord::new("j1", JobState::Success, 1_000), Duration::from_secs(60));
        cache.set_available(false);
        assert_eq!(cache.get("j1"), Lookup::Unavailable);
        assert_eq!(
            cache.set(&JobRecord::new("j2", JobState::Running, 1_000), Duration::from_secs(60)),
            CacheWrite::Unavailable
        );
        assert_eq!(cache.records(), Lookup::Unavailable);

        cache.set_available(true);
        assert!(cache.get("j1").found().is_some());
        assert_eq!(cache.get("j2"), Lookup::Missing);
    }

    #[test]
    fn cleanup_removes_old_records_only() {
        let (_, cache) = setup();
        let ttl = Duration::from_secs(86_400);
        cache.set(&JobRecord::new("old", JobState::Success, 100), ttl);
        cache.set(&JobRecord::new("new", JobState::Running, 990), ttl);

        assert_eq!(cache.cleanup_older_than(Duration::from_secs(60)), Lookup::Found(1));
        assert_eq!(cache.get("old"), Lookup::Missing);
        assert!(cache.get("new").found().is_some());
    }

    #[test]
    fn flush_forgets_everything() {
        let (_, cache) = setup();
        cache.set(&JobRecord::new("j1", JobState::Success, 1_000), Duration::from_secs(60));
        cache.flush();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.statistics().found().unwrap().total, 0);
    }
}
