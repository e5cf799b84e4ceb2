//! Fast, TTL-bounded job id → [`JobRecord`] store.
//!
//! The cache may forget anything at any time and may be unreachable; the
//! artifact store stays the source of truth for success and failure. Every
//! operation reports an explicit outcome instead of failing.

mod dir;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::lookup::Lookup;
use crate::state::{JobRecord, JobState};

pub use dir::DirCache;
pub use memory::MemoryCache;

/// Outcome of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Stored,
    /// Not written because the cache already holds a newer record.
    Skipped,
    Unavailable,
}

pub trait EphemeralCache: Send + Sync {
    fn get(&self, job_id: &str) -> Lookup<JobRecord>;

    fn set(&self, record: &JobRecord, ttl: Duration) -> CacheWrite;

    /// `Found(())` when a record was removed.
    fn delete(&self, job_id: &str) -> Lookup<()>;

    /// Every live record.
    fn records(&self) -> Lookup<Vec<JobRecord>>;

    /// Removes records whose timestamp is older than `age`; returns how many.
    fn cleanup_older_than(&self, age: Duration) -> Lookup<usize>;

    fn statistics(&self) -> Lookup<CacheStats> {
        self.records().map(|records| CacheStats::from_records(&records))
    }
}

/// Writes `record` unless the cache holds one with a newer timestamp.
///
/// The cache itself is a dumb key/value store, so every writer that can race
/// with the worker goes through this.
pub fn set_if_newer(cache: &dyn EphemeralCache, record: &JobRecord, ttl: Duration) -> CacheWrite {
    match cache.get(&record.job_id) {
        Lookup::Unavailable => CacheWrite::Unavailable,
        Lookup::Found(existing) if existing.timestamp > record.timestamp => {
            debug!(
                job_id = %record.job_id,
                cached = existing.timestamp,
                incoming = record.timestamp,
                "discarding stale cache write"
            );
            CacheWrite::Skipped
        }
        Lookup::Found(_) | Lookup::Missing => cache.set(record, ttl),
    }
}

/// Shared implementation of [`EphemeralCache::cleanup_older_than`].
fn purge_older_than(cache: &dyn EphemeralCache, cutoff: i64) -> Lookup<usize> {
    let records = match cache.records() {
        Lookup::Found(records) => records,
        Lookup::Missing => return Lookup::Found(0),
        Lookup::Unavailable => return Lookup::Unavailable,
    };
    let mut cleaned = 0;
    for record in records.iter().filter(|r| r.timestamp < cutoff) {
        match cache.delete(&record.job_id) {
            Lookup::Found(()) => cleaned += 1,
            Lookup::Missing => {}
            Lookup::Unavailable => return Lookup::Unavailable,
        }
    }
    Lookup::Found(cleaned)
}

fn cutoff(clock: &dyn Clock, age: Duration) -> i64 {
    clock.unix_now() - i64::try_from(age.as_secs()).unwrap_or(i64::MAX)
}

/// A cache that is switched off: every call is unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCache;

impl EphemeralCache for DisabledCache {
    fn get(&self, _job_id: &str) -> Lookup<JobRecord> {
        Lookup::Unavailable
    }

    fn set(&self, _record: &JobRecord, _ttl: Duration) -> CacheWrite {
        CacheWrite::Unavailable
    }

    fn delete(&self, _job_id: &str) -> Lookup<()> {
        Lookup::Unavailable
    }

    fn records(&self) -> Lookup<Vec<JobRecord>> {
        Lookup::Unavailable
    }

    fn cleanup_older_than(&self, _age: Duration) -> Lookup<usize> {
        Lookup::Unavailable
    }
}

/// Builds the cache described by the configuration.
pub fn from_config(config: &CacheConfig, clock: Arc<dyn Clock>) -> Arc<dyn EphemeralCache> {
    if config.enabled {
        Arc::new(DirCache::open(&config.dir, clock))
    } else {
        tracing::info!("job state cache is disabled by configuration");
        Arc::new(DisabledCache)
    }
}

/// Aggregate view of the cached records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
}

impl CacheStats {
    pub fn from_records(records: &[JobRecord]) -> Self {
        let mut stats = CacheStats {
            total: records.len(),
            ..Default::default()
        };
        for record in records {
            *stats.by_state.entry(record.state.to_string()).or_default() += 1;
            *stats.by_type.entry(record.task_type().to_string()).or_default() += 1;
            match record.state {
                JobState::Pending | JobState::Running => stats.active_tasks += 1,
                JobState::Success => stats.completed_tasks += 1,
                JobState::Failure => stats.failed_tasks += 1,
                JobState::Expired | JobState::Revoked | JobState::Interrupted => {}
            }
        }
        stats
    }
}
