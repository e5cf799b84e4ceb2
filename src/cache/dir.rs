use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::artifacts::{atomic_write, validate_job_id};
use crate::clock::Clock;
use crate::lookup::Lookup;
use crate::state::JobRecord;

use super::{CacheWrite, EphemeralCache, cutoff, purge_older_than};

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    expires_at: i64,
    record: JobRecord,
}

/// What a cache file holds. Reads never delete: another process may replace
/// the file between the read and the delete. Dead entries are swept by
/// `cleanup_older_than`.
enum Entry {
    Live(JobRecord),
    Expired,
    Undecodable,
}

/// Cache shared by every process on one host: one JSON file per job.
///
/// If the directory cannot be created the cache starts out unavailable, and
/// any IO failure later on reports unavailable for that call only.
pub struct DirCache {
    dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl DirCache {
    pub fn open(dir: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Self {
        let dir = dir.as_ref();
        match fs::create_dir_all(dir) {
            Ok(()) => Self {
                dir: Some(dir.to_path_buf()),
                clock,
            },
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "job state cache unavailable");
                Self { dir: None, clock }
            }
        }
    }

    fn path_for(&self, dir: &Path, job_id: &str) -> Option<PathBuf> {
        validate_job_id(job_id).ok()?;
        Some(dir.join(format!("{job_id}.json")))
    }

    fn read_entry(&self, path: &Path) -> io::Result<Option<Entry>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let entry = match serde_json::from_slice::<StoredRecord>(&bytes) {
            Ok(stored) if stored.expires_at <= self.clock.unix_now() => Entry::Expired,
            Ok(stored) => Entry::Live(stored.record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring undecodable cache entry");
                Entry::Undecodable
            }
        };
        Ok(Some(entry))
    }

    fn entry_paths(dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if is_record {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Deletes expired and undecodable entry files.
    fn sweep_dead_entries(&self, dir: &Path) -> io::Result<usize> {
        let mut swept = 0;
        for path in Self::entry_paths(dir)? {
            let dead = matches!(self.read_entry(&path), Ok(Some(Entry::Expired | Entry::Undecodable)));
            if !dead {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => swept += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if swept > 0 {
            debug!(dir = %dir.display(), swept, "swept dead cache entries");
        }
        Ok(swept)
    }
}

impl EphemeralCache for DirCache {
    fn get(&self, job_id: &str) -> Lookup<JobRecord> {
        let Some(dir) = &self.dir else {
            return Lookup::Unavailable;
        };
        let Some(path) = self.path_for(dir, job_id) else {
            return Lookup::Missing;
        };
        match self.read_entry(&path) {
            Ok(Some(Entry::Live(record))) => Lookup::Found(record),
            Ok(Some(Entry::Expired | Entry::Undecodable) | None) => Lookup::Missing,
            Err(e) => {
                warn!(job_id, error = %e, "cache read failed");
                Lookup::Unavailable
            }
        }
    }

    fn set(&self, record: &JobRecord, ttl: Duration) -> CacheWrite {
        let Some(dir) = &self.dir else {
            return CacheWrite::Unavailable;
        };
        let Some(path) = self.path_for(dir, &record.job_id) else {
            warn!(job_id = %record.job_id, "refusing to cache record for invalid job id");
            return CacheWrite::Unavailable;
        };
        let stored = StoredRecord {
            expires_at: self
                .clock
                .unix_now()
                .saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
            record: record.clone(),
        };
        let result = serde_json::to_vec(&stored)
            .map_err(io::Error::other)
            .and_then(|json| atomic_write(&path, &json));
        match result {
            Ok(()) => CacheWrite::Stored,
            Err(e) => {
                warn!(job_id = %record.job_id, error = %e, "cache write failed");
                CacheWrite::Unavailable
            }
        }
    }

    fn delete(&self, job_id: &str) -> Lookup<()> {
        let Some(dir) = &self.dir else {
            return Lookup::Unavailable;
        };
        let Some(path) = self.path_for(dir, job_id) else {
            return Lookup::Missing;
        };
        match fs::remove_file(&path) {
            Ok(()) => Lookup::Found(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Lookup::Missing,
            Err(e) => {
                warn!(job_id, error = %e, "cache delete failed");
                Lookup::Unavailable
            }
        }
    }

    fn records(&self) -> Lookup<Vec<JobRecord>> {
        let Some(dir) = &self.dir else {
            return Lookup::Unavailable;
        };
        let paths = match Self::entry_paths(dir) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cache listing failed");
                return Lookup::Unavailable;
            }
        };
        let mut records = Vec::new();
        for path in paths {
            match self.read_entry(&path) {
                Ok(Some(Entry::Live(record))) => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable cache entry"),
            }
        }
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Lookup::Found(records)
    }

    fn cleanup_older_than(&self, age: Duration) -> Lookup<usize> {
        let Some(dir) = &self.dir else {
            return Lookup::Unavailable;
        };
        let swept = match self.sweep_dead_entries(dir) {
            Ok(swept) => swept,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cache sweep failed");
                return Lookup::Unavailable;
            }
        };
        purge_older_than(self, cutoff(self.clock.as_ref(), age)).map(|purged| purged + swept)
    }
}
