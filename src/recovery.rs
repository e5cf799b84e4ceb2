//! Rebuilds cache records from the artifact store after the cache lost them.
//!
//! Only durable evidence is used (marker, result files, stage-state file), and
//! records carry the evidence's own timestamp, so repeated scans converge on
//! the same cache contents.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::cache::{CacheWrite, EphemeralCache, set_if_newer};
use crate::clock::Clock;
use crate::lookup::Lookup;
use crate::state::{JobRecord, JobState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Fill in jobs the cache has no record for.
    #[default]
    Normal,
    /// Derive and report, write nothing.
    DryRun,
    /// Re-derive every job; newer cache records still win.
    Force,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub scanned: usize,
    pub recovered: usize,
    pub already_cached: usize,
    pub unresolved: usize,
    pub errors: usize,
    pub cancelled: bool,
}

impl fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {}, recovered {}, already cached {}, unresolved {}, errors {}",
            self.scanned, self.recovered, self.already_cached, self.unresolved, self.errors
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoverySource {
    SuccessMarker,
    ResultFiles,
    StateFile,
}

impl RecoverySource {
    fn as_str(&self) -> &'static str {
        match self {
            RecoverySource::SuccessMarker => "success_marker",
            RecoverySource::ResultFiles => "result_files",
            RecoverySource::StateFile => "state_file",
        }
    }
}

pub struct RecoveryScanner {
    store: ArtifactStore,
    cache: Arc<dyn EphemeralCache>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    mode: RecoveryMode,
    cancel: CancellationToken,
}

impl RecoveryScanner {
    pub fn new(
        store: ArtifactStore,
        cache: Arc<dyn EphemeralCache>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            ttl,
            mode: RecoveryMode::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_mode(mut self, mode: RecoveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn mode(&self) -> RecoveryMode {
        self.mode
    }

    /// Scans every job directory once. Checks for cancellation between jobs.
    pub fn run(&self) -> RecoveryStats {
        let mut stats = RecoveryStats::default();
        let job_ids = match self.store.job_ids() {
            Ok(ids) => ids,
            Err(e) => {
                error!(root = %self.store.results_root().display(), error = %e, "cannot list job directories");
                stats.errors += 1;
                return stats;
            }
        };
        info!(jobs = job_ids.len(), mode = ?self.mode, "starting state recovery scan");

        for job_id in &job_ids {
            if self.cancel.is_cancelled() {
                warn!(scanned = stats.scanned, "state recovery cancelled");
                stats.cancelled = true;
                break;
            }
            stats.scanned += 1;

            if self.mode == RecoveryMode::Normal {
                match self.cache.get(job_id) {
                    Lookup::Found(_) => {
                        stats.already_cached += 1;
                        continue;
                    }
                    Lookup::Unavailable => {
                        stats.errors += 1;
                        continue;
                    }
                    Lookup::Missing => {}
                }
            }

            match self.derive_record(job_id) {
                Lookup::Found(record) => match self.store_record(&record) {
                    CacheWrite::Stored => stats.recovered += 1,
                    CacheWrite::Skipped => stats.already_cached += 1,
                    CacheWrite::Unavailable => stats.errors += 1,
                },
                Lookup::Missing => {
                    debug!(job_id, "no usable evidence in job directory");
                    stats.unresolved += 1;
                }
                Lookup::Unavailable => stats.errors += 1,
            }
        }

        info!(%stats, "state recovery scan complete");
        stats
    }

    /// Derives and stores the state of one job, regardless of what the cache
    /// holds. Returns the derived state, or `None` without usable evidence.
    pub fn recover_one(&self, job_id: &str) -> Option<JobState> {
        let record = self.derive_record(job_id).found()?;
        if self.store_record(&record) == CacheWrite::Unavailable {
            warn!(job_id, "derived state could not be cached");
        }
        Some(record.state)
    }

    fn store_record(&self, record: &JobRecord) -> CacheWrite {
        match self.mode {
            RecoveryMode::DryRun => {
                info!(job_id = %record.job_id, state = %record.state, "would recover job state");
                CacheWrite::Stored
            }
            RecoveryMode::Normal | RecoveryMode::Force => {
                let outcome = set_if_newer(self.cache.as_ref(), record, self.ttl);
                if outcome == CacheWrite::Stored {
                    info!(job_id = %record.job_id, state = %record.state, "recovered job state");
                }
                outcome
            }
        }
    }

    /// Cache record implied by the job's durable artifacts.
    fn derive_record(&self, job_id: &str) -> Lookup<JobRecord> {
        let set = match self.store.inspect(job_id) {
            Lookup::Found(set) => set,
            Lookup::Missing => return Lookup::Missing,
            Lookup::Unavailable => return Lookup::Unavailable,
        };
        let stage_file = match self.store.read_stage_file(job_id) {
            Lookup::Found(file) => Some(file),
            Lookup::Missing => None,
            Lookup::Unavailable => return Lookup::Unavailable,
        };
        let file_state = stage_file.as_ref().map(|f| f.normalized());
        let file_time = stage_file.as_ref().map(|f| f.timestamp).filter(|t| *t > 0);

        let (state, stage, source, timestamp, mut metadata) = if let Some(marker_time) = set.marker {
            let time = file_time
                .filter(|_| matches!(file_state, Some((JobState::Success, _))))
                .unwrap_or(marker_time);
            (JobState::Success, None, RecoverySource::SuccessMarker, time, Map::new())
        } else if set.has_deliverables() {
            let time = file_time.unwrap_or_else(|| self.clock.unix_now());
            (JobState::Success, None, RecoverySource::ResultFiles, time, Map::new())
        } else if let (Some(file), Some((state, stage))) = (&stage_file, file_state) {
            let state = match state {
                JobState::Success | JobState::Failure | JobState::Revoked | JobState::Running => state,
                JobState::Pending | JobState::Expired | JobState::Interrupted => JobState::Running,
            };
            let time = file_time.unwrap_or_else(|| self.clock.unix_now());
            let mut metadata = file.metadata.clone();
            if state == JobState::Failure
                && let Some(message) = file.error_message()
            {
                metadata
                    .entry("error")
                    .or_insert_with(|| json!({ "message": message }));
            }
            if let Some(info) = &file.stage_info {
                metadata.insert("stage_info".into(), json!(info));
            }
            (state, stage, RecoverySource::StateFile, time, metadata)
        } else if set.tabular_result || set.structured_result {
            let time = self.clock.unix_now();
            (JobState::Success, None, RecoverySource::ResultFiles, time, Map::new())
        } else {
            return Lookup::Missing;
        };

        metadata.insert("recovery_source".into(), Value::from(source.as_str()));
        debug!(job_id, %state, source = source.as_str(), "derived state from artifacts");
        Lookup::Found(
            JobRecord::new(job_id, state, timestamp)
                .with_stage(stage)
                .with_metadata(metadata),
        )
    }
}
