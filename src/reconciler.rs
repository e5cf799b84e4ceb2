//! Merges every evidence tier into one authoritative job state.
//!
//! Tiers are consulted in a fixed trust order and the first one with an
//! answer wins:
//!
//! 1. durable override: success marker, or bundle plus structured result
//! 2. cache record in a terminal state
//! 3. cache record in progress
//! 4. stage-state file
//! 5. heuristic reconstruction (queue says pending but directories exist)
//! 6. the raw queue state, flagged unreliable
//!
//! Whenever a tier claims success but the deliverables are gone, the expiry
//! policy decides between "still finishing" and `expired`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::artifacts::{ArtifactSet, ArtifactStore, StageFile};
use crate::cache::{EphemeralCache, set_if_newer};
use crate::clock::Clock;
use crate::config::{Config, ModerateEvidencePolicy};
use crate::lookup::Lookup;
use crate::queue::QueueReport;
use crate::state::{
    EvidenceSource, JobRecord, JobState, Resolution, Stage, StateEvidence,
};

pub const EXPIRED_MESSAGE: &str =
    "Results for this job are no longer available. They may have been cleaned up after expiring.";
pub const INTERRUPTED_MESSAGE: &str = "Job was interrupted and left in an invalid state";
pub const GENERIC_FAILURE_MESSAGE: &str = "The job failed without reporting an error message.";
pub const PARTIAL_ARTIFACTS_MESSAGE: &str =
    "Job appears to have completed but packaging may have been interrupted";
pub const RECONSTRUCTED_MESSAGE: &str = "Reconstructed from result artifacts after interruption";

/// Tunables of the reconciliation policy.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Recency window when a stage-state file supplies the timestamp.
    pub rich_recency_window: Duration,
    /// Recency window when only a cache record, marker or queue payload does.
    pub simple_recency_window: Duration,
    pub moderate_evidence: ModerateEvidencePolicy,
    pub backfill_cache: bool,
    pub cache_ttl: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            rich_recency_window: Duration::from_secs(180),
            simple_recency_window: Duration::from_secs(60),
            moderate_evidence: ModerateEvidencePolicy::Success,
            backfill_cache: true,
            cache_ttl: Duration::from_secs(7 * 86_400),
        }
    }
}

impl ReconcilePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rich_recency_window: Duration::from_secs(config.reconcile.rich_recency_window_secs),
            simple_recency_window: Duration::from_secs(config.reconcile.simple_recency_window_secs),
            moderate_evidence: config.reconcile.moderate_evidence,
            backfill_cache: config.reconcile.backfill_cache,
            cache_ttl: config.cache.ttl(),
        }
    }
}

/// Everything read once per `resolve` call.
struct Snapshot<'a> {
    job_id: &'a str,
    now: i64,
    artifacts: Lookup<ArtifactSet>,
    stage_file: Option<StageFile>,
    queue: &'a QueueReport,
}

pub struct StateReconciler {
    store: ArtifactStore,
    cache: Arc<dyn EphemeralCache>,
    clock: Arc<dyn Clock>,
    policy: ReconcilePolicy,
}

impl StateReconciler {
    pub fn new(
        store: ArtifactStore,
        cache: Arc<dyn EphemeralCache>,
        clock: Arc<dyn Clock>,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Determines the job's authoritative state.
    ///
    /// Never fails: unavailable tiers are skipped, and the queue's own answer
    /// is the last resort.
    pub fn resolve(&self, job_id: &str, queue: impl Into<QueueReport>) -> Resolution {
        let queue = queue.into();
        let snapshot = Snapshot {
            job_id,
            now: self.clock.unix_now(),
            artifacts: self.store.inspect(job_id),
            stage_file: self.store.read_stage_file(job_id).found(),
            queue: &queue,
        };

        let resolution = self
            .durable_override(&snapshot)
            .or_else(|| self.from_cache(&snapshot))
            .or_else(|| self.from_stage_file(&snapshot))
            .or_else(|| self.reconstruct(&snapshot))
            .unwrap_or_else(|| self.from_queue(&snapshot));
        let resolution = finalize(resolution);
        let resolution = match resolution.state {
            JobState::Success | JobState::Expired => {
                resolution.with_expiry(queue.expires_on(), queue.expires_in())
            }
            _ => resolution,
        };

        info!(
            job_id,
            queue_state = %queue.state,
            state = %resolution.state,
            source = ?resolution.evidence.source,
            reliable = resolution.evidence.reliable,
            "resolved job state"
        );
        resolution
    }

    fn durable_override(&self, snap: &Snapshot<'_>) -> Option<Resolution> {
        let set = snap.artifacts.as_found()?;
        let completed_at = snap
            .stage_file
            .as_ref()
            .filter(|f| f.normalized().0 == JobState::Success)
            .map(|f| f.timestamp);

        let (source, timestamp) = match set.marker {
            Some(marker_time) => (EvidenceSource::ArtifactMarker, completed_at.unwrap_or(marker_time)),
            None if set.has_deliverables() => (EvidenceSource::ArtifactFiles, completed_at.unwrap_or(0)),
            None => return None,
        };
        let evidence = StateEvidence::new(JobState::Success, source, true, timestamp)
            .with_artifacts(set.summary());
        let resolution = Resolution::from_evidence(evidence);

        // The marker is the commit point: a missing bundle right after it is
        // flush lag, and long after it is cleanup.
        if !set.has_deliverables()
            && (past_announced_expiry(snap) || !self.still_finishing(snap, set, Some(timestamp), false))
        {
            debug!(job_id = snap.job_id, "success marker present but results are gone");
            return Some(resolution.with_state(JobState::Expired).with_message(EXPIRED_MESSAGE));
        }

        if self.policy.backfill_cache {
            self.backfill(snap.job_id, timestamp);
        }
        Some(resolution)
    }

    fn backfill(&self, job_id: &str, timestamp: i64) {
        match self.cache.get(job_id) {
            Lookup::Found(record) if record.state == JobState::Success => {}
            Lookup::Unavailable => {}
            Lookup::Found(_) | Lookup::Missing => {
                let record = JobRecord::new(job_id, JobState::Success, timestamp);
                let outcome = set_if_newer(self.cache.as_ref(), &record, self.policy.cache_ttl);
                debug!(job_id, ?outcome, "backfilled cache from durable evidence");
            }
        }
    }

    fn from_cache(&self, snap: &Snapshot<'_>) -> Option<Resolution> {
        let record = match self.cache.get(snap.job_id) {
            Lookup::Found(record) => record,
            Lookup::Missing => return None,
            Lookup::Unavailable => {
                debug!(job_id = snap.job_id, "cache unavailable, skipping cache tiers");
                return None;
            }
        };
        let evidence = StateEvidence::new(record.state, EvidenceSource::Cache, true, record.timestamp)
            .with_metadata(record.metadata.clone());

        match record.state {
            JobState::Success => Some(self.claimed_success(
                snap,
                Resolution::from_evidence(evidence),
                Some(record.timestamp),
            )),
            JobState::Failure => {
                let message = crate::state::error_message_from(&record.metadata);
                let resolution = Resolution::from_evidence(evidence);
                Some(match message {
                    Some(message) => resolution.with_error_message(message),
                    None => resolution,
                })
            }
            JobState::Running => {
                // A terminal stage-state file at least as new as the record
                // means the cache missed the worker's last write.
                let superseded = snap.stage_file.as_ref().is_some_and(|file| {
                    file.normalized().0.is_terminal() && file.timestamp >= record.timestamp
                });
                if superseded {
                    debug!(job_id = snap.job_id, "ignoring stale running record in cache");
                    return None;
                }
                let evidence = evidence.with_stage(record.stage, record.stage_info());
                Some(Resolution::from_evidence(evidence))
            }
            JobState::Pending
            | JobState::Expired
            | JobState::Revoked
            | JobState::Interrupted => None,
        }
    }

    fn from_stage_file(&self, snap: &Snapshot<'_>) -> Option<Resolution> {
        let file = snap.stage_file.as_ref()?;
        let (state, stage) = file.normalized();
        let stage_info = file
            .stage_info
            .clone()
            .or_else(|| file.stage.clone().filter(|_| stage.is_none()));
        let evidence = StateEvidence::new(state, EvidenceSource::ArtifactStateFile, true, file.timestamp)
            .with_stage(stage, stage_info)
            .with_metadata(file.to_metadata());
        let resolution = Resolution::from_evidence(evidence);

        Some(match state {
            JobState::Success => self.claimed_success(snap, resolution, None),
            JobState::Failure => match file.error_message() {
                Some(message) => resolution.with_error_message(message),
                None => resolution,
            },
            JobState::Revoked | JobState::Running => resolution,
            // The file only exists once a worker picked the job up.
            JobState::Pending | JobState::Expired | JobState::Interrupted => {
                resolution.with_state(JobState::Running)
            }
        })
    }

    fn reconstruct(&self, snap: &Snapshot<'_>) -> Option<Resolution> {
        if !snap.queue.state.is_pending() {
            return None;
        }
        let set = snap.artifacts.as_found()?;
        if !set.any_directory() {
            return None;
        }
        debug!(job_id = snap.job_id, artifacts = ?set.summary(), "queue reports pending but job directories exist");

        let evidence = |state| {
            StateEvidence::new(state, EvidenceSource::Heuristic, true, 0).with_artifacts(set.summary())
        };

        if set.has_strong_evidence() {
            return Some(Resolution::from_evidence(evidence(JobState::Success)));
        }
        if set.has_moderate_evidence() {
            return Some(match self.policy.moderate_evidence {
                ModerateEvidencePolicy::Success => {
                    Resolution::from_evidence(evidence(JobState::Success)).with_message(PARTIAL_ARTIFACTS_MESSAGE)
                }
                ModerateEvidencePolicy::Running => Resolution::from_evidence(
                    evidence(JobState::Running).with_stage(Some(Stage::Packaging), None),
                )
                .with_message(PARTIAL_ARTIFACTS_MESSAGE),
            });
        }
        if set.has_weak_evidence() {
            let resolution = Resolution::from_evidence(evidence(JobState::Interrupted));
            // Results may have landed since the snapshot was taken.
            let recovered = self
                .store
                .inspect(snap.job_id)
                .found()
                .is_some_and(|now| now.has_strong_evidence());
            return Some(if recovered {
                info!(job_id = snap.job_id, "interrupted job has complete results");
                resolution.with_state(JobState::Success).with_message(RECONSTRUCTED_MESSAGE)
            } else {
                info!(job_id = snap.job_id, "interrupted job left no usable results");
                resolution
                    .with_state(JobState::Failure)
                    .with_error_message(INTERRUPTED_MESSAGE)
            });
        }
        None
    }

    fn from_queue(&self, snap: &Snapshot<'_>) -> Resolution {
        let queue = snap.queue;
        let state = queue.state.job_state();
        let evidence = StateEvidence::new(state, EvidenceSource::Queue, false, queue.created_on().unwrap_or(0))
            .with_metadata(queue.payload().unwrap_or_default());
        let resolution = Resolution::from_evidence(evidence);

        match state {
            JobState::Success => self.claimed_success(snap, resolution, queue.created_on()),
            JobState::Failure => match queue.error_message() {
                Some(message) => resolution.with_error_message(message),
                None => resolution,
            },
            _ => resolution,
        }
    }

    /// A non-marker tier says success: check the deliverables are still there.
    fn claimed_success(&self, snap: &Snapshot<'_>, resolution: Resolution, claim_time: Option<i64>) -> Resolution {
        let set = match &snap.artifacts {
            Lookup::Found(set) => set,
            // Cannot see the disk: nothing contradicts the claim.
            Lookup::Missing | Lookup::Unavailable => return resolution,
        };
        if set.has_deliverables() {
            return resolution;
        }
        if past_announced_expiry(snap) {
            debug!(job_id = snap.job_id, "result folder is past its announced expiry");
            return resolution.with_state(JobState::Expired).with_message(EXPIRED_MESSAGE);
        }
        if self.still_finishing(snap, set, claim_time, true) {
            let stage = snap.stage_file.as_ref().and_then(|f| f.normalized().1);
            return resolution.running(stage);
        }
        resolution.with_state(JobState::Expired).with_message(EXPIRED_MESSAGE)
    }

    /// Whether missing deliverables are explained by a job still finishing.
    fn still_finishing(
        &self,
        snap: &Snapshot<'_>,
        set: &ArtifactSet,
        claim_time: Option<i64>,
        consider_partial_writes: bool,
    ) -> bool {
        let within = |timestamp: i64, window: Duration| {
            let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
            timestamp > 0 && snap.now.saturating_sub(timestamp) <= window
        };

        let packaging = snap.stage_file.as_ref().is_some_and(StageFile::is_packaging);
        let recent_stage_file = snap
            .stage_file
            .as_ref()
            .is_some_and(|f| within(f.timestamp, self.policy.rich_recency_window));
        let recent_claim = claim_time.is_some_and(|t| within(t, self.policy.simple_recency_window));
        let partial_write = consider_partial_writes && set.write_in_progress();

        packaging || recent_stage_file || recent_claim || partial_write
    }
}

/// The queue payload announced when the result folder would be removed, and
/// that moment has passed.
fn past_announced_expiry(snap: &Snapshot<'_>) -> bool {
    snap.queue.expires_on().is_some_and(|t| snap.now > t)
}

/// Surface-level guarantees: failures carry a message, and `interrupted`
/// never leaves the reconciler.
fn finalize(mut resolution: Resolution) -> Resolution {
    if resolution.state == JobState::Interrupted {
        resolution.state = JobState::Failure;
        resolution.error_message = Some(INTERRUPTED_MESSAGE.to_string());
    }
    if resolution.state == JobState::Failure
        && resolution
            .error_message
            .as_deref()
            .is_none_or(|m| m.trim().is_empty())
    {
        resolution.error_message = Some(GENERIC_FAILURE_MESSAGE.to_string());
    }
    resolution
}
