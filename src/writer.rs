//! Worker-side recording of stage transitions.
//!
//! The stage-state file is always written first and is the only write whose
//! failure is reported; the cache mirror is best effort. On success the marker
//! is the last durable write: a crash before it leaves no success signal.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::artifacts::{ArtifactStore, StageFile, validate_job_id};
use crate::cache::{CacheWrite, EphemeralCache};
use crate::clock::Clock;
use crate::error::Result;
use crate::state::{FailureInfo, JobRecord, JobState, Stage};

pub struct StateWriter {
    store: ArtifactStore,
    cache: Arc<dyn EphemeralCache>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl StateWriter {
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
        }
    }

    /// Records that the job entered `stage`. Safe to repeat; last write wins.
    ///
    /// A `stage_info` string in `metadata` replaces the stage's default
    /// description.
    pub fn write_stage(&self, job_id: &str, stage: Stage, metadata: Map<String, Value>) -> Result<()> {
        validate_job_id(job_id)?;
        let now = self.clock.unix_now();
        let stage_info = metadata
            .get("stage_info")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| stage.default_info().to_string());

        let file = StageFile {
            job_id: Some(job_id.to_string()),
            state: JobState::Running.to_string(),
            stage: Some(stage.to_string()),
            stage_info: Some(stage_info.clone()),
            timestamp: now,
            pid: Some(std::process::id()),
            metadata: metadata.clone(),
            extra: Map::new(),
        };
        self.store.write_stage_file(job_id, &file)?;

        let mut cached = metadata;
        cached.insert("stage".into(), json!(stage));
        cached.insert("stage_info".into(), json!(stage_info));
        cached.insert("last_update".into(), json!(now));
        let record = JobRecord::new(job_id, JobState::Running, now)
            .with_stage(Some(stage))
            .with_metadata(cached);
        self.mirror(&record);

        info!(job_id, %stage, "job entered stage");
        Ok(())
    }

    /// Records successful completion. The result files must already be on disk.
    pub fn mark_success(&self, job_id: &str, result_summary: Value) -> Result<()> {
        validate_job_id(job_id)?;
        let now = self.clock.unix_now();
        let mut metadata = Map::new();
        metadata.insert("completed_at".into(), json!(now));
        metadata.insert("result_summary".into(), result_summary);

        self.store
            .write_stage_file(job_id, &self.terminal_file(job_id, JobState::Success, now, &metadata))?;
        self.store.write_marker(job_id)?;

        self.mirror(&JobRecord::new(job_id, JobState::Success, now).with_metadata(metadata));
        info!(job_id, "job marked successful");
        Ok(())
    }

    /// Records failure with its error payload. No marker is written.
    pub fn mark_failure(&self, job_id: &str, failure: &FailureInfo) -> Result<()> {
        validate_job_id(job_id)?;
        let now = self.clock.unix_now();
        let mut metadata = Map::new();
        metadata.insert("failed_at".into(), json!(now));
        metadata.insert("error".into(), serde_json::to_value(failure)?);

        self.store
            .write_stage_file(job_id, &self.terminal_file(job_id, JobState::Failure, now, &metadata))?;

        self.mirror(&JobRecord::new(job_id, JobState::Failure, now).with_metadata(metadata));
        warn!(job_id, error = %failure.message, "job marked failed");
        Ok(())
    }

    fn terminal_file(
        &self,
        job_id: &str,
        state: JobState,
        now: i64,
        metadata: &Map<String, Value>,
    ) -> StageFile {
        StageFile {
            job_id: Some(job_id.to_string()),
            state: state.to_string(),
            stage: None,
            stage_info: None,
            timestamp: now,
            pid: Some(std::process::id()),
            metadata: metadata.clone(),
            extra: Map::new(),
        }
    }

    fn mirror(&self, record: &JobRecord) {
        if self.cache.set(record, self.ttl) == CacheWrite::Unavailable {
            warn!(job_id = %record.job_id, state = %record.state, "cache unavailable, state kept on disk only");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::testing::Fixture;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::error::JobStateError;
    use crate::lookup::Lookup;

    struct Setup {
        fx: Fixture,
        clock: Arc<ManualClock>,
        cache: Arc<MemoryCache>,
        writer: StateWriter,
    }

    fn setup() -> Setup {
        let fx = Fixture::new();
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let writer = StateWriter::new(
            fx.store.clone(),
            cache.clone(),
            clock.clone(),
            Duration::from_secs(7 * 86_400),
        );
        Setup {
            fx,
            clock,
            cache,
            writer,
        }
    }

    #[test]
    fn write_stage_persists_file_and_cache() {
        let s = setup();
        let mut metadata = Map::new();
        metadata.insert("input_file".into(), json!("poem.txt"));
        s.writer.write_stage("j1", Stage::Processing, metadata).unwrap();

        let file = s.fx.store.read_stage_file("j1").found().unwrap();
        assert_eq!(file.state, "running");
        assert_eq!(file.stage.as_deref(), Some("processing"));
        assert_eq!(file.timestamp, 1_700_000_000);
        assert_eq!(file.pid, Some(std::process::id()));
        assert_eq!(file.metadata["input_file"], "poem.txt");

        let record = s.cache.get("j1").found().unwrap();
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.stage, Some(Stage::Processing));
        assert_eq!(record.stage_info().as_deref(), Some("Running the analysis"));
    }

    #[test]
    fn later_stage_overwrites_earlier_one() {
        let s = setup();
        for stage in Stage::ALL {
            s.writer.write_stage("j1", stage, Map::new()).unwrap();
            s.clock.advance(chrono::Duration::seconds(5));
        }
        let file = s.fx.store.read_stage_file("j1").found().unwrap();
        assert!(file.is_packaging());
        assert_eq!(file.timestamp, 1_700_000_015);
        assert_eq!(s.cache.get("j1").found().unwrap().stage, Some(Stage::Packaging));
    }

    #[test]
    fn stage_info_override_from_metadata() {
        let s = setup();
        let mut metadata = Map::new();
        metadata.insert("stage_info".into(), json!("Computing stress contours"));
        s.writer.write_stage("j1", Stage::Enhancing, metadata).unwrap();
        let file = s.fx.store.read_stage_file("j1").found().unwrap();
        assert_eq!(file.stage_info.as_deref(), Some("Computing stress contours"));
    }

    #[test]
    fn mark_success_writes_marker_last_and_mirrors() {
        let s = setup();
        s.writer.write_stage("j1", Stage::Packaging, Map::new()).unwrap();
        s.writer
            .mark_success("j1", json!({"download_url": "/results/j1"}))
            .unwrap();

        let set = s.fx.store.inspect("j1").found().unwrap();
        assert!(set.has_marker());
        let file = s.fx.store.read_stage_file("j1").found().unwrap();
        assert_eq!(file.state, "success");
        assert_eq!(file.metadata["result_summary"]["download_url"], "/results/j1");

        let record = s.cache.get("j1").found().unwrap();
        assert_eq!(record.state, JobState::Success);
        assert_eq!(record.stage, None);
    }

    #[test]
    fn mark_success_is_idempotent() {
        let s = setup();
        s.writer.mark_success("j1", json!({})).unwrap();
        let first = s.fx.store.read_stage_file("j1").found().unwrap();
        s.writer.mark_success("j1", json!({})).unwrap();
        let second = s.fx.store.read_stage_file("j1").found().unwrap();
        assert_eq!(first, second);
        assert!(s.fx.store.inspect("j1").found().unwrap().has_marker());
    }

    #[test]
    fn mark_failure_records_error_without_marker() {
        let s = setup();
        s.writer
            .mark_failure("j2", &FailureInfo::new("boom").with_code("UNEXPECTED_ERROR"))
            .unwrap();

        let file = s.fx.store.read_stage_file("j2").found().unwrap();
        assert_eq!(file.state, "failure");
        assert_eq!(file.error_message().as_deref(), Some("boom"));
        assert_eq!(file.metadata["error"]["code"], "UNEXPECTED_ERROR");
        assert!(!s.fx.store.inspect("j2").found().unwrap().has_marker());
        assert_eq!(s.cache.get("j2").found().unwrap().state, JobState::Failure);
    }

    #[test]
    fn cache_outage_does_not_fail_the_worker() {
        let s = setup();
        s.cache.set_available(false);
        s.writer.write_stage("j1", Stage::Processing, Map::new()).unwrap();
        s.writer.mark_success("j1", json!(null)).unwrap();

        s.cache.set_available(true);
        assert_eq!(s.cache.get("j1"), Lookup::Missing);
        assert!(s.fx.store.inspect("j1").found().unwrap().has_marker());
    }

    #[test]
    fn invalid_job_id_is_rejected() {
        let s = setup();
        let err = s.writer.write_stage("../x", Stage::Processing, Map::new()).unwrap_err();
        assert!(matches!(err, JobStateError::InvalidJobId(_)));
    }
}
