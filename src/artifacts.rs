//! Filesystem-backed evidence of job progress and completion.
//!
//! Per job id, under the results root:
//!
//! ```text
//! <results_root>/<job>/*.zip                  packaged bundle
//! <results_root>/<job>/output/task_state.json stage-state file
//! <results_root>/<job>/output/task_completed  success marker (content ignored)
//! <results_root>/<job>/output/results.csv     tabular result
//! <public_root>/<job>/results.json            structured result
//! ```
//!
//! Result file names come from [`ArtifactLayout`]; they are only ever checked
//! for existence.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ArtifactLayout, Config};
use crate::error::{JobStateError, Result};
use crate::lookup::Lookup;
use crate::state::{ArtifactSummary, JobState, Stage, error_message_from, normalize_label};

pub const STATE_FILE_NAME: &str = "task_state.json";
pub const SUCCESS_MARKER_NAME: &str = "task_completed";
pub const OUTPUT_DIR_NAME: &str = "output";

/// Rejects ids that could escape the results root.
pub fn validate_job_id(job_id: &str) -> Result<()> {
    let invalid = job_id.is_empty()
        || job_id == "."
        || job_id == ".."
        || job_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(JobStateError::InvalidJobId(job_id.to_string()));
    }
    Ok(())
}

/// Writes `contents` to a temporary sibling and renames it over `path`, so
/// readers observe either the old file or the new one.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    if let Err(e) = fs::write(&temp_path, contents) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

/// Contents of `output/task_state.json`.
///
/// `state` is kept as the raw label: older workers wrote stage names such as
/// `packaging` directly into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_info: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Top-level fields written by older workers (`error`, `completed_at`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StageFile {
    /// Normalized state and stage. Labels nobody recognizes count as running:
    /// a stage-state file only exists once the worker has started.
    pub fn normalized(&self) -> (JobState, Option<Stage>) {
        let (state, label_stage) = normalize_label(&self.state).unwrap_or((JobState::Running, None));
        let stage = label_stage.or_else(|| {
            self.stage
                .as_deref()
                .and_then(normalize_label)
                .and_then(|(_, stage)| stage)
        });
        (state, if state == JobState::Running { stage } else { None })
    }

    pub fn is_packaging(&self) -> bool {
        self.normalized() == (JobState::Running, Some(Stage::Packaging))
    }

    pub fn error_message(&self) -> Option<String> {
        error_message_from(&self.metadata).or_else(|| error_message_from(&self.extra))
    }

    /// All fields as one JSON object, for evidence metadata.
    pub fn to_metadata(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Existence snapshot of everything the engine looks at for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    pub job_dir: bool,
    pub output_dir: bool,
    pub public_dir: bool,
    /// Modification time of the success marker, if it exists.
    pub marker: Option<i64>,
    pub bundle: bool,
    pub structured_result: bool,
    pub tabular_result: bool,
    pub intermediate_result: bool,
    pub auxiliary: usize,
}

impl ArtifactSet {
    pub fn has_marker(&self) -> bool {
        self.marker.is_some()
    }

    /// Both files a download needs: the bundle and the structured result.
    pub fn has_deliverables(&self) -> bool {
        self.bundle && self.structured_result
    }

    pub fn any_directory(&self) -> bool {
        self.job_dir || self.output_dir || self.public_dir
    }

    /// Bundle alone, or the structured and tabular results together.
    pub fn has_strong_evidence(&self) -> bool {
        self.bundle || (self.structured_result && self.tabular_result)
    }

    /// Tabular result plus at least one derived auxiliary file.
    pub fn has_moderate_evidence(&self) -> bool {
        self.tabular_result && self.auxiliary > 0
    }

    /// Only the intermediate output: the job started and never finished.
    pub fn has_weak_evidence(&self) -> bool {
        self.intermediate_result
    }

    /// Exactly one of the two deliverables, with the job directory still in
    /// place. A structured result left behind after the job directory was
    /// removed is a cleanup leftover, not a write in progress.
    pub fn has_partial_deliverable(&self) -> bool {
        self.bundle != self.structured_result && (self.job_dir || self.output_dir)
    }

    /// Files that exist only while the worker is still writing results.
    pub fn write_in_progress(&self) -> bool {
        self.has_partial_deliverable() || (self.output_dir && !self.tabular_result)
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            has_marker: self.has_marker(),
            has_bundle: self.bundle,
            has_structured_result: self.structured_result,
            has_tabular_result: self.tabular_result,
            has_intermediate_result: self.intermediate_result,
            auxiliary_files: self.auxiliary,
        }
    }
}

/// Reads and writes the durable per-job artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    results_root: PathBuf,
    public_root: PathBuf,
    layout: ArtifactLayout,
}

impl ArtifactStore {
    pub fn new(
        results_root: impl Into<PathBuf>,
        public_root: impl Into<PathBuf>,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            results_root: results_root.into(),
            public_root: public_root.into(),
            layout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.results_root.clone(),
            config.public_root.clone(),
            config.artifacts.clone(),
        )
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        Ok(self.results_root.join(job_id))
    }

    pub fn output_dir(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.job_dir(job_id)?.join(OUTPUT_DIR_NAME))
    }

    pub fn public_dir(&self, job_id: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        Ok(self.public_root.join(job_id))
    }

    pub fn stage_file_path(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.output_dir(job_id)?.join(STATE_FILE_NAME))
    }

    pub fn marker_path(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.output_dir(job_id)?.join(SUCCESS_MARKER_NAME))
    }

    pub fn structured_result_path(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.public_dir(job_id)?.join(&self.layout.structured_result))
    }

    /// Takes an existence snapshot of the job's artifacts.
    ///
    /// Any IO error other than "not found" makes the whole tier unavailable.
    pub fn inspect(&self, job_id: &str) -> Lookup<ArtifactSet> {
        match self.try_inspect(job_id) {
            Ok(set) => Lookup::Found(set),
            Err(JobStateError::InvalidJobId(id)) => {
                warn!(job_id = %id, "refusing to inspect artifacts for invalid job id");
                Lookup::Missing
            }
            Err(e) => {
                warn!(job_id, error = %e, "artifact store unreadable");
                Lookup::Unavailable
            }
        }
    }

    fn try_inspect(&self, job_id: &str) -> Result<ArtifactSet> {
        let job_dir = self.job_dir(job_id)?;
        let output_dir = self.output_dir(job_id)?;
        let public_dir = self.public_dir(job_id)?;

        let marker = match fs::metadata(output_dir.join(SUCCESS_MARKER_NAME)) {
            Ok(meta) => Some(
                meta.modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_default(),
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut auxiliary = 0;
        for name in &self.layout.auxiliary {
            if output_dir.join(name).try_exists()? {
                auxiliary += 1;
            }
        }

        Ok(ArtifactSet {
            job_dir: job_dir.try_exists()?,
            output_dir: output_dir.try_exists()?,
            public_dir: public_dir.try_exists()?,
            marker,
            bundle: self.has_bundle(&job_dir)?,
            structured_result: public_dir.join(&self.layout.structured_result).try_exists()?,
            tabular_result: output_dir.join(&self.layout.tabular_result).try_exists()?,
            intermediate_result: output_dir.join(&self.layout.intermediate_result).try_exists()?,
            auxiliary,
        })
    }

    fn has_bundle(&self, job_dir: &Path) -> io::Result<bool> {
        let entries = match fs::read_dir(job_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.layout.bundle_extension));
            if matches && path.is_file() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True when both download deliverables exist. Errors count as "not yet".
    pub fn deliverables_present(&self, job_id: &str) -> bool {
        self.inspect(job_id)
            .found()
            .is_some_and(|set| set.has_deliverables())
    }

    /// Reads the stage-state file. Malformed JSON is logged and treated as absent.
    pub fn read_stage_file(&self, job_id: &str) -> Lookup<StageFile> {
        let path = match self.stage_file_path(job_id) {
            Ok(path) => path,
            Err(_) => return Lookup::Missing,
        };
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Lookup::Missing,
            Err(e) => {
                warn!(job_id, path = %path.display(), error = %e, "failed to read stage-state file");
                return Lookup::Unavailable;
            }
        };
        match serde_json::from_str::<StageFile>(&contents) {
            Ok(file) => Lookup::Found(file),
            Err(e) => {
                warn!(job_id, path = %path.display(), error = %e, "ignoring malformed stage-state file");
                Lookup::Missing
            }
        }
    }

    /// Overwrites the stage-state file atomically.
    pub fn write_stage_file(&self, job_id: &str, file: &StageFile) -> Result<()> {
        let path = self.stage_file_path(job_id)?;
        let json = serde_json::to_vec_pretty(file)?;
        atomic_write(&path, &json)?;
        debug!(job_id, state = %file.state, "stage-state file written");
        Ok(())
    }

    /// Creates the zero-content success marker.
    pub fn write_marker(&self, job_id: &str) -> Result<()> {
        let path = self.marker_path(job_id)?;
        atomic_write(&path, b"")?;
        debug!(job_id, "success marker written");
        Ok(())
    }

    /// Ids of every job directory under the results root, sorted.
    pub fn job_ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.results_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && validate_job_id(name).is_ok()
                && !name.starts_with('.')
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;

    #[test]
    fn job_ids_are_validated() {
        assert!(validate_job_id("5f0c-11aa").is_ok());
        assert!(validate_job_id("").is_err());
        assert!(validate_job_id("..").is_err());
        assert!(validate_job_id("a/b").is_err());
        assert!(validate_job_id("a\\b").is_err());
    }

    #[test]
    fn inspect_empty_job_finds_nothing() {
        let fx = Fixture::new();
        let set = fx.store.inspect("j1").found().unwrap();
        assert_eq!(set, ArtifactSet::default());
        assert!(!set.any_directory());
    }

    #[test]
    fn inspect_invalid_id_is_missing() {
        let fx = Fixture::new();
        assert_eq!(fx.store.inspect("../etc"), Lookup::Missing);
        assert_eq!(fx.store.read_stage_file("../etc"), Lookup::Missing);
    }

    #[test]
    fn inspect_sees_every_artifact() {
        let fx = Fixture::new();
        fx.write_deliverables("j1");
        fx.touch_output("j1", "results.csv");
        fx.touch_output("j1", "raw_results.csv");
        fx.touch_output("j1", "sentences.csv");
        fx.store.write_marker("j1").unwrap();

        let set = fx.store.inspect("j1").found().unwrap();
        assert!(set.job_dir && set.output_dir && set.public_dir);
        assert!(set.has_marker());
        assert!(set.has_deliverables());
        assert!(set.has_strong_evidence());
        assert!(set.has_moderate_evidence());
        assert_eq!(set.auxiliary, 1);
        assert!(!set.write_in_progress());
        assert!(fx.store.deliverables_present("j1"));
    }

    #[test]
    fn bundle_detection_uses_extension_only() {
        let fx = Fixture::new();
        let dir = fx.store.job_dir("j1").unwrap();
        fs::create_dir_all(dir.join("nested.zip")).unwrap();
        fs::write(dir.join("notes.txt"), "x").unwrap();
        assert!(!fx.store.inspect("j1").found().unwrap().bundle);

        fs::write(dir.join("RESULTS.ZIP"), "PK").unwrap();
        assert!(fx.store.inspect("j1").found().unwrap().bundle);
    }

    #[test]
    fn one_deliverable_means_write_in_progress() {
        let fx = Fixture::new();
        fx.write_structured_result("j1");
        fx.touch_output("j1", "results.csv");
        let set = fx.store.inspect("j1").found().unwrap();
        assert!(set.has_partial_deliverable());
        assert!(set.write_in_progress());
        assert!(!set.has_deliverables());
    }

    #[test]
    fn public_result_without_job_dir_is_not_a_write() {
        let fx = Fixture::new();
        fx.write_structured_result("j1");
        let set = fx.store.inspect("j1").found().unwrap();
        assert!(!set.job_dir && !set.output_dir && set.public_dir);
        assert!(!set.has_partial_deliverable());
        assert!(!set.write_in_progress());
    }

    #[test]
    fn stage_file_round_trips_and_normalizes() {
        let fx = Fixture::new();
        let file = StageFile {
            job_id: Some("j1".into()),
            state: "running".into(),
            stage: Some("verifying".into()),
            stage_info: None,
            timestamp: 42,
            pid: Some(7),
            metadata: Map::new(),
            extra: Map::new(),
        };
        fx.store.write_stage_file("j1", &file).unwrap();

        let read = fx.store.read_stage_file("j1").found().unwrap();
        assert_eq!(read, file);
        assert_eq!(read.normalized(), (JobState::Running, Some(Stage::Verifying)));
        assert!(!read.is_packaging());
    }

    #[test]
    fn legacy_stage_file_labels_are_understood() {
        let fx = Fixture::new();
        fx.write_raw_stage_file(
            "j1",
            r#"{"task_id": "j1", "state": "packaging", "stage": "results_packaging", "timestamp": 9}"#,
        );
        let file = fx.store.read_stage_file("j1").found().unwrap();
        assert!(file.is_packaging());
        assert_eq!(file.extra["task_id"], "j1");

        fx.write_raw_stage_file(
            "j2",
            r#"{"state": "failure", "error": {"message": "No input file specified"}}"#,
        );
        let file = fx.store.read_stage_file("j2").found().unwrap();
        assert_eq!(file.normalized(), (JobState::Failure, None));
        assert_eq!(file.error_message().as_deref(), Some("No input file specified"));

        fx.write_raw_stage_file("j3", r#"{"state": "metrical_tree_computation"}"#);
        let file = fx.store.read_stage_file("j3").found().unwrap();
        assert_eq!(file.normalized(), (JobState::Running, None));
    }

    #[test]
    fn malformed_stage_file_reads_as_missing() {
        let fx = Fixture::new();
        fx.write_raw_stage_file("j1", "{not json");
        assert_eq!(fx.store.read_stage_file("j1"), Lookup::Missing);
    }

    #[test]
    fn marker_is_empty_and_rewritable() {
        let fx = Fixture::new();
        fx.store.write_marker("j1").unwrap();
        fx.store.write_marker("j1").unwrap();
        let path = fx.store.marker_path("j1").unwrap();
        assert_eq!(fs::read(&path).unwrap(), Vec::<u8>::new());

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn job_ids_lists_directories_only() {
        let fx = Fixture::new();
        fx.touch_output("b", "results.csv");
        fx.touch_output("a", "results.csv");
        fs::write(fx.store.results_root().join("stray.txt"), "x").unwrap();
        fs::create_dir_all(fx.store.results_root().join(".trash")).unwrap();
        assert_eq!(fx.store.job_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn job_ids_of_missing_root_is_empty() {
        let store = ArtifactStore::new("/nonexistent/jobstate/results", "/nonexistent/public", ArtifactLayout::default());
        assert!(store.job_ids().unwrap().is_empty());
    }
}
