use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The lifecycle states a job can be reported in.
///
/// Declaration order is the "definitiveness" order used for display:
/// pending → running → success → failure → expired → revoked → interrupted.
/// It is not a trust order; the reconciler decides trust by evidence source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failure,
    Expired,
    Revoked,
    /// Only produced by heuristic reconstruction; never surfaced to callers.
    Interrupted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Expired => "expired",
            JobState::Revoked => "revoked",
            JobState::Interrupted => "interrupted",
        }
    }

    /// Success and failure are the only states a worker can finish in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named sub-steps of a running job, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Processing,
    Verifying,
    Enhancing,
    Packaging,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Processing,
        Stage::Verifying,
        Stage::Enhancing,
        Stage::Packaging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Processing => "processing",
            Stage::Verifying => "verifying",
            Stage::Enhancing => "enhancing",
            Stage::Packaging => "packaging",
        }
    }

    /// Human-readable description shown to operators while the stage runs.
    pub fn default_info(&self) -> &'static str {
        match self {
            Stage::Processing => "Running the analysis",
            Stage::Verifying => "Verifying analysis results",
            Stage::Enhancing => "Enhancing result files",
            Stage::Packaging => "Finalizing results and creating zip archive",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_label(s) {
            Some((_, Some(stage))) => Ok(stage),
            _ => Err(format!("unknown stage: {s}")),
        }
    }
}

/// Maps a raw state label, as found in state files, cache records or queue
/// reports, to a state and optional stage.
///
/// Returns `None` for labels nobody in the pipeline writes; callers pick the
/// fallback that fits their tier.
pub fn normalize_label(raw: &str) -> Option<(JobState, Option<Stage>)> {
    let label = raw.trim().to_ascii_lowercase();
    let normalized = match label.as_str() {
        "success" | "successful" => (JobState::Success, None),
        "failure" | "failed" => (JobState::Failure, None),
        "pending" | "waiting" => (JobState::Pending, None),
        "running" | "started" | "retry" => (JobState::Running, None),
        "processing" => (JobState::Running, Some(Stage::Processing)),
        "verifying" => (JobState::Running, Some(Stage::Verifying)),
        "enhancing" => (JobState::Running, Some(Stage::Enhancing)),
        "packaging" => (JobState::Running, Some(Stage::Packaging)),
        "revoked" => (JobState::Revoked, None),
        "expired" => (JobState::Expired, None),
        "interrupted" => (JobState::Interrupted, None),
        _ => return None,
    };
    Some(normalized)
}

/// Distinguishes between logic failures and infrastructure failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The job's input or analysis was invalid.
    Business,
    /// Infrastructure failed (disk, worker crash, external tool).
    System,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Business => write!(f, "Business"),
            FailureKind::System => write!(f, "System"),
        }
    }
}

/// Error payload recorded by `StateWriter::mark_failure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            code: None,
            suggestion: None,
        }
    }

    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// The value stored in the ephemeral cache for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Unix seconds of the write that produced this record.
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, state: JobState, timestamp: i64) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            stage: None,
            timestamp,
            metadata: Map::new(),
        }
    }

    pub fn with_stage(mut self, stage: Option<Stage>) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn stage_info(&self) -> Option<String> {
        self.metadata
            .get("stage_info")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Operator-supplied job category, used for cache statistics.
    pub fn task_type(&self) -> &str {
        self.metadata
            .get("task_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }
}

/// Pulls a user-facing error message out of a metadata object.
///
/// Accepts the shapes the worker and queue have historically written:
/// `{"error": {"message": ..}}`, `{"error": ".."}`, `{"message": ..}` and
/// `{"errorMessage": ..}`. Blank messages are ignored.
pub fn error_message_from(metadata: &Map<String, Value>) -> Option<String> {
    let nested = metadata.get("error").and_then(|error| match error {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => obj.get("message").and_then(Value::as_str),
        _ => None,
    });
    [
        nested,
        metadata.get("errorMessage").and_then(Value::as_str),
        metadata.get("message").and_then(Value::as_str),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|m| !m.is_empty())
    .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_label_covers_worker_and_queue_labels() {
        assert_eq!(normalize_label("SUCCESS"), Some((JobState::Success, None)));
        assert_eq!(normalize_label("failed"), Some((JobState::Failure, None)));
        assert_eq!(normalize_label("STARTED"), Some((JobState::Running, None)));
        assert_eq!(
            normalize_label("packaging"),
            Some((JobState::Running, Some(Stage::Packaging)))
        );
        assert_eq!(
            normalize_label(" Verifying "),
            Some((JobState::Running, Some(Stage::Verifying)))
        );
        assert_eq!(normalize_label("waiting"), Some((JobState::Pending, None)));
        assert_eq!(normalize_label("mystery"), None);
    }

    #[test]
    fn stage_labels_round_trip_through_from_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("running".parse::<Stage>().is_err());
    }

    #[test]
    fn definitiveness_order_follows_lifecycle() {
        assert!(JobState::Pending < JobState::Running);
        assert!(JobState::Running < JobState::Success);
        assert!(JobState::Success < JobState::Expired);
        assert!(JobState::Success.is_terminal());
        assert!(!JobState::Expired.is_terminal());
    }

    #[test]
    fn job_record_serializes_lowercase_labels() {
        let record = JobRecord::new("j1", JobState::Running, 100).with_stage(Some(Stage::Enhancing));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["stage"], "enhancing");

        let back: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn error_message_from_accepts_known_shapes() {
        let nested = json!({"error": {"message": "boom", "code": "E1"}});
        assert_eq!(error_message_from(nested.as_object().unwrap()).as_deref(), Some("boom"));

        let flat = json!({"error": "disk full"});
        assert_eq!(error_message_from(flat.as_object().unwrap()).as_deref(), Some("disk full"));

        let queue = json!({"errorMessage": "bad input"});
        assert_eq!(error_message_from(queue.as_object().unwrap()).as_deref(), Some("bad input"));

        let blank = json!({"error": "  "});
        assert_eq!(error_message_from(blank.as_object().unwrap()), None);
    }

    #[test]
    fn failure_kind_display() {
        assert_eq!(FailureKind::Business.to_string(), "Business");
        assert_eq!(FailureKind::System.to_string(), "System");
    }
}
