use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::job::{JobState, Stage};

/// Where a piece of evidence about a job's state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Queue,
    Cache,
    ArtifactMarker,
    ArtifactFiles,
    ArtifactStateFile,
    Heuristic,
}

impl EvidenceSource {
    /// Durable sources are backed by files the worker wrote to disk.
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            EvidenceSource::ArtifactMarker
                | EvidenceSource::ArtifactFiles
                | EvidenceSource::ArtifactStateFile
        )
    }
}

/// Existence snapshot of the result files, attached to evidence for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    pub has_marker: bool,
    pub has_bundle: bool,
    pub has_structured_result: bool,
    pub has_tabular_result: bool,
    pub has_intermediate_result: bool,
    pub auxiliary_files: usize,
}

/// One observation of a job's state, produced by a single evidence tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvidence {
    pub state: JobState,
    pub source: EvidenceSource,
    pub reliable: bool,
    /// Unix seconds; zero when the source carries no timestamp.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactSummary>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl StateEvidence {
    pub fn new(state: JobState, source: EvidenceSource, reliable: bool, timestamp: i64) -> Self {
        Self {
            state,
            source,
            reliable,
            timestamp,
            stage: None,
            stage_info: None,
            artifacts: None,
            metadata: Map::new(),
        }
    }

    pub fn with_stage(mut self, stage: Option<Stage>, stage_info: Option<String>) -> Self {
        self.stage = stage;
        self.stage_info = stage_info.or_else(|| stage.map(|s| s.default_info().to_string()));
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactSummary) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// The reconciler's answer for one job.
///
/// `state` is the normalized, caller-facing state and never `interrupted`;
/// `evidence` is the observation that decided it, left exactly as the tier
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub state: JobState,
    pub evidence: StateEvidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds after which the result folder is cleaned up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

impl Resolution {
    /// Resolution that surfaces the evidence's own state and stage.
    pub fn from_evidence(evidence: StateEvidence) -> Self {
        Self {
            state: evidence.state,
            stage: evidence.stage,
            stage_info: evidence.stage_info.clone(),
            evidence,
            error_message: None,
            message: None,
            expires_on: None,
            expires_in: None,
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    pub fn running(mut self, stage: Option<Stage>) -> Self {
        self.state = JobState::Running;
        if stage.is_some() {
            self.stage = stage;
            self.stage_info = stage.map(|s| s.default_info().to_string());
        }
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_expiry(mut self, expires_on: Option<i64>, expires_in: Option<i64>) -> Self {
        self.expires_on = expires_on;
        self.expires_in = expires_in;
        self
    }
}
