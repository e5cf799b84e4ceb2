mod evidence;
mod job;

pub use evidence::{ArtifactSummary, EvidenceSource, Resolution, StateEvidence};
pub use job::{
    FailureInfo, FailureKind, JobRecord, JobState, Stage, error_message_from, normalize_label,
};
