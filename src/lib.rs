//! Authoritative state for long-running, multi-stage jobs.
//!
//! A job's state is scattered across a task queue that forgets results on
//! restart, a TTL-bounded cache, and files the worker leaves on disk.
//! [`StateReconciler`] merges them into one answer, [`StateWriter`] is the
//! worker's side of the protocol, [`ResultAvailabilityProbe`] waits out
//! storage flush lag, and [`RecoveryScanner`] rebuilds the cache from disk.
//! [`Engine`] wires all of them from a [`Config`].

pub mod artifacts;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod lookup;
pub mod probe;
pub mod queue;
pub mod reconciler;
pub mod recovery;
pub mod state;
pub mod writer;

pub use artifacts::{ArtifactSet, ArtifactStore, StageFile};
pub use cache::{CacheStats, CacheWrite, DirCache, DisabledCache, EphemeralCache, MemoryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::Engine;
pub use error::{JobStateError, QueueError, Result};
pub use lookup::Lookup;
pub use probe::ResultAvailabilityProbe;
pub use queue::{HttpQueueBackend, QueueBackend, QueueReport, QueueState};
pub use reconciler::{ReconcilePolicy, StateReconciler};
pub use recovery::{RecoveryMode, RecoveryScanner, RecoveryStats};
pub use state::{
    EvidenceSource, FailureInfo, FailureKind, JobRecord, JobState, Resolution, Stage, StateEvidence,
};
pub use writer::StateWriter;
