//! One handle wiring every component from a single [`Config`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::artifacts::ArtifactStore;
use crate::cache::{self, CacheStats, EphemeralCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::lookup::Lookup;
use crate::probe::ResultAvailabilityProbe;
use crate::queue::{HttpQueueBackend, QueueBackend, QueueReport, QueueState};
use crate::reconciler::{ReconcilePolicy, StateReconciler};
use crate::recovery::{RecoveryMode, RecoveryScanner, RecoveryStats};
use crate::state::{FailureInfo, JobState, Resolution, Stage};
use crate::writer::StateWriter;

pub struct Engine {
    store: ArtifactStore,
    cache: Arc<dyn EphemeralCache>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    writer: StateWriter,
    reconciler: StateReconciler,
    probe: ResultAvailabilityProbe,
    queue: Option<HttpQueueBackend>,
}

impl Engine {
    /// Production wiring: system clock, configured cache and queue backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = cache::from_config(&config.cache, clock.clone());
        let mut engine = Self::with_parts(config, cache, clock);
        if let Some(url) = &config.queue.url {
            let timeout = Duration::from_secs(config.queue.timeout_secs);
            engine.queue = Some(HttpQueueBackend::new(url.clone(), timeout)?);
        }
        Ok(engine)
    }

    /// Wiring with an explicit cache and clock and no queue backend.
    pub fn with_parts(config: &Config, cache: Arc<dyn EphemeralCache>, clock: Arc<dyn Clock>) -> Self {
        let store = ArtifactStore::from_config(config);
        let ttl = config.cache.ttl();
        Self {
            writer: StateWriter::new(store.clone(), cache.clone(), clock.clone(), ttl),
            reconciler: StateReconciler::new(
                store.clone(),
                cache.clone(),
                clock.clone(),
                ReconcilePolicy::from_config(config),
            ),
            probe: ResultAvailabilityProbe::new(store.clone(), config.probe.clone()),
            queue: None,
            store,
            cache,
            clock,
            ttl,
        }
    }

    pub fn with_queue(mut self, queue: HttpQueueBackend) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn EphemeralCache> {
        &self.cache
    }

    pub fn probe(&self) -> &ResultAvailabilityProbe {
        &self.probe
    }

    pub fn has_queue(&self) -> bool {
        self.queue.is_some()
    }

    pub fn resolve(&self, job_id: &str, queue: impl Into<QueueReport>) -> Resolution {
        self.reconciler.resolve(job_id, queue)
    }

    /// Asks the queue backend first, then resolves.
    ///
    /// An unreachable or unconfigured backend counts as `PENDING`, which is
    /// what the queue itself says about jobs it has forgotten.
    pub async fn resolve_current(&self, job_id: &str) -> Resolution {
        let report = self.queue_report(job_id).await;
        self.reconciler.resolve(job_id, report)
    }

    async fn queue_report(&self, job_id: &str) -> QueueReport {
        let Some(queue) = &self.queue else {
            return QueueReport::new(QueueState::Pending);
        };
        match queue.status(job_id).await {
            Ok(report) => report,
            Err(e) => {
                warn!(job_id, error = %e, "queue backend unreachable, assuming pending");
                QueueReport::new(QueueState::Pending)
            }
        }
    }

    pub fn write_stage(&self, job_id: &str, stage: Stage, metadata: Map<String, Value>) -> Result<()> {
        self.writer.write_stage(job_id, stage, metadata)
    }

    pub fn mark_success(&self, job_id: &str, result_summary: Value) -> Result<()> {
        self.writer.mark_success(job_id, result_summary)
    }

    pub fn mark_failure(&self, job_id: &str, failure: &FailureInfo) -> Result<()> {
        self.writer.mark_failure(job_id, failure)
    }

    pub async fn await_result_files(&self, job_id: &str) -> bool {
        self.probe.await_result_files(job_id).await
    }

    pub fn recovery(&self, mode: RecoveryMode) -> RecoveryScanner {
        RecoveryScanner::new(self.store.clone(), self.cache.clone(), self.clock.clone(), self.ttl)
            .with_mode(mode)
    }

    pub fn recover_all(&self, mode: RecoveryMode, cancel: CancellationToken) -> RecoveryStats {
        self.recovery(mode).with_cancellation(cancel).run()
    }

    pub fn recover_one(&self, job_id: &str) -> Option<JobState> {
        self.recovery(RecoveryMode::Force).recover_one(job_id)
    }

    pub fn statistics(&self) -> Lookup<CacheStats> {
        self.cache.statistics()
    }

    pub fn cleanup(&self, older_than: Duration) -> Lookup<usize> {
        self.cache.cleanup_older_than(older_than)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::state::EvidenceSource;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Setup {
        _dir: tempfile::TempDir,
        cache: Arc<MemoryCache>,
        engine: Engine,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            results_root: dir.path().join("results"),
            public_root: dir.path().join("public"),
            ..Config::default()
        };
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let engine = Engine::with_parts(&config, cache.clone(), clock);
        Setup {
            _dir: dir,
            cache,
            engine,
        }
    }

    fn write_deliverables(engine: &Engine, job_id: &str) {
        let job_dir = engine.store().job_dir(job_id).unwrap();
        std::fs::create_dir_all(engine.store().output_dir(job_id).unwrap()).unwrap();
        std::fs::write(job_dir.join("input.zip"), "PK").unwrap();
        std::fs::write(engine.store().output_dir(job_id).unwrap().join("results.csv"), "a,b").unwrap();
        let structured = engine.store().structured_result_path(job_id).unwrap();
        std::fs::create_dir_all(structured.parent().unwrap()).unwrap();
        std::fs::write(structured, "[]").unwrap();
    }

    #[tokio::test]
    async fn job_lifecycle_end_to_end() {
        let s = setup();
        let e = &s.engine;

        e.write_stage("j1", Stage::Processing, Map::new()).unwrap();
        assert_eq!(e.resolve("j1", "STARTED").state, JobState::Running);

        e.write_stage("j1", Stage::Packaging, Map::new()).unwrap();
        write_deliverables(e, "j1");
        e.mark_success("j1", json!({"rows": 12})).unwrap();

        assert!(e.await_result_files("j1").await);
        let res = e.resolve_current("j1").await;
        assert_eq!(res.state, JobState::Success);
        assert_eq!(res.evidence.source, EvidenceSource::ArtifactMarker);
        assert_eq!(e.statistics().found().unwrap().completed_tasks, 1);
    }

    #[test]
    fn recovery_through_engine() {
        let s = setup();
        s.engine.write_stage("a", Stage::Verifying, Map::new()).unwrap();
        s.engine.mark_failure("b", &FailureInfo::new("bad input")).unwrap();
        s.cache.flush();

        let stats = s.engine.recover_all(RecoveryMode::Normal, CancellationToken::new());
        assert_eq!(stats.recovered, 2);
        assert_eq!(s.engine.recover_one("b"), Some(JobState::Failure));
        assert_eq!(s.engine.cleanup(Duration::from_secs(3600)), Lookup::Found(0));
    }

    #[tokio::test]
    async fn resolve_current_uses_queue_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/task/result/j2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "FAILURE",
                "result": {"error": "Input file is empty"}
            })))
            .mount(&server)
            .await;

        let s = setup();
        let backend = HttpQueueBackend::new(server.uri(), Duration::from_secs(5)).unwrap();
        let engine = s.engine.with_queue(backend);
        assert!(engine.has_queue());

        let res = engine.resolve_current("j2").await;
        assert_eq!(res.state, JobState::Failure);
        assert_eq!(res.error_message.as_deref(), Some("Input file is empty"));
    }

    #[tokio::test]
    async fn unreachable_queue_counts_as_pending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let s = setup();
        let backend = HttpQueueBackend::new(server.uri(), Duration::from_secs(5)).unwrap();
        let engine = s.engine.with_queue(backend);
        assert_eq!(engine.resolve_current("nothing").await.state, JobState::Pending);
    }

    #[test]
    fn from_config_builds_queue_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            results_root: dir.path().join("results"),
            public_root: dir.path().join("public"),
            ..Config::default()
        };
        config.cache.dir = dir.path().join("cache");
        config.queue.url = Some("http://localhost:5555".into());

        let engine = Engine::from_config(&config).unwrap();
        assert!(engine.has_queue());
        assert_eq!(engine.cache().get("j1"), Lookup::Missing);
    }
}
