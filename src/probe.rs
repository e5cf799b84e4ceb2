//! Bounded wait for result files to become visible.
//!
//! The worker writes the success marker before the last deliverable may have
//! been flushed to shared storage, so a caller about to hand out a download
//! link waits here first.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::artifacts::ArtifactStore;
use crate::config::ProbeConfig;

pub struct ResultAvailabilityProbe {
    store: ArtifactStore,
    config: ProbeConfig,
}

impl ResultAvailabilityProbe {
    pub fn new(store: ArtifactStore, config: ProbeConfig) -> Self {
        Self { store, config }
    }

    /// The sleeps the probe may perform, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.config.max_retries).map(|attempt| self.config.delay_for_attempt(attempt))
    }

    /// Longest time `await_result_files` can spend sleeping.
    pub fn worst_case_wait(&self) -> Duration {
        self.delays().sum()
    }

    /// Waits until the bundle and the structured result both exist.
    ///
    /// Retries only while something suggests the files are on their way: the
    /// stage-state file says packaging, or one of the two already exists.
    /// `false` means "not yet", not failure.
    pub async fn await_result_files(&self, job_id: &str) -> bool {
        let max_retries = self.config.max_retries;
        for attempt in 0..=max_retries {
            if self.store.deliverables_present(job_id) {
                if attempt > 0 {
                    info!(job_id, attempt, "result files became available");
                }
                return true;
            }
            if attempt == max_retries || !self.files_expected(job_id) {
                break;
            }
            let delay = self.config.delay_for_attempt(attempt);
            debug!(job_id, attempt, delay_ms = delay.as_millis() as u64, "result files not visible yet");
            sleep(delay).await;
        }
        debug!(job_id, "result files unavailable, reporting still running");
        false
    }

    /// [`Self::await_result_files`] cut short after `limit`.
    pub async fn await_result_files_within(&self, job_id: &str, limit: Duration) -> bool {
        timeout(limit, self.await_result_files(job_id))
            .await
            .unwrap_or(false)
    }

    fn files_expected(&self, job_id: &str) -> bool {
        let packaging = self
            .store
            .read_stage_file(job_id)
            .found()
            .is_some_and(|file| file.is_packaging());
        let partial = self
            .store
            .inspect(job_id)
            .found()
            .is_some_and(|set| set.has_partial_deliverable());
        packaging || partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::testing::Fixture;
    use tokio::time::Instant;

    fn probe(fx: &Fixture) -> ResultAvailabilityProbe {
        ResultAvailabilityProbe::new(fx.store.clone(), ProbeConfig::default())
    }

    fn write_packaging_stage(fx: &Fixture, job_id: &str) {
        fx.write_raw_stage_file(job_id, r#"{"state": "running", "stage": "packaging", "timestamp": 1}"#);
    }

    #[test]
    fn default_backoff_is_bounded() {
        let fx = Fixture::new();
        let p = probe(&fx);
        let delays: Vec<u64> = p.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 16_000]);
        assert_eq!(p.worst_case_wait(), Duration::from_millis(31_500));
    }

    #[tokio::test(start_paused = true)]
    async fn present_files_return_immediately() {
        let fx = Fixture::new();
        fx.write_deliverables("j1");
        let start = Instant::now();
        assert!(probe(&fx).await_result_files("j1").await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn no_indicator_means_no_wait() {
        let fx = Fixture::new();
        fx.touch_output("j1", "raw_results.csv");
        let start = Instant::now();
        assert!(!probe(&fx).await_result_files("j1").await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_bundle_written_during_packaging() {
        let fx = Fixture::new();
        write_packaging_stage(&fx, "j1");
        fx.write_structured_result("j1");

        let store = fx.store.clone();
        let writer = tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            let dir = store.job_dir("j1").unwrap();
            std::fs::write(dir.join("results.zip"), "PK").unwrap();
        });

        let start = Instant::now();
        assert!(probe(&fx).await_result_files("j1").await);
        // Checks at 0, 0.5, 1.5 and 3.5 seconds; the bundle lands at 3.
        assert_eq!(start.elapsed(), Duration::from_millis(3_500));
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_worst_case_wait() {
        let fx = Fixture::new();
        write_packaging_stage(&fx, "j1");
        let p = probe(&fx);

        let start = Instant::now();
        assert!(!p.await_result_files("j1").await);
        assert_eq!(start.elapsed(), p.worst_case_wait());
    }

    #[tokio::test(start_paused = true)]
    async fn one_deliverable_is_an_indicator() {
        let fx = Fixture::new();
        fx.write_bundle("j1");
        let p = ResultAvailabilityProbe::new(
            fx.store.clone(),
            ProbeConfig {
                max_retries: 2,
                base_delay_ms: 100,
            },
        );
        let start = Instant::now();
        assert!(!p.await_result_files("j1").await);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn leftover_public_result_means_no_wait() {
        let fx = Fixture::new();
        fx.write_structured_result("j1");
        let start = Instant::now();
        assert!(!probe(&fx).await_result_files("j1").await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_timeout_cuts_the_wait_short() {
        let fx = Fixture::new();
        write_packaging_stage(&fx, "j1");
        let start = Instant::now();
        assert!(
            !probe(&fx)
                .await_result_files_within("j1", Duration::from_secs(2))
                .await
        );
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
