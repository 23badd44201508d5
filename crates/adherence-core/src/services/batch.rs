//! Fleet-wide nightly recomputation.
//!
//! Discovery, chunking, bounded intra-chunk concurrency, inter-chunk
//! pacing, and per-patient isolation: one patient failing never halts the
//! batch, and store backpressure earns a patient bounded retries instead of
//! an immediate failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::ports::DispenseRepository;
use crate::services::orchestrator::{OrchestratorResult, PdcOrchestrator, RunOptions};

/// Progress is reported (tracing + callback) every this many patients.
const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub measurement_year: i32,
    pub current_date: NaiveDate,
    /// Overrides `EngineConfig::batch.batch_size` when set.
    pub batch_size: Option<usize>,
    pub max_patients: Option<usize>,
    /// Overrides `EngineConfig::batch.inter_batch_delay_ms` when set.
    pub inter_batch_delay_ms: Option<u64>,
    pub dry_run: bool,
}

impl BatchOptions {
    pub fn new(measurement_year: i32, current_date: NaiveDate) -> Self {
        Self {
            measurement_year,
            current_date,
            batch_size: None,
            max_patients: None,
            inter_batch_delay_ms: None,
            dry_run: false,
        }
    }
}

/// Structured execution record for one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub execution_id: String,
    pub measurement_year: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_patients: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub mean_duration_ms: f64,
    /// One entry per failed patient.
    pub errors: Vec<String>,
    /// Dropped-fill and similar warnings aggregated across patients.
    pub warnings: Vec<String>,
    /// Total classification misses across patients (telemetry).
    pub unclassified_medications: usize,
}

pub struct BatchDriver {
    orchestrator: Arc<PdcOrchestrator>,
    dispenses: Arc<dyn DispenseRepository>,
    config: EngineConfig,
}

impl BatchDriver {
    pub fn new(
        orchestrator: Arc<PdcOrchestrator>,
        dispenses: Arc<dyn DispenseRepository>,
        config: EngineConfig,
    ) -> Self {
        Self {
            orchestrator,
            dispenses,
            config,
        }
    }

    pub async fn run_batch(&self, options: &BatchOptions) -> Result<BatchResult> {
        self.run_batch_with_progress(options, |_, _| {}).await
    }

    /// Run the batch, invoking `progress(processed, total)` as patients
    /// complete. Only discovery can fail the whole run.
    #[instrument(skip(self, options, progress), fields(year = options.measurement_year))]
    pub async fn run_batch_with_progress<F>(
        &self,
        options: &BatchOptions,
        progress: F,
    ) -> Result<BatchResult>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let execution_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let batch_size = options
            .batch_size
            .unwrap_or(self.config.batch.batch_size)
            .max(1);
        let delay_ms = options
            .inter_batch_delay_ms
            .unwrap_or(self.config.batch.inter_batch_delay_ms);

        let patients = self
            .dispenses
            .patients_with_dispenses(options.measurement_year, options.max_patients)
            .await
            .context("discovering patients with dispenses")?;
        let total = patients.len();
        info!(execution_id, total, batch_size, "starting adherence batch");

        let mut run_options = RunOptions::new(options.measurement_year, options.current_date);
        run_options.dry_run = options.dry_run;

        let mut result = BatchResult {
            execution_id,
            measurement_year: options.measurement_year,
            started_at,
            finished_at: started_at,
            total_patients: total,
            succeeded: 0,
            failed: 0,
            mean_duration_ms: 0.0,
            errors: Vec::new(),
            warnings: Vec::new(),
            unclassified_medications: 0,
        };

        let mut processed = 0usize;
        let mut total_duration_ms = 0u64;

        for chunk in patients.chunks(batch_size) {
            let runs = join_all(
                chunk
                    .iter()
                    .map(|patient_id| self.run_patient_with_retry(patient_id, &run_options)),
            )
            .await;

            for (patient_id, (patient_result, duration_ms)) in chunk.iter().zip(runs) {
                processed += 1;
                total_duration_ms += duration_ms;

                result.warnings.extend(patient_result.warnings.iter().cloned());
                result.unclassified_medications += patient_result.unclassified_medications;

                if patient_result.succeeded() {
                    result.succeeded += 1;
                } else {
                    result.failed += 1;
                    result.errors.push(format!(
                        "patient {}: {}",
                        patient_id,
                        patient_result.errors.join("; ")
                    ));
                }

                if processed % PROGRESS_EVERY == 0 {
                    info!(
                        processed,
                        total,
                        succeeded = result.succeeded,
                        failed = result.failed,
                        "batch progress"
                    );
                }
                progress(processed, total);
            }

            if processed < total && delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        result.finished_at = Utc::now();
        result.mean_duration_ms = total_duration_ms as f64 / processed.max(1) as f64;
        info!(
            succeeded = result.succeeded,
            failed = result.failed,
            mean_duration_ms = result.mean_duration_ms,
            "batch complete"
        );
        Ok(result)
    }

    /// One patient, retried with exponential backoff while the store keeps
    /// signalling backpressure; never drops the patient before exhausting
    /// the retry budget.
    async fn run_patient_with_retry(
        &self,
        patient_id: &str,
        options: &RunOptions,
    ) -> (OrchestratorResult, u64) {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let result = self.orchestrator.calculate_and_store(patient_id, options).await;

            if result.backpressure && attempt < self.config.batch.max_patient_retries {
                attempt += 1;
                let backoff_ms = 250u64
                    .saturating_mul(1u64 << attempt.min(16))
                    .min(self.config.batch.backpressure_ceiling_ms);
                warn!(
                    patient_id,
                    attempt,
                    backoff_ms,
                    "store backpressure; retrying patient"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                continue;
            }

            return (result, started.elapsed().as_millis() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::MaRxnormTable;
    use crate::testing::{
        dispense_fixture, InMemoryDispenseRepository, InMemoryObservationStore,
        InMemoryPatientStore,
    };
    use std::sync::Mutex;

    const LISINOPRIL: &str = "314076";

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, d).unwrap()
    }

    struct Harness {
        dispenses: Arc<InMemoryDispenseRepository>,
        observations: Arc<InMemoryObservationStore>,
        driver: BatchDriver,
    }

    fn harness() -> Harness {
        let dispenses = Arc::new(InMemoryDispenseRepository::new());
        let observations = Arc::new(InMemoryObservationStore::new());
        let patients = Arc::new(InMemoryPatientStore::new());
        let table =
            Arc::new(MaRxnormTable::from_json_str(&format!(r#"{{"{}": "MAH"}}"#, LISINOPRIL)).unwrap());

        let mut config = EngineConfig::default();
        config.write_retry_backoff_ms = vec![1];
        config.batch.inter_batch_delay_ms = 1;
        config.batch.backpressure_ceiling_ms = 5;

        let orchestrator = Arc::new(PdcOrchestrator::new(
            dispenses.clone(),
            observations.clone(),
            patients,
            table,
            config.clone(),
        ));
        Harness {
            dispenses: dispenses.clone(),
            observations,
            driver: BatchDriver::new(orchestrator, dispenses, config),
        }
    }

    fn seed_patient(h: &Harness, patient_id: &str) {
        h.dispenses.insert(
            patient_id,
            vec![dispense_fixture(patient_id, date(1, 15), 30.0, LISINOPRIL, "lisinopril")],
        );
    }

    #[tokio::test]
    async fn test_batch_tally_and_isolation() {
        let h = harness();
        seed_patient(&h, "p1");
        seed_patient(&h, "p2");
        seed_patient(&h, "p3");
        h.dispenses.fail_reads_for("p2");

        let result = h
            .driver
            .run_batch(&BatchOptions::new(2025, date(6, 15)))
            .await
            .unwrap();

        assert_eq!(result.total_patients, 3);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("p2"));

        // p1 and p3 still produced observations.
        let stored = h.observations.all();
        assert!(stored.iter().any(|o| o.patient_id == "p1"));
        assert!(stored.iter().any(|o| o.patient_id == "p3"));
    }

    #[tokio::test]
    async fn test_chunking_processes_everyone() {
        let h = harness();
        for id in ["p1", "p2", "p3", "p4", "p5"] {
            seed_patient(&h, id);
        }

        let mut options = BatchOptions::new(2025, date(6, 15));
        options.batch_size = Some(2);

        let seen = Mutex::new(Vec::new());
        let result = h
            .driver
            .run_batch_with_progress(&options, |done, total| {
                seen.lock().unwrap().push((done, total));
            })
            .await
            .unwrap();

        assert_eq!(result.total_patients, 5);
        assert_eq!(result.succeeded, 5);
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last(), Some(&(5, 5)));
    }

    #[tokio::test]
    async fn test_max_patients_caps_discovery() {
        let h = harness();
        for id in ["p1", "p2", "p3"] {
            seed_patient(&h, id);
        }

        let mut options = BatchOptions::new(2025, date(6, 15));
        options.max_patients = Some(2);
        let result = h.driver.run_batch(&options).await.unwrap();
        assert_eq!(result.total_patients, 2);
    }

    #[tokio::test]
    async fn test_backpressure_earns_patient_retry() {
        let h = harness();
        seed_patient(&h, "p1");
        // One failing create: the first orchestration attempt fails with the
        // backpressure marker (single write attempt configured), the batch
        // driver retries the patient, the retry succeeds.
        h.observations.inject_backpressure_failures(1);

        let result = h
            .driver
            .run_batch(&BatchOptions::new(2025, date(6, 15)))
            .await
            .unwrap();

        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn test_dry_run_batch_writes_nothing() {
        let h = harness();
        seed_patient(&h, "p1");

        let mut options = BatchOptions::new(2025, date(6, 15));
        options.dry_run = true;
        let result = h.driver.run_batch(&options).await.unwrap();

        assert_eq!(result.succeeded, 1);
        assert!(h.observations.all().is_empty());
    }

    #[tokio::test]
    async fn test_empty_discovery_is_clean() {
        let h = harness();
        let result = h
            .driver
            .run_batch(&BatchOptions::new(2025, date(6, 15)))
            .await
            .unwrap();
        assert_eq!(result.total_patients, 0);
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.mean_duration_ms, 0.0);
    }
}
