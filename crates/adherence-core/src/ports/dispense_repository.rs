use async_trait::async_trait;

use crate::domain::Dispense;

/// Read-only access to pharmacy dispense records. Dispenses are owned by the
/// ingestion pipeline; the engine never writes them.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DispenseRepository: Send + Sync {
    /// All dispenses for a patient handed over within the measurement year,
    /// regardless of status (the orchestrator filters).
    async fn dispenses_for_patient(
        &self,
        patient_id: &str,
        measurement_year: i32,
    ) -> anyhow::Result<Vec<Dispense>>;

    /// Distinct patients with at least one dispense in the measurement year.
    /// Implementations should use a minimal-field search; this feeds batch
    /// discovery, not calculation.
    async fn patients_with_dispenses(
        &self,
        measurement_year: i32,
        max_patients: Option<usize>,
    ) -> anyhow::Result<Vec<String>>;
}
