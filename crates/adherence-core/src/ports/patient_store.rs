use async_trait::async_trait;

use crate::domain::PatientSummary;

/// A patient as seen by the engine: its optimistic-concurrency version token
/// and the adherence summary currently on the resource. All other patient
/// content is opaque to the engine and preserved verbatim by adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientRecord {
    pub patient_id: String,
    pub version: String,
    pub summary: Option<PatientSummary>,
}

/// Result of a version-conditional summary write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryWriteOutcome {
    Applied,
    /// The version token changed under us; the caller re-reads and retries.
    VersionConflict,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PatientStore: Send + Sync {
    async fn read(&self, patient_id: &str) -> anyhow::Result<PatientRecord>;

    /// Merge the summary extensions into the patient resource, preserving
    /// everything else, conditional on `version` still being current.
    async fn write_summary(
        &self,
        patient_id: &str,
        version: &str,
        summary: &PatientSummary,
    ) -> anyhow::Result<SummaryWriteOutcome>;
}
