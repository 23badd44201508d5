use async_trait::async_trait;

use crate::domain::{ObservationDraft, ObservationKey, StoredObservation};

/// Persistence for adherence observations. The engine is the only writer;
/// observations are append-only plus current-flag flips, never deleted.
///
/// Implementations do not enforce the single-current invariant themselves;
/// the observation service layers the create-then-unflag protocol on top.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Create a new observation with `is_current = true`. When the draft
    /// carries an id the store must honor it (measure-level ids are
    /// pre-generated so children can reference their parent).
    async fn create(&self, draft: ObservationDraft) -> anyhow::Result<StoredObservation>;

    /// All observations currently flagged current for a key. May transiently
    /// return more than one during a concurrent store; callers resolve by
    /// newest effective date, then largest id.
    async fn find_current(&self, key: &ObservationKey) -> anyhow::Result<Vec<StoredObservation>>;

    /// Flip a single observation to non-current, preserving it as history.
    async fn mark_not_current(&self, observation_id: &str) -> anyhow::Result<()>;

    /// Every current observation for a patient across all codes and
    /// measures. Feeds the denormalized patient summary.
    async fn all_current_for_patient(
        &self,
        patient_id: &str,
    ) -> anyhow::Result<Vec<StoredObservation>>;
}
