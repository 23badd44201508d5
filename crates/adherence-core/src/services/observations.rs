//! Observation persistence with the single-current discipline.
//!
//! Store protocol, in order: (1) look up prior currents for the key,
//! (2) create the new observation with `is_current = true`, (3) flip each
//! prior to non-current. Create-new precedes unflag-old so a concurrent
//! reader never sees zero currents; the transient two-current window is
//! resolved on the read side by [`select_current`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::config::EngineConfig;
use crate::domain::{ObservationDraft, ObservationKey, StoredObservation};
use crate::ports::ObservationStore;

/// Resolve a (possibly transiently plural) current set to the authoritative
/// observation: newest effective date wins, ties broken by largest id.
pub fn select_current(mut candidates: Vec<StoredObservation>) -> Option<StoredObservation> {
    candidates.sort_by(|a, b| {
        a.effective
            .cmp(&b.effective)
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates.pop()
}

pub struct ObservationService {
    store: Arc<dyn ObservationStore>,
    config: EngineConfig,
}

impl ObservationService {
    pub fn new(store: Arc<dyn ObservationStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Persist a new observation and supersede the prior current for its
    /// key. Individual store writes are retried on the configured backoff
    /// schedule before giving up.
    pub async fn store_observation(&self, draft: ObservationDraft) -> Result<StoredObservation> {
        let key = draft.key();

        let prior = self
            .store
            .find_current(&key)
            .await
            .context("searching prior current observation")?;

        let created = self
            .with_write_retry("create observation", || self.store.create(draft.clone()))
            .await?;

        for old in prior {
            if old.id == created.id {
                continue;
            }
            self.with_write_retry("unflag prior observation", || {
                self.store.mark_not_current(&old.id)
            })
            .await?;
        }

        Ok(created)
    }

    /// The authoritative current observation for a key, if any.
    pub async fn get_current(&self, key: &ObservationKey) -> Result<Option<StoredObservation>> {
        let candidates = self.store.find_current(key).await?;
        Ok(select_current(candidates))
    }

    pub async fn all_current(&self, patient_id: &str) -> Result<Vec<StoredObservation>> {
        self.store.all_current_for_patient(patient_id).await
    }

    async fn with_write_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let schedule = &self.config.write_retry_backoff_ms;
        let attempts = schedule.len().max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(what, attempt = attempt + 1, error = %err, "store write failed");
                    last_err = Some(err);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_millis(schedule[attempt])).await;
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("no write attempts configured"))
            .context(format!("{} failed after {} attempts", what, attempts)))
    }
}
