//! Denormalized patient summary maintenance.
//!
//! The summary duplicates information computable from the current
//! observation set; it exists for query performance and is always rebuilt
//! from currents, so drift is recoverable.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::domain::{EngineError, PatientSummary, PdcByMeasure, StoredObservation};
use crate::ports::{ObservationStore, PatientStore, SummaryWriteOutcome};

const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// Aggregate the current observation set into a summary.
///
/// Worst tier uses severity order F1 > F2 > F3 > F4 > F5 > T5 > COMPLIANT;
/// earliest runout prefers medication-level observations and falls back to
/// the measure-level rollup.
pub fn compute_summary(currents: &[StoredObservation], now: DateTime<Utc>) -> PatientSummary {
    let measure_level = currents.iter().filter(|o| !o.is_medication_level());
    let medication_level: Vec<&StoredObservation> =
        currents.iter().filter(|o| o.is_medication_level()).collect();

    let mut worst_tier = None;
    let mut highest_priority_score = 0;
    let mut pdc_by_measure = PdcByMeasure::default();
    let mut measure_runouts = Vec::new();

    for observation in measure_level {
        let tier = observation.fragility_tier;
        worst_tier = match worst_tier {
            None => Some(tier),
            Some(current) if tier.severity_rank() < current.severity_rank() => Some(tier),
            keep => keep,
        };
        highest_priority_score = highest_priority_score.max(observation.priority_score);
        if let Some(measure) = observation.measure {
            pdc_by_measure.set(measure, observation.value);
        }
        if let Some(days) = observation.days_until_runout {
            measure_runouts.push(days);
        }
    }

    let days_until_earliest_runout = if medication_level.is_empty() {
        measure_runouts.into_iter().min()
    } else {
        medication_level
            .iter()
            .filter_map(|o| o.days_until_runout)
            .min()
    };

    PatientSummary {
        worst_tier,
        highest_priority_score,
        days_until_earliest_runout,
        pdc_by_measure,
        last_updated: now,
    }
}

pub struct PatientSummaryService {
    observations: Arc<dyn ObservationStore>,
    patients: Arc<dyn PatientStore>,
}

impl PatientSummaryService {
    pub fn new(observations: Arc<dyn ObservationStore>, patients: Arc<dyn PatientStore>) -> Self {
        Self {
            observations,
            patients,
        }
    }

    /// Rebuild the summary from currents and write it with optimistic
    /// concurrency. On a version conflict the whole cycle repeats with a
    /// fresh read of both currents and patient, up to 3 attempts.
    pub async fn refresh(&self, patient_id: &str, now: DateTime<Utc>) -> Result<PatientSummary> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let currents = self.observations.all_current_for_patient(patient_id).await?;
            let summary = compute_summary(&currents, now);
            let record = self.patients.read(patient_id).await?;

            match self
                .patients
                .write_summary(patient_id, &record.version, &summary)
                .await?
            {
                SummaryWriteOutcome::Applied => return Ok(summary),
                SummaryWriteOutcome::VersionConflict => {
                    warn!(
                        patient_id,
                        attempt, "patient summary write conflicted; retrying with fresh read"
                    );
                }
            }
        }

        Err(EngineError::SummaryConflict {
            attempts: MAX_UPDATE_ATTEMPTS,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        FragilityTier, Measure, MedicationDetail, ObservationCode, StoredObservation,
    };
    use crate::testing::{InMemoryObservationStore, InMemoryPatientStore};
    use chrono::TimeZone;

    fn observation(
        id: &str,
        code: ObservationCode,
        measure: Option<Measure>,
        tier: FragilityTier,
        score: u32,
        runout: Option<i64>,
    ) -> StoredObservation {
        StoredObservation {
            id: id.to_string(),
            patient_id: "p1".to_string(),
            code,
            measure,
            value: 0.6,
            effective: Utc.with_ymd_and_hms(2025, 6, 15, 2, 0, 0).unwrap(),
            is_current: true,
            fragility_tier: tier,
            priority_score: score,
            days_until_runout: runout,
            gap_days_remaining: 0,
            delay_budget: 0.0,
            treatment_period: None,
            q4_adjusted: false,
            medication: (code == ObservationCode::PdcMedication).then(|| MedicationDetail {
                rxnorm: id.to_string(),
                display: "med".to_string(),
                remaining_refills: 1,
                supply_on_hand: 5,
                coverage_shortfall: 0,
                estimated_days_per_refill: 30.0,
                parent_measure_observation: None,
            }),
            member_observations: vec![],
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 2, 30, 0).unwrap()
    }

    #[test]
    fn test_worst_tier_prefers_actionable_over_lost() {
        let currents = vec![
            observation(
                "a",
                ObservationCode::PdcMac,
                Some(Measure::Mac),
                FragilityTier::T5Unsalvageable,
                0,
                None,
            ),
            observation(
                "b",
                ObservationCode::PdcMah,
                Some(Measure::Mah),
                FragilityTier::F4Comfortable,
                40,
                None,
            ),
        ];
        let summary = compute_summary(&currents, now());
        assert_eq!(summary.worst_tier, Some(FragilityTier::F4Comfortable));
        assert_eq!(summary.highest_priority_score, 40);
    }

    #[test]
    fn test_earliest_runout_from_medication_level() {
        let currents = vec![
            observation(
                "measure",
                ObservationCode::PdcMah,
                Some(Measure::Mah),
                FragilityTier::F2Fragile,
                80,
                Some(9),
            ),
            observation(
                "med-a",
                ObservationCode::PdcMedication,
                Some(Measure::Mah),
                FragilityTier::F2Fragile,
                80,
                Some(14),
            ),
            observation(
                "med-b",
                ObservationCode::PdcMedication,
                Some(Measure::Mah),
                FragilityTier::F3Moderate,
                60,
                Some(-3),
            ),
        ];
        let summary = compute_summary(&currents, now());
        assert_eq!(summary.days_until_earliest_runout, Some(-3));
    }

    #[test]
    fn test_pdc_by_measure_absent_without_observation() {
        let currents = vec![observation(
            "a",
            ObservationCode::PdcMad,
            Some(Measure::Mad),
            FragilityTier::F3Moderate,
            60,
            None,
        )];
        let summary = compute_summary(&currents, now());
        assert!(summary.pdc_by_measure.mad.is_some());
        assert!(summary.pdc_by_measure.mac.is_none());
        assert!(summary.pdc_by_measure.mah.is_none());
    }

    #[test]
    fn test_empty_currents_yield_empty_summary() {
        let summary = compute_summary(&[], now());
        assert_eq!(summary.worst_tier, None);
        assert_eq!(summary.highest_priority_score, 0);
        assert_eq!(summary.days_until_earliest_runout, None);
    }

    #[tokio::test]
    async fn test_refresh_writes_summary() {
        let observations = Arc::new(InMemoryObservationStore::new());
        let patients = Arc::new(InMemoryPatientStore::new());
        observations
            .create(crate::domain::ObservationDraft {
                id: Some("m1".to_string()),
                patient_id: "p1".to_string(),
                code: ObservationCode::PdcMah,
                measure: Some(Measure::Mah),
                value: 0.7,
                effective: now(),
                fragility_tier: FragilityTier::F2Fragile,
                priority_score: 80,
                days_until_runout: Some(5),
                gap_days_remaining: 10,
                delay_budget: 5.0,
                treatment_period: None,
                q4_adjusted: false,
                medication: None,
                member_observations: vec![],
            })
            .await
            .unwrap();

        let service = PatientSummaryService::new(observations, patients.clone());
        let summary = service.refresh("p1", now()).await.unwrap();

        assert_eq!(summary.worst_tier, Some(FragilityTier::F2Fragile));
        assert_eq!(patients.summary_of("p1"), Some(summary));
    }

    #[tokio::test]
    async fn test_refresh_retries_through_conflicts() {
        // Scenario: a concurrent run bumps the version twice; the third
        // attempt lands.
        let observations = Arc::new(InMemoryObservationStore::new());
        let patients = Arc::new(InMemoryPatientStore::new());
        patients.inject_conflicts(2);

        let service = PatientSummaryService::new(observations, patients.clone());
        let summary = service.refresh("p1", now()).await;
        assert!(summary.is_ok());
        assert!(patients.summary_of("p1").is_some());
    }

    #[tokio::test]
    async fn test_refresh_gives_up_after_three_conflicts() {
        let observations = Arc::new(InMemoryObservationStore::new());
        let patients = Arc::new(InMemoryPatientStore::new());
        patients.inject_conflicts(5);

        let service = PatientSummaryService::new(observations, patients);
        let err = service.refresh("p1", now()).await.unwrap_err();
        assert!(err.to_string().contains("conflicted"));
    }
}
