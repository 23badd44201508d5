use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};

use crate::domain::{
    Dispense, DispenseStatus, ObservationCode, ObservationDraft, ObservationKey, PatientSummary,
    StoredObservation,
};
use crate::ports::{
    DispenseRepository, ObservationStore, PatientRecord, PatientStore, SummaryWriteOutcome,
};

/// A well-formed completed dispense for tests.
pub fn dispense_fixture(
    patient_id: &str,
    fill_date: NaiveDate,
    days_supply: f64,
    rxnorm: &str,
    display: &str,
) -> Dispense {
    Dispense {
        patient_ref: format!("Patient/{}", patient_id),
        fill_date: Some(fill_date),
        days_supply: Some(days_supply),
        medication_code: Some(rxnorm.to_string()),
        medication_display: Some(display.to_string()),
        status: DispenseStatus::Completed,
        reversal_flag: false,
        refills_remaining: None,
    }
}

// ============================================================================
// Dispense repository
// ============================================================================

#[derive(Default)]
pub struct InMemoryDispenseRepository {
    dispenses: RwLock<HashMap<String, Vec<Dispense>>>,
    failing_patients: RwLock<HashSet<String>>,
}

impl InMemoryDispenseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, patient_id: &str, records: Vec<Dispense>) {
        let mut map = self.dispenses.write().unwrap();
        map.entry(patient_id.to_string()).or_default().extend(records);
    }

    /// Make reads for one patient fail, for isolation tests.
    pub fn fail_reads_for(&self, patient_id: &str) {
        self.failing_patients
            .write()
            .unwrap()
            .insert(patient_id.to_string());
    }
}

#[async_trait]
impl DispenseRepository for InMemoryDispenseRepository {
    async fn dispenses_for_patient(
        &self,
        patient_id: &str,
        measurement_year: i32,
    ) -> anyhow::Result<Vec<Dispense>> {
        if self.failing_patients.read().unwrap().contains(patient_id) {
            anyhow::bail!("simulated dispense read failure for {}", patient_id);
        }
        let map = self.dispenses.read().unwrap();
        Ok(map
            .get(patient_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|d| {
                        d.fill_date
                            .map(|date| date.year() == measurement_year)
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn patients_with_dispenses(
        &self,
        measurement_year: i32,
        max_patients: Option<usize>,
    ) -> anyhow::Result<Vec<String>> {
        let map = self.dispenses.read().unwrap();
        let mut ids: Vec<String> = map
            .iter()
            .filter(|(_, records)| {
                records.iter().any(|d| {
                    d.fill_date
                        .map(|date| date.year() == measurement_year)
                        .unwrap_or(false)
                })
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        if let Some(max) = max_patients {
            ids.truncate(max);
        }
        Ok(ids)
    }
}

// ============================================================================
// Observation store
// ============================================================================

#[derive(Default)]
pub struct InMemoryObservationStore {
    observations: RwLock<Vec<StoredObservation>>,
    next_id: AtomicU64,
    /// When set, creates with this code fail (storage-failure injection).
    failing_code: RwLock<Option<ObservationCode>>,
    /// When > 0, creates fail with a backpressure marker and decrement.
    backpressure_failures: AtomicU32,
}

impl InMemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates_with_code(&self, code: Option<ObservationCode>) {
        *self.failing_code.write().unwrap() = code;
    }

    pub fn inject_backpressure_failures(&self, count: u32) {
        self.backpressure_failures.store(count, Ordering::SeqCst);
    }

    /// Full history, current and superseded.
    pub fn all(&self) -> Vec<StoredObservation> {
        self.observations.read().unwrap().clone()
    }

    pub fn current_count(&self, key: &ObservationKey) -> usize {
        self.observations
            .read()
            .unwrap()
            .iter()
            .filter(|o| o.is_current && &o.key() == key)
            .count()
    }
}

#[async_trait]
impl ObservationStore for InMemoryObservationStore {
    async fn create(&self, draft: ObservationDraft) -> anyhow::Result<StoredObservation> {
        if self.backpressure_failures.load(Ordering::SeqCst) > 0 {
            self.backpressure_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow::Error::new(crate::domain::Backpressure));
        }
        if *self.failing_code.read().unwrap() == Some(draft.code) {
            anyhow::bail!("simulated create failure for {}", draft.code);
        }

        let id = draft.id.clone().unwrap_or_else(|| {
            format!("obs-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        });
        let stored = StoredObservation {
            id,
            patient_id: draft.patient_id,
            code: draft.code,
            measure: draft.measure,
            value: draft.value,
            effective: draft.effective,
            is_current: true,
            fragility_tier: draft.fragility_tier,
            priority_score: draft.priority_score,
            days_until_runout: draft.days_until_runout,
            gap_days_remaining: draft.gap_days_remaining,
            delay_budget: draft.delay_budget,
            treatment_period: draft.treatment_period,
            q4_adjusted: draft.q4_adjusted,
            medication: draft.medication,
            member_observations: draft.member_observations,
        };
        self.observations.write().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn find_current(&self, key: &ObservationKey) -> anyhow::Result<Vec<StoredObservation>> {
        Ok(self
            .observations
            .read()
            .unwrap()
            .iter()
            .filter(|o| o.is_current && &o.key() == key)
            .cloned()
            .collect())
    }

    async fn mark_not_current(&self, observation_id: &str) -> anyhow::Result<()> {
        let mut observations = self.observations.write().unwrap();
        match observations.iter_mut().find(|o| o.id == observation_id) {
            Some(observation) => {
                observation.is_current = false;
                Ok(())
            }
            None => anyhow::bail!("no observation with id {}", observation_id),
        }
    }

    async fn all_current_for_patient(
        &self,
        patient_id: &str,
    ) -> anyhow::Result<Vec<StoredObservation>> {
        Ok(self
            .observations
            .read()
            .unwrap()
            .iter()
            .filter(|o| o.is_current && o.patient_id == patient_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Patient store
// ============================================================================

#[derive(Default)]
pub struct InMemoryPatientStore {
    patients: RwLock<HashMap<String, (u64, Option<PatientSummary>)>>,
    /// Number of upcoming writes to reject with a version conflict.
    conflicts_to_inject: AtomicU32,
}

impl InMemoryPatientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts_to_inject.store(count, Ordering::SeqCst);
    }

    pub fn summary_of(&self, patient_id: &str) -> Option<PatientSummary> {
        self.patients
            .read()
            .unwrap()
            .get(patient_id)
            .and_then(|(_, summary)| summary.clone())
    }

    pub fn version_of(&self, patient_id: &str) -> Option<u64> {
        self.patients
            .read()
            .unwrap()
            .get(patient_id)
            .map(|(version, _)| *version)
    }
}

#[async_trait]
impl PatientStore for InMemoryPatientStore {
    async fn read(&self, patient_id: &str) -> anyhow::Result<PatientRecord> {
        let mut patients = self.patients.write().unwrap();
        let (version, summary) = patients
            .entry(patient_id.to_string())
            .or_insert((1, None))
            .clone();
        Ok(PatientRecord {
            patient_id: patient_id.to_string(),
            version: version.to_string(),
            summary,
        })
    }

    async fn write_summary(
        &self,
        patient_id: &str,
        version: &str,
        summary: &PatientSummary,
    ) -> anyhow::Result<SummaryWriteOutcome> {
        if self.conflicts_to_inject.load(Ordering::SeqCst) > 0 {
            self.conflicts_to_inject.fetch_sub(1, Ordering::SeqCst);
            // Simulate another writer landing first.
            let mut patients = self.patients.write().unwrap();
            let entry = patients.entry(patient_id.to_string()).or_insert((1, None));
            entry.0 += 1;
            return Ok(SummaryWriteOutcome::VersionConflict);
        }

        let mut patients = self.patients.write().unwrap();
        let entry = patients.entry(patient_id.to_string()).or_insert((1, None));
        if entry.0.to_string() != version {
            return Ok(SummaryWriteOutcome::VersionConflict);
        }
        entry.0 += 1;
        entry.1 = Some(summary.clone());
        Ok(SummaryWriteOutcome::Applied)
    }
}
