//! Per-patient calculation and persistence pipeline.
//!
//! One invocation is one unit of work: dispenses in, measure buckets,
//! medication-level then measure-level observations, patient summary last.
//! Errors accumulate in the result; a failing measure never aborts its
//! siblings, and only the initial dispense read can fail the whole patient.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::classification::MaRxnormTable;
use crate::config::EngineConfig;
use crate::domain::{
    is_backpressure, Dispense, DispenseStatus, FillRecord, FragilityResult, Measure,
    MedicationDetail, MedicationProjection, ObservationDraft, PatientSummary, PdcResult,
};
use crate::pdc::{calculate_pdc, classify_fragility, project_medication, FragilityInput};
use crate::ports::DispenseRepository;
use crate::services::{ObservationService, PatientSummaryService};

/// Options for one orchestration run. `current_date` is the injected "now"
/// used by every projection, so replays are deterministic.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub measurement_year: i32,
    pub current_date: NaiveDate,
    pub include_medication_level: bool,
    pub update_patient_extensions: bool,
    pub dry_run: bool,
    /// When set, remaining measures are skipped once the deadline passes.
    pub deadline: Option<Instant>,
}

impl RunOptions {
    pub fn new(measurement_year: i32, current_date: NaiveDate) -> Self {
        Self {
            measurement_year,
            current_date,
            include_medication_level: true,
            update_patient_extensions: true,
            dry_run: false,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MedicationResult {
    pub projection: MedicationProjection,
    pub pdc: PdcResult,
    pub fragility: FragilityResult,
    pub observation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeasureResult {
    pub measure: Measure,
    pub pdc: PdcResult,
    pub fragility: FragilityResult,
    pub medications: Vec<MedicationResult>,
    pub observation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorResult {
    pub patient_id: String,
    pub measurement_year: i32,
    pub calculated_at: DateTime<Utc>,
    pub measures: Vec<MeasureResult>,
    pub summary: Option<PatientSummary>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Dispenses with a valid RxNorm code absent from the MA table
    /// (telemetry, not an error).
    pub unclassified_medications: usize,
    pub timed_out: bool,
    /// Whether any failure was store backpressure; drives batch retry.
    #[serde(skip)]
    pub backpressure: bool,
}

impl OrchestratorResult {
    fn new(patient_id: &str, measurement_year: i32, calculated_at: DateTime<Utc>) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            measurement_year,
            calculated_at,
            measures: Vec::new(),
            summary: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            unclassified_medications: 0,
            timed_out: false,
            backpressure: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty() && !self.timed_out
    }
}

/// Fills for one medication within one measure bucket, accumulated while
/// walking the dispense list.
struct MedicationGroup {
    rxnorm: String,
    display: String,
    fills: Vec<FillRecord>,
    refills_remaining: Option<u32>,
    refills_as_of: Option<NaiveDate>,
}

pub struct PdcOrchestrator {
    dispenses: Arc<dyn DispenseRepository>,
    observations: ObservationService,
    summaries: PatientSummaryService,
    table: Arc<MaRxnormTable>,
    config: EngineConfig,
}

impl PdcOrchestrator {
    pub fn new(
        dispenses: Arc<dyn DispenseRepository>,
        observation_store: Arc<dyn crate::ports::ObservationStore>,
        patient_store: Arc<dyn crate::ports::PatientStore>,
        table: Arc<MaRxnormTable>,
        config: EngineConfig,
    ) -> Self {
        Self {
            dispenses,
            observations: ObservationService::new(observation_store.clone(), config.clone()),
            summaries: PatientSummaryService::new(observation_store, patient_store),
            table,
            config,
        }
    }

    /// Run the full pipeline for one patient. Never returns `Err`: every
    /// failure lands in the result's error list.
    #[instrument(skip(self, options), fields(year = options.measurement_year))]
    pub async fn calculate_and_store(
        &self,
        patient_id: &str,
        options: &RunOptions,
    ) -> OrchestratorResult {
        let calculated_at = Utc::now();
        let mut result = OrchestratorResult::new(patient_id, options.measurement_year, calculated_at);

        let dispenses = match self
            .dispenses
            .dispenses_for_patient(patient_id, options.measurement_year)
            .await
        {
            Ok(records) => records,
            Err(err) => {
                if is_backpressure(&err) {
                    result.backpressure = true;
                }
                result
                    .errors
                    .push(format!("failed to read dispenses: {:#}", err));
                return result;
            }
        };

        let buckets = self.build_measure_buckets(dispenses, &mut result);
        let participating: Vec<Measure> = Measure::ALL
            .into_iter()
            .filter(|m| buckets.contains_key(m))
            .collect();
        let measure_count = participating.len();

        let earliest_fill = buckets
            .values()
            .flat_map(|groups| groups.iter())
            .flat_map(|g| g.fills.iter())
            .map(|f| f.fill_date)
            .min();
        let is_new_patient = earliest_fill
            .map(|first| {
                let age = (options.current_date - first).num_days();
                (0..=self.config.new_patient_window_days).contains(&age)
            })
            .unwrap_or(false);

        for measure in participating {
            if let Some(deadline) = options.deadline {
                if Instant::now() >= deadline {
                    result.timed_out = true;
                    result.errors.push(format!(
                        "timed out before {}; remaining measures skipped",
                        measure
                    ));
                    break;
                }
            }

            let groups = &buckets[&measure];
            self.process_measure(
                patient_id,
                measure,
                groups,
                measure_count,
                is_new_patient,
                options,
                &mut result,
            )
            .await;
        }

        if options.update_patient_extensions && !options.dry_run && !result.timed_out {
            match self.summaries.refresh(patient_id, calculated_at).await {
                Ok(summary) => result.summary = Some(summary),
                Err(err) => {
                    if is_backpressure(&err) {
                        result.backpressure = true;
                    }
                    // Denormalization only; observations stand and the next
                    // run rebuilds the summary.
                    result
                        .errors
                        .push(format!("patient summary update failed: {:#}", err));
                }
            }
        }

        info!(
            measures = result.measures.len(),
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "orchestration finished"
        );
        result
    }

    /// Filter and validate raw dispenses into per-measure, per-medication
    /// fill groups. Invalid records are dropped with a warning; unclassified
    /// medications are counted for telemetry.
    fn build_measure_buckets(
        &self,
        dispenses: Vec<Dispense>,
        result: &mut OrchestratorResult,
    ) -> HashMap<Measure, Vec<MedicationGroup>> {
        let mut by_measure: HashMap<Measure, HashMap<String, MedicationGroup>> = HashMap::new();

        for dispense in dispenses {
            if dispense.status != DispenseStatus::Completed || dispense.reversal_flag {
                debug!(status = ?dispense.status, "excluding non-completed dispense");
                continue;
            }

            let Some(fill_date) = dispense.fill_date else {
                result
                    .warnings
                    .push("dispense missing fill date; dropped".to_string());
                continue;
            };

            let Some(raw_supply) = dispense.days_supply else {
                result.warnings.push(format!(
                    "dispense on {} missing days supply; dropped",
                    fill_date
                ));
                continue;
            };
            if raw_supply <= 0.0 || raw_supply.fract() != 0.0 {
                result.warnings.push(format!(
                    "dispense on {} has invalid days supply {}; dropped",
                    fill_date, raw_supply
                ));
                continue;
            }

            let Some(rxnorm) = dispense.medication_code.clone() else {
                result.warnings.push(format!(
                    "dispense on {} missing RxNorm code; dropped",
                    fill_date
                ));
                continue;
            };

            let Some(measure) = self.table.classify(&rxnorm) else {
                debug!(rxnorm, "medication not in MA classification table");
                result.unclassified_medications += 1;
                continue;
            };

            let group = by_measure
                .entry(measure)
                .or_default()
                .entry(rxnorm.clone())
                .or_insert_with(|| MedicationGroup {
                    rxnorm: rxnorm.clone(),
                    display: dispense
                        .medication_display
                        .clone()
                        .unwrap_or_else(|| rxnorm.clone()),
                    fills: Vec::new(),
                    refills_remaining: None,
                    refills_as_of: None,
                });

            group.fills.push(FillRecord::new(fill_date, raw_supply as i64));

            // Refills-remaining reflects the latest hand-over that carried it.
            if dispense.refills_remaining.is_some()
                && group.refills_as_of.map(|d| fill_date >= d).unwrap_or(true)
            {
                group.refills_remaining = dispense.refills_remaining;
                group.refills_as_of = Some(fill_date);
            }
        }

        by_measure
            .into_iter()
            .map(|(measure, groups)| {
                let mut groups: Vec<MedicationGroup> = groups.into_values().collect();
                groups.sort_by(|a, b| a.rxnorm.cmp(&b.rxnorm));
                (measure, groups)
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_measure(
        &self,
        patient_id: &str,
        measure: Measure,
        groups: &[MedicationGroup],
        measure_count: usize,
        is_new_patient: bool,
        options: &RunOptions,
        result: &mut OrchestratorResult,
    ) {
        let all_fills: Vec<FillRecord> = groups.iter().flat_map(|g| g.fills.clone()).collect();
        let measure_pdc = calculate_pdc(
            &all_fills,
            options.measurement_year,
            options.current_date,
            &self.config,
        );
        if !measure_pdc.has_treatment_period() {
            debug!(%measure, "no treatment period; emitting nothing");
            return;
        }
        // Period end is present whenever a treatment period exists.
        let treatment_end = match measure_pdc.treatment_period {
            Some(period) => period.end,
            None => return,
        };

        // The measure-level id is assigned before any write so children can
        // reference their parent and the parent can list its members, while
        // the children are still written first.
        let measure_observation_id = Uuid::new_v4().to_string();

        let mut medications = Vec::new();
        let mut member_ids = Vec::new();
        let mut total_refills: u32 = 0;
        let mut earliest_runout: Option<i64> = None;

        for group in groups {
            let med_pdc = calculate_pdc(
                &group.fills,
                options.measurement_year,
                options.current_date,
                &self.config,
            );
            if !med_pdc.has_treatment_period() {
                continue;
            }
            let Some(projection) = project_medication(
                &group.rxnorm,
                &group.display,
                &group.fills,
                options.current_date,
                group.refills_remaining,
                treatment_end,
            ) else {
                continue;
            };

            total_refills = total_refills.saturating_add(projection.remaining_refills);
            earliest_runout = Some(match earliest_runout {
                Some(days) => days.min(projection.days_until_runout),
                None => projection.days_until_runout,
            });

            let fragility = classify_fragility(
                &med_pdc,
                &FragilityInput {
                    refills_remaining: projection.remaining_refills,
                    measure_count,
                    is_new_patient,
                    current_date: options.current_date,
                    days_until_runout: Some(projection.days_until_runout),
                },
                &self.config,
            );

            let observation_id = if options.include_medication_level && !options.dry_run {
                let draft = self.medication_draft(
                    patient_id,
                    measure,
                    &projection,
                    &med_pdc,
                    &fragility,
                    &measure_observation_id,
                    result.calculated_at,
                );
                match self.observations.store_observation(draft).await {
                    Ok(stored) => {
                        member_ids.push(stored.id.clone());
                        Some(stored.id)
                    }
                    Err(err) => {
                        if is_backpressure(&err) {
                            result.backpressure = true;
                        }
                        result.errors.push(format!(
                            "{}/{}: medication observation write failed: {:#}",
                            measure, group.rxnorm, err
                        ));
                        None
                    }
                }
            } else {
                None
            };

            medications.push(MedicationResult {
                projection,
                pdc: med_pdc,
                fragility,
                observation_id,
            });
        }

        let measure_fragility = classify_fragility(
            &measure_pdc,
            &FragilityInput {
                refills_remaining: total_refills,
                measure_count,
                is_new_patient,
                current_date: options.current_date,
                days_until_runout: earliest_runout,
            },
            &self.config,
        );

        let observation_id = if options.dry_run {
            None
        } else {
            let draft = ObservationDraft {
                id: Some(measure_observation_id),
                patient_id: patient_id.to_string(),
                code: measure.observation_code(),
                measure: Some(measure),
                value: measure_pdc.pdc,
                effective: result.calculated_at,
                fragility_tier: measure_fragility.tier,
                priority_score: measure_fragility.priority_score,
                days_until_runout: earliest_runout,
                gap_days_remaining: measure_pdc.gap_days_remaining,
                delay_budget: measure_fragility.delay_budget_per_refill,
                treatment_period: measure_pdc.treatment_period,
                q4_adjusted: measure_fragility.flags.q4_tightened,
                medication: None,
                member_observations: member_ids,
            };
            match self.observations.store_observation(draft).await {
                Ok(stored) => Some(stored.id),
                Err(err) => {
                    if is_backpressure(&err) {
                        result.backpressure = true;
                    }
                    result.errors.push(format!(
                        "{}: measure observation write failed: {:#}",
                        measure, err
                    ));
                    None
                }
            }
        };

        result.measures.push(MeasureResult {
            measure,
            pdc: measure_pdc,
            fragility: measure_fragility,
            medications,
            observation_id,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn medication_draft(
        &self,
        patient_id: &str,
        measure: Measure,
        projection: &MedicationProjection,
        pdc: &PdcResult,
        fragility: &FragilityResult,
        parent_observation_id: &str,
        effective: DateTime<Utc>,
    ) -> ObservationDraft {
        ObservationDraft {
            id: None,
            patient_id: patient_id.to_string(),
            code: crate::domain::ObservationCode::PdcMedication,
            measure: Some(measure),
            value: pdc.pdc,
            effective,
            fragility_tier: fragility.tier,
            priority_score: fragility.priority_score,
            days_until_runout: Some(projection.days_until_runout),
            gap_days_remaining: pdc.gap_days_remaining,
            delay_budget: fragility.delay_budget_per_refill,
            treatment_period: pdc.treatment_period,
            q4_adjusted: fragility.flags.q4_tightened,
            medication: Some(MedicationDetail {
                rxnorm: projection.rxnorm.clone(),
                display: projection.display.clone(),
                remaining_refills: projection.remaining_refills,
                supply_on_hand: projection.supply_on_hand,
                coverage_shortfall: projection.coverage_shortfall,
                estimated_days_per_refill: projection.estimated_days_per_refill,
                parent_measure_observation: Some(parent_observation_id.to_string()),
            }),
            member_observations: vec![],
        }
    }
}
