use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ===== Medication Adherence Measures =====

/// The three HEDIS medication adherence measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measure {
    /// Medication Adherence for Cholesterol (statins)
    #[serde(rename = "MAC")]
    Mac,
    /// Medication Adherence for Diabetes
    #[serde(rename = "MAD")]
    Mad,
    /// Medication Adherence for Hypertension (RAS antagonists)
    #[serde(rename = "MAH")]
    Mah,
}

impl Measure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Measure::Mac => "MAC",
            Measure::Mad => "MAD",
            Measure::Mah => "MAH",
        }
    }

    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        match s {
            "MAC" => Ok(Measure::Mac),
            "MAD" => Ok(Measure::Mad),
            "MAH" => Ok(Measure::Mah),
            _ => Err(format!("Unknown MA measure: {}", s)),
        }
    }

    /// Observation code used when persisting measure-level results.
    pub fn observation_code(&self) -> ObservationCode {
        match self {
            Measure::Mac => ObservationCode::PdcMac,
            Measure::Mad => ObservationCode::PdcMad,
            Measure::Mah => ObservationCode::PdcMah,
        }
    }

    pub const ALL: [Measure; 3] = [Measure::Mac, Measure::Mad, Measure::Mah];
}

impl std::fmt::Display for Measure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ===== Dispense Input Model =====

/// Dispense status as understood by the engine. Anything that is not a
/// completed hand-over is excluded from calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispenseStatus {
    Completed,
    Reversed,
    Other,
}

impl DispenseStatus {
    /// Map a raw FHIR MedicationDispense.status to the engine's view.
    pub fn from_fhir(status: &str) -> Self {
        match status {
            "completed" => DispenseStatus::Completed,
            "entered-in-error" | "cancelled" | "declined" | "stopped" => DispenseStatus::Reversed,
            _ => DispenseStatus::Other,
        }
    }
}

/// A raw pharmacy dispense record, read-only input to the engine.
///
/// Fields are optional where the source system may omit them; the
/// orchestrator drops unusable records with a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispense {
    pub patient_ref: String,
    pub fill_date: Option<NaiveDate>,
    pub days_supply: Option<f64>,
    pub medication_code: Option<String>,
    pub medication_display: Option<String>,
    pub status: DispenseStatus,
    pub reversal_flag: bool,
    /// Refills remaining on the prescription at hand-over time, when the
    /// source system publishes it (namespaced extension).
    pub refills_remaining: Option<u32>,
}

/// A validated fill: coverage interval is `[fill_date, fill_date + days_supply)`,
/// half-open so the terminal day is excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    pub fill_date: NaiveDate,
    pub days_supply: i64,
}

impl FillRecord {
    pub fn new(fill_date: NaiveDate, days_supply: i64) -> Self {
        Self {
            fill_date,
            days_supply,
        }
    }

    /// Exclusive end of the coverage interval.
    pub fn coverage_end(&self) -> NaiveDate {
        self.fill_date + chrono::Duration::days(self.days_supply)
    }
}

// ===== PDC Result =====

/// Treatment period: first fill through Dec 31 of the measurement year,
/// both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TreatmentPeriod {
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Output of the PDC calculator for one fill set.
///
/// Invariants: `covered_days <= treatment_days`,
/// `gap_days_used + covered_days = treatment_days`,
/// `gap_days_remaining = gap_days_allowed - gap_days_used` (may be negative),
/// `pdc_status_quo <= pdc_perfect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdcResult {
    pub pdc: f64,
    pub covered_days: i64,
    pub treatment_days: i64,
    pub gap_days_used: i64,
    pub gap_days_allowed: i64,
    pub gap_days_remaining: i64,
    /// Projected year-end PDC assuming no further refills: the merge already
    /// extends on-hand supply to exhaustion, so this equals `pdc`.
    pub pdc_status_quo: f64,
    /// Projected year-end PDC assuming continuous coverage from the current
    /// date onward.
    pub pdc_perfect: f64,
    pub treatment_period: Option<TreatmentPeriod>,
}

impl PdcResult {
    /// The "no data" result: no fills means no treatment period, and the
    /// orchestrator emits no observation for the measure.
    pub fn empty() -> Self {
        Self {
            pdc: 0.0,
            covered_days: 0,
            treatment_days: 0,
            gap_days_used: 0,
            gap_days_allowed: 0,
            gap_days_remaining: 0,
            pdc_status_quo: 0.0,
            pdc_perfect: 0.0,
            treatment_period: None,
        }
    }

    pub fn has_treatment_period(&self) -> bool {
        self.treatment_period.is_some() && self.treatment_days > 0
    }
}

// ===== Fragility Classification =====

/// Risk stratification tier. Exactly one tier per classification call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragilityTier {
    #[serde(rename = "COMPLIANT")]
    Compliant,
    #[serde(rename = "F1_IMMINENT")]
    F1Imminent,
    #[serde(rename = "F2_FRAGILE")]
    F2Fragile,
    #[serde(rename = "F3_MODERATE")]
    F3Moderate,
    #[serde(rename = "F4_COMFORTABLE")]
    F4Comfortable,
    #[serde(rename = "F5_SAFE")]
    F5Safe,
    #[serde(rename = "T5_UNSALVAGEABLE")]
    T5Unsalvageable,
}

impl FragilityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FragilityTier::Compliant => "COMPLIANT",
            FragilityTier::F1Imminent => "F1_IMMINENT",
            FragilityTier::F2Fragile => "F2_FRAGILE",
            FragilityTier::F3Moderate => "F3_MODERATE",
            FragilityTier::F4Comfortable => "F4_COMFORTABLE",
            FragilityTier::F5Safe => "F5_SAFE",
            FragilityTier::T5Unsalvageable => "T5_UNSALVAGEABLE",
        }
    }

    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        match s {
            "COMPLIANT" => Ok(FragilityTier::Compliant),
            "F1_IMMINENT" => Ok(FragilityTier::F1Imminent),
            "F2_FRAGILE" => Ok(FragilityTier::F2Fragile),
            "F3_MODERATE" => Ok(FragilityTier::F3Moderate),
            "F4_COMFORTABLE" => Ok(FragilityTier::F4Comfortable),
            "F5_SAFE" => Ok(FragilityTier::F5Safe),
            "T5_UNSALVAGEABLE" => Ok(FragilityTier::T5Unsalvageable),
            _ => Err(format!("Unknown fragility tier: {}", s)),
        }
    }

    /// Severity rank for worst-tier aggregation; lower is more severe.
    ///
    /// F1 indicates active imminent risk; T5 is lost but not actionable,
    /// so it sits between F5 and COMPLIANT.
    pub fn severity_rank(&self) -> u8 {
        match self {
            FragilityTier::F1Imminent => 0,
            FragilityTier::F2Fragile => 1,
            FragilityTier::F3Moderate => 2,
            FragilityTier::F4Comfortable => 3,
            FragilityTier::F5Safe => 4,
            FragilityTier::T5Unsalvageable => 5,
            FragilityTier::Compliant => 6,
        }
    }

    /// Recommended outreach window for the tier.
    pub fn contact_window(&self) -> &'static str {
        match self {
            FragilityTier::F1Imminent => "24-48 hours",
            FragilityTier::F2Fragile => "within 1 week",
            FragilityTier::F3Moderate => "within 2 weeks",
            FragilityTier::F4Comfortable => "within 30 days",
            FragilityTier::F5Safe => "routine",
            FragilityTier::Compliant => "routine monitoring",
            FragilityTier::T5Unsalvageable => "care planning",
        }
    }
}

impl std::fmt::Display for FragilityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UrgencyLevel {
    Extreme,
    High,
    Moderate,
    Low,
}

impl UrgencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrgencyLevel::Extreme => "EXTREME",
            UrgencyLevel::High => "HIGH",
            UrgencyLevel::Moderate => "MODERATE",
            UrgencyLevel::Low => "LOW",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragilityFlags {
    pub is_compliant: bool,
    pub is_unsalvageable: bool,
    pub q4_tightened: bool,
}

/// Individual priority bonuses, kept separate so the stored observation can
/// explain how the score was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityBonuses {
    pub out_of_meds: u32,
    pub q4: u32,
    pub multi_measure: u32,
    pub new_patient: u32,
}

impl PriorityBonuses {
    pub fn total(&self) -> u32 {
        self.out_of_meds + self.q4 + self.multi_measure + self.new_patient
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragilityResult {
    pub tier: FragilityTier,
    pub priority_score: u32,
    pub urgency: UrgencyLevel,
    pub delay_budget_per_refill: f64,
    pub contact_window: String,
    pub flags: FragilityFlags,
    pub bonuses: PriorityBonuses,
}

// ===== Refill Projection =====

/// Per-medication operational supply metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationProjection {
    pub rxnorm: String,
    pub display: String,
    pub remaining_refills: u32,
    /// Days of medication on hand as of the current date (never negative).
    pub supply_on_hand: i64,
    /// Median days-supply across fills; resists single outlier fills.
    pub estimated_days_per_refill: f64,
    /// Days the rest of the period exceeds projected supply (never negative).
    pub coverage_shortfall: i64,
    /// Signed: positive days of supply left, negative days since runout.
    pub days_until_runout: i64,
    pub last_fill_date: NaiveDate,
}

// ===== Stored Observations =====

/// Observation codes persisted to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservationCode {
    #[serde(rename = "pdc-mac")]
    PdcMac,
    #[serde(rename = "pdc-mad")]
    PdcMad,
    #[serde(rename = "pdc-mah")]
    PdcMah,
    #[serde(rename = "pdc-medication")]
    PdcMedication,
}

impl ObservationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationCode::PdcMac => "pdc-mac",
            ObservationCode::PdcMad => "pdc-mad",
            ObservationCode::PdcMah => "pdc-mah",
            ObservationCode::PdcMedication => "pdc-medication",
        }
    }

    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        match s {
            "pdc-mac" => Ok(ObservationCode::PdcMac),
            "pdc-mad" => Ok(ObservationCode::PdcMad),
            "pdc-mah" => Ok(ObservationCode::PdcMah),
            "pdc-medication" => Ok(ObservationCode::PdcMedication),
            _ => Err(format!("Unknown observation code: {}", s)),
        }
    }
}

impl std::fmt::Display for ObservationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Medication-level payload carried only by `pdc-medication` observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationDetail {
    pub rxnorm: String,
    pub display: String,
    pub remaining_refills: u32,
    pub supply_on_hand: i64,
    pub coverage_shortfall: i64,
    pub estimated_days_per_refill: f64,
    /// Reference to the measure-level observation this one rolls up into.
    pub parent_measure_observation: Option<String>,
}

/// Identity of an observation series: at most one member of the series is
/// current at any instant (single-current invariant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationKey {
    pub patient_id: String,
    pub code: ObservationCode,
    pub measure: Option<Measure>,
    pub medication_rxnorm: Option<String>,
}

/// An observation as it should be created in the store. The id is assigned
/// by the store unless supplied (measure-level ids are pre-generated so the
/// children can reference their parent before it exists).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationDraft {
    pub id: Option<String>,
    pub patient_id: String,
    pub code: ObservationCode,
    pub measure: Option<Measure>,
    /// PDC ratio in [0, 1].
    pub value: f64,
    pub effective: DateTime<Utc>,
    pub fragility_tier: FragilityTier,
    pub priority_score: u32,
    pub days_until_runout: Option<i64>,
    pub gap_days_remaining: i64,
    pub delay_budget: f64,
    pub treatment_period: Option<TreatmentPeriod>,
    pub q4_adjusted: bool,
    pub medication: Option<MedicationDetail>,
    /// Measure-level only: ids of the medication observations rolled up here.
    pub member_observations: Vec<String>,
}

impl ObservationDraft {
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            patient_id: self.patient_id.clone(),
            code: self.code,
            measure: self.measure,
            medication_rxnorm: self.medication.as_ref().map(|m| m.rxnorm.clone()),
        }
    }
}

/// An observation as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObservation {
    pub id: String,
    pub patient_id: String,
    pub code: ObservationCode,
    pub measure: Option<Measure>,
    pub value: f64,
    pub effective: DateTime<Utc>,
    pub is_current: bool,
    pub fragility_tier: FragilityTier,
    pub priority_score: u32,
    pub days_until_runout: Option<i64>,
    pub gap_days_remaining: i64,
    pub delay_budget: f64,
    pub treatment_period: Option<TreatmentPeriod>,
    pub q4_adjusted: bool,
    pub medication: Option<MedicationDetail>,
    pub member_observations: Vec<String>,
}

impl StoredObservation {
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            patient_id: self.patient_id.clone(),
            code: self.code,
            measure: self.measure,
            medication_rxnorm: self.medication.as_ref().map(|m| m.rxnorm.clone()),
        }
    }

    pub fn is_medication_level(&self) -> bool {
        self.code == ObservationCode::PdcMedication
    }
}

// ===== Patient Summary =====

/// Per-measure PDC ratios; absent when the patient has no current
/// observation for that measure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PdcByMeasure {
    pub mac: Option<f64>,
    pub mad: Option<f64>,
    pub mah: Option<f64>,
}

impl PdcByMeasure {
    pub fn set(&mut self, measure: Measure, pdc: f64) {
        match measure {
            Measure::Mac => self.mac = Some(pdc),
            Measure::Mad => self.mad = Some(pdc),
            Measure::Mah => self.mah = Some(pdc),
        }
    }

    pub fn get(&self, measure: Measure) -> Option<f64> {
        match measure {
            Measure::Mac => self.mac,
            Measure::Mad => self.mad,
            Measure::Mah => self.mah,
        }
    }
}

/// Denormalized adherence summary maintained on the Patient resource.
/// Authoritatively derivable from the current observation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientSummary {
    pub worst_tier: Option<FragilityTier>,
    pub highest_priority_score: u32,
    pub days_until_earliest_runout: Option<i64>,
    pub pdc_by_measure: PdcByMeasure,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_roundtrip() {
        for m in Measure::ALL {
            assert_eq!(Measure::parse(m.as_str()), Ok(m));
        }
        assert!(Measure::parse("MAX").is_err());
    }

    #[test]
    fn test_tier_severity_order() {
        // F1 most severe, COMPLIANT least; T5 sits between F5 and COMPLIANT.
        let order = [
            FragilityTier::F1Imminent,
            FragilityTier::F2Fragile,
            FragilityTier::F3Moderate,
            FragilityTier::F4Comfortable,
            FragilityTier::F5Safe,
            FragilityTier::T5Unsalvageable,
            FragilityTier::Compliant,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].severity_rank() < pair[1].severity_rank());
        }
    }

    #[test]
    fn test_dispense_status_mapping() {
        assert_eq!(
            DispenseStatus::from_fhir("completed"),
            DispenseStatus::Completed
        );
        assert_eq!(
            DispenseStatus::from_fhir("entered-in-error"),
            DispenseStatus::Reversed
        );
        assert_eq!(
            DispenseStatus::from_fhir("in-progress"),
            DispenseStatus::Other
        );
    }

    #[test]
    fn test_fill_coverage_end_is_exclusive() {
        let fill = FillRecord::new(NaiveDate::from_ymd_opt(2025, 12, 1).unwrap(), 90);
        assert_eq!(
            fill.coverage_end(),
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
        );
    }

    #[test]
    fn test_treatment_period_days_inclusive() {
        let period = TreatmentPeriod {
            start: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
        };
        assert_eq!(period.days(), 351);
    }

    #[test]
    fn test_observation_key_distinguishes_medication() {
        let base = ObservationKey {
            patient_id: "p1".into(),
            code: ObservationCode::PdcMedication,
            measure: Some(Measure::Mah),
            medication_rxnorm: Some("314076".into()),
        };
        let other = ObservationKey {
            medication_rxnorm: Some("197361".into()),
            ..base.clone()
        };
        assert_ne!(base, other);
    }
}
