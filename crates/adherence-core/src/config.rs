//! Engine configuration.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::domain::FragilityTier;

/// Delay-budget boundaries (days per remaining refill) for the F1-F5 bands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierBoundaries {
    /// Budget at or below this lands in F1_IMMINENT. Default: 2.0
    pub f1_max_days: f64,
    /// Default: 5.0
    pub f2_max_days: f64,
    /// Default: 10.0
    pub f3_max_days: f64,
    /// Budget above this lands in F5_SAFE. Default: 20.0
    pub f4_max_days: f64,
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            f1_max_days: 2.0,
            f2_max_days: 5.0,
            f3_max_days: 10.0,
            f4_max_days: 20.0,
        }
    }
}

/// Base scores per tier and additive bonuses for the priority score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub base_f1: u32,
    pub base_f2: u32,
    pub base_f3: u32,
    pub base_f4: u32,
    pub base_f5: u32,
    /// Added when the patient has run out of medication (runout <= 0 days).
    pub bonus_out_of_meds: u32,
    /// Added during the final quarter of the measurement year.
    pub bonus_q4: u32,
    /// Added when the patient participates in 2+ MA measures.
    pub bonus_multi_measure: u32,
    /// Added when the first fill is within the new-patient window.
    pub bonus_new_patient: u32,
    /// Hard ceiling for the final score.
    pub max_score: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            base_f1: 100,
            base_f2: 80,
            base_f3: 60,
            base_f4: 40,
            base_f5: 20,
            bonus_out_of_meds: 30,
            bonus_q4: 25,
            bonus_multi_measure: 15,
            bonus_new_patient: 10,
            max_score: 200,
        }
    }
}

impl PriorityWeights {
    /// Base score for a tier. COMPLIANT and T5 carry no base and receive no
    /// bonuses: neither is an outreach target.
    pub fn base_for(&self, tier: FragilityTier) -> u32 {
        match tier {
            FragilityTier::F1Imminent => self.base_f1,
            FragilityTier::F2Fragile => self.base_f2,
            FragilityTier::F3Moderate => self.base_f3,
            FragilityTier::F4Comfortable => self.base_f4,
            FragilityTier::F5Safe => self.base_f5,
            FragilityTier::Compliant | FragilityTier::T5Unsalvageable => 0,
        }
    }
}

/// Batch driver knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Patients per chunk; also the bound on intra-chunk concurrency.
    /// Default: 10
    pub batch_size: usize,
    /// Sleep between chunks, respecting downstream rate limits. Default: 100
    pub inter_batch_delay_ms: u64,
    /// Per-patient retries when the store signals backpressure. Default: 3
    pub max_patient_retries: u32,
    /// Ceiling for the exponential backpressure backoff. Default: 30_000
    pub backpressure_ceiling_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            inter_batch_delay_ms: 100,
            max_patient_retries: 3,
            backpressure_ceiling_ms: 30_000,
        }
    }
}

/// All tunables of the adherence engine.
///
/// `current_date` and `measurement_year` are deliberately absent: "now" is
/// injected per run so replays are deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// PDC at or above this is compliant. Default: 0.80 (HEDIS)
    pub compliance_threshold: f64,
    /// Allowed gap days as a fraction of treatment days. Default: 0.20
    pub gap_days_allowed_fraction: f64,
    /// Multiplier applied to the delay budget during Q4. Default: 0.80
    pub q4_tightening_factor: f64,
    pub tier_boundaries: TierBoundaries,
    pub priority: PriorityWeights,
    /// First fill within this many days of "now" marks a new patient.
    /// Default: 90
    pub new_patient_window_days: i64,
    /// Base for every extension URL written to the store.
    pub extension_base_url: String,
    pub batch: BatchConfig,
    /// Backoff schedule for individual observation writes (ms per attempt).
    pub write_retry_backoff_ms: Vec<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compliance_threshold: 0.80,
            gap_days_allowed_fraction: 0.20,
            q4_tightening_factor: 0.80,
            tier_boundaries: TierBoundaries::default(),
            priority: PriorityWeights::default(),
            new_patient_window_days: 90,
            extension_base_url: "https://adherence.example.org/fhir/StructureDefinition"
                .to_string(),
            batch: BatchConfig::default(),
            write_retry_backoff_ms: vec![200, 1000, 5000],
        }
    }
}

impl EngineConfig {
    /// Allowed gap days for a treatment period, floored per HEDIS.
    pub fn gap_days_allowed(&self, treatment_days: i64) -> i64 {
        (treatment_days as f64 * self.gap_days_allowed_fraction).floor() as i64
    }

    /// Whether a date falls in the final quarter of its year.
    pub fn is_q4(&self, date: NaiveDate) -> bool {
        date.month() >= 10
    }

    /// Full URL for a namespaced extension.
    pub fn extension_url(&self, leaf: &str) -> String {
        format!("{}/{}", self.extension_base_url.trim_end_matches('/'), leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_days_allowed_floors() {
        let config = EngineConfig::default();
        assert_eq!(config.gap_days_allowed(351), 70); // 70.2 -> 70
        assert_eq!(config.gap_days_allowed(365), 73);
        assert_eq!(config.gap_days_allowed(0), 0);
    }

    #[test]
    fn test_q4_months() {
        let config = EngineConfig::default();
        assert!(!config.is_q4(NaiveDate::from_ymd_opt(2025, 9, 30).unwrap()));
        assert!(config.is_q4(NaiveDate::from_ymd_opt(2025, 10, 1).unwrap()));
        assert!(config.is_q4(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()));
    }

    #[test]
    fn test_extension_url_join() {
        let mut config = EngineConfig::default();
        config.extension_base_url = "https://x.test/fhir/".to_string();
        assert_eq!(config.extension_url("is-current"), "https://x.test/fhir/is-current");
    }

    #[test]
    fn test_priority_base_zero_for_boundary_tiers() {
        let weights = PriorityWeights::default();
        assert_eq!(weights.base_for(FragilityTier::Compliant), 0);
        assert_eq!(weights.base_for(FragilityTier::T5Unsalvageable), 0);
        assert_eq!(weights.base_for(FragilityTier::F1Imminent), 100);
    }
}
