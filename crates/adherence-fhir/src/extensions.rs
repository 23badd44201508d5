//! Leaf names of the namespaced extensions written by the engine. Full URLs
//! come from `EngineConfig::extension_url`, never hard-coded.

pub const IS_CURRENT: &str = "is-current";
pub const MA_MEASURE: &str = "ma-measure";
pub const FRAGILITY_TIER: &str = "fragility-tier";
pub const PRIORITY_SCORE: &str = "priority-score";
pub const DAYS_UNTIL_RUNOUT: &str = "days-until-runout";
pub const GAP_DAYS_REMAINING: &str = "gap-days-remaining";
pub const DELAY_BUDGET: &str = "delay-budget";
pub const TREATMENT_PERIOD: &str = "treatment-period";
pub const Q4_ADJUSTED: &str = "q4-adjusted";

pub const MEDICATION_RXNORM: &str = "medication-rxnorm";
pub const MEDICATION_DISPLAY: &str = "medication-display";
pub const REMAINING_REFILLS: &str = "remaining-refills";
pub const SUPPLY_ON_HAND: &str = "supply-on-hand";
pub const COVERAGE_SHORTFALL: &str = "coverage-shortfall";
pub const ESTIMATED_DAYS_PER_REFILL: &str = "estimated-days-per-refill";
pub const PARENT_MEASURE_OBSERVATION: &str = "parent-measure-observation";

pub const REFILLS_REMAINING: &str = "refills-remaining";
pub const REVERSAL_FLAG: &str = "reversal-flag";

pub const SUMMARY_PREFIX: &str = "summary-";
pub const SUMMARY_WORST_TIER: &str = "summary-worst-tier";
pub const SUMMARY_HIGHEST_PRIORITY_SCORE: &str = "summary-highest-priority-score";
pub const SUMMARY_DAYS_UNTIL_EARLIEST_RUNOUT: &str = "summary-days-until-earliest-runout";
pub const SUMMARY_PDC_MAC: &str = "summary-pdc-mac";
pub const SUMMARY_PDC_MAD: &str = "summary-pdc-mad";
pub const SUMMARY_PDC_MAH: &str = "summary-pdc-mah";
pub const SUMMARY_LAST_UPDATED: &str = "summary-last-updated";

/// Coding system for the engine's observation codes.
pub const OBSERVATION_CODES: &str = "observation-codes";
