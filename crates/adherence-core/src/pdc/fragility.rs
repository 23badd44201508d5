//! Fragility tier and priority classification.
//!
//! Tier rules are ordered and first-match-wins: a patient whose current
//! behavior already yields a compliant year-end PDC is never "lost", no
//! matter what the perfect projection says.

use chrono::NaiveDate;

use crate::config::EngineConfig;
use crate::domain::{
    FragilityFlags, FragilityResult, FragilityTier, PdcResult, PriorityBonuses, UrgencyLevel,
};

/// Contextual inputs to classification beyond the PDC result itself.
#[derive(Debug, Clone)]
pub struct FragilityInput {
    pub refills_remaining: u32,
    /// Number of MA measures the patient participates in.
    pub measure_count: usize,
    /// First fill within the configured window of the current date.
    pub is_new_patient: bool,
    pub current_date: NaiveDate,
    /// Signed days until (or since, when negative) medication runout.
    /// Measure-level callers pass the minimum across medications.
    pub days_until_runout: Option<i64>,
}

/// Assign exactly one tier plus the priority score for a PDC result.
pub fn classify_fragility(
    pdc: &PdcResult,
    input: &FragilityInput,
    config: &EngineConfig,
) -> FragilityResult {
    let is_q4 = config.is_q4(input.current_date);
    let delay_budget =
        pdc.gap_days_remaining as f64 / (input.refills_remaining.max(1)) as f64;

    let (tier, effective_budget, q4_tightened) = if pdc.pdc_status_quo >= config.compliance_threshold
    {
        (FragilityTier::Compliant, delay_budget, false)
    } else if pdc.pdc_perfect < config.compliance_threshold {
        (FragilityTier::T5Unsalvageable, delay_budget, false)
    } else {
        let effective = if is_q4 {
            delay_budget * config.q4_tightening_factor
        } else {
            delay_budget
        };
        let bounds = &config.tier_boundaries;
        let tier = if effective <= bounds.f1_max_days {
            FragilityTier::F1Imminent
        } else if effective <= bounds.f2_max_days {
            FragilityTier::F2Fragile
        } else if effective <= bounds.f3_max_days {
            FragilityTier::F3Moderate
        } else if effective <= bounds.f4_max_days {
            FragilityTier::F4Comfortable
        } else {
            FragilityTier::F5Safe
        };
        (tier, effective, is_q4)
    };

    let base = config.priority.base_for(tier);

    // COMPLIANT and T5 are not outreach targets: no base, no bonuses.
    let bonuses = if base == 0 {
        PriorityBonuses::default()
    } else {
        PriorityBonuses {
            out_of_meds: match input.days_until_runout {
                Some(days) if days <= 0 => config.priority.bonus_out_of_meds,
                _ => 0,
            },
            q4: if is_q4 { config.priority.bonus_q4 } else { 0 },
            multi_measure: if input.measure_count >= 2 {
                config.priority.bonus_multi_measure
            } else {
                0
            },
            new_patient: if input.is_new_patient {
                config.priority.bonus_new_patient
            } else {
                0
            },
        }
    };

    let priority_score = (base + bonuses.total()).min(config.priority.max_score);

    let urgency = if priority_score >= 150 {
        UrgencyLevel::Extreme
    } else if priority_score >= 100 {
        UrgencyLevel::High
    } else if priority_score >= 50 {
        UrgencyLevel::Moderate
    } else {
        UrgencyLevel::Low
    };

    FragilityResult {
        tier,
        priority_score,
        urgency,
        delay_budget_per_refill: effective_budget,
        contact_window: tier.contact_window().to_string(),
        flags: FragilityFlags {
            is_compliant: tier == FragilityTier::Compliant,
            is_unsalvageable: tier == FragilityTier::T5Unsalvageable,
            q4_tightened,
        },
        bonuses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TreatmentPeriod;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Minimal PDC result with the three fields classification reads.
    fn pdc(status_quo: f64, perfect: f64, gap_remaining: i64) -> PdcResult {
        PdcResult {
            pdc: status_quo,
            covered_days: 100,
            treatment_days: 351,
            gap_days_used: 251,
            gap_days_allowed: 70,
            gap_days_remaining: gap_remaining,
            pdc_status_quo: status_quo,
            pdc_perfect: perfect,
            treatment_period: Some(TreatmentPeriod {
                start: date(2025, 1, 15),
                end: date(2025, 12, 31),
            }),
        }
    }

    fn input(refills: u32, current: NaiveDate) -> FragilityInput {
        FragilityInput {
            refills_remaining: refills,
            measure_count: 1,
            is_new_patient: false,
            current_date: current,
            days_until_runout: Some(14),
        }
    }

    #[test]
    fn test_compliant_wins_over_everything() {
        let result = classify_fragility(
            &pdc(0.85, 0.90, -200),
            &input(0, date(2025, 11, 15)),
            &EngineConfig::default(),
        );
        assert_eq!(result.tier, FragilityTier::Compliant);
        assert_eq!(result.priority_score, 0);
        assert!(result.flags.is_compliant);
        assert!(!result.flags.q4_tightened);
    }

    #[test]
    fn test_unsalvageable_when_perfect_below_threshold() {
        // Scenario B: statusQuo 0.256, perfect 0.390.
        let result = classify_fragility(
            &pdc(0.256, 0.390, -191),
            &input(0, date(2025, 11, 15)),
            &EngineConfig::default(),
        );
        assert_eq!(result.tier, FragilityTier::T5Unsalvageable);
        assert_eq!(result.priority_score, 0);
        assert_eq!(result.bonuses.total(), 0);
        assert!(result.flags.is_unsalvageable);
    }

    #[rstest::rstest]
    #[case(2, FragilityTier::F1Imminent)]
    #[case(5, FragilityTier::F2Fragile)]
    #[case(10, FragilityTier::F3Moderate)]
    #[case(20, FragilityTier::F4Comfortable)]
    #[case(21, FragilityTier::F5Safe)]
    fn test_band_boundaries_inclusive(#[case] gap: i64, #[case] expected: FragilityTier) {
        // One refill remaining, so the budget equals the gap days.
        let result = classify_fragility(
            &pdc(0.5, 0.9, gap),
            &input(1, date(2025, 6, 15)),
            &EngineConfig::default(),
        );
        assert_eq!(result.tier, expected, "gap {}", gap);
    }

    #[test]
    fn test_delay_budget_divides_by_refills() {
        let result = classify_fragility(
            &pdc(0.5, 0.9, 40),
            &input(4, date(2025, 6, 15)),
            &EngineConfig::default(),
        );
        // 40 / 4 = 10 days per refill.
        assert!((result.delay_budget_per_refill - 10.0).abs() < 1e-9);
        assert_eq!(result.tier, FragilityTier::F3Moderate);
    }

    #[test]
    fn test_zero_refills_treated_as_one() {
        let result = classify_fragility(
            &pdc(0.5, 0.9, 8),
            &input(0, date(2025, 6, 15)),
            &EngineConfig::default(),
        );
        assert!((result.delay_budget_per_refill - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_q4_tightening_moves_band() {
        let config = EngineConfig::default();
        // Budget 24 -> F5 normally, 24 * 0.8 = 19.2 -> F4 in Q4.
        let summer = classify_fragility(&pdc(0.5, 0.9, 24), &input(1, date(2025, 6, 15)), &config);
        assert_eq!(summer.tier, FragilityTier::F5Safe);
        assert!(!summer.flags.q4_tightened);

        let november =
            classify_fragility(&pdc(0.5, 0.9, 24), &input(1, date(2025, 11, 15)), &config);
        assert_eq!(november.tier, FragilityTier::F4Comfortable);
        assert!(november.flags.q4_tightened);
        assert!((november.delay_budget_per_refill - 19.2).abs() < 1e-9);
        assert_eq!(november.bonuses.q4, 25);
    }

    #[test]
    fn test_negative_budget_is_imminent() {
        // Scenario A: gap remaining -116 over 5 refills.
        let result = classify_fragility(
            &pdc(0.470, 1.0, -116),
            &input(5, date(2025, 6, 15)),
            &EngineConfig::default(),
        );
        assert_eq!(result.tier, FragilityTier::F1Imminent);
        assert_eq!(result.priority_score, 100);
        assert_eq!(result.urgency, UrgencyLevel::High);
    }

    #[test]
    fn test_bonuses_accumulate_and_clamp() {
        let config = EngineConfig::default();
        let input = FragilityInput {
            refills_remaining: 1,
            measure_count: 3,
            is_new_patient: true,
            current_date: date(2025, 11, 1),
            days_until_runout: Some(-3),
        };
        // Q4: budget 1 * 0.8 stays F1. 100 + 30 + 25 + 15 + 10 = 180.
        let result = classify_fragility(&pdc(0.5, 0.9, 1), &input, &config);
        assert_eq!(result.priority_score, 180);
        assert_eq!(result.urgency, UrgencyLevel::Extreme);
        assert!(result.priority_score <= config.priority.max_score);
        assert_eq!(result.bonuses.out_of_meds, 30);
        assert_eq!(result.bonuses.multi_measure, 15);
        assert_eq!(result.bonuses.new_patient, 10);
    }

    #[test]
    fn test_urgency_thresholds() {
        let config = EngineConfig::default();
        let current = date(2025, 6, 15);
        // F5 base 20 -> LOW.
        let low = classify_fragility(&pdc(0.5, 0.9, 100), &input(1, current), &config);
        assert_eq!(low.urgency, UrgencyLevel::Low);
        // F3 base 60 -> MODERATE.
        let moderate = classify_fragility(&pdc(0.5, 0.9, 10), &input(1, current), &config);
        assert_eq!(moderate.urgency, UrgencyLevel::Moderate);
    }

    #[test]
    fn test_exactly_one_tier_for_any_projection_pair() {
        let config = EngineConfig::default();
        let current = date(2025, 6, 15);
        for sq in [0.0, 0.5, 0.79, 0.80, 0.95] {
            for perfect in [0.0, 0.5, 0.79, 0.80, 1.0] {
                if perfect < sq {
                    continue;
                }
                let result =
                    classify_fragility(&pdc(sq, perfect, 10), &input(1, current), &config);
                let compliant = sq >= 0.80;
                let lost = !compliant && perfect < 0.80;
                assert_eq!(result.tier == FragilityTier::Compliant, compliant);
                assert_eq!(result.tier == FragilityTier::T5Unsalvageable, lost);
            }
        }
    }

    #[test]
    fn test_lost_case_from_calculated_pdc() {
        // Single 90-day metformin fill in January, no refills, mid-November:
        // the classifier sees the calculator's own projections.
        use crate::domain::FillRecord;
        use crate::pdc::calculator::calculate_pdc;

        let config = EngineConfig::default();
        let fills = [FillRecord::new(date(2025, 1, 15), 90)];
        let result = calculate_pdc(&fills, 2025, date(2025, 11, 15), &config);

        let fragility = classify_fragility(
            &result,
            &FragilityInput {
                refills_remaining: 0,
                measure_count: 1,
                is_new_patient: false,
                current_date: date(2025, 11, 15),
                days_until_runout: Some(-214),
            },
            &config,
        );
        assert_eq!(fragility.tier, FragilityTier::T5Unsalvageable);
        assert_eq!(fragility.priority_score, 0);
    }

    #[test]
    fn test_compliant_case_from_calculated_pdc() {
        // Twelve monthly 30-day fills: status quo stays above threshold.
        use crate::domain::FillRecord;
        use crate::pdc::calculator::calculate_pdc;

        let config = EngineConfig::default();
        let fills: Vec<FillRecord> = (1..=12)
            .map(|m| FillRecord::new(date(2025, m, 15), 30))
            .collect();
        let result = calculate_pdc(&fills, 2025, date(2025, 12, 1), &config);

        let fragility = classify_fragility(
            &result,
            &FragilityInput {
                refills_remaining: 1,
                measure_count: 1,
                is_new_patient: false,
                current_date: date(2025, 12, 1),
                days_until_runout: Some(30),
            },
            &config,
        );
        assert_eq!(fragility.tier, FragilityTier::Compliant);
        assert_eq!(fragility.priority_score, 0);
    }

    #[test]
    fn test_contact_window_follows_tier() {
        let result = classify_fragility(
            &pdc(0.5, 0.9, 1),
            &input(1, date(2025, 6, 15)),
            &EngineConfig::default(),
        );
        assert_eq!(result.contact_window, "24-48 hours");
    }
}
