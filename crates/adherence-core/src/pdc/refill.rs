//! Per-medication supply projection.

use chrono::NaiveDate;

use crate::domain::{FillRecord, MedicationProjection};

/// Median days-supply across fills. Median resists a single outlier fill
/// (e.g. one 90-day vacation fill among 30-day fills); for even counts the
/// two middle values are averaged.
pub fn median_days_supply(fills: &[FillRecord]) -> f64 {
    if fills.is_empty() {
        return 0.0;
    }
    let mut supplies: Vec<i64> = fills.iter().map(|f| f.days_supply).collect();
    supplies.sort_unstable();
    let n = supplies.len();
    if n % 2 == 1 {
        supplies[n / 2] as f64
    } else {
        (supplies[n / 2 - 1] + supplies[n / 2]) as f64 / 2.0
    }
}

/// Estimate refills remaining when the source system does not publish it:
/// the number of median-length refills needed to cover the period after
/// on-hand supply runs out.
pub fn derive_refills_remaining(
    supply_runs_out: NaiveDate,
    treatment_end: NaiveDate,
    estimated_days_per_refill: f64,
) -> u32 {
    if supply_runs_out > treatment_end || estimated_days_per_refill <= 0.0 {
        return 0;
    }
    let uncovered = (treatment_end - supply_runs_out).num_days() + 1;
    (uncovered as f64 / estimated_days_per_refill).ceil() as u32
}

/// Project operational supply metrics for one medication.
///
/// `fills` must be non-empty and belong to a single RxNorm code;
/// supply-on-hand uses the most recent fill only.
pub fn project_medication(
    rxnorm: &str,
    display: &str,
    fills: &[FillRecord],
    current_date: NaiveDate,
    refills_remaining: Option<u32>,
    treatment_end: NaiveDate,
) -> Option<MedicationProjection> {
    let last = fills.iter().max_by_key(|f| (f.fill_date, f.days_supply))?;

    let estimated_days_per_refill = median_days_supply(fills);

    // Signed days to exhaustion of the last fill; negative = days since.
    let days_until_runout = (last.coverage_end() - current_date).num_days();
    let supply_on_hand = days_until_runout.max(0);

    let remaining_refills = refills_remaining.unwrap_or_else(|| {
        derive_refills_remaining(last.coverage_end(), treatment_end, estimated_days_per_refill)
    });

    let days_left_in_period = ((treatment_end - current_date).num_days() + 1).max(0);
    let projected_supply =
        supply_on_hand as f64 + remaining_refills as f64 * estimated_days_per_refill;
    let coverage_shortfall = (days_left_in_period as f64 - projected_supply).ceil().max(0.0) as i64;

    Some(MedicationProjection {
        rxnorm: rxnorm.to_string(),
        display: display.to_string(),
        remaining_refills,
        supply_on_hand,
        estimated_days_per_refill,
        coverage_shortfall,
        days_until_runout,
        last_fill_date: last.fill_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fill(m: u32, d: u32, supply: i64) -> FillRecord {
        FillRecord::new(date(2025, m, d), supply)
    }

    #[test]
    fn test_median_odd_count() {
        assert_eq!(median_days_supply(&[fill(1, 1, 30), fill(2, 1, 90), fill(3, 1, 30)]), 30.0);
    }

    #[test]
    fn test_median_even_count_averages() {
        assert_eq!(median_days_supply(&[fill(1, 1, 30), fill(2, 1, 60)]), 45.0);
    }

    #[test]
    fn test_median_empty() {
        assert_eq!(median_days_supply(&[]), 0.0);
    }

    #[test]
    fn test_supply_on_hand_from_last_fill() {
        let fills = vec![fill(1, 15, 30), fill(5, 30, 30)];
        let projection = project_medication(
            "314076",
            "lisinopril 10 MG Oral Tablet",
            &fills,
            date(2025, 6, 15),
            Some(5),
            date(2025, 12, 31),
        )
        .unwrap();

        // Last fill covers through Jun 29 (exclusive): 14 days left on Jun 15.
        assert_eq!(projection.supply_on_hand, 14);
        assert_eq!(projection.days_until_runout, 14);
        assert_eq!(projection.last_fill_date, date(2025, 5, 30));
    }

    #[test]
    fn test_runout_is_signed() {
        let fills = vec![fill(1, 15, 90)];
        let projection = project_medication(
            "861007",
            "metformin",
            &fills,
            date(2025, 11, 15),
            Some(0),
            date(2025, 12, 31),
        )
        .unwrap();

        // Coverage ended Apr 15 (exclusive); Nov 15 is 214 days later.
        assert_eq!(projection.supply_on_hand, 0);
        assert_eq!(projection.days_until_runout, -214);
    }

    #[test]
    fn test_coverage_shortfall() {
        let fills = vec![fill(1, 15, 90)];
        let projection = project_medication(
            "861007",
            "metformin",
            &fills,
            date(2025, 11, 15),
            Some(0),
            date(2025, 12, 31),
        )
        .unwrap();

        // 47 days left, no supply, no refills.
        assert_eq!(projection.coverage_shortfall, 47);
    }

    #[test]
    fn test_no_shortfall_when_projected_supply_covers_period() {
        let fills = vec![fill(11, 1, 30)];
        let projection = project_medication(
            "197361",
            "atorvastatin",
            &fills,
            date(2025, 11, 15),
            Some(2),
            date(2025, 12, 31),
        )
        .unwrap();

        // 16 on hand + 60 projected >= 47 remaining days.
        assert_eq!(projection.coverage_shortfall, 0);
    }

    #[test]
    fn test_derived_refills_when_source_omits_them() {
        let fills = vec![fill(1, 15, 30), fill(2, 14, 30)];
        let projection = project_medication(
            "314076",
            "lisinopril",
            &fills,
            date(2025, 3, 1),
            None,
            date(2025, 12, 31),
        )
        .unwrap();

        // Supply runs out Mar 16; Mar 16 .. Dec 31 is 291 days at 30/refill.
        assert_eq!(projection.remaining_refills, 10);
    }

    #[test]
    fn test_derive_refills_zero_after_period() {
        assert_eq!(derive_refills_remaining(date(2026, 1, 2), date(2025, 12, 31), 30.0), 0);
        assert_eq!(derive_refills_remaining(date(2025, 6, 1), date(2025, 12, 31), 0.0), 0);
    }

    #[test]
    fn test_empty_fills_yield_no_projection() {
        assert!(project_medication(
            "314076",
            "lisinopril",
            &[],
            date(2025, 6, 15),
            Some(1),
            date(2025, 12, 31),
        )
        .is_none());
    }
}
