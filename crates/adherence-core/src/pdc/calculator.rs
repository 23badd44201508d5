//! Proportion-of-days-covered calculator.
//!
//! Coverage accounting is overlap-safe: fills are merged as half-open
//! intervals `[fill_date, fill_date + days_supply)` so stockpiled refills
//! never double-count a day.

use chrono::{Duration, NaiveDate};
use tracing::warn;

use crate::config::EngineConfig;
use crate::domain::{FillRecord, PdcResult, TreatmentPeriod};

/// Covered days within the treatment period for a fill set.
///
/// Fills are processed in fill-date order; same-day ties are broken by the
/// larger days-supply first so the longer coverage absorbs the shorter one.
/// A fill extending beyond the period contributes only the portion inside
/// it (exclusive end caps at Jan 1 of the following year).
pub fn merge_covered_days(fills: &[FillRecord], period: &TreatmentPeriod) -> i64 {
    merge_covered_days_until(fills, period, period.end + Duration::days(1))
}

/// Same merge, but counting only days strictly before `exclusive_end`.
/// Used for the perfect-adherence projection, which replaces everything
/// from the current date onward with continuous coverage.
fn merge_covered_days_until(
    fills: &[FillRecord],
    period: &TreatmentPeriod,
    exclusive_end: NaiveDate,
) -> i64 {
    let cap = exclusive_end.min(period.end + Duration::days(1));

    let mut sorted: Vec<FillRecord> = fills.iter().filter(|f| f.days_supply > 0).copied().collect();
    sorted.sort_by(|a, b| {
        a.fill_date
            .cmp(&b.fill_date)
            .then(b.days_supply.cmp(&a.days_supply))
    });

    let mut covered_until = period.start;
    let mut covered = 0i64;

    for fill in &sorted {
        if fill.fill_date > period.end {
            warn!(
                fill_date = %fill.fill_date,
                period_end = %period.end,
                "fill after treatment period; contributes nothing"
            );
            continue;
        }

        let start = if fill.fill_date < period.start {
            warn!(
                fill_date = %fill.fill_date,
                period_start = %period.start,
                "fill before treatment period; clamping to period start"
            );
            period.start
        } else {
            fill.fill_date
        };

        let end = fill.coverage_end().min(cap);
        if start >= cap || end <= start {
            continue;
        }

        if start >= covered_until {
            // Disjoint from everything merged so far.
            covered += (end - start).num_days();
            covered_until = end;
        } else if end > covered_until {
            // Partial overlap: only the fresh tail counts.
            covered += (end - covered_until).num_days();
            covered_until = end;
        }
        // Fully inside already-merged coverage: contributes nothing.
    }

    covered.min(period.days())
}

/// Compute the full [`PdcResult`] for one fill set against a measurement
/// year. Fills with non-positive days-supply are dropped with a warning; an
/// empty fill set yields the "no treatment period" result, which callers
/// must not persist as an observation.
pub fn calculate_pdc(
    fills: &[FillRecord],
    measurement_year: i32,
    current_date: NaiveDate,
    config: &EngineConfig,
) -> PdcResult {
    let usable: Vec<FillRecord> = fills
        .iter()
        .filter(|f| {
            if f.days_supply <= 0 {
                warn!(
                    fill_date = %f.fill_date,
                    days_supply = f.days_supply,
                    "dropping fill with non-positive days supply"
                );
                false
            } else {
                true
            }
        })
        .copied()
        .collect();

    let Some(first_fill) = usable.iter().map(|f| f.fill_date).min() else {
        return PdcResult::empty();
    };

    // Dec 31 always exists.
    let treatment_end = NaiveDate::from_ymd_opt(measurement_year, 12, 31)
        .unwrap_or_else(|| first_fill + Duration::days(365));
    if first_fill > treatment_end {
        warn!(
            first_fill = %first_fill,
            measurement_year,
            "first fill after measurement year end; no treatment period"
        );
        return PdcResult::empty();
    }

    let period = TreatmentPeriod {
        start: first_fill,
        end: treatment_end,
    };
    let treatment_days = period.days();

    let covered_days = merge_covered_days(&usable, &period);
    let pdc = covered_days as f64 / treatment_days as f64;

    let gap_days_used = treatment_days - covered_days;
    let gap_days_allowed = config.gap_days_allowed(treatment_days);
    let gap_days_remaining = gap_days_allowed - gap_days_used;

    // Status quo: existing fills projected to exhaustion, which the merge
    // above already does.
    let pdc_status_quo = pdc;

    // Perfect: coverage so far, plus every day from the current date through
    // period end.
    let remaining_days = if current_date > treatment_end {
        0
    } else {
        (treatment_end - current_date.max(period.start)).num_days() + 1
    };
    let covered_before = if current_date <= period.start {
        0
    } else {
        merge_covered_days_until(&usable, &period, current_date)
    };
    let perfect_covered = (covered_before + remaining_days).min(treatment_days);
    let pdc_perfect = (perfect_covered as f64 / treatment_days as f64).max(pdc_status_quo);

    PdcResult {
        pdc,
        covered_days,
        treatment_days,
        gap_days_used,
        gap_days_allowed,
        gap_days_remaining,
        pdc_status_quo,
        pdc_perfect,
        treatment_period: Some(period),
    }
}
