//! Pure HEDIS adherence computations: covered-days interval merge, PDC
//! derivation and projections, fragility tiering, refill supply projection.
//!
//! Nothing in this module performs I/O or reads the system clock; every
//! "now" is an injected `NaiveDate` so replays are bit-identical.

pub mod calculator;
pub mod fragility;
pub mod refill;

pub use calculator::{calculate_pdc, merge_covered_days};
pub use fragility::{classify_fragility, FragilityInput};
pub use refill::{derive_refills_remaining, median_days_supply, project_medication};
