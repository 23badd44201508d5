pub mod error;
pub mod models;

pub use error::{is_backpressure, Backpressure, EngineError};
pub use models::{
    Dispense, DispenseStatus, FillRecord, FragilityFlags, FragilityResult, FragilityTier, Measure,
    MedicationDetail, MedicationProjection, ObservationCode, ObservationDraft, ObservationKey,
    PatientSummary, PdcByMeasure, PdcResult, PriorityBonuses, StoredObservation, TreatmentPeriod,
    UrgencyLevel,
};
