pub mod classification;
pub mod config;
pub mod domain;
pub mod pdc;
pub mod ports;
pub mod services;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use classification::MaRxnormTable;
pub use config::{BatchConfig, EngineConfig, PriorityWeights, TierBoundaries};
pub use domain::{
    is_backpressure,
    Backpressure,
    Dispense,
    DispenseStatus,
    EngineError,
    FillRecord,
    FragilityFlags,
    FragilityResult,
    FragilityTier,
    Measure,
    MedicationDetail,
    MedicationProjection,
    ObservationCode,
    ObservationDraft,
    ObservationKey,
    PatientSummary,
    PdcByMeasure,
    PdcResult,
    PriorityBonuses,
    StoredObservation,
    TreatmentPeriod,
    UrgencyLevel,
};
pub use pdc::{
    calculate_pdc, classify_fragility, derive_refills_remaining, median_days_supply,
    merge_covered_days, project_medication, FragilityInput,
};
pub use ports::{
    DispenseRepository, ObservationStore, PatientRecord, PatientStore, SummaryWriteOutcome,
};
pub use services::{
    compute_summary, select_current, BatchDriver, BatchOptions, BatchResult, MeasureResult,
    MedicationResult, ObservationService, OrchestratorResult, PatientSummaryService,
    PdcOrchestrator, RunOptions,
};
