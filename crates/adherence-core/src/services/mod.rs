pub mod batch;
pub mod observations;
pub mod orchestrator;
pub mod patient_summary;

pub use batch::{BatchDriver, BatchOptions, BatchResult};
pub use observations::{select_current, ObservationService};
pub use orchestrator::{
    MeasureResult, MedicationResult, OrchestratorResult, PdcOrchestrator, RunOptions,
};
pub use patient_summary::{compute_summary, PatientSummaryService};
