pub mod dispense_repository;
pub mod observation_store;
pub mod patient_store;

pub use dispense_repository::DispenseRepository;
pub use observation_store::ObservationStore;
pub use patient_store::{PatientRecord, PatientStore, SummaryWriteOutcome};

#[cfg(any(test, feature = "testing"))]
pub use dispense_repository::MockDispenseRepository;
#[cfg(any(test, feature = "testing"))]
pub use observation_store::MockObservationStore;
#[cfg(any(test, feature = "testing"))]
pub use patient_store::MockPatientStore;
