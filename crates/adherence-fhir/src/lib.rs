pub mod client;
pub mod dispense;
pub mod error;
pub mod extensions;
pub mod models;
pub mod observation;
pub mod patient;

pub use client::{FhirClient, FhirClientConfig};
pub use dispense::FhirDispenseRepository;
pub use error::{into_engine_error, FhirError, Result};
pub use observation::FhirObservationStore;
pub use patient::FhirPatientStore;
