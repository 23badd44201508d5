//! In-memory port implementations and fixtures for tests and simulations.
//!
//! HashMap-backed stores behind RwLock, implementing the same traits the
//! FHIR adapter implements, plus failure-injection hooks so error paths are
//! testable without a server.

pub mod stores;

pub use stores::{
    dispense_fixture, InMemoryDispenseRepository, InMemoryObservationStore, InMemoryPatientStore,
};
