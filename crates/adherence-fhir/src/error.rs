use thiserror::Error;

#[derive(Error, Debug)]
pub enum FhirError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("FHIR server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Server rate limited the request after {attempts} retries")]
    RateLimited { attempts: u32 },

    #[error("Invalid FHIR base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Malformed resource: {0}")]
    Malformed(String),
}

impl FhirError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, FhirError::Status { status: 409 | 412, .. })
    }

    /// Capability-negotiation failure on a search parameter the server does
    /// not index.
    pub fn is_unsupported_search(&self) -> bool {
        matches!(self, FhirError::Status { status: 400 | 404, .. })
    }
}

/// Convert to `anyhow`, tagging rate-limit exhaustion with the engine's
/// backpressure marker so the batch driver can retry the patient.
pub fn into_engine_error(err: FhirError) -> anyhow::Error {
    match err {
        FhirError::RateLimited { .. } => {
            anyhow::Error::new(adherence_core::Backpressure).context(err.to_string())
        }
        other => anyhow::Error::new(other),
    }
}

pub type Result<T> = std::result::Result<T, FhirError>;
