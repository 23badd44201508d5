use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Patient summary update conflicted after {attempts} attempts")]
    SummaryConflict { attempts: u32 },
}

/// Marker error surfaced by store adapters when the backing server signals
/// backpressure (HTTP 429 or equivalent) beyond the adapter's own retry
/// budget. The batch driver looks for this through the error chain to decide
/// whether a patient should be retried rather than failed outright.
#[derive(Debug, Error)]
#[error("store signalled backpressure (rate limited)")]
pub struct Backpressure;

/// True when any cause in the chain is a [`Backpressure`] marker.
pub fn is_backpressure(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Backpressure>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_backpressure_detected_through_context() {
        let err = anyhow::Error::new(Backpressure).context("storing observation");
        assert!(is_backpressure(&err));
    }

    #[test]
    fn test_other_errors_are_not_backpressure() {
        let err = anyhow::anyhow!("connection refused");
        assert!(!is_backpressure(&err));
    }
}
