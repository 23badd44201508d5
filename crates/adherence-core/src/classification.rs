//! RxNorm to MA-measure classification.
//!
//! The table is supplied externally (configuration input) as a flat JSON map
//! of RxNorm code to measure name. Classification is a pure lookup; codes
//! absent from the table are excluded from every measure and tracked as
//! "unclassified" telemetry by the orchestrator.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::domain::Measure;

#[derive(Debug, Clone, Default)]
pub struct MaRxnormTable {
    entries: HashMap<String, Measure>,
}

impl MaRxnormTable {
    pub fn new(entries: HashMap<String, Measure>) -> Self {
        Self { entries }
    }

    /// Load from a JSON object of `{"<rxnorm code>": "MAC"|"MAD"|"MAH"}`.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: HashMap<String, String> =
            serde_json::from_str(json).context("MA table is not a JSON object of code -> measure")?;

        let mut entries = HashMap::with_capacity(raw.len());
        for (code, measure) in raw {
            let measure = Measure::parse(&measure)
                .map_err(|e| anyhow::anyhow!("MA table entry {}: {}", code, e))?;
            entries.insert(code, measure);
        }
        Ok(Self { entries })
    }

    /// Measure for an RxNorm code, or None when the medication does not
    /// participate in any MA measure.
    pub fn classify(&self, rxnorm: &str) -> Option<Measure> {
        self.entries.get(rxnorm).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
