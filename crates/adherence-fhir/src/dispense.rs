//! Read-only adapter over MedicationDispense.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use adherence_core::{Dispense, DispenseRepository, DispenseStatus, EngineConfig};

use crate::client::FhirClient;
use crate::error::into_engine_error;
use crate::extensions;
use crate::models::{find_extension, parse_fhir_date, MedicationDispenseResource, RXNORM_SYSTEM};

pub struct FhirDispenseRepository {
    client: Arc<FhirClient>,
    config: EngineConfig,
}

impl FhirDispenseRepository {
    pub fn new(client: Arc<FhirClient>, config: EngineConfig) -> Self {
        Self { client, config }
    }

    /// Lenient mapping: anything unusable becomes `None` on the field and
    /// the orchestrator decides whether to drop the record.
    fn parse_dispense(&self, value: &Value) -> Option<Dispense> {
        let resource: MedicationDispenseResource = match serde_json::from_value(value.clone()) {
            Ok(resource) => resource,
            Err(err) => {
                debug!(%err, "skipping unparseable MedicationDispense");
                return None;
            }
        };

        let (medication_code, medication_display) = resource
            .medication_codeable_concept
            .as_ref()
            .and_then(|concept| concept.code_for_system(RXNORM_SYSTEM))
            .map(|(code, display)| (Some(code.to_string()), display.map(str::to_string)))
            .unwrap_or((None, None));

        let status = DispenseStatus::from_fhir(resource.status.as_deref().unwrap_or("unknown"));
        let reversal_flag =
            find_extension(&resource.extension, &self.config.extension_url(extensions::REVERSAL_FLAG))
                .and_then(|e| e.value_boolean)
                .unwrap_or(false);
        let refills_remaining = find_extension(
            &resource.extension,
            &self.config.extension_url(extensions::REFILLS_REMAINING),
        )
        .and_then(|e| e.value_integer)
        .map(|v| v.max(0) as u32);

        Some(Dispense {
            patient_ref: resource
                .subject
                .and_then(|s| s.reference)
                .unwrap_or_default(),
            fill_date: resource.when_handed_over.as_deref().and_then(parse_fhir_date),
            days_supply: resource.days_supply.and_then(|q| q.value),
            medication_code,
            medication_display,
            status,
            reversal_flag,
            refills_remaining,
        })
    }

    fn year_bounds(measurement_year: i32) -> (String, String) {
        (
            format!("ge{}-01-01", measurement_year),
            format!("le{}-12-31", measurement_year),
        )
    }
}

#[async_trait]
impl DispenseRepository for FhirDispenseRepository {
    async fn dispenses_for_patient(
        &self,
        patient_id: &str,
        measurement_year: i32,
    ) -> anyhow::Result<Vec<Dispense>> {
        let (from, to) = Self::year_bounds(measurement_year);
        let params = vec![
            ("subject".to_string(), format!("Patient/{}", patient_id)),
            ("status".to_string(), "completed".to_string()),
            ("whenhandedover".to_string(), from),
            ("whenhandedover".to_string(), to),
        ];

        let resources = self
            .client
            .search("MedicationDispense", &params)
            .await
            .map_err(into_engine_error)?;

        Ok(resources
            .iter()
            .filter_map(|r| self.parse_dispense(r))
            .collect())
    }

    async fn patients_with_dispenses(
        &self,
        measurement_year: i32,
        max_patients: Option<usize>,
    ) -> anyhow::Result<Vec<String>> {
        let (from, to) = Self::year_bounds(measurement_year);
        // Minimal-field search: only the subject reference is needed.
        let params = vec![
            ("status".to_string(), "completed".to_string()),
            ("whenhandedover".to_string(), from),
            ("whenhandedover".to_string(), to),
            ("_elements".to_string(), "subject".to_string()),
        ];

        let resources = self
            .client
            .search("MedicationDispense", &params)
            .await
            .map_err(into_engine_error)?;

        let ids: BTreeSet<String> = resources
            .iter()
            .filter_map(|r| r.get("subject"))
            .filter_map(|s| s.get("reference"))
            .filter_map(|r| r.as_str())
            .filter_map(|r| r.strip_prefix("Patient/"))
            .map(str::to_string)
            .collect();

        let mut ids: Vec<String> = ids.into_iter().collect();
        if let Some(max) = max_patients {
            ids.truncate(max);
        }
        Ok(ids)
    }
}
