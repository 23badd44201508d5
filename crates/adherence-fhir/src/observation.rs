//! Observation persistence against the FHIR store.
//!
//! Search strategy: the preferred query uses server-side indexes on the
//! `is-current` / `ma-measure` / `medication-rxnorm` extension search
//! parameters. When the server rejects that query (capability-negotiation
//! failure) the store degrades permanently to an unindexed subject+code
//! search filtered client-side; both paths return equivalent results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use tracing::{debug, warn};

use adherence_core::{
    EngineConfig, FragilityTier, Measure, MedicationDetail, ObservationCode, ObservationDraft,
    ObservationKey, ObservationStore, StoredObservation, TreatmentPeriod,
};

use crate::client::FhirClient;
use crate::error::{into_engine_error, FhirError, Result};
use crate::extensions as ext;
use crate::models::{
    find_extension, parse_fhir_date, CodeableConcept, Coding, Extension, ObservationResource,
    Quantity, Reference, UCUM_SYSTEM,
};

pub struct FhirObservationStore {
    client: Arc<FhirClient>,
    config: EngineConfig,
    indexed_search_supported: AtomicBool,
}

impl FhirObservationStore {
    pub fn new(client: Arc<FhirClient>, config: EngineConfig) -> Self {
        Self {
            client,
            config,
            indexed_search_supported: AtomicBool::new(true),
        }
    }

    fn url(&self, leaf: &str) -> String {
        self.config.extension_url(leaf)
    }

    fn code_system(&self) -> String {
        self.config.extension_url(ext::OBSERVATION_CODES)
    }

    /// Domain draft to FHIR resource, every extension under the configured
    /// base URL.
    pub fn to_resource(&self, draft: &ObservationDraft) -> ObservationResource {
        let mut extension = vec![
            Extension::boolean(self.url(ext::IS_CURRENT), true),
            Extension::string(self.url(ext::FRAGILITY_TIER), draft.fragility_tier.as_str()),
            Extension::integer(self.url(ext::PRIORITY_SCORE), i64::from(draft.priority_score)),
            Extension::integer(self.url(ext::GAP_DAYS_REMAINING), draft.gap_days_remaining),
            Extension::decimal(self.url(ext::DELAY_BUDGET), draft.delay_budget),
            Extension::boolean(self.url(ext::Q4_ADJUSTED), draft.q4_adjusted),
        ];
        if let Some(measure) = draft.measure {
            extension.push(Extension::string(self.url(ext::MA_MEASURE), measure.as_str()));
        }
        if let Some(days) = draft.days_until_runout {
            extension.push(Extension::integer(self.url(ext::DAYS_UNTIL_RUNOUT), days));
        }
        if let Some(period) = draft.treatment_period {
            extension.push(Extension::period(
                self.url(ext::TREATMENT_PERIOD),
                period.start,
                period.end,
            ));
        }
        if let Some(medication) = &draft.medication {
            extension.push(Extension::string(
                self.url(ext::MEDICATION_RXNORM),
                medication.rxnorm.clone(),
            ));
            extension.push(Extension::string(
                self.url(ext::MEDICATION_DISPLAY),
                medication.display.clone(),
            ));
            extension.push(Extension::integer(
                self.url(ext::REMAINING_REFILLS),
                i64::from(medication.remaining_refills),
            ));
            extension.push(Extension::integer(
                self.url(ext::SUPPLY_ON_HAND),
                medication.supply_on_hand,
            ));
            extension.push(Extension::integer(
                self.url(ext::COVERAGE_SHORTFALL),
                medication.coverage_shortfall,
            ));
            extension.push(Extension::decimal(
                self.url(ext::ESTIMATED_DAYS_PER_REFILL),
                medication.estimated_days_per_refill,
            ));
            if let Some(parent) = &medication.parent_measure_observation {
                extension.push(Extension::reference(
                    self.url(ext::PARENT_MEASURE_OBSERVATION),
                    Reference::to("Observation", parent),
                ));
            }
        }

        ObservationResource {
            resource_type: "Observation".to_string(),
            id: draft.id.clone(),
            status: "final".to_string(),
            code: CodeableConcept {
                coding: vec![Coding {
                    system: Some(self.code_system()),
                    code: Some(draft.code.as_str().to_string()),
                    display: None,
                }],
                text: None,
            },
            subject: Some(Reference::to("Patient", &draft.patient_id)),
            effective_date_time: Some(draft.effective.to_rfc3339()),
            value_quantity: Some(Quantity {
                value: Some(draft.value),
                unit: Some("ratio".to_string()),
                system: Some(UCUM_SYSTEM.to_string()),
                code: Some("1".to_string()),
            }),
            extension,
            has_member: draft
                .member_observations
                .iter()
                .map(|id| Reference::to("Observation", id))
                .collect(),
        }
    }

    /// FHIR resource back to the domain view. Fails on resources the engine
    /// did not write (foreign code system), letting callers skip them.
    pub fn from_resource(&self, value: &Value) -> Result<StoredObservation> {
        let resource: ObservationResource = serde_json::from_value(value.clone())
            .map_err(|e| FhirError::Malformed(format!("observation: {}", e)))?;

        let id = resource
            .id
            .ok_or_else(|| FhirError::Malformed("observation without id".into()))?;
        let code_system = self.code_system();
        let code = resource
            .code
            .code_for_system(&code_system)
            .and_then(|(code, _)| ObservationCode::parse(code).ok())
            .ok_or_else(|| FhirError::Malformed("not an adherence observation".into()))?;
        let patient_id = resource
            .subject
            .as_ref()
            .and_then(|s| s.id())
            .ok_or_else(|| FhirError::Malformed("observation without subject".into()))?
            .to_string();
        let effective = resource
            .effective_date_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.to_utc())
            .ok_or_else(|| FhirError::Malformed("observation without effectiveDateTime".into()))?;
        let value = resource
            .value_quantity
            .as_ref()
            .and_then(|q| q.value)
            .ok_or_else(|| FhirError::Malformed("observation without value".into()))?;

        let extensions = &resource.extension;
        let get = |leaf: &str| find_extension(extensions, &self.url(leaf));

        let fragility_tier = get(ext::FRAGILITY_TIER)
            .and_then(|e| e.value_string.as_deref())
            .and_then(|s| FragilityTier::parse(s).ok())
            .ok_or_else(|| FhirError::Malformed("observation without fragility tier".into()))?;
        let measure = get(ext::MA_MEASURE)
            .and_then(|e| e.value_string.as_deref())
            .and_then(|s| Measure::parse(s).ok());
        let treatment_period = get(ext::TREATMENT_PERIOD)
            .and_then(|e| e.value_period.as_ref())
            .and_then(|p| {
                let start = p.start.as_deref().and_then(parse_fhir_date)?;
                let end = p.end.as_deref().and_then(parse_fhir_date)?;
                Some(TreatmentPeriod { start, end })
            });

        let medication = get(ext::MEDICATION_RXNORM)
            .and_then(|e| e.value_string.clone())
            .map(|rxnorm| MedicationDetail {
                rxnorm,
                display: get(ext::MEDICATION_DISPLAY)
                    .and_then(|e| e.value_string.clone())
                    .unwrap_or_default(),
                remaining_refills: get(ext::REMAINING_REFILLS)
                    .and_then(|e| e.value_integer)
                    .unwrap_or(0)
                    .max(0) as u32,
                supply_on_hand: get(ext::SUPPLY_ON_HAND)
                    .and_then(|e| e.value_integer)
                    .unwrap_or(0),
                coverage_shortfall: get(ext::COVERAGE_SHORTFALL)
                    .and_then(|e| e.value_integer)
                    .unwrap_or(0),
                estimated_days_per_refill: get(ext::ESTIMATED_DAYS_PER_REFILL)
                    .and_then(|e| e.value_decimal)
                    .unwrap_or(0.0),
                parent_measure_observation: get(ext::PARENT_MEASURE_OBSERVATION)
                    .and_then(|e| e.value_reference.as_ref())
                    .and_then(|r| r.id())
                    .map(str::to_string),
            });

        Ok(StoredObservation {
            id,
            patient_id,
            code,
            measure,
            value,
            effective,
            is_current: get(ext::IS_CURRENT).and_then(|e| e.value_boolean).unwrap_or(false),
            fragility_tier,
            priority_score: get(ext::PRIORITY_SCORE)
                .and_then(|e| e.value_integer)
                .unwrap_or(0)
                .max(0) as u32,
            days_until_runout: get(ext::DAYS_UNTIL_RUNOUT).and_then(|e| e.value_integer),
            gap_days_remaining: get(ext::GAP_DAYS_REMAINING)
                .and_then(|e| e.value_integer)
                .unwrap_or(0),
            delay_budget: get(ext::DELAY_BUDGET).and_then(|e| e.value_decimal).unwrap_or(0.0),
            treatment_period,
            q4_adjusted: get(ext::Q4_ADJUSTED).and_then(|e| e.value_boolean).unwrap_or(false),
            medication,
            member_observations: resource
                .has_member
                .iter()
                .filter_map(|r| r.id())
                .map(str::to_string)
                .collect(),
        })
    }

    async fn indexed_search(&self, key: &ObservationKey) -> Result<Vec<Value>> {
        let mut params = vec![
            ("subject".to_string(), format!("Patient/{}", key.patient_id)),
            ("code".to_string(), key.code.as_str().to_string()),
            (ext::IS_CURRENT.to_string(), "true".to_string()),
        ];
        if let Some(measure) = key.measure {
            params.push((ext::MA_MEASURE.to_string(), measure.as_str().to_string()));
        }
        if let Some(rxnorm) = &key.medication_rxnorm {
            params.push((ext::MEDICATION_RXNORM.to_string(), rxnorm.clone()));
        }
        self.client.search("Observation", &params).await
    }

    async fn fallback_search(&self, patient_id: &str, code: Option<ObservationCode>) -> Result<Vec<Value>> {
        let mut params = vec![(
            "subject".to_string(),
            format!("Patient/{}", patient_id),
        )];
        if let Some(code) = code {
            params.push(("code".to_string(), code.as_str().to_string()));
        }
        self.client.search("Observation", &params).await
    }

    /// Run the preferred indexed search, degrading to the unindexed path on
    /// capability failure and remembering the downgrade.
    async fn search_with_fallback(
        &self,
        key_patient: &str,
        key_code: Option<ObservationCode>,
        indexed: impl std::future::Future<Output = Result<Vec<Value>>>,
    ) -> Result<Vec<Value>> {
        if self.indexed_search_supported.load(Ordering::Relaxed) {
            match indexed.await {
                Ok(resources) => return Ok(resources),
                Err(err) if err.is_unsupported_search() => {
                    warn!(
                        %err,
                        "server rejected indexed observation search; using client-side filtering"
                    );
                    self.indexed_search_supported.store(false, Ordering::Relaxed);
                }
                Err(err) => return Err(err),
            }
        }
        self.fallback_search(key_patient, key_code).await
    }
}

#[async_trait]
impl ObservationStore for FhirObservationStore {
    async fn create(&self, draft: ObservationDraft) -> anyhow::Result<StoredObservation> {
        let resource = self.to_resource(&draft);
        let body = serde_json::to_value(&resource)
            .map_err(|e| anyhow::anyhow!("serializing observation: {}", e))?;

        let response = match &draft.id {
            Some(id) => self.client.put(&format!("Observation/{}", id), &body, None).await,
            None => self.client.post("Observation", &body).await,
        }
        .map_err(into_engine_error)?;

        // Prefer the server-assigned id from the echoed resource.
        let id = response
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| draft.id.clone())
            .ok_or_else(|| anyhow::anyhow!("server did not return an id for created observation"))?;

        Ok(StoredObservation {
            id,
            patient_id: draft.patient_id,
            code: draft.code,
            measure: draft.measure,
            value: draft.value,
            effective: draft.effective,
            is_current: true,
            fragility_tier: draft.fragility_tier,
            priority_score: draft.priority_score,
            days_until_runout: draft.days_until_runout,
            gap_days_remaining: draft.gap_days_remaining,
            delay_budget: draft.delay_budget,
            treatment_period: draft.treatment_period,
            q4_adjusted: draft.q4_adjusted,
            medication: draft.medication,
            member_observations: draft.member_observations,
        })
    }

    async fn find_current(&self, key: &ObservationKey) -> anyhow::Result<Vec<StoredObservation>> {
        let resources = self
            .search_with_fallback(&key.patient_id, Some(key.code), self.indexed_search(key))
            .await
            .map_err(into_engine_error)?;

        // Both search paths converge on the same client-side filter so
        // indexed and unindexed results are equivalent.
        Ok(resources
            .iter()
            .filter_map(|r| match self.from_resource(r) {
                Ok(observation) => Some(observation),
                Err(err) => {
                    debug!(%err, "skipping non-engine observation in search results");
                    None
                }
            })
            .filter(|o| o.is_current && &o.key() == key)
            .collect())
    }

    async fn mark_not_current(&self, observation_id: &str) -> anyhow::Result<()> {
        let path = format!("Observation/{}", observation_id);
        let mut resource = self.client.get(&path).await.map_err(into_engine_error)?;

        // Flip the flag on the raw resource so foreign extensions survive.
        let is_current_url = self.url(ext::IS_CURRENT);
        let extensions = resource
            .get_mut("extension")
            .and_then(|v| v.as_array_mut());
        match extensions {
            Some(entries) => {
                let mut found = false;
                for entry in entries.iter_mut() {
                    if entry.get("url").and_then(|u| u.as_str()) == Some(is_current_url.as_str()) {
                        entry["valueBoolean"] = Value::Bool(false);
                        found = true;
                    }
                }
                if !found {
                    entries.push(serde_json::json!({
                        "url": is_current_url,
                        "valueBoolean": false,
                    }));
                }
            }
            None => {
                resource["extension"] = serde_json::json!([{
                    "url": is_current_url,
                    "valueBoolean": false,
                }]);
            }
        }

        self.client
            .put(&path, &resource, None)
            .await
            .map_err(into_engine_error)?;
        Ok(())
    }

    async fn all_current_for_patient(
        &self,
        patient_id: &str,
    ) -> anyhow::Result<Vec<StoredObservation>> {
        let indexed = async {
            let params = vec![
                ("subject".to_string(), format!("Patient/{}", patient_id)),
                (ext::IS_CURRENT.to_string(), "true".to_string()),
            ];
            self.client.search("Observation", &params).await
        };
        let resources = self
            .search_with_fallback(patient_id, None, indexed)
            .await
            .map_err(into_engine_error)?;

        Ok(resources
            .iter()
            .filter_map(|r| self.from_resource(r).ok())
            .filter(|o| o.is_current)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn store() -> FhirObservationStore {
        let client = Arc::new(
            crate::client::FhirClient::new(crate::client::FhirClientConfig::default()).unwrap(),
        );
        FhirObservationStore::new(client, EngineConfig::default())
    }

    fn draft() -> ObservationDraft {
        ObservationDraft {
            id: Some("measure-1".to_string()),
            patient_id: "p1".to_string(),
            code: ObservationCode::PdcMah,
            measure: Some(Measure::Mah),
            value: 0.47,
            effective: Utc.with_ymd_and_hms(2025, 6, 15, 2, 0, 0).unwrap(),
            fragility_tier: FragilityTier::F1Imminent,
            priority_score: 100,
            days_until_runout: Some(14),
            gap_days_remaining: -116,
            delay_budget: -23.2,
            treatment_period: Some(TreatmentPeriod {
                start: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
                end: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
            }),
            q4_adjusted: false,
            medication: None,
            member_observations: vec!["med-1".to_string()],
        }
    }

    #[test]
    fn test_resource_round_trip_measure_level() {
        let store = store();
        let resource = store.to_resource(&draft());
        let value = serde_json::to_value(&resource).unwrap();
        let parsed = store.from_resource(&value).unwrap();

        assert_eq!(parsed.id, "measure-1");
        assert_eq!(parsed.patient_id, "p1");
        assert_eq!(parsed.code, ObservationCode::PdcMah);
        assert_eq!(parsed.measure, Some(Measure::Mah));
        assert!((parsed.value - 0.47).abs() < 1e-9);
        assert!(parsed.is_current);
        assert_eq!(parsed.fragility_tier, FragilityTier::F1Imminent);
        assert_eq!(parsed.priority_score, 100);
        assert_eq!(parsed.days_until_runout, Some(14));
        assert_eq!(parsed.gap_days_remaining, -116);
        assert_eq!(parsed.member_observations, vec!["med-1".to_string()]);
        assert_eq!(
            parsed.treatment_period.unwrap().start,
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        );
    }

    #[test]
    fn test_resource_round_trip_medication_level() {
        let store = store();
        let mut d = draft();
        d.code = ObservationCode::PdcMedication;
        d.medication = Some(MedicationDetail {
            rxnorm: "314076".to_string(),
            display: "lisinopril 10 MG Oral Tablet".to_string(),
            remaining_refills: 5,
            supply_on_hand: 14,
            coverage_shortfall: 0,
            estimated_days_per_refill: 30.0,
            parent_measure_observation: Some("measure-1".to_string()),
        });
        d.member_observations = vec![];

        let value = serde_json::to_value(store.to_resource(&d)).unwrap();
        let parsed = store.from_resource(&value).unwrap();

        let medication = parsed.medication.clone().unwrap();
        assert_eq!(medication.rxnorm, "314076");
        assert_eq!(medication.remaining_refills, 5);
        assert_eq!(medication.supply_on_hand, 14);
        assert_eq!(
            medication.parent_measure_observation,
            Some("measure-1".to_string())
        );
        assert_eq!(parsed.key().medication_rxnorm, Some("314076".to_string()));
    }

    #[test]
    fn test_foreign_observation_rejected() {
        let store = store();
        let foreign = serde_json::json!({
            "resourceType": "Observation",
            "id": "x",
            "status": "final",
            "code": {"coding": [{"system": "http://loinc.org", "code": "1234-5"}]},
            "subject": {"reference": "Patient/p1"},
        });
        assert!(store.from_resource(&foreign).is_err());
    }
}
