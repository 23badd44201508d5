//! Patient summary extensions with optimistic concurrency.
//!
//! The engine owns only its `summary-*` extensions; every other element of
//! the Patient resource, including foreign extensions, is preserved
//! verbatim. Writes are version-conditional (`If-Match`), and a 409/412
//! surfaces as a conflict outcome for the service-layer retry loop.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use tracing::debug;

use adherence_core::{
    EngineConfig, FragilityTier, PatientRecord, PatientStore, PatientSummary, PdcByMeasure,
    SummaryWriteOutcome,
};

use crate::client::FhirClient;
use crate::error::into_engine_error;
use crate::extensions as ext;
use crate::models::Extension;

pub struct FhirPatientStore {
    client: Arc<FhirClient>,
    config: EngineConfig,
}

impl FhirPatientStore {
    pub fn new(client: Arc<FhirClient>, config: EngineConfig) -> Self {
        Self { client, config }
    }

    fn summary_extensions(&self, summary: &PatientSummary) -> Vec<Extension> {
        let url = |leaf: &str| self.config.extension_url(leaf);
        let mut extensions = Vec::new();

        if let Some(tier) = summary.worst_tier {
            extensions.push(Extension::string(url(ext::SUMMARY_WORST_TIER), tier.as_str()));
        }
        extensions.push(Extension::integer(
            url(ext::SUMMARY_HIGHEST_PRIORITY_SCORE),
            i64::from(summary.highest_priority_score),
        ));
        if let Some(days) = summary.days_until_earliest_runout {
            extensions.push(Extension::integer(
                url(ext::SUMMARY_DAYS_UNTIL_EARLIEST_RUNOUT),
                days,
            ));
        }
        if let Some(pdc) = summary.pdc_by_measure.mac {
            extensions.push(Extension::decimal(url(ext::SUMMARY_PDC_MAC), pdc));
        }
        if let Some(pdc) = summary.pdc_by_measure.mad {
            extensions.push(Extension::decimal(url(ext::SUMMARY_PDC_MAD), pdc));
        }
        if let Some(pdc) = summary.pdc_by_measure.mah {
            extensions.push(Extension::decimal(url(ext::SUMMARY_PDC_MAH), pdc));
        }
        extensions.push(Extension::date_time(
            url(ext::SUMMARY_LAST_UPDATED),
            summary.last_updated,
        ));
        extensions
    }

    fn parse_summary(&self, extensions: &[Extension]) -> Option<PatientSummary> {
        let url = |leaf: &str| self.config.extension_url(leaf);
        let get = |leaf: &str| extensions.iter().find(|e| e.url == url(leaf));

        // The last-updated stamp marks a summary as present.
        let last_updated = get(ext::SUMMARY_LAST_UPDATED)
            .and_then(|e| e.value_date_time.as_deref())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.to_utc())?;

        Some(PatientSummary {
            worst_tier: get(ext::SUMMARY_WORST_TIER)
                .and_then(|e| e.value_string.as_deref())
                .and_then(|s| FragilityTier::parse(s).ok()),
            highest_priority_score: get(ext::SUMMARY_HIGHEST_PRIORITY_SCORE)
                .and_then(|e| e.value_integer)
                .unwrap_or(0)
                .max(0) as u32,
            days_until_earliest_runout: get(ext::SUMMARY_DAYS_UNTIL_EARLIEST_RUNOUT)
                .and_then(|e| e.value_integer),
            pdc_by_measure: PdcByMeasure {
                mac: get(ext::SUMMARY_PDC_MAC).and_then(|e| e.value_decimal),
                mad: get(ext::SUMMARY_PDC_MAD).and_then(|e| e.value_decimal),
                mah: get(ext::SUMMARY_PDC_MAH).and_then(|e| e.value_decimal),
            },
            last_updated,
        })
    }

    /// Replace the engine's summary extensions on a raw Patient resource,
    /// leaving every other element untouched.
    fn merge_summary_into(&self, resource: &mut Value, summary: &PatientSummary) {
        let prefix = self.config.extension_url(ext::SUMMARY_PREFIX);

        let mut extensions: Vec<Value> = resource
            .get("extension")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        extensions.retain(|entry| {
            entry
                .get("url")
                .and_then(|u| u.as_str())
                .map(|u| !u.starts_with(&prefix))
                .unwrap_or(true)
        });
        for extension in self.summary_extensions(summary) {
            if let Ok(value) = serde_json::to_value(&extension) {
                extensions.push(value);
            }
        }
        resource["extension"] = Value::Array(extensions);
    }

    fn lenient_extensions(resource: &Value) -> Vec<Extension> {
        resource
            .get("extension")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| serde_json::from_value(e.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn version_of(resource: &Value) -> String {
        resource
            .get("meta")
            .and_then(|m| m.get("versionId"))
            .and_then(|v| v.as_str())
            .unwrap_or("0")
            .to_string()
    }
}

#[async_trait]
impl PatientStore for FhirPatientStore {
    async fn read(&self, patient_id: &str) -> anyhow::Result<PatientRecord> {
        let resource = self
            .client
            .get(&format!("Patient/{}", patient_id))
            .await
            .map_err(into_engine_error)?;

        let extensions = Self::lenient_extensions(&resource);
        Ok(PatientRecord {
            patient_id: patient_id.to_string(),
            version: Self::version_of(&resource),
            summary: self.parse_summary(&extensions),
        })
    }

    async fn write_summary(
        &self,
        patient_id: &str,
        version: &str,
        summary: &PatientSummary,
    ) -> anyhow::Result<SummaryWriteOutcome> {
        let path = format!("Patient/{}", patient_id);
        let mut resource = self.client.get(&path).await.map_err(into_engine_error)?;

        // If another writer landed between the caller's read and this fetch,
        // the conditional PUT below fails on the stale version and the
        // caller retries with a fresh read.
        self.merge_summary_into(&mut resource, summary);

        match self.client.put(&path, &resource, Some(version)).await {
            Ok(_) => Ok(SummaryWriteOutcome::Applied),
            Err(err) if err.is_version_conflict() => {
                debug!(patient_id, version, "patient summary write hit version conflict");
                Ok(SummaryWriteOutcome::VersionConflict)
            }
            Err(err) => Err(into_engine_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FhirClientConfig;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn store() -> FhirPatientStore {
        let client = Arc::new(FhirClient::new(FhirClientConfig::default()).unwrap());
        FhirPatientStore::new(client, EngineConfig::default())
    }

    fn summary() -> PatientSummary {
        PatientSummary {
            worst_tier: Some(FragilityTier::F2Fragile),
            highest_priority_score: 105,
            days_until_earliest_runout: Some(-2),
            pdc_by_measure: PdcByMeasure {
                mac: Some(0.91),
                mad: None,
                mah: Some(0.47),
            },
            last_updated: Utc.with_ymd_and_hms(2025, 6, 15, 2, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_merge_preserves_foreign_extensions_and_fields() {
        let store = store();
        let mut resource = json!({
            "resourceType": "Patient",
            "id": "p1",
            "name": [{"family": "Rivera"}],
            "extension": [
                {"url": "http://hl7.org/fhir/us/core/StructureDefinition/us-core-race",
                 "valueString": "unknown"},
                {"url": store.config.extension_url(ext::SUMMARY_WORST_TIER),
                 "valueString": "F5_SAFE"}
            ]
        });

        store.merge_summary_into(&mut resource, &summary());

        // Name untouched, foreign extension kept, stale summary replaced.
        assert_eq!(resource["name"][0]["family"], "Rivera");
        let extensions = resource["extension"].as_array().unwrap();
        assert!(extensions
            .iter()
            .any(|e| e["url"].as_str().unwrap().contains("us-core-race")));
        let tiers: Vec<&str> = extensions
            .iter()
            .filter(|e| {
                e["url"].as_str().unwrap() == store.config.extension_url(ext::SUMMARY_WORST_TIER)
            })
            .map(|e| e["valueString"].as_str().unwrap())
            .collect();
        assert_eq!(tiers, vec!["F2_FRAGILE"]);
    }

    #[test]
    fn test_summary_round_trip() {
        let store = store();
        let mut resource = json!({"resourceType": "Patient", "id": "p1"});
        store.merge_summary_into(&mut resource, &summary());

        let extensions = FhirPatientStore::lenient_extensions(&resource);
        let parsed = store.parse_summary(&extensions).unwrap();
        assert_eq!(parsed, summary());
    }

    #[test]
    fn test_no_summary_extensions_means_no_summary() {
        let store = store();
        let resource = json!({"resourceType": "Patient", "id": "p1",
            "extension": [{"url": "http://example.org/other", "valueString": "x"}]});
        let extensions = FhirPatientStore::lenient_extensions(&resource);
        assert!(store.parse_summary(&extensions).is_none());
    }

    #[test]
    fn test_version_extraction() {
        let resource = json!({"meta": {"versionId": "7"}});
        assert_eq!(FhirPatientStore::version_of(&resource), "7");
        assert_eq!(FhirPatientStore::version_of(&json!({})), "0");
    }
}
