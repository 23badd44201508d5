//! Serde fragments of the FHIR R4 resources the engine touches.
//!
//! These are deliberately partial: only the elements the engine reads or
//! writes are modeled, everything else rides along as raw JSON where the
//! resource is round-tripped (Patient updates).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RXNORM_SYSTEM: &str = "http://www.nlm.nih.gov/research/umls/rxnorm";
pub const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Coding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    /// The code/display pair for a coding system, if present.
    pub fn code_for_system(&self, system: &str) -> Option<(&str, Option<&str>)> {
        self.coding
            .iter()
            .find(|c| c.system.as_deref() == Some(system))
            .and_then(|c| c.code.as_deref().map(|code| (code, c.display.as_deref())))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quantity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Reference {
    pub fn to(resource_type: &str, id: &str) -> Self {
        Self {
            reference: Some(format!("{}/{}", resource_type, id)),
            display: None,
        }
    }

    /// The id part of a `Type/id` reference.
    pub fn id(&self) -> Option<&str> {
        self.reference
            .as_deref()
            .map(|r| r.rsplit('/').next().unwrap_or(r))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Period {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

/// An extension with the single value[x] choice types the engine uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extension {
    pub url: String,
    #[serde(rename = "valueBoolean", skip_serializing_if = "Option::is_none")]
    pub value_boolean: Option<bool>,
    #[serde(rename = "valueString", skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(rename = "valueInteger", skip_serializing_if = "Option::is_none")]
    pub value_integer: Option<i64>,
    #[serde(rename = "valueDecimal", skip_serializing_if = "Option::is_none")]
    pub value_decimal: Option<f64>,
    #[serde(rename = "valueDateTime", skip_serializing_if = "Option::is_none")]
    pub value_date_time: Option<String>,
    #[serde(rename = "valueReference", skip_serializing_if = "Option::is_none")]
    pub value_reference: Option<Reference>,
    #[serde(rename = "valuePeriod", skip_serializing_if = "Option::is_none")]
    pub value_period: Option<Period>,
}

impl Extension {
    pub fn boolean(url: String, value: bool) -> Self {
        Self {
            url,
            value_boolean: Some(value),
            ..Default::default()
        }
    }

    pub fn string(url: String, value: impl Into<String>) -> Self {
        Self {
            url,
            value_string: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn integer(url: String, value: i64) -> Self {
        Self {
            url,
            value_integer: Some(value),
            ..Default::default()
        }
    }

    pub fn decimal(url: String, value: f64) -> Self {
        Self {
            url,
            value_decimal: Some(value),
            ..Default::default()
        }
    }

    pub fn date_time(url: String, value: DateTime<Utc>) -> Self {
        Self {
            url,
            value_date_time: Some(value.to_rfc3339()),
            ..Default::default()
        }
    }

    pub fn reference(url: String, reference: Reference) -> Self {
        Self {
            url,
            value_reference: Some(reference),
            ..Default::default()
        }
    }

    pub fn period(url: String, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            url,
            value_period: Some(Period {
                start: Some(start.to_string()),
                end: Some(end.to_string()),
            }),
            ..Default::default()
        }
    }
}

/// Find an extension by URL in a slice.
pub fn find_extension<'a>(extensions: &'a [Extension], url: &str) -> Option<&'a Extension> {
    extensions.iter().find(|e| e.url == url)
}

// ============================================================================
// Bundles
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub entry: Vec<BundleEntry>,
    #[serde(default)]
    pub link: Vec<BundleLink>,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleEntry {
    pub resource: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleLink {
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub url: String,
}

impl Bundle {
    pub fn next_link(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|l| l.relation == "next")
            .map(|l| l.url.as_str())
    }

    pub fn resources(self) -> Vec<Value> {
        self.entry.into_iter().filter_map(|e| e.resource).collect()
    }
}

// ============================================================================
// Resource fragments
// ============================================================================

/// The slice of MedicationDispense the dispense reader consumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationDispenseResource {
    pub id: Option<String>,
    pub status: Option<String>,
    pub subject: Option<Reference>,
    pub when_handed_over: Option<String>,
    pub days_supply: Option<Quantity>,
    pub medication_codeable_concept: Option<CodeableConcept>,
    #[serde(default)]
    pub extension: Vec<Extension>,
}

/// The slice of Observation the observation store round-trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationResource {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: String,
    pub code: CodeableConcept,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub has_member: Vec<Reference>,
}

/// Parse a FHIR date or dateTime string into a calendar date.
pub fn parse_fhir_date(raw: &str) -> Option<NaiveDate> {
    raw.get(..10)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
}
