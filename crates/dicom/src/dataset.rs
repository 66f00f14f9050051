//! Lenient DICOM+JSON dataset model.
//!
//! The archive returns arrays of objects keyed by 8-hex-digit tags. Each element carries a
//! value representation and an optional `Value` array; other members (`BulkDataURI`,
//! `InlineBinary`) are ignored.

use crate::{DicomError, DicomResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One DICOM+JSON attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub vr: String,

    #[serde(rename = "Value", default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<serde_json::Value>,
}

/// One DICOM+JSON object (a study, patient or worklist item).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset(BTreeMap<String, Element>);

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a QIDO-RS response body.
    ///
    /// An empty body (the archive answers `204 No Content` to a query without matches) is an
    /// empty result, not an error. Schema mismatches report the failing path, e.g.
    /// `[0].00100020.vr`.
    pub fn parse_array(text: &str) -> DicomResult<Vec<Dataset>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut deserializer = serde_json::Deserializer::from_str(text);
        serde_path_to_error::deserialize::<_, Vec<Dataset>>(&mut deserializer).map_err(|err| {
            let path = err.path().to_string();
            let path = if path.is_empty() { "<root>".to_string() } else { path };
            DicomError::InvalidJson(format!("schema mismatch at {path}: {}", err.into_inner()))
        })
    }

    pub fn element(&self, tag: &str) -> Option<&Element> {
        self.0.get(tag)
    }

    /// First value of a string-valued attribute, trimmed. Empty strings read as absent.
    pub fn string(&self, tag: &str) -> Option<&str> {
        self.element(tag)?
            .value
            .first()?
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// First value of an integer attribute (IS values arrive as numbers or numeric strings).
    pub fn integer(&self, tag: &str) -> Option<i64> {
        let value = self.element(tag)?.value.first()?;
        match value {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Alphabetic component of the first person name value.
    pub fn person_name(&self, tag: &str) -> Option<&str> {
        self.element(tag)?
            .value
            .first()?
            .get("Alphabetic")?
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Items of a sequence attribute. Malformed items are skipped.
    pub fn sequence(&self, tag: &str) -> Vec<Dataset> {
        self.element(tag)
            .map(|e| {
                e.value
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set a single-valued string attribute.
    pub fn with_string(mut self, tag: &str, vr: &str, value: impl Into<String>) -> Self {
        self.0.insert(
            tag.to_string(),
            Element {
                vr: vr.to_string(),
                value: vec![serde_json::Value::String(value.into())],
            },
        );
        self
    }

    /// Set a single-valued person name attribute.
    pub fn with_person_name(mut self, tag: &str, alphabetic: impl Into<String>) -> Self {
        self.0.insert(
            tag.to_string(),
            Element {
                vr: "PN".to_string(),
                value: vec![serde_json::json!({ "Alphabetic": alphabetic.into() })],
            },
        );
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains_key(tag)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
