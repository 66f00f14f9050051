//! FHIR Patient wire model and demographics translation.
//!
//! This module provides both a domain-level demographics type and the wire model for
//! Patient resources served by the FHIR server.
//!
//! Responsibilities:
//! - Define the flat demographics carrier used by the reconciler
//! - Define a lenient wire model for deserialisation
//! - Translate FHIR conventions (ISO dates, `gender` codes) into DICOM ones
//!
//! Notes:
//! - The MRN is the first identifier value; the archive files studies under it
//! - Patients without any usable identifier are rejected, never guessed

use crate::datatypes::non_empty;
use crate::{parse_resource, FhirError, FhirResult, HumanName, Identifier};
use chrono::NaiveDate;
use serde::Deserialize;

// ============================================================================
// Public domain-level types
// ============================================================================

/// Demographics of the patient referenced by a scheduled order.
///
/// Values are already in the form the archive expects. Owned by one reconciliation run and
/// discarded after use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatientDemographics {
    /// Medical record number (archive Patient ID).
    pub mrn: String,

    /// Display name; empty when the resource carries no usable name.
    pub name: String,

    /// Birth date as `YYYYMMDD`.
    pub birth_date: Option<String>,

    /// Single-letter DICOM sex code (`M`, `F`, `O`, `U`).
    pub sex: String,
}

// ============================================================================
// Public Patient operations
// ============================================================================

/// Patient resource as read from the FHIR server.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Patient {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub identifier: Vec<Identifier>,

    #[serde(default)]
    pub name: Vec<HumanName>,

    #[serde(rename = "birthDate", default)]
    pub birth_date: Option<String>,

    #[serde(default)]
    pub gender: Option<String>,
}

impl Patient {
    /// Parse a Patient resource.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError`] if the value is not a Patient or a known field has the wrong type.
    pub fn parse(value: &serde_json::Value) -> FhirResult<Self> {
        parse_resource(value, "Patient")
    }

    /// Extract demographics in DICOM conventions.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if neither an identifier value nor a resource id is
    /// available to serve as MRN.
    pub fn demographics(&self) -> FhirResult<PatientDemographics> {
        let mrn = self
            .identifier
            .first()
            .and_then(|i| non_empty(i.value.as_deref()))
            .or_else(|| non_empty(self.id.as_deref()))
            .ok_or_else(|| FhirError::InvalidInput("Patient has no identifier or id".into()))?;

        Ok(PatientDemographics {
            mrn: mrn.to_string(),
            name: self
                .name
                .first()
                .and_then(HumanName::display)
                .unwrap_or_default(),
            birth_date: non_empty(self.birth_date.as_deref()).map(dicom_date),
            sex: dicom_sex(self.gender.as_deref()),
        })
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

/// `1992-03-20` -> `19920320`. Unparseable values keep their digits only.
fn dicom_date(value: &str) -> String {
    match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(date) => date.format("%Y%m%d").to_string(),
        Err(_) => value.chars().filter(char::is_ascii_digit).collect(),
    }
}

/// First letter of the FHIR gender code, upper-cased; `O` when absent.
fn dicom_sex(gender: Option<&str>) -> String {
    non_empty(gender)
        .and_then(|g| g.chars().next())
        .map(|c| c.to_ascii_uppercase().to_string())
        .unwrap_or_else(|| "O".to_string())
}
