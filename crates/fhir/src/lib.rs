//! FHIR wire/boundary support for the imaging reconciliation tools.
//!
//! This crate provides **wire models** and **translation helpers** for the FHIR R4 JSON
//! resources the reconciler reads and rewrites:
//! - `Bundle` search results and their paging links
//! - `ServiceRequest` (accession identifiers, exam context)
//! - `Patient` (demographics in DICOM conventions)
//! - `Procedure` (worklist identifiers)
//! - `ImagingStudy` (migration and in-place refresh documents)
//!
//! Wire models are lenient: unknown members are ignored on read. `ImagingStudy` keeps the
//! complete JSON object so a rewritten document never loses data it did not touch.
//!
//! This crate does no HTTP. Callers hand it `serde_json::Value` documents.

pub mod bundle;
pub mod datatypes;
pub mod imaging_study;
pub mod patient;
pub mod procedure;
pub mod service_request;

pub use bundle::Bundle;
pub use datatypes::{Annotation, CodeableConcept, HumanName, Identifier, Reference};
pub use imaging_study::ImagingStudy;
pub use patient::{Patient, PatientDemographics};
pub use procedure::{Procedure, WorklistRef};
pub use service_request::{ExamContext, ServiceRequest};

use serde::de::DeserializeOwned;

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;

/// Deserialize a resource after checking its `resourceType`.
///
/// Schema mismatches are reported with the failing path (e.g. `identifier.0.value`).
pub(crate) fn parse_resource<T: DeserializeOwned>(
    value: &serde_json::Value,
    expected: &str,
) -> FhirResult<T> {
    let actual = value
        .get("resourceType")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    if actual != expected {
        return Err(FhirError::InvalidInput(format!(
            "Expected resourceType '{expected}', got '{actual}'"
        )));
    }

    serde_path_to_error::deserialize::<_, T>(value.clone()).map_err(|err| {
        let path = err.path().to_string();
        let path = if path.is_empty() {
            "<root>".to_string()
        } else {
            path
        };
        FhirError::Translation(format!(
            "{expected} schema mismatch at {path}: {}",
            err.into_inner()
        ))
    })
}
