//! DICOM+JSON wire support for the archive's QIDO-RS, worklist and patient endpoints.
//!
//! This crate provides:
//! - a lenient [`Dataset`] model for `tag -> {vr, Value}` objects returned by the archive
//! - the tag constants the reconciliation tools query and write
//! - payload builders for patient merges and study metadata updates
//!
//! It knows nothing about HTTP. Callers fetch the text and hand it to
//! [`Dataset::parse_array`].

pub mod dataset;
pub mod payload;
pub mod tags;

pub use dataset::{Dataset, Element};
pub use payload::{merge_payload, study_update_payload, DicomDemographics, StudyUpdate};

/// Errors returned by the `dicom-json` crate.
#[derive(Debug, thiserror::Error)]
pub enum DicomError {
    #[error("invalid DICOM+JSON: {0}")]
    InvalidJson(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Type alias for Results that can fail with a [`DicomError`].
pub type DicomResult<T> = Result<T, DicomError>;
