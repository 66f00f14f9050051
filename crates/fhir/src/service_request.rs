//! ServiceRequest wire model and exam-context translation.
//!
//! A ServiceRequest is the RIS order behind one accession number. The reconciler reads it for:
//! - the accession identifiers used to pair unscheduled and scheduled orders
//! - the subject reference used to find the patient
//! - the study metadata written back to the archive

use crate::datatypes::non_empty;
use crate::{parse_resource, Annotation, CodeableConcept, FhirResult, Identifier, Reference};
use chrono::DateTime;
use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServiceRequest {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub identifier: Vec<Identifier>,

    #[serde(default)]
    pub subject: Option<Reference>,

    #[serde(default)]
    pub code: Option<CodeableConcept>,

    #[serde(default)]
    pub requester: Option<Reference>,

    #[serde(default)]
    pub note: Vec<Annotation>,

    #[serde(rename = "occurrenceDateTime", default)]
    pub occurrence_date_time: Option<String>,
}

/// Study metadata carried by the scheduled order, already in DICOM conventions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExamContext {
    pub description: Option<String>,
    pub referring_physician: Option<String>,
    pub clinical_notes: Option<String>,
    /// `YYYYMMDD`
    pub study_date: Option<String>,
    /// `HHMMSS`
    pub study_time: Option<String>,
}

impl ServiceRequest {
    pub fn parse(value: &serde_json::Value) -> FhirResult<Self> {
        parse_resource(value, "ServiceRequest")
    }

    /// Every key this order can be known by: accession identifiers in `system`, then its id.
    pub fn accession_keys<'a>(&'a self, system: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.identifier
            .iter()
            .filter_map(move |i| i.value_in(system))
            .chain(non_empty(self.id.as_deref()))
    }

    /// Logical id of the referenced Patient.
    pub fn patient_id(&self) -> Option<&str> {
        self.subject.as_ref()?.id_for("Patient")
    }

    pub fn exam_context(&self) -> ExamContext {
        let (study_date, study_time) = self
            .occurrence_date_time
            .as_deref()
            .and_then(|s| non_empty(Some(s)))
            .map(dicom_date_time)
            .unwrap_or((None, None));

        ExamContext {
            description: self
                .code
                .as_ref()
                .and_then(|c| non_empty(c.text.as_deref()))
                .map(str::to_string),
            referring_physician: self
                .requester
                .as_ref()
                .and_then(|r| non_empty(r.display.as_deref()))
                .map(str::to_string),
            clinical_notes: self
                .note
                .first()
                .and_then(|n| non_empty(n.text.as_deref()))
                .map(str::to_string),
            study_date,
            study_time,
        }
    }
}

/// Split a FHIR dateTime into DICOM DA and TM values.
///
/// Full timestamps keep the wall-clock time as written (no timezone conversion). Partial
/// values (`2025-01-02`, `2025-01-02T10:20`) are handled textually.
fn dicom_date_time(value: &str) -> (Option<String>, Option<String>) {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return (
            Some(dt.format("%Y%m%d").to_string()),
            Some(dt.format("%H%M%S").to_string()),
        );
    }

    let (date_part, time_part) = match value.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (value, None),
    };
    let date: String = date_part.chars().filter(char::is_ascii_digit).collect();
    let time: Option<String> = time_part.map(|t| {
        t.chars()
            .take_while(|c| c.is_ascii_digit() || *c == ':')
            .filter(char::is_ascii_digit)
            .take(6)
            .collect()
    });

    (
        Some(date).filter(|d| !d.is_empty()),
        time.filter(|t| !t.is_empty()),
    )
}
