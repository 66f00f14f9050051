//! ImagingStudy documents and the rewrites the reconciler applies to them.
//!
//! The document is kept as a full JSON object: the reconciler only rewrites `id`, `status`,
//! `subject.reference` and the accession identifier, and everything else it was given must
//! survive the round trip.

use crate::{FhirError, FhirResult};
use serde_json::{json, Map, Value};

/// Status written to every reconciled study.
pub const AVAILABLE: &str = "available";

#[derive(Clone, Debug, PartialEq)]
pub struct ImagingStudy(Map<String, Value>);

impl ImagingStudy {
    /// Wrap a JSON document after checking its `resourceType`.
    pub fn parse(value: Value) -> FhirResult<Self> {
        match value {
            Value::Object(map)
                if map.get("resourceType").and_then(Value::as_str) == Some("ImagingStudy") =>
            {
                Ok(Self(map))
            }
            other => Err(FhirError::InvalidInput(format!(
                "Expected an ImagingStudy object, got {}",
                other
                    .get("resourceType")
                    .and_then(Value::as_str)
                    .unwrap_or("non-resource JSON")
            ))),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    pub fn subject_reference(&self) -> Option<&str> {
        self.0
            .get("subject")
            .and_then(|s| s.get("reference"))
            .and_then(Value::as_str)
    }

    /// Values of identifiers in `system`.
    pub fn identifier_values<'a>(&'a self, system: &'a str) -> Vec<&'a str> {
        self.identifiers()
            .iter()
            .filter(|i| i.get("system").and_then(Value::as_str) == Some(system))
            .filter_map(|i| i.get("value").and_then(Value::as_str))
            .collect()
    }

    /// Build the replacement document that re-keys this study under `new_id`.
    ///
    /// - `id` becomes `new_id`, `status` becomes `available`
    /// - `subject.reference` points at `Patient/{patient_id}`; other subject members are kept
    /// - the accession identifier (first one in `accession_system`, or a new one) carries
    ///   `new_id`; further accession entries are dropped, other systems are preserved in order
    /// - server-managed `meta` and generated `text` are removed
    pub fn migrated(&self, new_id: &str, patient_id: &str, accession_system: &str) -> Self {
        let mut doc = self.0.clone();
        doc.remove("meta");
        doc.remove("text");
        doc.insert("id".into(), Value::String(new_id.to_string()));

        let mut next = Self(doc);
        next.set_status_and_subject(patient_id);

        let mut accession = None;
        let mut others = Vec::new();
        for ident in self.identifiers() {
            let in_system = ident.get("system").and_then(Value::as_str) == Some(accession_system);
            match (in_system, accession.is_some()) {
                (true, false) => accession = Some(ident.clone()),
                (true, true) => {}
                (false, _) => others.push(ident.clone()),
            }
        }
        let mut accession = accession
            .unwrap_or_else(|| json!({ "system": accession_system }));
        if let Value::Object(obj) = &mut accession {
            obj.insert("value".into(), Value::String(new_id.to_string()));
        }

        let mut identifiers = vec![accession];
        identifiers.extend(others);
        next.0.insert("identifier".into(), Value::Array(identifiers));
        next
    }

    /// In-place refresh (status + patient reference), or `None` if already current.
    pub fn refreshed(&self, patient_id: &str) -> Option<Self> {
        let reference = format!("Patient/{patient_id}");
        if self.status() == Some(AVAILABLE) && self.subject_reference() == Some(reference.as_str())
        {
            return None;
        }
        let mut next = self.clone();
        next.set_status_and_subject(patient_id);
        Some(next)
    }

    /// Shape check run before any irreversible delete.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Validation`] naming the first violated rule.
    pub fn validate(&self, expected_id: &str, accession_system: &str) -> FhirResult<()> {
        let fail = |msg: String| Err(FhirError::Validation(msg));

        if self.0.get("resourceType").and_then(Value::as_str) != Some("ImagingStudy") {
            return fail("resourceType must be ImagingStudy".into());
        }
        if self.id() != Some(expected_id) {
            return fail(format!("id must be {expected_id}, got {:?}", self.id()));
        }
        if self.status().map_or(true, str::is_empty) {
            return fail("status is missing".into());
        }
        match self.subject_reference() {
            Some(r) if r.starts_with("Patient/") && r.len() > "Patient/".len() => {}
            other => return fail(format!("subject.reference is not a Patient: {other:?}")),
        }
        let accessions = self.identifier_values(accession_system);
        if accessions != [expected_id] {
            return fail(format!(
                "expected exactly one accession identifier {expected_id}, got {accessions:?}"
            ));
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    fn identifiers(&self) -> &[Value] {
        self.0
            .get("identifier")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn set_status_and_subject(&mut self, patient_id: &str) {
        self.0
            .insert("status".into(), Value::String(AVAILABLE.to_string()));

        let mut subject = match self.0.remove("subject") {
            Some(Value::Object(obj)) => obj,
            _ => Map::new(),
        };
        subject.insert(
            "reference".into(),
            Value::String(format!("Patient/{patient_id}")),
        );
        self.0.insert("subject".into(), Value::Object(subject));
    }
}
