//! Request bodies for the archive's patient-merge and study-update endpoints.

use crate::tags;
use crate::Dataset;

/// Patient demographics already converted to DICOM conventions
/// (`FAMILY^GIVEN` or free text names, `YYYYMMDD` dates, single-letter sex).
///
/// Absent fields are omitted from payloads rather than sent empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DicomDemographics {
    pub name: Option<String>,
    pub birth_date: Option<String>,
    pub sex: Option<String>,
}

impl DicomDemographics {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.birth_date.is_none() && self.sex.is_none()
    }

    /// Read demographics from a patient or study dataset.
    pub fn from_dataset(ds: &Dataset) -> Self {
        Self {
            name: ds.person_name(tags::PATIENT_NAME).map(str::to_string),
            birth_date: ds.string(tags::PATIENT_BIRTH_DATE).map(str::to_string),
            sex: ds.string(tags::PATIENT_SEX).map(str::to_string),
        }
    }
}

/// Study attributes written when an archived study is re-tagged with its scheduled accession.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StudyUpdate {
    pub study_instance_uid: String,
    pub patient_id: String,
    pub accession_number: String,
    pub description: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub referring_physician: Option<String>,
    pub clinical_notes: Option<String>,
}

/// Body for `PUT .../patients/{pid}[^^^{issuer}]?merge=true`.
///
/// The archive expects an array holding one dataset with the canonical identity.
pub fn merge_payload(
    patient_id: &str,
    canonical_issuer: &str,
    demographics: &DicomDemographics,
) -> serde_json::Value {
    let mut ds = Dataset::new()
        .with_string(tags::PATIENT_ID, "LO", patient_id)
        .with_string(tags::ISSUER_OF_PATIENT_ID, "LO", canonical_issuer);
    if let Some(name) = &demographics.name {
        ds = ds.with_person_name(tags::PATIENT_NAME, name.as_str());
    }
    if let Some(dob) = &demographics.birth_date {
        ds = ds.with_string(tags::PATIENT_BIRTH_DATE, "DA", dob.as_str());
    }
    if let Some(sex) = &demographics.sex {
        ds = ds.with_string(tags::PATIENT_SEX, "CS", sex.as_str());
    }
    serde_json::Value::Array(vec![ds.to_json()])
}

/// Body for `PUT .../studies/{uid}`.
pub fn study_update_payload(update: &StudyUpdate) -> serde_json::Value {
    let mut ds = Dataset::new()
        .with_string(tags::STUDY_INSTANCE_UID, "UI", update.study_instance_uid.as_str())
        .with_string(tags::PATIENT_ID, "LO", update.patient_id.as_str())
        .with_string(tags::ACCESSION_NUMBER, "SH", update.accession_number.as_str());

    let optional = [
        (tags::STUDY_DESCRIPTION, "LO", &update.description),
        (tags::STUDY_DATE, "DA", &update.study_date),
        (tags::STUDY_TIME, "TM", &update.study_time),
        (tags::ADDITIONAL_PATIENT_HISTORY, "LT", &update.clinical_notes),
    ];
    for (tag, vr, value) in optional {
        if let Some(v) = value {
            ds = ds.with_string(tag, vr, v.as_str());
        }
    }
    // Referring physician is sent as a plain PN string, not an Alphabetic object.
    if let Some(doc) = &update.referring_physician {
        ds = ds.with_string(tags::REFERRING_PHYSICIAN_NAME, "PN", doc.as_str());
    }

    ds.to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_payload_omits_absent_demographics() {
        let demo = DicomDemographics {
            name: Some("DOE^JANE".into()),
            birth_date: None,
            sex: Some("F".into()),
        };
        let body = merge_payload("P1", "CANON", &demo);
        assert_eq!(
            body,
            json!([{
                "00100010": {"vr": "PN", "Value": [{"Alphabetic": "DOE^JANE"}]},
                "00100020": {"vr": "LO", "Value": ["P1"]},
                "00100021": {"vr": "LO", "Value": ["CANON"]},
                "00100040": {"vr": "CS", "Value": ["F"]}
            }])
        );
    }

    #[test]
    fn study_update_includes_only_known_fields() {
        let update = StudyUpdate {
            study_instance_uid: "1.2.3".into(),
            patient_id: "MRN1".into(),
            accession_number: "ACC1".into(),
            study_date: Some("20250102".into()),
            ..Default::default()
        };
        let body = study_update_payload(&update);
        let obj = body.as_object().expect("object");
        assert_eq!(obj.len(), 4);
        assert_eq!(body["00080050"]["Value"][0], "ACC1");
        assert_eq!(body["00080020"]["vr"], "DA");
        assert!(!obj.contains_key("00081030"));
    }

    #[test]
    fn demographics_from_dataset() {
        let ds = Dataset::new()
            .with_person_name(tags::PATIENT_NAME, "ROE^RICHARD")
            .with_string(tags::PATIENT_BIRTH_DATE, "DA", "19800101");
        let demo = DicomDemographics::from_dataset(&ds);
        assert_eq!(demo.name.as_deref(), Some("ROE^RICHARD"));
        assert_eq!(demo.birth_date.as_deref(), Some("19800101"));
        assert!(demo.sex.is_none());
        assert!(!demo.is_empty());
    }
}
