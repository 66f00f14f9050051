//! Procedure wire model.
//!
//! The RIS mirrors each worklist entry as a Procedure keyed by accession. Its identifiers
//! carry the worklist coordinates needed to close the entry.

use crate::{parse_resource, FhirResult, Identifier};
use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Procedure {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub identifier: Vec<Identifier>,
}

/// Coordinates of one worklist item: `mwlitems/{study_id}/{sps_id}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorklistRef {
    pub study_id: String,
    pub sps_id: String,
}

impl Procedure {
    pub fn parse(value: &serde_json::Value) -> FhirResult<Self> {
        parse_resource(value, "Procedure")
    }

    /// Both worklist identifiers, or `None` if either is missing. Later entries win.
    pub fn worklist_ref(&self, sps_system: &str, study_id_system: &str) -> Option<WorklistRef> {
        let last_in = |system: &str| {
            self.identifier
                .iter()
                .rev()
                .find_map(|i| i.value_in(system))
                .map(str::to_string)
        };

        Some(WorklistRef {
            study_id: last_in(study_id_system)?,
            sps_id: last_in(sps_system)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requires_both_identifiers() {
        let full = Procedure::parse(&json!({
            "resourceType": "Procedure",
            "identifier": [
                {"system": "urn:sps", "value": "SPS-1"},
                {"system": "urn:study", "value": "ST-1"}
            ]
        }))
        .expect("parse");
        assert_eq!(
            full.worklist_ref("urn:sps", "urn:study"),
            Some(WorklistRef {
                study_id: "ST-1".into(),
                sps_id: "SPS-1".into()
            })
        );

        let partial = Procedure::parse(&json!({
            "resourceType": "Procedure",
            "identifier": [{"system": "urn:sps", "value": "SPS-1"}]
        }))
        .expect("parse");
        assert_eq!(partial.worklist_ref("urn:sps", "urn:study"), None);
    }
}
