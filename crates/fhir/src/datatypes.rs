//! FHIR complex datatypes shared by several resources.

use serde::{Deserialize, Serialize};

/// Business identifier (`system` + `value`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Identifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Identifier {
    /// Trimmed non-empty value when the identifier belongs to `system`.
    pub fn value_in(&self, system: &str) -> Option<&str> {
        if self.system.as_deref() != Some(system) {
            return None;
        }
        non_empty(self.value.as_deref())
    }
}

/// Literal reference to another resource (`Patient/123`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Reference {
    /// Logical id of the target when the reference points at `resource_type`.
    ///
    /// A bare id without a type prefix is accepted as-is.
    pub fn id_for(&self, resource_type: &str) -> Option<&str> {
        let reference = non_empty(self.reference.as_deref())?;
        let id = match reference.split_once('/') {
            Some((kind, id)) if kind == resource_type => id,
            Some(_) => return None,
            None => reference,
        };
        non_empty(Some(id))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Human name as written by the RIS: either free `text` or `given` + `family`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HumanName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub given: Vec<String>,
}

impl HumanName {
    /// `text` if present, otherwise the first given name followed by the family name.
    pub fn display(&self) -> Option<String> {
        if let Some(text) = non_empty(self.text.as_deref()) {
            return Some(text.to_string());
        }
        let parts: Vec<&str> = [
            non_empty(self.given.first().map(String::as_str)),
            non_empty(self.family.as_deref()),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Trim and drop empty strings.
pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
