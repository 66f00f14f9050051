//! FHIR search result bundles.

use crate::{parse_resource, FhirResult};
use serde::Deserialize;

/// Search-set bundle. Entries are kept as raw JSON so callers can pick resource types.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub entry: Vec<BundleEntry>,

    #[serde(default)]
    pub link: Vec<BundleLink>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BundleEntry {
    #[serde(default)]
    pub resource: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BundleLink {
    #[serde(default)]
    pub relation: String,

    #[serde(default)]
    pub url: String,
}

impl Bundle {
    pub fn parse(value: &serde_json::Value) -> FhirResult<Self> {
        parse_resource(value, "Bundle")
    }

    /// URL of the next page, if the server paginated the result.
    pub fn next_link(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|l| l.relation == "next")
            .map(|l| l.url.trim())
            .filter(|u| !u.is_empty())
    }

    /// Entry resources whose `resourceType` matches.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = &'a serde_json::Value> + 'a {
        self.entry
            .iter()
            .filter_map(|e| e.resource.as_ref())
            .filter(move |r| {
                r.get("resourceType").and_then(serde_json::Value::as_str) == Some(resource_type)
            })
    }

    /// Logical ids of the entry resources of one type, in bundle order.
    pub fn resource_ids(&self, resource_type: &str) -> Vec<String> {
        self.resources_of_type(resource_type)
            .filter_map(|r| r.get("id").and_then(serde_json::Value::as_str))
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .collect()
    }
}
