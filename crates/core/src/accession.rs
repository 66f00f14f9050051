//! Pairing of unscheduled accessions with their scheduled counterparts.

use fhir::ServiceRequest;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// An unscheduled accession whose scheduled counterpart also exists.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AccessionPair {
    /// e.g. `ACC1-unscheduled`
    pub unscheduled: String,
    /// e.g. `ACC1`
    pub scheduled: String,
    /// Logical ids of the ServiceRequests carrying the unscheduled accession in this run's
    /// collection. Empty when the pair was built from bare accession keys.
    pub order_ids: Vec<String>,
}

impl AccessionPair {
    pub fn new(unscheduled: impl Into<String>, scheduled: impl Into<String>) -> Self {
        Self {
            unscheduled: unscheduled.into(),
            scheduled: scheduled.into(),
            order_ids: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessionResolution {
    pub accessions: BTreeSet<String>,
    /// Sorted by unscheduled accession.
    pub pairs: Vec<AccessionPair>,
    /// Unscheduled accessions without a scheduled counterpart.
    pub orphans: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct AccessionResolver {
    accession_system: String,
    suffix: String,
}

impl AccessionResolver {
    pub fn new(accession_system: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            accession_system: accession_system.into(),
            suffix: suffix.into(),
        }
    }

    /// Collect every accession key from raw ServiceRequest resources and pair them.
    ///
    /// A resource whose identifiers do not parse still contributes its own id.
    pub fn resolve(&self, resources: &[serde_json::Value]) -> AccessionResolution {
        let mut orders: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for value in resources {
            let id = value
                .get("id")
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|id| !id.is_empty());

            let keys: Vec<String> = match ServiceRequest::parse(value) {
                Ok(sr) => sr
                    .accession_keys(&self.accession_system)
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect(),
                Err(e) => {
                    warn!(
                        "ServiceRequest/{} unreadable, keeping only its id: {e}",
                        id.unwrap_or("<no id>")
                    );
                    id.map(str::to_string).into_iter().collect()
                }
            };

            for key in keys {
                let ids = orders.entry(key).or_default();
                if let Some(id) = id {
                    ids.insert(id.to_string());
                }
            }
        }
        self.pair_orders(orders)
    }

    /// Pair an already-collected set of accessions.
    pub fn pair(&self, accessions: BTreeSet<String>) -> AccessionResolution {
        self.pair_orders(accessions.into_iter().map(|a| (a, BTreeSet::new())).collect())
    }

    fn pair_orders(&self, orders: BTreeMap<String, BTreeSet<String>>) -> AccessionResolution {
        let mut pairs = Vec::new();
        let mut orphans = Vec::new();

        for (accession, ids) in &orders {
            let Some(scheduled) = accession.strip_suffix(self.suffix.as_str()) else {
                continue;
            };
            if !scheduled.is_empty() && orders.contains_key(scheduled) {
                pairs.push(AccessionPair {
                    unscheduled: accession.clone(),
                    scheduled: scheduled.to_string(),
                    order_ids: ids.iter().cloned().collect(),
                });
            } else {
                orphans.push(accession.clone());
            }
        }

        AccessionResolution {
            accessions: orders.into_keys().collect(),
            pairs,
            orphans,
        }
    }
}
