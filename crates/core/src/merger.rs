//! Consolidation of archive patient identities under the canonical issuer.
//!
//! The archive may hold the same patient id under several issuers (including none). The
//! merger scans the patient directory, groups records by patient id, and merges every
//! non-canonical identity of a group into the canonical one.

use crate::audit::{AuditEntry, AuditLog, AuditResult};
use crate::clients::{DicomClient, MirrorClient};
use crate::config::SyncConfig;
use crate::gate::{DryRunGate, Mutation, DICOM_JSON};
use crate::outcome::Outcome;
use crate::summary::MergeSummary;
use crate::token::AccessToken;
use crate::SyncResult;
use dicom_json::{merge_payload, tags, Dataset, DicomDemographics};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Marker for a record filed without an Issuer of Patient ID.
pub const EMPTY_ISSUER: &str = "";

/// All issuers one patient id is known under, in first-seen order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatientIdentityGroup {
    pub patient_id: String,
    pub issuers: Vec<String>,
}

/// Accumulates `(patient id, issuer)` pairs from directory pages.
#[derive(Debug, Default)]
pub struct IdentityDirectory {
    groups: BTreeMap<String, Vec<String>>,
}

impl IdentityDirectory {
    pub fn add(&mut self, patient_id: &str, issuer: &str) {
        let issuers = self.groups.entry(patient_id.to_string()).or_default();
        if !issuers.iter().any(|i| i == issuer) {
            issuers.push(issuer.to_string());
        }
    }

    /// Record one patient dataset. Returns `false` if it carries no patient id.
    pub fn add_dataset(&mut self, ds: &Dataset) -> bool {
        let Some(patient_id) = ds.string(tags::PATIENT_ID) else {
            return false;
        };
        let issuer = ds.string(tags::ISSUER_OF_PATIENT_ID).unwrap_or(EMPTY_ISSUER);
        self.add(patient_id, issuer);
        true
    }

    /// Groups ordered by patient id.
    pub fn into_groups(self) -> Vec<PatientIdentityGroup> {
        self.groups
            .into_iter()
            .map(|(patient_id, issuers)| PatientIdentityGroup {
                patient_id,
                issuers,
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergePlan {
    /// Only the canonical issuer is present.
    AlreadyCanonical,
    /// The only identity has no issuer; the archive rejects merging it.
    UnsafeEmptyIssuer,
    /// Merge `seed` first (if any), then every source, each into the canonical issuer.
    Merge {
        seed: Option<String>,
        sources: Vec<String>,
    },
}

impl MergePlan {
    /// Source issuers in call order.
    pub fn calls(&self) -> Vec<&str> {
        match self {
            Self::Merge { seed, sources } => seed
                .iter()
                .chain(sources.iter())
                .map(String::as_str)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Decide which merge calls a group needs.
///
/// - canonical present: no seed, every other issuer (the empty one included) is a source
/// - otherwise the seed is the first non-empty issuer that is not a placeholder, falling back
///   to the first issuer seen; empty issuers are never sources once a seed is chosen
pub fn plan_merge(
    group: &PatientIdentityGroup,
    canonical: &str,
    placeholders: &[String],
) -> MergePlan {
    let issuers = &group.issuers;
    if issuers.iter().all(|i| i == canonical) {
        return MergePlan::AlreadyCanonical;
    }
    if issuers.iter().all(|i| i == EMPTY_ISSUER) {
        return MergePlan::UnsafeEmptyIssuer;
    }

    if issuers.iter().any(|i| i == canonical) {
        return MergePlan::Merge {
            seed: None,
            sources: issuers.iter().filter(|i| *i != canonical).cloned().collect(),
        };
    }

    let seed = issuers
        .iter()
        .find(|i| !i.is_empty() && !placeholders.contains(*i))
        .or_else(|| issuers.first())
        .cloned()
        .unwrap_or_default();
    let sources = issuers
        .iter()
        .filter(|i| **i != seed && *i != canonical && !i.is_empty())
        .cloned()
        .collect();

    MergePlan::Merge {
        seed: Some(seed),
        sources,
    }
}

fn display_issuer(issuer: &str) -> &str {
    if issuer.is_empty() {
        "<empty>"
    } else {
        issuer
    }
}

enum GroupOutcome {
    AlreadyCanonical,
    SkippedUnsafe,
    Merged { calls: usize, failed: usize },
}

pub struct PatientIdentityMerger {
    cfg: Arc<SyncConfig>,
    dicom: DicomClient,
    mirror: Option<MirrorClient>,
    gate: DryRunGate,
    audit: Arc<AuditLog>,
}

impl PatientIdentityMerger {
    pub fn new(
        cfg: Arc<SyncConfig>,
        dicom: DicomClient,
        mirror: Option<MirrorClient>,
        gate: DryRunGate,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            cfg,
            dicom,
            mirror,
            gate,
            audit,
        }
    }

    pub async fn run(&self, token: &AccessToken) -> SyncResult<MergeSummary> {
        let groups = self.scan(token).await;
        let mut summary = MergeSummary {
            groups: groups.len(),
            ..MergeSummary::default()
        };
        info!("{} patient identity groups found", groups.len());

        for group in &groups {
            match self.merge_group(token, group).await {
                Ok(GroupOutcome::AlreadyCanonical) => summary.already_canonical += 1,
                Ok(GroupOutcome::SkippedUnsafe) => summary.skipped_unsafe += 1,
                Ok(GroupOutcome::Merged { calls, failed }) => {
                    summary.merge_calls += calls;
                    summary.failed_calls += failed;
                    if failed == 0 {
                        summary.merged += 1;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(patient = %group.patient_id, "merge failed: {e}");
                    summary.errored += 1;
                    self.audit.record(
                        &AuditEntry::new(
                            group.patient_id.as_str(),
                            self.cfg.canonical_issuer(),
                            "merge",
                            AuditResult::Failed,
                        )
                        .with_code("error")
                        .with_info(e.to_string()),
                    )?;
                }
            }
        }

        self.cleanup_mirror().await?;
        Ok(summary)
    }

    /// Page through the patient directory until an empty page.
    ///
    /// A failed or unparseable page ends the scan early; what was read so far is kept.
    pub async fn scan(&self, token: &AccessToken) -> Vec<PatientIdentityGroup> {
        let page_size = self.cfg.patient_page_size();
        let mut directory = IdentityDirectory::default();
        let mut offset = 0;
        let mut seen_first = BTreeSet::new();

        loop {
            let page = match self.dicom.patients_page(token, offset, page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("patient directory scan stopped at offset {offset}: {e}");
                    break;
                }
            };
            let Some(first) = page.first() else {
                break;
            };
            // Servers that ignore `offset` return the same page forever.
            if !seen_first.insert(first.to_json().to_string()) {
                warn!("patient directory repeated a page at offset {offset}, stopping scan");
                break;
            }

            let without_id = page.iter().filter(|ds| !directory.add_dataset(ds)).count();
            if without_id > 0 {
                debug!("{without_id} patient records without an id at offset {offset}");
            }
            offset += page.len();
        }

        directory.into_groups()
    }

    async fn merge_group(
        &self,
        token: &AccessToken,
        group: &PatientIdentityGroup,
    ) -> SyncResult<GroupOutcome> {
        let canonical = self.cfg.canonical_issuer();
        let plan = plan_merge(group, canonical, self.cfg.issuer_placeholders());

        match &plan {
            MergePlan::AlreadyCanonical => {
                debug!(patient = %group.patient_id, "already canonical");
                return Ok(GroupOutcome::AlreadyCanonical);
            }
            MergePlan::UnsafeEmptyIssuer => {
                warn!(
                    patient = %group.patient_id,
                    "sole identity has no issuer, archive rejects this merge; fix out-of-band"
                );
                self.audit.record(
                    &AuditEntry::new(
                        group.patient_id.as_str(),
                        canonical,
                        "merge",
                        AuditResult::Skipped,
                    )
                    .with_info("known-unsafe: sole identity has an empty issuer"),
                )?;
                return Ok(GroupOutcome::SkippedUnsafe);
            }
            MergePlan::Merge { .. } => {}
        }

        let demographics = self.pick_demographics(token, &group.patient_id).await;
        let payload = merge_payload(&group.patient_id, canonical, &demographics);

        let mut failed = 0;
        let calls = plan.calls();
        for source in &calls {
            info!(
                patient = %group.patient_id,
                "merging {} -> {canonical}",
                display_issuer(source)
            );
            let mutation = Mutation::put(self.dicom.merge_url(&group.patient_id, source), "merge")
                .with_json(payload.clone(), DICOM_JSON)
                .about(group.patient_id.as_str(), canonical)
                .with_info(format!("{} -> {canonical}", display_issuer(source)));
            let result = self.gate.execute(token, mutation).await?;
            if !result.is_success() && result.outcome != Outcome::Accepted {
                failed += 1;
            }
        }

        Ok(GroupOutcome::Merged {
            calls: calls.len(),
            failed,
        })
    }

    /// Demographics sent with every merge call of a patient.
    ///
    /// Prefers a record already filed under the canonical issuer, then the most recent study.
    /// Read failures fall through to the next source; the result may be empty.
    pub async fn pick_demographics(
        &self,
        token: &AccessToken,
        patient_id: &str,
    ) -> DicomDemographics {
        let canonical = self.cfg.canonical_issuer();
        match self.dicom.patients_by_id(token, patient_id).await {
            Ok(records) => {
                let found = records
                    .iter()
                    .filter(|ds| ds.string(tags::ISSUER_OF_PATIENT_ID) == Some(canonical))
                    .map(DicomDemographics::from_dataset)
                    .find(|d| !d.is_empty());
                if let Some(demographics) = found {
                    return demographics;
                }
            }
            Err(e) => warn!(patient = %patient_id, "canonical record lookup failed: {e}"),
        }

        match self.dicom.studies_by_patient(token, patient_id).await {
            Ok(studies) => latest_study(&studies)
                .map(DicomDemographics::from_dataset)
                .unwrap_or_default(),
            Err(e) => {
                warn!(patient = %patient_id, "study lookup failed: {e}");
                DicomDemographics::default()
            }
        }
    }

    async fn cleanup_mirror(&self) -> SyncResult<()> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        let Some(rpc) = mirror.cleanup_rpc() else {
            return Ok(());
        };
        if !self.gate.dry_run() {
            let delay = self.cfg.safety_delay();
            warn!(
                "relational mirror will be modified via {rpc} in {}s",
                delay.as_secs()
            );
            tokio::time::sleep(delay).await;
        }

        let result = self
            .gate
            .execute(mirror.key(), mirror.cleanup_call(rpc).about("mirror", rpc))
            .await?;
        if let Err(e) = result.require_success(rpc) {
            error!("mirror cleanup failed: {e}");
        }
        Ok(())
    }
}

/// Most recent study by `StudyDate` then `StudyTime`; the first one wins ties.
pub fn latest_study(studies: &[Dataset]) -> Option<&Dataset> {
    let key = |ds: &Dataset| {
        (
            ds.string(tags::STUDY_DATE).unwrap_or("").to_string(),
            ds.string(tags::STUDY_TIME).unwrap_or("").to_string(),
        )
    };
    studies.iter().fold(None, |best: Option<&Dataset>, ds| match best {
        Some(current) if key(current) >= key(ds) => Some(current),
        _ => Some(ds),
    })
}
