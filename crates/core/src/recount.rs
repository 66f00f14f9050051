//! Correction of stale instance counts in the relational mirror.
//!
//! The mirror's `imagingStudy.numberOfInstances` is compared with the archive's study-level
//! count; rows that disagree are patched to the archive's value.

use crate::audit::{AuditEntry, AuditLog, AuditResult};
use crate::clients::{DicomClient, MirrorClient, MirrorStudy};
use crate::gate::DryRunGate;
use crate::summary::RecountSummary;
use crate::token::AccessToken;
use crate::SyncResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct InstanceRecounter {
    dicom: DicomClient,
    mirror: MirrorClient,
    gate: DryRunGate,
    audit: Arc<AuditLog>,
}

impl InstanceRecounter {
    pub fn new(
        dicom: DicomClient,
        mirror: MirrorClient,
        gate: DryRunGate,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            dicom,
            mirror,
            gate,
            audit,
        }
    }

    /// # Errors
    ///
    /// Fails if the mirror rows cannot be read at all, or on fatal errors.
    pub async fn run(&self, token: &AccessToken) -> SyncResult<RecountSummary> {
        let rows = self.mirror.imaging_studies().await?;
        info!("{} mirror ImagingStudy rows to check", rows.len());

        let mut summary = RecountSummary::default();
        for row in &rows {
            summary.checked += 1;
            if let Err(e) = self.check(token, row, &mut summary).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(study = %row.id, "recount failed: {e}");
                summary.errored += 1;
                self.audit.record(
                    &AuditEntry::new(row.id.as_str(), "-", "recount", AuditResult::Skipped)
                        .with_info(format!("archive count unavailable: {e}")),
                )?;
            }
        }

        Ok(summary)
    }

    async fn check(
        &self,
        token: &AccessToken,
        row: &MirrorStudy,
        summary: &mut RecountSummary,
    ) -> SyncResult<()> {
        let Some(study_uid) = row.study_uid() else {
            warn!(study = %row.id, "no study-id identifier");
            summary.errored += 1;
            return self.audit.record(
                &AuditEntry::new(row.id.as_str(), "-", "recount", AuditResult::Skipped)
                    .with_info("no study-id identifier"),
            );
        };

        let actual = self.dicom.instance_count(token, study_uid).await?;
        let recorded = row.number_of_instances.unwrap_or(0).max(0) as u64;
        if actual == recorded {
            debug!(study = %row.id, "count {actual} matches");
            return Ok(());
        }

        summary.mismatched += 1;
        info!(study = %row.id, "mirror says {recorded}, archive has {actual}");
        let mutation = self
            .mirror
            .instance_count_update(&row.id, actual)
            .about(row.id.as_str(), study_uid)
            .with_info(format!("{recorded} -> {actual}"));
        let result = self.gate.execute(self.mirror.key(), mutation).await?;
        if result.is_success() {
            summary.updated += 1;
        }
        Ok(())
    }
}
