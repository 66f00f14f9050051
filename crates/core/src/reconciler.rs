//! Per-pair reconciliation of unscheduled exams with their scheduled orders.
//!
//! Each [`AccessionPair`] is driven through an explicit state machine, one pair at a time:
//!
//! ```text
//! CheckWorklist -> FetchContext -> LocateStudy -> MovePatient -> UpdateMetadata
//!     -> ReconcileImagingStudy -> CompleteWorklist -> Cleanup -> Done
//! ```
//!
//! Any state may jump straight to `Done` with a skipped or partial outcome. Reads that fail
//! before the first mutation skip the pair; nothing is changed remotely in that case.

use crate::accession::{AccessionPair, AccessionResolution};
use crate::artifacts::ArtifactStore;
use crate::audit::{AuditEntry, AuditLog, AuditResult};
use crate::clients::{DicomClient, FhirClient};
use crate::config::SyncConfig;
use crate::gate::{DryRunGate, Mutation, DICOM_JSON, FHIR_JSON};
use crate::outcome::{MutationResult, Outcome};
use crate::summary::StudySyncSummary;
use crate::token::AccessToken;
use crate::{SyncError, SyncResult};
use dicom_json::{study_update_payload, tags, Dataset, DicomDemographics, StudyUpdate};
use fhir::{ExamContext, ImagingStudy, Patient, PatientDemographics, Procedure, ServiceRequest};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Resource types linked to an order through `basedOn` and removed with it.
pub const LINKED_RESOURCE_TYPES: [&str; 3] = ["Observation", "DiagnosticReport", "Media"];

/// Worklist step statuses that no longer block a merge.
const INACTIVE_STEP_STATUSES: [&str; 2] = ["COMPLETED", "DISCONTINUED"];

/// Everything read about the scheduled order before the first mutation.
#[derive(Clone, Debug)]
pub struct PairContext {
    pub demographics: PatientDemographics,
    pub exam: ExamContext,
    /// Logical id used for `Patient/{id}` references.
    pub fhir_patient_id: String,
    /// Non-gating anomalies, reported on the pair's final audit row.
    pub notes: Vec<String>,
}

/// Where the archive currently files the exam's study.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StudyLocation {
    pub study_uid: String,
    pub patient_id: Option<String>,
    pub accession: Option<String>,
}

impl StudyLocation {
    pub fn from_dataset(ds: &Dataset) -> Option<Self> {
        Some(Self {
            study_uid: ds.string(tags::STUDY_INSTANCE_UID)?.to_string(),
            patient_id: ds.string(tags::PATIENT_ID).map(str::to_string),
            accession: ds.string(tags::ACCESSION_NUMBER).map(str::to_string),
        })
    }
}

#[derive(Clone, Debug)]
pub enum PairState {
    CheckWorklist,
    FetchContext,
    LocateStudy(PairContext),
    MovePatient(PairContext, StudyLocation),
    UpdateMetadata(PairContext, StudyLocation),
    ReconcileImagingStudy(PairContext),
    CompleteWorklist(PairContext),
    Cleanup(PairContext),
    Done(PairOutcome),
}

impl PairState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckWorklist => "check_worklist",
            Self::FetchContext => "fetch_context",
            Self::LocateStudy(_) => "locate_study",
            Self::MovePatient(..) => "move_patient",
            Self::UpdateMetadata(..) => "update_metadata",
            Self::ReconcileImagingStudy(_) => "reconcile_imaging_study",
            Self::CompleteWorklist(_) => "complete_worklist",
            Self::Cleanup(_) => "cleanup",
            Self::Done(_) => "done",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairOutcome {
    /// The scheduled order now owns the study; notes list non-gating anomalies.
    Success(Vec<String>),
    Partial(String),
    Skipped(SkipReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoScheduledCounterpart,
    WorklistActive(String),
    WorklistUnavailable(String),
    ServiceRequestMissing,
    PatientReferenceMissing,
    PatientMissing(String),
    PatientUnusable(String),
    StudyNotFound,
    ImagingStudyUnreadable(String),
    FetchRefused(String),
}

impl SkipReason {
    /// Step the skip decision was taken in.
    pub fn step(&self) -> &'static str {
        match self {
            Self::NoScheduledCounterpart => "resolve",
            Self::WorklistActive(_) | Self::WorklistUnavailable(_) => "check_worklist",
            Self::ServiceRequestMissing
            | Self::PatientReferenceMissing
            | Self::PatientMissing(_)
            | Self::PatientUnusable(_)
            | Self::FetchRefused(_) => "fetch_context",
            Self::StudyNotFound => "locate_study",
            Self::ImagingStudyUnreadable(_) => "imaging_study",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoScheduledCounterpart => write!(f, "no scheduled counterpart"),
            Self::WorklistActive(status) => write!(f, "worklist entry still active ({status})"),
            Self::WorklistUnavailable(msg) => write!(
                f,
                "worklist query failed, exam treated as possibly active: {msg}"
            ),
            Self::ServiceRequestMissing => write!(f, "scheduled ServiceRequest not found"),
            Self::PatientReferenceMissing => write!(f, "ServiceRequest has no Patient subject"),
            Self::PatientMissing(id) => write!(f, "Patient/{id} not found"),
            Self::PatientUnusable(msg) => write!(f, "Patient unusable: {msg}"),
            Self::StudyNotFound => write!(f, "no DICOM study under either accession"),
            Self::ImagingStudyUnreadable(msg) => write!(f, "ImagingStudy unreadable: {msg}"),
            Self::FetchRefused(msg) => write!(f, "read refused: {msg}"),
        }
    }
}

/// Outcome of a read-then-delete cleanup step.
enum Removal {
    AlreadyAbsent,
    Attempted(MutationResult),
}

impl Removal {
    fn removed(&self) -> bool {
        match self {
            Self::AlreadyAbsent => true,
            Self::Attempted(result) => {
                result.is_success() || result.outcome == Outcome::NotFound
            }
        }
    }
}

pub struct StudyReconciler {
    cfg: Arc<SyncConfig>,
    fhir: FhirClient,
    dicom: DicomClient,
    gate: DryRunGate,
    audit: Arc<AuditLog>,
    artifacts: Arc<ArtifactStore>,
}

impl StudyReconciler {
    pub fn new(
        cfg: Arc<SyncConfig>,
        fhir: FhirClient,
        dicom: DicomClient,
        gate: DryRunGate,
        audit: Arc<AuditLog>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            cfg,
            fhir,
            dicom,
            gate,
            audit,
            artifacts,
        }
    }

    /// Reconcile every resolved pair in order, isolating failures per pair.
    ///
    /// # Errors
    ///
    /// Only fatal errors (see [`crate::SyncError::is_fatal`]) are returned; everything else is
    /// counted in the summary.
    pub async fn run(
        &self,
        token: &AccessToken,
        resolution: &AccessionResolution,
    ) -> SyncResult<StudySyncSummary> {
        let mut summary = StudySyncSummary {
            candidates: resolution.pairs.len() + resolution.orphans.len(),
            ..StudySyncSummary::default()
        };

        for orphan in &resolution.orphans {
            info!(accession = %orphan, "no scheduled counterpart, skipping");
            self.record_skip(orphan, "-", &SkipReason::NoScheduledCounterpart)?;
            summary.skipped += 1;
        }

        for pair in &resolution.pairs {
            info!(
                unscheduled = %pair.unscheduled,
                scheduled = %pair.scheduled,
                "reconciling pair"
            );
            match self.reconcile(token, pair).await {
                Ok(PairOutcome::Success(notes)) => {
                    info!(scheduled = %pair.scheduled, "pair synchronized");
                    summary.synchronized += 1;
                    self.audit.record(
                        &AuditEntry::new(
                            pair.unscheduled.as_str(),
                            pair.scheduled.as_str(),
                            "complete",
                            AuditResult::Success,
                        )
                        .with_info(notes.join("; ")),
                    )?;
                }
                Ok(PairOutcome::Partial(reason)) => {
                    warn!(scheduled = %pair.scheduled, "pair partially synchronized: {reason}");
                    summary.partial += 1;
                    self.audit.record(
                        &AuditEntry::new(
                            pair.unscheduled.as_str(),
                            pair.scheduled.as_str(),
                            "partial",
                            AuditResult::Partial,
                        )
                        .with_info(reason),
                    )?;
                }
                Ok(PairOutcome::Skipped(reason)) => {
                    info!(scheduled = %pair.scheduled, "pair skipped: {reason}");
                    summary.skipped += 1;
                    self.record_skip(&pair.unscheduled, &pair.scheduled, &reason)?;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_fetch_refusal() => {
                    warn!(scheduled = %pair.scheduled, "pair skipped: {e}");
                    summary.skipped += 1;
                    self.record_skip(
                        &pair.unscheduled,
                        &pair.scheduled,
                        &SkipReason::FetchRefused(e.to_string()),
                    )?;
                }
                Err(e) => {
                    error!(scheduled = %pair.scheduled, "pair failed: {e}");
                    summary.errored += 1;
                    self.audit.record(
                        &AuditEntry::new(
                            pair.unscheduled.as_str(),
                            pair.scheduled.as_str(),
                            "error",
                            AuditResult::Failed,
                        )
                        .with_code("error")
                        .with_info(e.to_string()),
                    )?;
                }
            }
        }

        Ok(summary)
    }

    /// Drive one pair from `CheckWorklist` to a terminal outcome.
    pub async fn reconcile(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
    ) -> SyncResult<PairOutcome> {
        let mut state = PairState::CheckWorklist;
        loop {
            debug!(scheduled = %pair.scheduled, state = state.name(), "entering state");
            state = match self.advance(token, pair, state).await? {
                PairState::Done(outcome) => return Ok(outcome),
                next => next,
            };
        }
    }

    /// Run one state handler and return the next state.
    pub async fn advance(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        state: PairState,
    ) -> SyncResult<PairState> {
        match state {
            PairState::CheckWorklist => self.check_worklist(token, pair).await,
            PairState::FetchContext => self.fetch_context(token, pair).await,
            PairState::LocateStudy(ctx) => self.locate_study(token, pair, ctx).await,
            PairState::MovePatient(ctx, location) => {
                self.move_patient(token, pair, ctx, location).await
            }
            PairState::UpdateMetadata(ctx, location) => {
                self.update_metadata(token, pair, ctx, location).await
            }
            PairState::ReconcileImagingStudy(ctx) => {
                self.reconcile_imaging_study(token, pair, ctx).await
            }
            PairState::CompleteWorklist(ctx) => self.complete_worklist(token, pair, ctx).await,
            PairState::Cleanup(ctx) => self.cleanup(token, pair, ctx).await,
            PairState::Done(outcome) => Ok(PairState::Done(outcome)),
        }
    }

    async fn check_worklist(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
    ) -> SyncResult<PairState> {
        let items = match self
            .dicom
            .mwl_items_by_accession(token, &pair.scheduled)
            .await
        {
            Ok(items) => items,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(scheduled = %pair.scheduled, "worklist query failed: {e}");
                return Ok(skip(SkipReason::WorklistUnavailable(e.to_string())));
            }
        };

        if let Some(status) = items.iter().find_map(active_step_status) {
            return Ok(skip(SkipReason::WorklistActive(status)));
        }
        Ok(PairState::FetchContext)
    }

    async fn fetch_context(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
    ) -> SyncResult<PairState> {
        let Some(order) = self
            .fhir
            .read(token, "ServiceRequest", &pair.scheduled)
            .await?
        else {
            return Ok(skip(SkipReason::ServiceRequestMissing));
        };
        let order = ServiceRequest::parse(&order.value)?;

        let Some(patient_ref) = order.patient_id().map(str::to_string) else {
            return Ok(skip(SkipReason::PatientReferenceMissing));
        };
        let Some(patient) = self.fhir.read(token, "Patient", &patient_ref).await? else {
            return Ok(skip(SkipReason::PatientMissing(patient_ref)));
        };
        let demographics = match Patient::parse(&patient.value).and_then(|p| p.demographics()) {
            Ok(demographics) => demographics,
            Err(e) => return Ok(skip(SkipReason::PatientUnusable(e.to_string()))),
        };

        let fhir_patient_id = match self
            .fhir
            .search(token, "Patient", "identifier", &demographics.mrn)
            .await
        {
            Ok(bundle) => bundle.resource_ids("Patient").into_iter().next(),
            Err(e) => {
                warn!("Patient lookup by MRN {} failed: {e}", demographics.mrn);
                None
            }
        }
        .unwrap_or(patient_ref);

        info!(
            scheduled = %pair.scheduled,
            mrn = %demographics.mrn,
            patient = %fhir_patient_id,
            "context loaded"
        );
        Ok(PairState::LocateStudy(PairContext {
            demographics,
            exam: order.exam_context(),
            fhir_patient_id,
            notes: Vec::new(),
        }))
    }

    async fn locate_study(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        ctx: PairContext,
    ) -> SyncResult<PairState> {
        for accession in [&pair.scheduled, &pair.unscheduled] {
            let studies = self.dicom.studies_by_accession(token, accession).await?;
            if let Some(location) = studies.iter().find_map(StudyLocation::from_dataset) {
                info!(
                    accession = %accession,
                    study = %location.study_uid,
                    "study located"
                );
                return Ok(PairState::MovePatient(ctx, location));
            }
            debug!(accession = %accession, "no study filed under accession");
        }
        Ok(skip(SkipReason::StudyNotFound))
    }

    async fn move_patient(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        ctx: PairContext,
        location: StudyLocation,
    ) -> SyncResult<PairState> {
        let mrn = ctx.demographics.mrn.as_str();
        if location.patient_id.as_deref() == Some(mrn) {
            debug!(study = %location.study_uid, "study already filed under {mrn}");
            return Ok(PairState::UpdateMetadata(ctx, location));
        }

        let demographics = dicom_demographics(&ctx.demographics);
        let mutation = Mutation::post(
            self.dicom
                .move_study_url(&location.study_uid, mrn, &demographics),
            "move_patient",
        )
        .about(pair.scheduled.as_str(), format!("study {}", location.study_uid))
        .with_info(format!(
            "{} -> {mrn}",
            location.patient_id.as_deref().unwrap_or("<none>")
        ));
        let result = self.gate.execute(token, mutation).await?;

        match result.outcome {
            Outcome::Success | Outcome::Accepted => Ok(PairState::UpdateMetadata(ctx, location)),
            Outcome::Forbidden => {
                info!(study = %location.study_uid, "move refused with 403, treating as consistent");
                Ok(PairState::UpdateMetadata(ctx, location))
            }
            _ => Ok(PairState::Done(PairOutcome::Partial(format!(
                "patient move failed ({})",
                result.code_label()
            )))),
        }
    }

    async fn update_metadata(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        mut ctx: PairContext,
        location: StudyLocation,
    ) -> SyncResult<PairState> {
        if location.accession.as_deref() == Some(pair.scheduled.as_str()) {
            debug!(study = %location.study_uid, "accession already current");
            return Ok(PairState::ReconcileImagingStudy(ctx));
        }

        let update = StudyUpdate {
            study_instance_uid: location.study_uid.clone(),
            patient_id: ctx.demographics.mrn.clone(),
            accession_number: pair.scheduled.clone(),
            description: ctx.exam.description.clone(),
            study_date: ctx.exam.study_date.clone(),
            study_time: ctx.exam.study_time.clone(),
            referring_physician: ctx.exam.referring_physician.clone(),
            clinical_notes: ctx.exam.clinical_notes.clone(),
        };
        let mutation = Mutation::put(self.dicom.study_url(&location.study_uid), "update_metadata")
            .with_json(study_update_payload(&update), DICOM_JSON)
            .about(pair.scheduled.as_str(), format!("study {}", location.study_uid))
            .with_info(format!(
                "accession {} -> {}",
                location.accession.as_deref().unwrap_or("<none>"),
                pair.scheduled
            ));
        let result = self.gate.execute(token, mutation).await?;

        if !matches!(result.outcome, Outcome::Success | Outcome::Accepted) {
            warn!(
                study = %location.study_uid,
                "metadata update returned {}, continuing",
                result.code_label()
            );
            ctx.notes
                .push(format!("metadata update returned {}", result.code_label()));
        }
        Ok(PairState::ReconcileImagingStudy(ctx))
    }

    async fn reconcile_imaging_study(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        mut ctx: PairContext,
    ) -> SyncResult<PairState> {
        let unscheduled = match self
            .fhir
            .search(token, "ImagingStudy", "identifier", &pair.unscheduled)
            .await
        {
            Ok(bundle) => bundle.resource_ids("ImagingStudy"),
            Err(e) => return Ok(partial(format!("ImagingStudy lookup failed: {e}"))),
        };
        if let Some(id) = unscheduled.first() {
            return self.migrate_imaging_study(token, pair, ctx, id).await;
        }

        let scheduled = match self
            .fhir
            .search(token, "ImagingStudy", "identifier", &pair.scheduled)
            .await
        {
            Ok(bundle) => bundle.resource_ids("ImagingStudy"),
            Err(e) => return Ok(partial(format!("ImagingStudy lookup failed: {e}"))),
        };
        let Some(id) = scheduled.first() else {
            warn!(scheduled = %pair.scheduled, "no ImagingStudy under either accession");
            ctx.notes.push("no ImagingStudy record".into());
            return Ok(PairState::CompleteWorklist(ctx));
        };

        let current = match self.fhir.read(token, "ImagingStudy", id).await? {
            Some(doc) => ImagingStudy::parse(doc.value)?,
            None => {
                warn!("ImagingStudy/{id} disappeared before refresh");
                ctx.notes.push(format!("ImagingStudy/{id} disappeared"));
                return Ok(PairState::CompleteWorklist(ctx));
            }
        };
        let Some(refreshed) = current.refreshed(&ctx.fhir_patient_id) else {
            debug!("ImagingStudy/{id} already current");
            return Ok(PairState::CompleteWorklist(ctx));
        };

        let mutation = Mutation::put(
            self.fhir.resource_url("ImagingStudy", id),
            "refresh_imaging_study",
        )
        .with_json(refreshed.to_value(), FHIR_JSON)
        .about(pair.scheduled.as_str(), format!("ImagingStudy/{id}"))
        .with_info(format!("status available, subject Patient/{}", ctx.fhir_patient_id));
        let result = self.gate.execute(token, mutation).await?;
        if !result.is_success() {
            ctx.notes.push(format!(
                "ImagingStudy refresh returned {}",
                result.code_label()
            ));
        }
        Ok(PairState::CompleteWorklist(ctx))
    }

    /// Replace the unscheduled ImagingStudy with one keyed by the scheduled accession.
    ///
    /// The replacement is validated and staged to disk before the delete is issued, and the
    /// pair stops (keeping its unscheduled order for a re-run) if either write fails.
    async fn migrate_imaging_study(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        ctx: PairContext,
        unscheduled_id: &str,
    ) -> SyncResult<PairState> {
        let study = match self.fhir.read(token, "ImagingStudy", unscheduled_id).await? {
            Some(doc) => match ImagingStudy::parse(doc.value) {
                Ok(study) => study,
                Err(e) => return Ok(skip(SkipReason::ImagingStudyUnreadable(e.to_string()))),
            },
            None => {
                return Ok(skip(SkipReason::ImagingStudyUnreadable(format!(
                    "ImagingStudy/{unscheduled_id} not found"
                ))))
            }
        };

        let replacement = checked_replacement(
            &study,
            &pair.scheduled,
            &ctx.fhir_patient_id,
            self.cfg.systems().accession.as_str(),
        )?;
        let staged = self.artifacts.stage(
            &format!("ImagingStudy_{}.json", pair.scheduled),
            &replacement.to_value(),
        )?;

        let deleted = self
            .gate
            .execute(
                token,
                self.fhir_delete(pair, "ImagingStudy", unscheduled_id, "delete_imaging_study"),
            )
            .await?;
        if !deleted.is_success() {
            return Ok(partial(format!(
                "could not delete ImagingStudy/{unscheduled_id} ({})",
                deleted.code_label()
            )));
        }

        let target = format!("ImagingStudy/{}", pair.scheduled);
        let create = Mutation::put(
            self.fhir.resource_url("ImagingStudy", &pair.scheduled),
            "create_imaging_study",
        )
        .with_json(replacement.to_value(), FHIR_JSON)
        .about(pair.scheduled.as_str(), target.as_str())
        .with_info(format!("replaces ImagingStudy/{unscheduled_id}"));
        let created = self.gate.execute(token, create).await?;

        if !created.is_success() {
            error!(
                "DATA LOSS: ImagingStudy/{unscheduled_id} was deleted but {target} could not be \
                 created ({}); replay {}",
                created.code_label(),
                staged.display()
            );
            self.audit.record(
                &AuditEntry::new(
                    pair.scheduled.as_str(),
                    target.as_str(),
                    "create_imaging_study",
                    AuditResult::Warning,
                )
                .with_code(created.code_label())
                .with_info(format!(
                    "data loss: replacement staged at {}",
                    staged.display()
                )),
            )?;
            return Ok(partial(format!(
                "{target} not created, replacement staged at {}",
                staged.display()
            )));
        }

        info!("ImagingStudy/{unscheduled_id} migrated to {target}");
        Ok(PairState::CompleteWorklist(ctx))
    }

    async fn complete_worklist(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        mut ctx: PairContext,
    ) -> SyncResult<PairState> {
        let procedure = match self.fhir.read(token, "Procedure", &pair.scheduled).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Procedure/{} unreadable: {e}", pair.scheduled);
                ctx.notes.push("scheduled Procedure unreadable".into());
                None
            }
        };
        let systems = self.cfg.systems();
        let worklist = procedure
            .and_then(|doc| Procedure::parse(&doc.value).ok())
            .and_then(|p| p.worklist_ref(systems.sps.as_str(), systems.study_id.as_str()));

        let Some(worklist) = worklist else {
            debug!(scheduled = %pair.scheduled, "no worklist coordinates, nothing to complete");
            return Ok(PairState::Cleanup(ctx));
        };

        let mutation = Mutation::post(
            self.dicom
                .complete_worklist_url(&worklist.study_id, &worklist.sps_id),
            "complete_mwl",
        )
        .about(
            pair.scheduled.as_str(),
            format!("mwlitem {}/{}", worklist.study_id, worklist.sps_id),
        );
        let result = self.gate.execute(token, mutation).await?;
        if !matches!(result.outcome, Outcome::Success | Outcome::Accepted) {
            ctx.notes.push(format!(
                "worklist completion returned {}",
                result.code_label()
            ));
        }
        Ok(PairState::Cleanup(ctx))
    }

    async fn cleanup(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        mut ctx: PairContext,
    ) -> SyncResult<PairState> {
        let procedure = self
            .delete_if_present(token, pair, "Procedure", &pair.unscheduled)
            .await?;
        if !procedure.removed() {
            ctx.notes.push("unscheduled Procedure not deleted".into());
        }

        let order_removed = self.delete_orders(token, pair, &mut ctx).await?;

        let references: Vec<String> = if pair.order_ids.is_empty() {
            vec![format!("ServiceRequest/{}", pair.unscheduled)]
        } else {
            pair.order_ids
                .iter()
                .map(|id| format!("ServiceRequest/{id}"))
                .collect()
        };
        for resource_type in LINKED_RESOURCE_TYPES {
            let mut ids = BTreeSet::new();
            for based_on in &references {
                match self
                    .fhir
                    .search(token, resource_type, "based-on", based_on)
                    .await
                {
                    Ok(bundle) => ids.extend(bundle.resource_ids(resource_type)),
                    Err(e) => {
                        warn!("{resource_type} lookup for {based_on} failed: {e}");
                        ctx.notes.push(format!("{resource_type} lookup failed"));
                    }
                }
            }
            for id in ids {
                let result = self
                    .gate
                    .execute(token, self.fhir_delete(pair, resource_type, &id, "cleanup"))
                    .await?;
                if !Removal::Attempted(result).removed() {
                    ctx.notes.push(format!("{resource_type}/{id} not deleted"));
                }
            }
        }

        if order_removed {
            Ok(PairState::Done(PairOutcome::Success(ctx.notes)))
        } else {
            let mut reason = format!("ServiceRequest/{} not deleted", pair.unscheduled);
            for note in &ctx.notes {
                reason.push_str("; ");
                reason.push_str(note);
            }
            Ok(partial(reason))
        }
    }

    /// Delete the unscheduled ServiceRequest(s). Returns whether every one is gone.
    ///
    /// Orders seen in this run's collection are deleted by their logical id and only a
    /// successful DELETE counts. Without collected ids the accession is tried as the id,
    /// read first so a re-run on a finished pair sends nothing.
    async fn delete_orders(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        ctx: &mut PairContext,
    ) -> SyncResult<bool> {
        if pair.order_ids.is_empty() {
            let removal = self
                .delete_if_present(token, pair, "ServiceRequest", &pair.unscheduled)
                .await?;
            return Ok(removal.removed());
        }

        let mut all_removed = true;
        for id in &pair.order_ids {
            let result = self
                .gate
                .execute(token, self.fhir_delete(pair, "ServiceRequest", id, "cleanup"))
                .await?;
            if !result.is_success() {
                warn!("ServiceRequest/{id} delete returned {}", result.code_label());
                ctx.notes.push(format!(
                    "ServiceRequest/{id} delete returned {}",
                    result.code_label()
                ));
                all_removed = false;
            }
        }
        Ok(all_removed)
    }

    async fn delete_if_present(
        &self,
        token: &AccessToken,
        pair: &AccessionPair,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<Removal> {
        match self.fhir.read(token, resource_type, id).await {
            Ok(None) => {
                debug!("{resource_type}/{id} already absent");
                return Ok(Removal::AlreadyAbsent);
            }
            Ok(Some(_)) => {}
            Err(e) => warn!("could not confirm {resource_type}/{id} before delete: {e}"),
        }

        let result = self
            .gate
            .execute(token, self.fhir_delete(pair, resource_type, id, "cleanup"))
            .await?;
        Ok(Removal::Attempted(result))
    }

    fn fhir_delete(
        &self,
        pair: &AccessionPair,
        resource_type: &str,
        id: &str,
        step: &'static str,
    ) -> Mutation {
        Mutation::delete(self.fhir.resource_url(resource_type, id), step)
            .about(pair.scheduled.as_str(), format!("{resource_type}/{id}"))
    }

    fn record_skip(&self, subject: &str, target: &str, reason: &SkipReason) -> SyncResult<()> {
        self.audit.record(
            &AuditEntry::new(subject, target, reason.step(), AuditResult::Skipped)
                .with_info(reason.to_string()),
        )
    }
}

fn skip(reason: SkipReason) -> PairState {
    PairState::Done(PairOutcome::Skipped(reason))
}

fn partial(reason: String) -> PairState {
    PairState::Done(PairOutcome::Partial(reason))
}

/// Build the replacement ImagingStudy and check its shape before anything is deleted.
///
/// # Errors
///
/// Returns [`SyncError::Validation`] when the document fails the shape check.
pub fn checked_replacement(
    study: &ImagingStudy,
    scheduled: &str,
    patient_id: &str,
    accession_system: &str,
) -> SyncResult<ImagingStudy> {
    let replacement = study.migrated(scheduled, patient_id, accession_system);
    replacement
        .validate(scheduled, accession_system)
        .map_err(|e| SyncError::Validation(format!("replacement ImagingStudy/{scheduled}: {e}")))?;
    Ok(replacement)
}

/// Status of the first scheduled step that still blocks a merge, if any.
///
/// An item without any readable step status counts as active.
pub fn active_step_status(item: &Dataset) -> Option<String> {
    let statuses: Vec<String> = item
        .sequence(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
        .iter()
        .filter_map(|step| step.string(tags::SCHEDULED_PROCEDURE_STEP_STATUS))
        .map(str::to_ascii_uppercase)
        .collect();

    if statuses.is_empty() {
        return Some("UNKNOWN".to_string());
    }
    statuses
        .into_iter()
        .find(|s| !INACTIVE_STEP_STATUSES.contains(&s.as_str()))
}

/// FHIR demographics in the shape the archive's move endpoint takes.
pub fn dicom_demographics(demographics: &PatientDemographics) -> DicomDemographics {
    DicomDemographics {
        name: Some(demographics.name.clone()).filter(|n| !n.is_empty()),
        birth_date: demographics.birth_date.clone(),
        sex: Some(demographics.sex.clone()).filter(|s| !s.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worklist_item(statuses: &[&str]) -> Dataset {
        let steps: Vec<serde_json::Value> = statuses
            .iter()
            .map(|s| Dataset::new().with_string(tags::SCHEDULED_PROCEDURE_STEP_STATUS, "CS", *s))
            .map(|ds| ds.to_json())
            .collect();
        let mut item = serde_json::Map::new();
        item.insert(
            tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE.to_string(),
            serde_json::json!({"vr": "SQ", "Value": steps}),
        );
        serde_json::from_value(serde_json::Value::Object(item)).expect("dataset")
    }

    #[test]
    fn worklist_activity_follows_step_status() {
        assert_eq!(
            active_step_status(&worklist_item(&["SCHEDULED"])),
            Some("SCHEDULED".to_string())
        );
        assert_eq!(active_step_status(&worklist_item(&["COMPLETED"])), None);
        assert_eq!(active_step_status(&worklist_item(&["discontinued"])), None);
        assert_eq!(
            active_step_status(&worklist_item(&["COMPLETED", "STARTED"])),
            Some("STARTED".to_string())
        );
        assert_eq!(
            active_step_status(&Dataset::new()),
            Some("UNKNOWN".to_string())
        );
    }

    #[test]
    fn study_location_requires_uid() {
        let ds = Dataset::new()
            .with_string(tags::STUDY_INSTANCE_UID, "UI", "1.2.3")
            .with_string(tags::PATIENT_ID, "LO", "MRN-1");
        assert_eq!(
            StudyLocation::from_dataset(&ds),
            Some(StudyLocation {
                study_uid: "1.2.3".into(),
                patient_id: Some("MRN-1".into()),
                accession: None,
            })
        );
        assert_eq!(
            StudyLocation::from_dataset(&Dataset::new().with_string(tags::PATIENT_ID, "LO", "X")),
            None
        );
    }

    #[test]
    fn demographics_drop_empty_fields() {
        let demo = dicom_demographics(&PatientDemographics {
            mrn: "MRN-1".into(),
            name: String::new(),
            birth_date: Some("19800101".into()),
            sex: "F".into(),
        });
        assert_eq!(demo.name, None);
        assert_eq!(demo.birth_date.as_deref(), Some("19800101"));
        assert_eq!(demo.sex.as_deref(), Some("F"));
    }

    #[test]
    fn skip_reasons_name_their_step() {
        assert_eq!(SkipReason::NoScheduledCounterpart.step(), "resolve");
        assert_eq!(
            SkipReason::WorklistActive("SCHEDULED".into()).to_string(),
            "worklist entry still active (SCHEDULED)"
        );
        assert_eq!(SkipReason::StudyNotFound.step(), "locate_study");
        let unavailable = SkipReason::WorklistUnavailable("HTTP 500".into());
        assert_eq!(unavailable.step(), "check_worklist");
        assert!(unavailable.to_string().starts_with("worklist query failed"));
    }

    #[test]
    fn replacement_without_patient_fails_validation() {
        let study = ImagingStudy::parse(serde_json::json!({
            "resourceType": "ImagingStudy",
            "id": "is-1",
            "status": "registered",
            "subject": {"reference": "Patient/p1"},
            "identifier": [{"system": "urn:ris:accession", "value": "ACC1-unscheduled"}]
        }))
        .expect("study");

        let replacement =
            checked_replacement(&study, "ACC1", "p2", "urn:ris:accession").expect("valid");
        assert_eq!(replacement.id(), Some("ACC1"));

        let err = checked_replacement(&study, "ACC1", "", "urn:ris:accession").unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("subject.reference"));
    }
}
