//! Wiring of one run: run directory, audit log, shared HTTP client and components.

use crate::accession::AccessionResolver;
use crate::artifacts::ArtifactStore;
use crate::audit::AuditLog;
use crate::clients::{build_http_client, DicomClient, FhirClient, MirrorClient};
use crate::config::SyncConfig;
use crate::gate::DryRunGate;
use crate::merger::PatientIdentityMerger;
use crate::reconciler::StudyReconciler;
use crate::recount::InstanceRecounter;
use crate::summary::{RunSummary, StudySyncSummary};
use crate::token::{AccessToken, TokenProvider};
use crate::{SyncError, SyncResult};
use chrono::Local;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const AUDIT_FILE_NAME: &str = "audit.csv";
pub const RUN_LOG_FILE_NAME: &str = "run.log";

pub struct SyncSession {
    cfg: Arc<SyncConfig>,
    http: Client,
    run_dir: PathBuf,
    audit: Arc<AuditLog>,
    artifacts: Arc<ArtifactStore>,
}

impl SyncSession {
    /// Open a session in a fresh `medsync_<YYYYMMDD_HHMMSS>` directory under the log root.
    pub fn open(cfg: SyncConfig) -> SyncResult<Self> {
        let run_dir = cfg.log_root().join(format!(
            "medsync_{}",
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        Self::open_in(cfg, run_dir)
    }

    pub fn open_in(cfg: SyncConfig, run_dir: PathBuf) -> SyncResult<Self> {
        std::fs::create_dir_all(&run_dir).map_err(|e| SyncError::io(&run_dir, e))?;
        let audit = Arc::new(AuditLog::create(run_dir.join(AUDIT_FILE_NAME))?);
        let artifacts = Arc::new(ArtifactStore::create(&run_dir, cfg.verbose())?);
        let http = build_http_client(&cfg)?;

        Ok(Self {
            cfg: Arc::new(cfg),
            http,
            run_dir,
            audit,
            artifacts,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.run_dir.join(RUN_LOG_FILE_NAME)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn token_provider(&self) -> TokenProvider {
        TokenProvider::new(self.http.clone(), self.cfg.token().clone())
    }

    pub fn fhir(&self) -> FhirClient {
        FhirClient::new(
            self.http.clone(),
            self.cfg.fhir_base().clone(),
            self.artifacts.clone(),
        )
    }

    pub fn dicom(&self) -> DicomClient {
        DicomClient::new(
            self.http.clone(),
            self.cfg.qido_base().clone(),
            self.cfg.mwl_base().clone(),
            self.artifacts.clone(),
        )
    }

    pub fn mirror(&self) -> Option<MirrorClient> {
        self.cfg
            .mirror()
            .map(|m| MirrorClient::new(self.http.clone(), m, self.artifacts.clone()))
    }

    pub fn gate(&self) -> DryRunGate {
        DryRunGate::new(
            self.http.clone(),
            self.audit.clone(),
            self.artifacts.clone(),
            self.cfg.dry_run(),
        )
    }

    pub fn study_reconciler(&self) -> StudyReconciler {
        StudyReconciler::new(
            self.cfg.clone(),
            self.fhir(),
            self.dicom(),
            self.gate(),
            self.audit.clone(),
            self.artifacts.clone(),
        )
    }

    pub fn identity_merger(&self) -> PatientIdentityMerger {
        PatientIdentityMerger::new(
            self.cfg.clone(),
            self.dicom(),
            self.mirror(),
            self.gate(),
            self.audit.clone(),
        )
    }

    /// # Errors
    ///
    /// Returns [`SyncError::Config`] when no mirror is configured.
    pub fn instance_recounter(&self) -> SyncResult<InstanceRecounter> {
        let settings = self.cfg.require_mirror()?;
        let mirror = MirrorClient::new(self.http.clone(), settings, self.artifacts.clone());
        Ok(InstanceRecounter::new(
            self.dicom(),
            mirror,
            self.gate(),
            self.audit.clone(),
        ))
    }

    /// Read every ServiceRequest, pair the accessions and reconcile each pair.
    ///
    /// # Errors
    ///
    /// Fails if the ServiceRequest collection cannot be read, or on fatal errors.
    pub async fn sync_studies(&self, token: &AccessToken) -> SyncResult<StudySyncSummary> {
        let resources = self.fhir().service_requests(token).await?;
        let resolver = AccessionResolver::new(
            self.cfg.systems().accession.as_str(),
            self.cfg.unscheduled_suffix(),
        );
        let resolution = resolver.resolve(&resources);
        info!(
            "{} ServiceRequests, {} accessions, {} pairs, {} orphans",
            resources.len(),
            resolution.accessions.len(),
            resolution.pairs.len(),
            resolution.orphans.len()
        );

        self.study_reconciler().run(token, &resolution).await
    }

    /// Summary skeleton carrying this run's paths; command counters are filled in by the caller.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            dry_run: self.cfg.dry_run(),
            audit_rows: self.audit.rows(),
            audit_log: self.audit.path().to_path_buf(),
            run_log: self.run_log_path(),
            debug_dir: self
                .artifacts
                .verbose()
                .then(|| self.artifacts.debug_dir().to_path_buf()),
            staged_dir: self.artifacts.staged_dir().to_path_buf(),
            ..RunSummary::default()
        }
    }
}
