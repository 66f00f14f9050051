//! # medsync core
//!
//! Reconciliation of a RIS FHIR store with a DICOM archive.
//!
//! This crate contains the workflows and everything they need to talk to the outside world:
//! - Pairing unscheduled exams with their scheduled orders and migrating their records
//! - Consolidating archive patient identities under one canonical issuer
//! - Correcting instance counts in the relational mirror
//! - The dry-run gate every mutation passes through, and the CSV audit trail
//!
//! **No process concerns**: argument parsing, `.env` loading and subscriber setup belong in the
//! `medsync` binary.

pub mod accession;
pub mod artifacts;
pub mod audit;
pub mod clients;
pub mod config;
pub mod error;
pub mod gate;
pub mod merger;
pub mod outcome;
pub mod reconciler;
pub mod recount;
pub mod session;
pub mod summary;
pub mod token;

pub use accession::{AccessionPair, AccessionResolution, AccessionResolver};
pub use audit::{AuditEntry, AuditLog, AuditResult};
pub use config::{RunMode, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use gate::{DryRunGate, Mutation};
pub use merger::{plan_merge, MergePlan, PatientIdentityGroup, PatientIdentityMerger};
pub use outcome::{MutationResult, Outcome};
pub use reconciler::{PairOutcome, PairState, SkipReason, StudyReconciler};
pub use recount::InstanceRecounter;
pub use session::SyncSession;
pub use summary::{MergeSummary, RecountSummary, RunSummary, StudySyncSummary};
pub use token::{AccessToken, TokenProvider};
