//! Counters reported at the end of a run.

use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StudySyncSummary {
    /// Unscheduled accessions considered (paired and orphaned).
    pub candidates: usize,
    pub synchronized: usize,
    pub partial: usize,
    pub skipped: usize,
    pub errored: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub groups: usize,
    pub already_canonical: usize,
    pub skipped_unsafe: usize,
    /// Groups whose merge calls all succeeded.
    pub merged: usize,
    pub merge_calls: usize,
    pub failed_calls: usize,
    pub errored: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecountSummary {
    pub checked: usize,
    pub mismatched: usize,
    pub updated: usize,
    pub errored: usize,
}

/// Everything printed once a command finishes.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub dry_run: bool,
    pub studies: Option<StudySyncSummary>,
    pub merge: Option<MergeSummary>,
    pub recount: Option<RecountSummary>,
    pub audit_rows: usize,
    pub audit_log: PathBuf,
    pub run_log: PathBuf,
    pub debug_dir: Option<PathBuf>,
    pub staged_dir: PathBuf,
}

impl fmt::Display for StudySyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "studies: {} candidates, {} synchronized, {} partial, {} skipped, {} errored",
            self.candidates, self.synchronized, self.partial, self.skipped, self.errored
        )
    }
}

impl fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "patients: {} groups, {} already canonical, {} unsafe skipped, {} merged \
             ({} calls, {} failed), {} errored",
            self.groups,
            self.already_canonical,
            self.skipped_unsafe,
            self.merged,
            self.merge_calls,
            self.failed_calls,
            self.errored
        )
    }
}

impl fmt::Display for RecountSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instances: {} checked, {} mismatched, {} updated, {} errored",
            self.checked, self.mismatched, self.updated, self.errored
        )
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { "DRY RUN" } else { "LIVE" };
        writeln!(f, "=== medsync summary ({mode}) ===")?;
        if let Some(studies) = &self.studies {
            writeln!(f, "{studies}")?;
        }
        if let Some(merge) = &self.merge {
            writeln!(f, "{merge}")?;
        }
        if let Some(recount) = &self.recount {
            writeln!(f, "{recount}")?;
        }
        writeln!(
            f,
            "audit log: {} ({} rows)",
            self.audit_log.display(),
            self.audit_rows
        )?;
        writeln!(f, "run log: {}", self.run_log.display())?;
        writeln!(f, "staged documents: {}", self.staged_dir.display())?;
        if let Some(debug_dir) = &self.debug_dir {
            writeln!(f, "debug artifacts: {}", debug_dir.display())?;
        }
        Ok(())
    }
}
