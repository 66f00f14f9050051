//! Files written next to the audit log: verbose debug dumps and staged documents.

use crate::{SyncError, SyncResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

pub const DEBUG_DIR_NAME: &str = "debug";
pub const STAGED_DIR_NAME: &str = "staged";

#[derive(Debug)]
pub struct ArtifactStore {
    debug_dir: PathBuf,
    staged_dir: PathBuf,
    verbose: bool,
    sequence: AtomicUsize,
}

impl ArtifactStore {
    /// Create the artifact directories under `run_dir`. `debug/` only exists in verbose runs.
    pub fn create(run_dir: &Path, verbose: bool) -> SyncResult<Self> {
        let debug_dir = run_dir.join(DEBUG_DIR_NAME);
        let staged_dir = run_dir.join(STAGED_DIR_NAME);

        fs::create_dir_all(&staged_dir).map_err(|e| SyncError::io(&staged_dir, e))?;
        if verbose {
            fs::create_dir_all(&debug_dir).map_err(|e| SyncError::io(&debug_dir, e))?;
        }

        Ok(Self {
            debug_dir,
            staged_dir,
            verbose,
            sequence: AtomicUsize::new(0),
        })
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn debug_dir(&self) -> &Path {
        &self.debug_dir
    }

    pub fn staged_dir(&self) -> &Path {
        &self.staged_dir
    }

    /// Next number in the run-wide artifact sequence, starting at 1.
    pub fn next_sequence(&self) -> usize {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Save a raw response body for later inspection. No-op unless verbose.
    pub fn debug(&self, name: &str, content: &str) {
        if !self.verbose {
            return;
        }

        let path = self.debug_dir.join(sanitize_file_name(name));
        let pretty = serde_json::from_str::<serde_json::Value>(content)
            .ok()
            .and_then(|v| serde_json::to_string_pretty(&v).ok());
        let body = pretty.as_deref().unwrap_or(content);

        match fs::write(&path, body) {
            Ok(()) => debug!("saved {}", path.display()),
            Err(e) => warn!("could not save debug artifact {}: {e}", path.display()),
        }
    }

    /// Persist a document durably before an irreversible operation that depends on it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Io`] if the document cannot be written and synced.
    pub fn stage(&self, name: &str, document: &serde_json::Value) -> SyncResult<PathBuf> {
        let path = self.staged_dir.join(sanitize_file_name(name));
        let body = serde_json::to_vec_pretty(document).map_err(|e| SyncError::Parse {
            resource: name.to_string(),
            message: e.to_string(),
        })?;

        let mut file = fs::File::create(&path).map_err(|e| SyncError::io(&path, e))?;
        file.write_all(&body).map_err(|e| SyncError::io(&path, e))?;
        file.sync_all().map_err(|e| SyncError::io(&path, e))?;

        debug!("staged {}", path.display());
        Ok(path)
    }
}

/// Anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_start_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}
