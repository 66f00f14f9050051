use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("failed to fetch {resource}: HTTP {status}")]
    ResourceFetch { resource: String, status: u16 },
    #[error("{target} still conflicting after conditional retry")]
    Conflict { target: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unparseable response from {resource}: {message}")]
    Parse { resource: String, message: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid configuration for {key}: {message}")]
    Config { key: String, message: String },
    #[error(
        "file operation failed (path: {path}): {source}",
        path = path.display()
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write audit log: {0}")]
    Audit(#[from] csv::Error),

    #[error("FHIR error: {0}")]
    Fhir(#[from] fhir::FhirError),
    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom_json::DicomError),
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(key: &str, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Errors that end the whole run rather than one unit of work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config { .. } | Self::Audit(_))
    }

    /// Errors that mean a read was refused, which marks the unit skipped instead of errored.
    pub fn is_fetch_refusal(&self) -> bool {
        matches!(self, Self::ResourceFetch { .. })
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_and_skip_errors() {
        assert!(SyncError::Auth("denied".into()).is_fatal());
        assert!(SyncError::config("FHIR_BASE", "missing").is_fatal());

        let fetch = SyncError::ResourceFetch {
            resource: "ServiceRequest/ACC1".into(),
            status: 500,
        };
        assert!(!fetch.is_fatal());
        assert!(fetch.is_fetch_refusal());
        assert_eq!(
            fetch.to_string(),
            "failed to fetch ServiceRequest/ACC1: HTTP 500"
        );
    }
}
