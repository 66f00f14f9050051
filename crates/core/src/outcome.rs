//! Classification of mutation responses.

use std::fmt;

/// What an HTTP status means for a mutation, decided once at the client boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Accepted,
    Conflict,
    NotFound,
    Forbidden,
    Error,
}

impl Outcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            202 => Self::Accepted,
            200..=299 => Self::Success,
            403 => Self::Forbidden,
            404 | 410 => Self::NotFound,
            409 => Self::Conflict,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Accepted => "accepted",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one mutation as seen by the caller.
///
/// `status` is `None` when no response was received at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutationResult {
    pub status: Option<u16>,
    pub outcome: Outcome,
    pub simulated: bool,
}

impl MutationResult {
    /// Result reported for a mutation suppressed in dry-run mode.
    pub fn simulated() -> Self {
        Self {
            status: Some(200),
            outcome: Outcome::Success,
            simulated: true,
        }
    }

    pub fn from_status(status: u16) -> Self {
        Self {
            status: Some(status),
            outcome: Outcome::from_status(status),
            simulated: false,
        }
    }

    pub fn transport_failure() -> Self {
        Self {
            status: None,
            outcome: Outcome::Error,
            simulated: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// HTTP code as written to the audit log; `error` when no response arrived.
    pub fn code_label(&self) -> String {
        self.status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "error".to_string())
    }

    /// Turn a non-successful result into an error for callers that cannot continue.
    pub fn require_success(&self, target: &str) -> crate::SyncResult<()> {
        match self.outcome {
            Outcome::Success | Outcome::Accepted => Ok(()),
            Outcome::Conflict => Err(crate::SyncError::Conflict {
                target: target.to_string(),
            }),
            _ => Err(crate::SyncError::ResourceFetch {
                resource: target.to_string(),
                status: self.status.unwrap_or(0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_statuses_once() {
        assert_eq!(Outcome::from_status(200), Outcome::Success);
        assert_eq!(Outcome::from_status(201), Outcome::Success);
        assert_eq!(Outcome::from_status(204), Outcome::Success);
        assert_eq!(Outcome::from_status(202), Outcome::Accepted);
        assert_eq!(Outcome::from_status(409), Outcome::Conflict);
        assert_eq!(Outcome::from_status(404), Outcome::NotFound);
        assert_eq!(Outcome::from_status(410), Outcome::NotFound);
        assert_eq!(Outcome::from_status(403), Outcome::Forbidden);
        assert_eq!(Outcome::from_status(500), Outcome::Error);
        assert_eq!(Outcome::from_status(302), Outcome::Error);
    }

    #[test]
    fn transport_failure_renders_as_error() {
        let result = MutationResult::transport_failure();
        assert_eq!(result.code_label(), "error");
        assert!(!result.is_success());
        assert!(matches!(
            MutationResult::from_status(409).require_success("Procedure/X"),
            Err(crate::SyncError::Conflict { .. })
        ));
    }

    #[test]
    fn simulated_results_count_as_success() {
        let result = MutationResult::simulated();
        assert!(result.is_success());
        assert!(result.simulated);
        assert_eq!(result.code_label(), "200");
    }
}
