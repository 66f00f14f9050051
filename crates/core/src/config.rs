//! Runtime configuration.
//!
//! This module defines configuration that is resolved once at process startup and then passed
//! into every component. Components never read process-wide environment variables themselves,
//! which keeps behaviour identical between the binary and test harnesses.

use crate::{SyncError, SyncResult};
use medsync_types::{BaseUrl, NonEmptyText};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TOKEN_SCOPE: &str = "openid";
pub const DEFAULT_CANONICAL_ISSUER: &str = "elvasoft";
pub const DEFAULT_ISSUER_PLACEHOLDERS: &str = "DCM4CHEE.null.null";
pub const DEFAULT_UNSCHEDULED_SUFFIX: &str = "-unscheduled";
pub const DEFAULT_PATIENT_PAGE_SIZE: usize = 200;
pub const DEFAULT_SAFETY_DELAY_SECS: u64 = 5;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Password-grant credentials for the identity provider.
#[derive(Clone)]
pub struct TokenSettings {
    pub token_url: BaseUrl,
    pub client_id: NonEmptyText,
    pub client_secret: String,
    pub username: NonEmptyText,
    pub password: String,
    pub scope: String,
}

impl std::fmt::Debug for TokenSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSettings")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Relational mirror (PostgREST-style REST API over the FHIR tables).
#[derive(Clone)]
pub struct MirrorSettings {
    pub url: BaseUrl,
    pub key: String,
    pub cleanup_rpc: Option<NonEmptyText>,
}

impl std::fmt::Debug for MirrorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSettings")
            .field("url", &self.url)
            .field("key", &"[REDACTED]")
            .field("cleanup_rpc", &self.cleanup_rpc)
            .finish()
    }
}

/// Identifier systems used by the RIS.
#[derive(Clone, Debug)]
pub struct IdentifierSystems {
    pub accession: NonEmptyText,
    pub sps: NonEmptyText,
    pub study_id: NonEmptyText,
}

/// Flags that change how a run behaves rather than where it connects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunMode {
    pub dry_run: bool,
    pub verbose: bool,
    pub insecure: bool,
}

/// Configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    fhir_base: BaseUrl,
    qido_base: BaseUrl,
    mwl_base: BaseUrl,
    token: TokenSettings,
    systems: IdentifierSystems,
    canonical_issuer: NonEmptyText,
    issuer_placeholders: Vec<String>,
    unscheduled_suffix: NonEmptyText,
    patient_page_size: usize,
    mirror: Option<MirrorSettings>,
    safety_delay: Duration,
    http_timeout: Duration,
    mode: RunMode,
    log_root: PathBuf,
}

impl SyncConfig {
    /// Build the configuration from a key lookup (normally the process environment).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] naming the first key that is missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let fhir_base = required_url(&get, "FHIR_BASE")?;
        let qido_base = required_url(&get, "DCM_QIDO")?;
        let mwl_base = match get("DCM_MWL") {
            Some(value) => parse_url("DCM_MWL", &value)?,
            None => qido_base.clone(),
        };

        let token = TokenSettings {
            token_url: required_url(&get, "KC_TOKEN_URL")?,
            client_id: required_text(&get, "KC_CLIENT_ID")?,
            client_secret: get("KC_CLIENT_SECRET").unwrap_or_default(),
            username: required_text(&get, "KC_USERNAME")?,
            password: get("KC_PASSWORD")
                .ok_or_else(|| SyncError::config("KC_PASSWORD", "missing"))?,
            scope: get("TOKEN_SCOPE").unwrap_or_else(|| DEFAULT_TOKEN_SCOPE.to_string()),
        };

        let systems = IdentifierSystems {
            accession: required_text(&get, "ACC_SYSTEM")?,
            sps: required_text(&get, "SPS_SYSTEM")?,
            study_id: required_text(&get, "STUDYID_SYSTEM")?,
        };

        let mirror = match (get("MIRROR_URL"), get("MIRROR_KEY")) {
            (Some(url), Some(key)) => Some(MirrorSettings {
                url: parse_url("MIRROR_URL", &url)?,
                key,
                cleanup_rpc: get("MIRROR_CLEANUP_RPC").and_then(|v| NonEmptyText::new(v).ok()),
            }),
            (Some(_), None) => {
                return Err(SyncError::config("MIRROR_KEY", "required when MIRROR_URL is set"))
            }
            _ => None,
        };

        let mode = RunMode {
            dry_run: optional_bool(&get, "DRY_RUN")?.unwrap_or(false),
            verbose: optional_bool(&get, "VERBOSE")?.unwrap_or(false),
            insecure: optional_bool(&get, "CURL_INSECURE")?.unwrap_or(false),
        };

        let patient_page_size =
            optional_number(&get, "PATIENT_PAGE_SIZE")?.unwrap_or(DEFAULT_PATIENT_PAGE_SIZE as u64);
        if patient_page_size == 0 {
            return Err(SyncError::config("PATIENT_PAGE_SIZE", "must be positive"));
        }

        Ok(Self {
            fhir_base,
            qido_base,
            mwl_base,
            token,
            systems,
            canonical_issuer: text_or_default(&get, "CANON", DEFAULT_CANONICAL_ISSUER)?,
            issuer_placeholders: get("ISSUER_PLACEHOLDERS")
                .unwrap_or_else(|| DEFAULT_ISSUER_PLACEHOLDERS.to_string())
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            unscheduled_suffix: text_or_default(
                &get,
                "UNSCHEDULED_SUFFIX",
                DEFAULT_UNSCHEDULED_SUFFIX,
            )?,
            patient_page_size: patient_page_size as usize,
            mirror,
            safety_delay: Duration::from_secs(
                optional_number(&get, "SAFETY_DELAY_SECS")?.unwrap_or(DEFAULT_SAFETY_DELAY_SECS),
            ),
            http_timeout: Duration::from_secs(
                optional_number(&get, "HTTP_TIMEOUT_SECS")?.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            ),
            mode,
            log_root: get("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }

    /// Apply command-line flags. A flag can switch a mode on but never off.
    pub fn with_mode(mut self, flags: RunMode) -> Self {
        self.mode.dry_run |= flags.dry_run;
        self.mode.verbose |= flags.verbose;
        self.mode.insecure |= flags.insecure;
        self
    }

    pub fn with_log_root(mut self, log_root: PathBuf) -> Self {
        self.log_root = log_root;
        self
    }

    pub fn with_safety_delay(mut self, delay: Duration) -> Self {
        self.safety_delay = delay;
        self
    }

    pub fn fhir_base(&self) -> &BaseUrl {
        &self.fhir_base
    }

    pub fn qido_base(&self) -> &BaseUrl {
        &self.qido_base
    }

    pub fn mwl_base(&self) -> &BaseUrl {
        &self.mwl_base
    }

    pub fn token(&self) -> &TokenSettings {
        &self.token
    }

    pub fn systems(&self) -> &IdentifierSystems {
        &self.systems
    }

    pub fn canonical_issuer(&self) -> &str {
        self.canonical_issuer.as_str()
    }

    pub fn issuer_placeholders(&self) -> &[String] {
        &self.issuer_placeholders
    }

    pub fn unscheduled_suffix(&self) -> &str {
        self.unscheduled_suffix.as_str()
    }

    pub fn patient_page_size(&self) -> usize {
        self.patient_page_size
    }

    pub fn mirror(&self) -> Option<&MirrorSettings> {
        self.mirror.as_ref()
    }

    /// Mirror settings for commands that cannot run without them.
    pub fn require_mirror(&self) -> SyncResult<&MirrorSettings> {
        self.mirror
            .as_ref()
            .ok_or_else(|| SyncError::config("MIRROR_URL", "required for this command"))
    }

    pub fn safety_delay(&self) -> Duration {
        self.safety_delay
    }

    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn dry_run(&self) -> bool {
        self.mode.dry_run
    }

    pub fn verbose(&self) -> bool {
        self.mode.verbose
    }

    pub fn log_root(&self) -> &Path {
        &self.log_root
    }
}

fn required_url(get: &impl Fn(&str) -> Option<String>, key: &str) -> SyncResult<BaseUrl> {
    let value = get(key).ok_or_else(|| SyncError::config(key, "missing"))?;
    parse_url(key, &value)
}

fn parse_url(key: &str, value: &str) -> SyncResult<BaseUrl> {
    BaseUrl::new(value).map_err(|e| SyncError::config(key, e.to_string()))
}

fn required_text(get: &impl Fn(&str) -> Option<String>, key: &str) -> SyncResult<NonEmptyText> {
    let value = get(key).ok_or_else(|| SyncError::config(key, "missing"))?;
    NonEmptyText::new(value).map_err(|e| SyncError::config(key, e.to_string()))
}

fn text_or_default(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> SyncResult<NonEmptyText> {
    NonEmptyText::new(get(key).unwrap_or_else(|| default.to_string()))
        .map_err(|e| SyncError::config(key, e.to_string()))
}

fn optional_bool(get: &impl Fn(&str) -> Option<String>, key: &str) -> SyncResult<Option<bool>> {
    get(key).map(|v| parse_bool(key, &v)).transpose()
}

/// Accepts `true/false/1/0/yes/no`, case-insensitively.
pub fn parse_bool(key: &str, value: &str) -> SyncResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(SyncError::config(
            key,
            format!("expected true/false/1/0/yes/no, got {other:?}"),
        )),
    }
}

fn optional_number(get: &impl Fn(&str) -> Option<String>, key: &str) -> SyncResult<Option<u64>> {
    get(key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| SyncError::config(key, e.to_string()))
        })
        .transpose()
}
