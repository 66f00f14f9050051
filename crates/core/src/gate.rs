//! The single choke point for mutating requests.
//!
//! Every PUT/POST/PATCH/DELETE the tool issues is described as a [`Mutation`] and handed to
//! [`DryRunGate::execute`]. In dry-run mode nothing leaves the process; the mutation is logged
//! and recorded as simulated. In live mode it is sent, classified and recorded. Verbose runs
//! also keep each request body and every non-2xx response body under `debug/`.

use crate::artifacts::ArtifactStore;
use crate::audit::{AuditEntry, AuditLog, AuditResult};
use crate::outcome::{MutationResult, Outcome};
use crate::token::AccessToken;
use crate::SyncResult;
use reqwest::{header, Client, Method};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DICOM_JSON: &str = "application/dicom+json";
pub const FHIR_JSON: &str = "application/fhir+json";
pub const JSON: &str = "application/json";

/// One intended change to a remote system.
#[derive(Clone, Debug)]
pub struct Mutation {
    pub method: Method,
    pub url: String,
    pub body: Option<(serde_json::Value, &'static str)>,
    pub headers: Vec<(&'static str, String)>,
    /// Accession or patient id the change belongs to.
    pub subject: String,
    /// Human-readable name of the affected resource.
    pub target: String,
    pub step: &'static str,
    pub info: String,
}

impl Mutation {
    pub fn new(method: Method, url: impl Into<String>, step: &'static str) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
            subject: String::new(),
            target: String::new(),
            step,
            info: String::new(),
        }
    }

    pub fn delete(url: impl Into<String>, step: &'static str) -> Self {
        Self::new(Method::DELETE, url, step)
    }

    pub fn post(url: impl Into<String>, step: &'static str) -> Self {
        Self::new(Method::POST, url, step)
    }

    pub fn put(url: impl Into<String>, step: &'static str) -> Self {
        Self::new(Method::PUT, url, step)
    }

    pub fn patch(url: impl Into<String>, step: &'static str) -> Self {
        Self::new(Method::PATCH, url, step)
    }

    pub fn with_json(mut self, body: serde_json::Value, content_type: &'static str) -> Self {
        self.body = Some((body, content_type));
        self
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn about(mut self, subject: impl Into<String>, target: impl Into<String>) -> Self {
        self.subject = subject.into();
        self.target = target.into();
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }
}

#[derive(Clone, Debug)]
pub struct DryRunGate {
    http: Client,
    audit: Arc<AuditLog>,
    artifacts: Arc<ArtifactStore>,
    dry_run: bool,
}

impl DryRunGate {
    pub fn new(
        http: Client,
        audit: Arc<AuditLog>,
        artifacts: Arc<ArtifactStore>,
        dry_run: bool,
    ) -> Self {
        Self {
            http,
            audit,
            artifacts,
            dry_run,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Execute (or simulate) a mutation and append its audit row.
    ///
    /// HTTP failures are reported through the returned [`MutationResult`], never as `Err`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the audit row cannot be written.
    pub async fn execute(
        &self,
        token: &AccessToken,
        mutation: Mutation,
    ) -> SyncResult<MutationResult> {
        if self.dry_run {
            info!(
                "DRY-RUN: would {} {} [{}]",
                mutation.method, mutation.url, mutation.step
            );
            if let Some((body, _)) = &mutation.body {
                debug!("DRY-RUN payload: {body}");
            }
            let result = MutationResult::simulated();
            self.record(&mutation, &result, AuditResult::Simulated, "")?;
            return Ok(result);
        }

        let seq = self.artifacts.next_sequence();
        if let Some((body, _)) = &mutation.body {
            self.artifacts
                .debug(&format!("{seq:04}_{}_request.json", mutation.step), &body.to_string());
        }

        let mut result = self.send(token, &mutation, None, seq).await;
        let mut note = "";

        if mutation.method == Method::DELETE && result.outcome == Outcome::Conflict {
            warn!("{} returned 409, retrying with If-Match", mutation.url);
            match self.current_etag(token, &mutation.url).await {
                Some(etag) => {
                    result = self.send(token, &mutation, Some(&etag), seq).await;
                    note = "retried with If-Match";
                }
                None => note = "409 and no ETag available for retry",
            }
        }

        let audit_result = match result.outcome {
            Outcome::Success | Outcome::Accepted => AuditResult::Success,
            _ => AuditResult::Failed,
        };
        if audit_result == AuditResult::Failed {
            warn!(
                "{} {} failed: {} ({})",
                mutation.method,
                mutation.url,
                result.code_label(),
                result.outcome
            );
        } else {
            info!(
                "{} {} -> {}",
                mutation.method,
                mutation.url,
                result.code_label()
            );
        }
        self.record(&mutation, &result, audit_result, note)?;
        Ok(result)
    }

    async fn send(
        &self,
        token: &AccessToken,
        mutation: &Mutation,
        if_match: Option<&str>,
        seq: usize,
    ) -> MutationResult {
        let mut request = self
            .http
            .request(mutation.method.clone(), &mutation.url)
            .bearer_auth(token.secret());
        for (name, value) in &mutation.headers {
            request = request.header(*name, value);
        }
        if let Some(etag) = if_match {
            request = request.header(header::IF_MATCH, etag);
        }
        if let Some((body, content_type)) = &mutation.body {
            request = request
                .header(header::CONTENT_TYPE, *content_type)
                .body(body.to_string());
        }

        debug!("{} {}", mutation.method, mutation.url);
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if !response.status().is_success() {
                    let body = response.text().await.unwrap_or_default();
                    if !body.is_empty() {
                        debug!("response body from {}: {body}", mutation.url);
                        self.artifacts.debug(
                            &format!("{seq:04}_{}_{status}_error.log", mutation.step),
                            &body,
                        );
                    }
                }
                MutationResult::from_status(status)
            }
            Err(e) => {
                warn!("{} {} transport error: {e}", mutation.method, mutation.url);
                MutationResult::transport_failure()
            }
        }
    }

    async fn current_etag(&self, token: &AccessToken, url: &str) -> Option<String> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token.secret())
            .send()
            .await
            .ok()?;
        let raw = response.headers().get(header::ETAG)?.to_str().ok()?;
        let etag = normalize_etag(raw);
        (!etag.is_empty()).then_some(etag)
    }

    fn record(
        &self,
        mutation: &Mutation,
        result: &MutationResult,
        audit_result: AuditResult,
        note: &str,
    ) -> SyncResult<()> {
        let info = match (mutation.info.is_empty(), note.is_empty()) {
            (_, true) => mutation.info.clone(),
            (true, false) => note.to_string(),
            (false, false) => format!("{}; {note}", mutation.info),
        };
        self.audit.record(
            &AuditEntry::new(
                mutation.subject.as_str(),
                mutation.target.as_str(),
                mutation.step,
                audit_result,
            )
            .with_code(result.code_label())
            .with_info(info),
        )
    }
}

/// Strip a weak-validator prefix and all double quotes: `W/"3"` -> `3`.
pub fn normalize_etag(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("W/")
        .replace('"', "")
        .trim()
        .to_string()
}
