//! Read-side HTTP clients for the FHIR server, the DICOM archive and the relational mirror.
//!
//! All clients share one `reqwest::Client`. Reads go straight out (they are allowed in dry-run
//! mode); writes are only ever described here and executed by the dry-run gate.

pub mod dicom;
pub mod fhir;
pub mod mirror;

pub use dicom::DicomClient;
pub use fhir::FhirClient;
pub use mirror::{MirrorClient, MirrorStudy};

use crate::config::SyncConfig;
use crate::{SyncError, SyncResult};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use tracing::debug;

/// Build the HTTP client shared by every component of a run.
pub fn build_http_client(cfg: &SyncConfig) -> SyncResult<Client> {
    Client::builder()
        .timeout(cfg.http_timeout())
        .danger_accept_invalid_certs(cfg.mode().insecure)
        .user_agent(concat!("medsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(SyncError::Network)
}

/// Body and validator of a successful read.
#[derive(Debug)]
pub(crate) struct Fetched {
    pub body: String,
    pub etag: Option<String>,
}

/// Send a read request and classify the response.
///
/// `404`/`410` become `Ok(None)`, other non-success statuses become
/// [`SyncError::ResourceFetch`], transport failures become [`SyncError::Network`].
pub(crate) async fn send_read(
    request: RequestBuilder,
    resource: &str,
) -> SyncResult<Option<Fetched>> {
    let response = request.send().await?;
    let status = response.status();
    debug!("GET {} -> {}", response.url(), status.as_u16());

    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(SyncError::ResourceFetch {
            resource: resource.to_string(),
            status: status.as_u16(),
        });
    }

    let etag = response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await?;
    Ok(Some(Fetched { body, etag }))
}

pub(crate) fn parse_json(resource: &str, body: &str) -> SyncResult<serde_json::Value> {
    serde_json::from_str(body).map_err(|e| SyncError::Parse {
        resource: resource.to_string(),
        message: e.to_string(),
    })
}
