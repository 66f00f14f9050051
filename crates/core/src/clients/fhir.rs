use super::{parse_json, send_read};
use crate::artifacts::{sanitize_file_name, ArtifactStore};
use crate::gate::FHIR_JSON;
use crate::token::AccessToken;
use crate::{SyncError, SyncResult};
use fhir::Bundle;
use medsync_types::BaseUrl;
use reqwest::{header, Client};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A resource as read from the server, with its version validator if one was sent.
#[derive(Clone, Debug)]
pub struct FhirDocument {
    pub value: serde_json::Value,
    pub etag: Option<String>,
}

#[derive(Clone, Debug)]
pub struct FhirClient {
    http: Client,
    base: BaseUrl,
    artifacts: Arc<ArtifactStore>,
}

impl FhirClient {
    pub fn new(http: Client, base: BaseUrl, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            http,
            base,
            artifacts,
        }
    }

    /// `{base}/{type}/{id}` with the id percent-encoded.
    pub fn resource_url(&self, resource_type: &str, id: &str) -> String {
        self.base
            .join(&format!("{resource_type}/{}", urlencoding::encode(id)))
    }

    /// Every ServiceRequest on the server, following `next` links until exhausted.
    ///
    /// # Errors
    ///
    /// Any failed page fails the whole collection: a partial list would hide orders.
    pub async fn service_requests(&self, token: &AccessToken) -> SyncResult<Vec<serde_json::Value>> {
        let mut url = self.base.join("ServiceRequest");
        let mut seen = HashSet::new();
        let mut resources = Vec::new();

        for page in 0.. {
            if !seen.insert(url.clone()) {
                warn!("pagination loop detected at {url}, stopping");
                break;
            }

            let fetched = send_read(self.get(token, &url), "ServiceRequest")
                .await?
                .ok_or_else(|| SyncError::ResourceFetch {
                    resource: "ServiceRequest".into(),
                    status: 404,
                })?;
            self.artifacts
                .debug(&format!("service_requests_page_{page}.json"), &fetched.body);

            let bundle = Bundle::parse(&parse_json("ServiceRequest", &fetched.body)?)?;
            let before = resources.len();
            resources.extend(bundle.resources_of_type("ServiceRequest").cloned());
            debug!(
                "ServiceRequest page {page}: {} resources",
                resources.len() - before
            );

            match bundle.next_link() {
                Some(next) => url = next.to_string(),
                None => break,
            }
        }

        Ok(resources)
    }

    /// Read one resource. `Ok(None)` when the server reports it absent.
    pub async fn read(
        &self,
        token: &AccessToken,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<Option<FhirDocument>> {
        let label = format!("{resource_type}/{id}");
        let Some(fetched) = send_read(self.get(token, &self.resource_url(resource_type, id)), &label).await?
        else {
            return Ok(None);
        };
        self.artifacts
            .debug(&sanitize_file_name(&format!("{resource_type}_{id}.json")), &fetched.body);

        Ok(Some(FhirDocument {
            value: parse_json(&label, &fetched.body)?,
            etag: fetched.etag,
        }))
    }

    /// `GET {base}/{type}?{param}={value}`. An absent endpoint yields an empty bundle.
    pub async fn search(
        &self,
        token: &AccessToken,
        resource_type: &str,
        param: &str,
        value: &str,
    ) -> SyncResult<Bundle> {
        let label = format!("{resource_type}?{param}={value}");
        let request = self
            .get(token, &self.base.join(resource_type))
            .query(&[(param, value)]);
        let Some(fetched) = send_read(request, &label).await? else {
            return Ok(Bundle::default());
        };
        self.artifacts.debug(
            &format!("search_{resource_type}_{param}_{value}.json"),
            &fetched.body,
        );

        Ok(Bundle::parse(&parse_json(&label, &fetched.body)?)?)
    }

    fn get(&self, token: &AccessToken, url: &str) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .bearer_auth(token.secret())
            .header(header::ACCEPT, FHIR_JSON)
    }
}
