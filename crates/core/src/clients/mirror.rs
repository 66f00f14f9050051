use super::{parse_json, send_read};
use crate::artifacts::ArtifactStore;
use crate::config::MirrorSettings;
use crate::gate::{Mutation, JSON};
use crate::token::AccessToken;
use crate::{SyncError, SyncResult};
use fhir::Identifier;
use medsync_types::BaseUrl;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const PAGE_SIZE: usize = 1000;
const STUDY_ID_SUFFIX: &str = "/study-id";

/// One row of the mirror's `imagingStudy` table.
#[derive(Clone, Debug, Deserialize)]
pub struct MirrorStudy {
    pub id: String,

    #[serde(rename = "numberOfInstances", default)]
    pub number_of_instances: Option<i64>,

    #[serde(default)]
    pub identifier: Vec<Identifier>,
}

impl MirrorStudy {
    /// Study Instance UID from the identifier whose system ends with `/study-id`.
    pub fn study_uid(&self) -> Option<&str> {
        self.identifier
            .iter()
            .filter(|i| {
                i.system
                    .as_deref()
                    .is_some_and(|s| s.ends_with(STUDY_ID_SUFFIX))
            })
            .find_map(|i| i.value.as_deref())
            .map(|v| v.trim().trim_start_matches("urn:oid:"))
            .filter(|v| !v.is_empty())
    }
}

/// PostgREST-style client for the relational mirror of the FHIR store.
#[derive(Clone, Debug)]
pub struct MirrorClient {
    http: Client,
    base: BaseUrl,
    key: AccessToken,
    cleanup_rpc: Option<String>,
    artifacts: Arc<ArtifactStore>,
}

impl MirrorClient {
    pub fn new(http: Client, settings: &MirrorSettings, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            http,
            base: settings.url.clone(),
            key: AccessToken::new(settings.key.clone()),
            cleanup_rpc: settings.cleanup_rpc.as_ref().map(|r| r.to_string()),
            artifacts,
        }
    }

    /// Credential presented to the gate for mirror mutations.
    pub fn key(&self) -> &AccessToken {
        &self.key
    }

    pub fn cleanup_rpc(&self) -> Option<&str> {
        self.cleanup_rpc.as_deref()
    }

    /// Every ImagingStudy row, read in `Range`-delimited pages.
    pub async fn imaging_studies(&self) -> SyncResult<Vec<MirrorStudy>> {
        let url = self.base.join("rest/v1/imagingStudy");
        let mut rows = Vec::new();

        loop {
            let start = rows.len();
            let request = self
                .http
                .get(&url)
                .query(&[("select", "id,numberOfInstances,identifier"), ("order", "id")])
                .header("apikey", self.key.secret())
                .bearer_auth(self.key.secret())
                .header("Range-Unit", "items")
                .header("Range", format!("{start}-{}", start + PAGE_SIZE - 1));
            let fetched = send_read(request, "imagingStudy")
                .await?
                .ok_or_else(|| SyncError::ResourceFetch {
                    resource: "imagingStudy".into(),
                    status: 404,
                })?;
            self.artifacts
                .debug(&format!("mirror_imaging_studies_{start}.json"), &fetched.body);

            let value = parse_json("imagingStudy", &fetched.body)?;
            let page: Vec<MirrorStudy> =
                serde_json::from_value(value).map_err(|e| SyncError::Parse {
                    resource: "imagingStudy".into(),
                    message: e.to_string(),
                })?;
            let len = page.len();
            rows.extend(page);
            if len < PAGE_SIZE {
                break;
            }
        }

        Ok(rows)
    }

    /// `PATCH imagingStudy?id=eq.{id}` setting `numberOfInstances`.
    pub fn instance_count_update(&self, id: &str, count: u64) -> Mutation {
        let url = format!(
            "{}?id=eq.{}",
            self.base.join("rest/v1/imagingStudy"),
            urlencoding::encode(id)
        );
        self.authorized(Mutation::patch(url, "recount"))
            .with_json(json!({ "numberOfInstances": count }), JSON)
            .with_header("Prefer", "return=minimal")
    }

    /// `POST rpc/{name}` for the configured cleanup procedure.
    pub fn cleanup_call(&self, rpc: &str) -> Mutation {
        let url = self
            .base
            .join(&format!("rest/v1/rpc/{}", urlencoding::encode(rpc)));
        self.authorized(Mutation::post(url, "mirror_cleanup"))
            .with_json(json!({}), JSON)
    }

    fn authorized(&self, mutation: Mutation) -> Mutation {
        mutation.with_header("apikey", self.key.secret())
    }
}
