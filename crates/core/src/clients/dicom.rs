use super::send_read;
use crate::artifacts::{sanitize_file_name, ArtifactStore};
use crate::gate::DICOM_JSON;
use crate::token::AccessToken;
use crate::SyncResult;
use dicom_json::{tags, Dataset, DicomDemographics};
use medsync_types::BaseUrl;
use reqwest::{header, Client};
use std::sync::Arc;

/// QIDO-RS / MWL-RS reads against the archive, and URL builders for its write endpoints.
#[derive(Clone, Debug)]
pub struct DicomClient {
    http: Client,
    qido: BaseUrl,
    mwl: BaseUrl,
    artifacts: Arc<ArtifactStore>,
}

impl DicomClient {
    pub fn new(http: Client, qido: BaseUrl, mwl: BaseUrl, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            http,
            qido,
            mwl,
            artifacts,
        }
    }

    pub async fn studies_by_accession(
        &self,
        token: &AccessToken,
        accession: &str,
    ) -> SyncResult<Vec<Dataset>> {
        let query = [
            (tags::ACCESSION_NUMBER, accession),
            ("includedefaults", "false"),
            ("includefield", tags::STUDY_INSTANCE_UID),
            ("includefield", tags::PATIENT_ID),
            ("includefield", tags::ACCESSION_NUMBER),
        ];
        self.query(token, &self.qido.join("studies"), &query, &format!("studies_{accession}"))
            .await
    }

    /// Worklist items for an accession, with their scheduled step sequence.
    pub async fn mwl_items_by_accession(
        &self,
        token: &AccessToken,
        accession: &str,
    ) -> SyncResult<Vec<Dataset>> {
        let query = [
            (tags::ACCESSION_NUMBER, accession),
            ("includedefaults", "false"),
            ("includefield", tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE),
        ];
        self.query(token, &self.mwl.join("mwlitems"), &query, &format!("mwl_{accession}"))
            .await
    }

    pub async fn patients_page(
        &self,
        token: &AccessToken,
        offset: usize,
        limit: usize,
    ) -> SyncResult<Vec<Dataset>> {
        let offset = offset.to_string();
        let limit = limit.to_string();
        let query = [
            ("includefield", "all"),
            ("offset", offset.as_str()),
            ("limit", limit.as_str()),
        ];
        self.query(
            token,
            &self.qido.join("patients"),
            &query,
            &format!("patients_offset_{offset}"),
        )
        .await
    }

    /// Every patient record filed under `patient_id`, whatever its issuer.
    pub async fn patients_by_id(
        &self,
        token: &AccessToken,
        patient_id: &str,
    ) -> SyncResult<Vec<Dataset>> {
        let query = [(tags::PATIENT_ID, patient_id), ("includefield", "all")];
        self.query(
            token,
            &self.qido.join("patients"),
            &query,
            &format!("patient_{patient_id}"),
        )
        .await
    }

    pub async fn studies_by_patient(
        &self,
        token: &AccessToken,
        patient_id: &str,
    ) -> SyncResult<Vec<Dataset>> {
        let query = [(tags::PATIENT_ID, patient_id), ("includefield", "all")];
        self.query(
            token,
            &self.qido.join("studies"),
            &query,
            &format!("patient_studies_{patient_id}"),
        )
        .await
    }

    /// Number of study-related instances the archive holds; `0` when the study is unknown.
    pub async fn instance_count(&self, token: &AccessToken, study_uid: &str) -> SyncResult<u64> {
        let query = [
            (tags::STUDY_INSTANCE_UID, study_uid),
            ("includedefaults", "false"),
            ("includefield", tags::NUMBER_OF_STUDY_RELATED_INSTANCES),
        ];
        let studies = self
            .query(
                token,
                &self.qido.join("studies"),
                &query,
                &format!("count_{study_uid}"),
            )
            .await?;

        Ok(studies
            .first()
            .and_then(|s| s.integer(tags::NUMBER_OF_STUDY_RELATED_INSTANCES))
            .map(|n| n.max(0) as u64)
            .unwrap_or(0))
    }

    /// `POST .../studies/{uid}/patient?PatientID=...`: move a study to another patient.
    pub fn move_study_url(
        &self,
        study_uid: &str,
        patient_id: &str,
        demographics: &DicomDemographics,
    ) -> String {
        let mut params = vec![("PatientID", patient_id)];
        if let Some(name) = &demographics.name {
            params.push(("PatientName", name.as_str()));
        }
        if let Some(sex) = &demographics.sex {
            params.push(("PatientSex", sex.as_str()));
        }
        if let Some(dob) = &demographics.birth_date {
            params.push(("PatientBirthDate", dob.as_str()));
        }
        let query: Vec<String> = params
            .into_iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect();

        format!(
            "{}?{}",
            self.qido
                .join(&format!("studies/{}/patient", urlencoding::encode(study_uid))),
            query.join("&")
        )
    }

    /// `PUT .../studies/{uid}`: overwrite study-level attributes.
    pub fn study_url(&self, study_uid: &str) -> String {
        self.qido
            .join(&format!("studies/{}", urlencoding::encode(study_uid)))
    }

    /// `POST .../mwlitems/{study}/{sps}/status/COMPLETED`.
    pub fn complete_worklist_url(&self, study_id: &str, sps_id: &str) -> String {
        self.mwl.join(&format!(
            "mwlitems/{}/{}/status/COMPLETED",
            urlencoding::encode(study_id),
            urlencoding::encode(sps_id)
        ))
    }

    /// `PUT .../patients/{pid}[^^^{issuer}]?merge=true`. An empty issuer addresses the
    /// record without an issuer.
    pub fn merge_url(&self, patient_id: &str, source_issuer: &str) -> String {
        let key = if source_issuer.is_empty() {
            urlencoding::encode(patient_id).into_owned()
        } else {
            format!(
                "{}^^^{}",
                urlencoding::encode(patient_id),
                urlencoding::encode(source_issuer)
            )
        };
        format!("{}?merge=true", self.qido.join(&format!("patients/{key}")))
    }

    async fn query(
        &self,
        token: &AccessToken,
        url: &str,
        query: &[(&str, &str)],
        artifact: &str,
    ) -> SyncResult<Vec<Dataset>> {
        let request = self
            .http
            .get(url)
            .bearer_auth(token.secret())
            .header(header::ACCEPT, DICOM_JSON)
            .query(query);
        let Some(fetched) = send_read(request, url).await? else {
            return Ok(Vec::new());
        };
        self.artifacts
            .debug(&sanitize_file_name(&format!("{artifact}.json")), &fetched.body);

        Ok(Dataset::parse_array(&fetched.body)?)
    }
}
