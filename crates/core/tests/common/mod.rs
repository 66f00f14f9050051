//! Shared fixtures for medsync-core integration tests.

#![allow(dead_code)]

use medsync_core::{AccessToken, SyncConfig, SyncSession};
use serde_json::{json, Value};
use std::collections::HashMap;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ACC_SYSTEM: &str = "urn:ris:accession";
pub const SPS_SYSTEM: &str = "urn:ris:sps";
pub const STUDY_ID_SYSTEM: &str = "http://ris.example/study-id";

/// Configuration pointing every endpoint at the mock server.
pub fn config(server: &MockServer, dry_run: bool, extra: &[(&str, &str)]) -> SyncConfig {
    let uri = server.uri();
    let mut env: HashMap<String, String> = HashMap::from([
        ("FHIR_BASE".to_string(), format!("{uri}/fhir")),
        ("DCM_QIDO".to_string(), format!("{uri}/dcm")),
        ("DCM_MWL".to_string(), format!("{uri}/mwl")),
        ("KC_TOKEN_URL".to_string(), format!("{uri}/token")),
        ("KC_CLIENT_ID".to_string(), "medsync".to_string()),
        ("KC_CLIENT_SECRET".to_string(), "client-secret".to_string()),
        ("KC_USERNAME".to_string(), "robot".to_string()),
        ("KC_PASSWORD".to_string(), "robot-password".to_string()),
        ("ACC_SYSTEM".to_string(), ACC_SYSTEM.to_string()),
        ("SPS_SYSTEM".to_string(), SPS_SYSTEM.to_string()),
        ("STUDYID_SYSTEM".to_string(), STUDY_ID_SYSTEM.to_string()),
        ("CANON".to_string(), "CANON".to_string()),
        ("MIRROR_URL".to_string(), uri.clone()),
        ("MIRROR_KEY".to_string(), "mirror-key".to_string()),
        ("SAFETY_DELAY_SECS".to_string(), "0".to_string()),
        ("DRY_RUN".to_string(), dry_run.to_string()),
    ]);
    for (key, value) in extra {
        env.insert(key.to_string(), value.to_string());
    }
    SyncConfig::from_lookup(|k| env.get(k).cloned()).expect("test config")
}

pub struct Harness {
    pub dir: TempDir,
    pub session: SyncSession,
    pub token: AccessToken,
}

pub fn harness(server: &MockServer, dry_run: bool) -> Harness {
    harness_with(server, dry_run, &[])
}

pub fn harness_with(server: &MockServer, dry_run: bool, extra: &[(&str, &str)]) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let session = SyncSession::open_in(config(server, dry_run, extra), dir.path().join("run"))
        .expect("session");
    Harness {
        dir,
        session,
        token: AccessToken::new("test-token"),
    }
}

/// Audit rows without the header.
pub fn audit_rows(session: &SyncSession) -> Vec<csv::StringRecord> {
    let mut reader = csv::Reader::from_path(session.audit().path()).expect("audit reader");
    reader.records().map(|r| r.expect("audit row")).collect()
}

pub fn rows_with_result<'a>(
    rows: &'a [csv::StringRecord],
    result: &str,
) -> Vec<&'a csv::StringRecord> {
    rows.iter().filter(|r| &r[5] == result).collect()
}

pub fn bundle(resources: Vec<Value>) -> Value {
    json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "entry": resources.into_iter().map(|r| json!({"resource": r})).collect::<Vec<_>>()
    })
}

pub fn service_request(id: &str) -> Value {
    json!({
        "resourceType": "ServiceRequest",
        "id": id,
        "identifier": [{"system": ACC_SYSTEM, "value": id}],
        "subject": {"reference": "Patient/p1"},
        "code": {"text": "CT Thorax"},
        "requester": {"display": "Dr House"},
        "note": [{"text": "persistent cough"}],
        "occurrenceDateTime": "2025-03-04T09:08:07+01:00"
    })
}

pub fn patient() -> Value {
    json!({
        "resourceType": "Patient",
        "id": "p1",
        "identifier": [{"system": "urn:mrn", "value": "MRN-1"}],
        "name": [{"given": ["Jane"], "family": "Doe"}],
        "birthDate": "1980-01-02",
        "gender": "female"
    })
}

pub fn unscheduled_imaging_study() -> Value {
    json!({
        "resourceType": "ImagingStudy",
        "id": "is-1",
        "meta": {"versionId": "2"},
        "status": "registered",
        "subject": {"reference": "Patient/tmp-9"},
        "identifier": [
            {"system": ACC_SYSTEM, "value": "ACC1-unscheduled"},
            {"system": STUDY_ID_SYSTEM, "value": "urn:oid:1.2.3"}
        ],
        "numberOfInstances": 12
    })
}

pub fn archive_study(uid: &str, patient_id: &str, accession: &str) -> Value {
    json!([{
        "0020000D": {"vr": "UI", "Value": [uid]},
        "00100020": {"vr": "LO", "Value": [patient_id]},
        "00080050": {"vr": "SH", "Value": [accession]}
    }])
}

pub async fn get_json(server: &MockServer, at: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

pub async fn get_json_with_query(
    server: &MockServer,
    at: &str,
    key: &str,
    value: &str,
    body: Value,
) {
    Mock::given(method("GET"))
        .and(path(at))
        .and(query_param(key, value))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Fail the test if any request with `verb` reaches the server.
pub async fn forbid(server: &MockServer, verb: &str) {
    Mock::given(method(verb))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(server)
        .await;
}

pub async fn forbid_mutations(server: &MockServer) {
    for verb in ["PUT", "POST", "PATCH", "DELETE"] {
        forbid(server, verb).await;
    }
}

/// Read side of the ACC1 / ACC1-unscheduled pair before reconciliation.
pub async fn mount_unsynchronized_pair(server: &MockServer) {
    get_json(
        server,
        "/fhir/ServiceRequest",
        bundle(vec![
            service_request("ACC1"),
            service_request("ACC1-unscheduled"),
            service_request("ACC2"),
        ]),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/mwl/mwlitems"))
        .and(query_param("00080050", "ACC1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;

    get_json(server, "/fhir/ServiceRequest/ACC1", service_request("ACC1")).await;
    get_json(
        server,
        "/fhir/ServiceRequest/ACC1-unscheduled",
        service_request("ACC1-unscheduled"),
    )
    .await;
    get_json(server, "/fhir/Patient/p1", patient()).await;
    get_json_with_query(server, "/fhir/Patient", "identifier", "MRN-1", bundle(vec![patient()]))
        .await;

    get_json_with_query(server, "/dcm/studies", "00080050", "ACC1", json!([])).await;
    get_json_with_query(
        server,
        "/dcm/studies",
        "00080050",
        "ACC1-unscheduled",
        archive_study("1.2.3", "TMP-9", "ACC1-unscheduled"),
    )
    .await;

    get_json_with_query(
        server,
        "/fhir/ImagingStudy",
        "identifier",
        "ACC1-unscheduled",
        bundle(vec![unscheduled_imaging_study()]),
    )
    .await;
    get_json(server, "/fhir/ImagingStudy/is-1", unscheduled_imaging_study()).await;

    get_json(
        server,
        "/fhir/Procedure/ACC1",
        json!({
            "resourceType": "Procedure",
            "id": "ACC1",
            "identifier": [
                {"system": SPS_SYSTEM, "value": "SPS-1"},
                {"system": STUDY_ID_SYSTEM, "value": "ST-1"}
            ]
        }),
    )
    .await;

    get_json_with_query(
        server,
        "/fhir/Observation",
        "based-on",
        "ServiceRequest/ACC1-unscheduled",
        bundle(vec![json!({"resourceType": "Observation", "id": "obs-1"})]),
    )
    .await;
}
