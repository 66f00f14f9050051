//! End-to-end reconciliation of unscheduled/scheduled pairs against mocked servers.

mod common;

use common::*;
use medsync_core::{AccessionPair, AccessionResolution, PairOutcome, SkipReason};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn acc1_pair() -> AccessionPair {
    AccessionPair::new("ACC1-unscheduled", "ACC1")
}

async fn expect_call(server: &MockServer, verb: &str, at: &str, status: u16) {
    Mock::given(method(verb))
        .and(path(at))
        .respond_with(ResponseTemplate::new(status))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn migrates_pair_end_to_end() {
    let server = MockServer::start().await;
    mount_unsynchronized_pair(&server).await;

    Mock::given(method("POST"))
        .and(path("/dcm/studies/1.2.3/patient"))
        .and(query_param("PatientID", "MRN-1"))
        .and(query_param("PatientSex", "F"))
        .and(query_param("PatientBirthDate", "19800102"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    expect_call(&server, "PUT", "/dcm/studies/1.2.3", 200).await;
    expect_call(&server, "DELETE", "/fhir/ImagingStudy/is-1", 204).await;
    expect_call(&server, "PUT", "/fhir/ImagingStudy/ACC1", 201).await;
    expect_call(
        &server,
        "POST",
        "/mwl/mwlitems/ST-1/SPS-1/status/COMPLETED",
        200,
    )
    .await;
    expect_call(&server, "DELETE", "/fhir/ServiceRequest/ACC1-unscheduled", 204).await;
    expect_call(&server, "DELETE", "/fhir/Observation/obs-1", 204).await;

    let h = harness(&server, false);
    let summary = h.session.sync_studies(&h.token).await.expect("sync");

    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.synchronized, 1);
    assert_eq!(summary.partial, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.errored, 0);

    let requests = server.received_requests().await.expect("recording enabled");
    let created = requests
        .iter()
        .find(|r| r.method.as_str() == "PUT" && r.url.path() == "/fhir/ImagingStudy/ACC1")
        .expect("replacement created");
    let body: Value = serde_json::from_slice(&created.body).expect("json body");
    assert_eq!(body["id"], "ACC1");
    assert_eq!(body["status"], "available");
    assert_eq!(body["subject"]["reference"], "Patient/p1");
    assert_eq!(body["numberOfInstances"], 12);
    assert!(body.get("meta").is_none());
    assert_eq!(
        body["identifier"],
        json!([
            {"system": ACC_SYSTEM, "value": "ACC1"},
            {"system": STUDY_ID_SYSTEM, "value": "urn:oid:1.2.3"}
        ])
    );

    let update = requests
        .iter()
        .find(|r| r.method.as_str() == "PUT" && r.url.path() == "/dcm/studies/1.2.3")
        .expect("metadata update");
    let update: Value = serde_json::from_slice(&update.body).expect("json body");
    assert_eq!(update["00080050"]["Value"][0], "ACC1");
    assert_eq!(update["00100020"]["Value"][0], "MRN-1");
    assert_eq!(update["00081030"]["Value"][0], "CT Thorax");
    assert_eq!(update["00080020"]["Value"][0], "20250304");

    let rows = audit_rows(&h.session);
    assert_eq!(rows_with_result(&rows, "SUCCESS").len(), 8);
    assert!(rows_with_result(&rows, "FAILED").is_empty());
    let last = rows.last().expect("pair row");
    assert_eq!(&last[3], "complete");
    assert_eq!(&last[1], "ACC1-unscheduled");

    let staged = h.session.run_dir().join("staged/ImagingStudy_ACC1.json");
    assert!(staged.exists(), "replacement must be staged before the delete");
}

#[tokio::test]
async fn dry_run_sends_no_mutations_and_audits_each_one() {
    let server = MockServer::start().await;
    forbid_mutations(&server).await;
    mount_unsynchronized_pair(&server).await;

    let h = harness(&server, true);
    let summary = h.session.sync_studies(&h.token).await.expect("sync");
    assert_eq!(summary.synchronized, 1);

    let rows = audit_rows(&h.session);
    let simulated = rows_with_result(&rows, "SIMULATED");
    let steps: Vec<&str> = simulated.iter().map(|r| &r[3]).collect();
    assert_eq!(
        steps,
        vec![
            "move_patient",
            "update_metadata",
            "delete_imaging_study",
            "create_imaging_study",
            "complete_mwl",
            "cleanup",
            "cleanup",
        ]
    );
    assert!(simulated.iter().all(|r| &r[4] == "200"));
}

#[tokio::test]
async fn orphan_is_skipped_without_mutations() {
    let server = MockServer::start().await;
    forbid_mutations(&server).await;
    get_json(
        &server,
        "/fhir/ServiceRequest",
        bundle(vec![service_request("ACC2-unscheduled"), service_request("ACC3")]),
    )
    .await;

    let h = harness(&server, false);
    let summary = h.session.sync_studies(&h.token).await.expect("sync");
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.synchronized, 0);

    let rows = audit_rows(&h.session);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][1], "ACC2-unscheduled");
    assert_eq!(&rows[0][5], "SKIPPED");
}

#[tokio::test]
async fn active_worklist_entry_skips_pair() {
    let server = MockServer::start().await;
    forbid_mutations(&server).await;
    Mock::given(method("GET"))
        .and(path("/mwl/mwlitems"))
        .and(query_param("00080050", "ACC1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "00400100": {"vr": "SQ", "Value": [
                {"00400020": {"vr": "CS", "Value": ["SCHEDULED"]}}
            ]}
        }])))
        .mount(&server)
        .await;

    let h = harness(&server, false);
    let outcome = h
        .session
        .study_reconciler()
        .reconcile(&h.token, &acc1_pair())
        .await
        .expect("reconcile");
    assert_eq!(
        outcome,
        PairOutcome::Skipped(SkipReason::WorklistActive("SCHEDULED".into()))
    );
}

#[tokio::test]
async fn failed_worklist_query_skips_pair() {
    let server = MockServer::start().await;
    forbid_mutations(&server).await;
    Mock::given(method("GET"))
        .and(path("/mwl/mwlitems"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let h = harness(&server, false);
    let resolution = AccessionResolution {
        pairs: vec![acc1_pair()],
        ..AccessionResolution::default()
    };
    let summary = h
        .session
        .study_reconciler()
        .run(&h.token, &resolution)
        .await
        .expect("run");
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.errored, 0);

    let rows = audit_rows(&h.session);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][5], "SKIPPED");
    assert_eq!(&rows[0][3], "check_worklist");
    assert!(rows[0][6].starts_with("worklist query failed"), "{}", &rows[0][6]);
    assert!(rows[0][6].contains("HTTP 500"), "{}", &rows[0][6]);
}

#[tokio::test]
async fn second_run_on_synchronized_pair_is_a_no_op() {
    let server = MockServer::start().await;
    forbid_mutations(&server).await;

    Mock::given(method("GET"))
        .and(path("/mwl/mwlitems"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "00400100": {"vr": "SQ", "Value": [
                {"00400020": {"vr": "CS", "Value": ["COMPLETED"]}}
            ]}
        }])))
        .mount(&server)
        .await;
    get_json(&server, "/fhir/ServiceRequest/ACC1", service_request("ACC1")).await;
    get_json(&server, "/fhir/Patient/p1", patient()).await;
    get_json_with_query(
        &server,
        "/dcm/studies",
        "00080050",
        "ACC1",
        archive_study("1.2.3", "MRN-1", "ACC1"),
    )
    .await;

    let mut current = unscheduled_imaging_study();
    current["id"] = json!("ACC1");
    current["status"] = json!("available");
    current["subject"] = json!({"reference": "Patient/p1"});
    get_json_with_query(
        &server,
        "/fhir/ImagingStudy",
        "identifier",
        "ACC1",
        bundle(vec![current.clone()]),
    )
    .await;
    get_json(&server, "/fhir/ImagingStudy/ACC1", current).await;

    let h = harness(&server, false);
    let outcome = h
        .session
        .study_reconciler()
        .reconcile(&h.token, &acc1_pair())
        .await
        .expect("reconcile");
    assert!(matches!(outcome, PairOutcome::Success(_)), "{outcome:?}");
    assert_eq!(h.session.audit().rows(), 0);
}

#[tokio::test]
async fn failed_patient_move_marks_pair_partial() {
    let server = MockServer::start().await;
    mount_unsynchronized_pair(&server).await;
    Mock::given(method("POST"))
        .and(path("/dcm/studies/1.2.3/patient"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    forbid(&server, "PUT").await;
    forbid(&server, "DELETE").await;

    let h = harness(&server, false);
    let outcome = h
        .session
        .study_reconciler()
        .reconcile(&h.token, &acc1_pair())
        .await
        .expect("reconcile");
    match outcome {
        PairOutcome::Partial(reason) => assert!(reason.contains("500"), "{reason}"),
        other => panic!("expected partial, got {other:?}"),
    }

    let rows = audit_rows(&h.session);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][3], "move_patient");
    assert_eq!(&rows[0][5], "FAILED");
}

#[tokio::test]
async fn failed_creation_after_delete_keeps_staged_replacement() {
    let server = MockServer::start().await;
    mount_unsynchronized_pair(&server).await;
    expect_call(&server, "POST", "/dcm/studies/1.2.3/patient", 200).await;
    expect_call(&server, "PUT", "/dcm/studies/1.2.3", 200).await;
    expect_call(&server, "DELETE", "/fhir/ImagingStudy/is-1", 204).await;
    expect_call(&server, "PUT", "/fhir/ImagingStudy/ACC1", 422).await;
    forbid(&server, "DELETE").await;

    let h = harness(&server, false);
    let outcome = h
        .session
        .study_reconciler()
        .reconcile(&h.token, &acc1_pair())
        .await
        .expect("reconcile");
    assert!(matches!(outcome, PairOutcome::Partial(_)), "{outcome:?}");

    let rows = audit_rows(&h.session);
    let warning = rows_with_result(&rows, "WARNING");
    assert_eq!(warning.len(), 1);
    assert!(warning[0][6].contains("ImagingStudy_ACC1.json"));
    assert!(h
        .session
        .run_dir()
        .join("staged/ImagingStudy_ACC1.json")
        .exists());
}

/// Collection where the unscheduled order lives under a server-assigned id.
async fn mount_order_under_foreign_id(server: &MockServer) {
    let mut unscheduled = service_request("sr-9");
    unscheduled["identifier"] = json!([{"system": ACC_SYSTEM, "value": "ACC1-unscheduled"}]);
    get_json(
        server,
        "/fhir/ServiceRequest",
        bundle(vec![service_request("ACC1"), unscheduled, service_request("ACC2")]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/fhir/ServiceRequest/ACC1-unscheduled"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/ServiceRequest/ACC1-unscheduled"))
        .respond_with(ResponseTemplate::new(404))
        .expect(0)
        .mount(server)
        .await;
    get_json_with_query(
        server,
        "/fhir/Observation",
        "based-on",
        "ServiceRequest/sr-9",
        bundle(vec![json!({"resourceType": "Observation", "id": "obs-9"})]),
    )
    .await;
    mount_unsynchronized_pair(server).await;
}

async fn expect_migration_calls(server: &MockServer) {
    expect_call(server, "POST", "/dcm/studies/1.2.3/patient", 200).await;
    expect_call(server, "PUT", "/dcm/studies/1.2.3", 200).await;
    expect_call(server, "DELETE", "/fhir/ImagingStudy/is-1", 204).await;
    expect_call(server, "PUT", "/fhir/ImagingStudy/ACC1", 201).await;
    expect_call(
        server,
        "POST",
        "/mwl/mwlitems/ST-1/SPS-1/status/COMPLETED",
        200,
    )
    .await;
    expect_call(server, "DELETE", "/fhir/Observation/obs-9", 204).await;
}

#[tokio::test]
async fn cleanup_deletes_order_by_its_logical_id() {
    let server = MockServer::start().await;
    mount_order_under_foreign_id(&server).await;
    expect_migration_calls(&server).await;
    expect_call(&server, "DELETE", "/fhir/ServiceRequest/sr-9", 204).await;

    let h = harness(&server, false);
    let summary = h.session.sync_studies(&h.token).await.expect("sync");

    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.synchronized, 1);
    assert_eq!(summary.partial, 0);

    let rows = audit_rows(&h.session);
    let deleted = rows
        .iter()
        .find(|r| &r[2] == "ServiceRequest/sr-9")
        .expect("order delete audited");
    assert_eq!(&deleted[3], "cleanup");
    assert_eq!(&deleted[5], "SUCCESS");
}

#[tokio::test]
async fn undeleted_order_leaves_pair_partial() {
    let server = MockServer::start().await;
    mount_order_under_foreign_id(&server).await;
    expect_migration_calls(&server).await;
    expect_call(&server, "DELETE", "/fhir/ServiceRequest/sr-9", 404).await;

    let h = harness(&server, false);
    let summary = h.session.sync_studies(&h.token).await.expect("sync");

    assert_eq!(summary.synchronized, 0);
    assert_eq!(summary.partial, 1);

    let rows = audit_rows(&h.session);
    let last = rows.last().expect("pair row");
    assert_eq!(&last[3], "partial");
    assert_eq!(&last[5], "PARTIAL");
    assert!(last[6].contains("ServiceRequest/sr-9 delete returned 404"), "{}", &last[6]);
}
