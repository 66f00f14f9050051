//! Live and dry-run behaviour of the mutation gate.

mod common;

use common::*;
use medsync_core::{Mutation, Outcome};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn conflicting_delete_is_retried_once_with_if_match() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Procedure/X"))
        .and(header("If-Match", "3"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Procedure/X"))
        .respond_with(ResponseTemplate::new(409))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Procedure/X"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "W/\"3\"")
                .set_body_json(serde_json::json!({"resourceType": "Procedure", "id": "X"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, false);
    let mutation = Mutation::delete(format!("{}/fhir/Procedure/X", server.uri()), "cleanup")
        .about("ACC1", "Procedure/X");
    let result = h
        .session
        .gate()
        .execute(&h.token, mutation)
        .await
        .expect("execute");

    assert_eq!(result.status, Some(204));
    assert_eq!(result.outcome, Outcome::Success);

    let rows = audit_rows(&h.session);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][4], "204");
    assert_eq!(&rows[0][5], "SUCCESS");
    assert_eq!(&rows[0][6], "retried with If-Match");
}

#[tokio::test]
async fn conflict_without_etag_is_recorded_as_failure() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Procedure/X"))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Procedure/X"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(&server, false);
    let mutation = Mutation::delete(format!("{}/fhir/Procedure/X", server.uri()), "cleanup");
    let result = h
        .session
        .gate()
        .execute(&h.token, mutation)
        .await
        .expect("execute");

    assert_eq!(result.outcome, Outcome::Conflict);
    let rows = audit_rows(&h.session);
    assert_eq!(&rows[0][5], "FAILED");
    assert_eq!(&rows[0][6], "409 and no ETag available for retry");
}

#[tokio::test]
async fn dry_run_sends_nothing() {
    let server = MockServer::start().await;
    forbid_mutations(&server).await;

    let h = harness(&server, true);
    let gate = h.session.gate();
    assert!(gate.dry_run());

    let mutation = Mutation::put(format!("{}/dcm/studies/1.2.3", server.uri()), "update_metadata")
        .with_json(serde_json::json!({"00080050": {"vr": "SH", "Value": ["ACC1"]}}), "application/dicom+json")
        .about("ACC1", "study 1.2.3")
        .with_info("accession ACC1-unscheduled -> ACC1");
    let result = gate.execute(&h.token, mutation).await.expect("execute");

    assert!(result.simulated);
    assert!(result.is_success());

    let rows = audit_rows(&h.session);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][1], "ACC1");
    assert_eq!(&rows[0][2], "study 1.2.3");
    assert_eq!(&rows[0][3], "update_metadata");
    assert_eq!(&rows[0][5], "SIMULATED");
    assert_eq!(&rows[0][6], "accession ACC1-unscheduled -> ACC1");
}

#[tokio::test]
async fn transport_failure_is_reported_not_raised() {
    let server = MockServer::start().await;
    let h = harness(&server, false);
    drop(server);

    let mutation = Mutation::post("http://127.0.0.1:9/unreachable", "complete_mwl");
    let result = h
        .session
        .gate()
        .execute(&h.token, mutation)
        .await
        .expect("execute");

    assert_eq!(result.status, None);
    assert!(!result.is_success());
    let rows = audit_rows(&h.session);
    assert_eq!(&rows[0][4], "error");
    assert_eq!(&rows[0][5], "FAILED");
}

#[tokio::test]
async fn verbose_run_keeps_request_and_error_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/fhir/ImagingStudy/ACC1"))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "diagnostics": "subject required"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Procedure/X"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness_with(&server, false, &[("VERBOSE", "true")]);
    let gate = h.session.gate();

    let create = Mutation::put(format!("{}/fhir/ImagingStudy/ACC1", server.uri()), "create_imaging_study")
        .with_json(
            serde_json::json!({"resourceType": "ImagingStudy", "id": "ACC1"}),
            "application/fhir+json",
        );
    let result = gate.execute(&h.token, create).await.expect("execute");
    assert_eq!(result.status, Some(422));

    let cleanup = Mutation::delete(format!("{}/fhir/Procedure/X", server.uri()), "cleanup");
    assert!(gate.execute(&h.token, cleanup).await.expect("execute").is_success());

    let debug_dir = h.session.run_dir().join("debug");
    let mut names: Vec<String> = std::fs::read_dir(&debug_dir)
        .expect("debug dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "0001_create_imaging_study_422_error.log".to_string(),
            "0001_create_imaging_study_request.json".to_string(),
        ]
    );

    let request = std::fs::read_to_string(debug_dir.join(&names[1])).expect("request");
    assert!(request.contains("\"id\": \"ACC1\""));
    let response = std::fs::read_to_string(debug_dir.join(&names[0])).expect("response");
    assert!(response.contains("subject required"));
}

#[tokio::test]
async fn quiet_run_writes_no_debug_artifacts() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/fhir/ImagingStudy/ACC1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let h = harness(&server, false);
    let create = Mutation::put(format!("{}/fhir/ImagingStudy/ACC1", server.uri()), "create_imaging_study")
        .with_json(serde_json::json!({"id": "ACC1"}), "application/fhir+json");
    h.session.gate().execute(&h.token, create).await.expect("execute");

    assert!(!h.session.run_dir().join("debug").exists());
}
