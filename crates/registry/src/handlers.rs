//! Session service handlers.
//!
//! Every handler is a pure function of (request, store state) and always
//! returns a `Response`, success or failure alike: failed requests are still
//! broadcast so that every replica records the failure identically. Status
//! codes come from the fixed store-error mapping plus 422 for bodies that do
//! not parse.

use crate::bridge::{CommitPayload, L1Bridge};
use crate::{HandlerFn, RegistryError, ServiceRegistry};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tandem_store::{ReplicatedCommit, SessionStore, StoreError};
use tandem_types::{Request, Response};
use tracing::error;

fn store_error_response(err: &StoreError) -> Response {
    Response::json_error(err.http_status(), &err.to_string())
}

fn parse_body<T: DeserializeOwned>(request: &Request) -> Result<T, Response> {
    serde_json::from_str(&request.body).map_err(|err| {
        Response::json_error(422, &format!("Invalid body format: {err}"))
    })
}

fn require_segments(request: &Request, count: usize) -> Result<(), Response> {
    if request.path.split('/').count() == count {
        Ok(())
    } else {
        Err(Response::json_error(400, "Invalid path format"))
    }
}

/// Register the full interactivity-layer service surface.
///
/// Registration order is fixed: pattern ambiguity resolves
/// first-registered-wins, so every replica must register identically.
pub fn register_l2_services(
    registry: &ServiceRegistry,
    store: Arc<SessionStore>,
    bridge: Arc<L1Bridge>,
) -> Result<(), RegistryError> {
    registry.register(
        "POST",
        "/session/test-package",
        true,
        create_test_package_handler(store.clone()),
    )?;
    registry.register(
        "POST",
        "/session/start",
        true,
        start_session_handler(store.clone()),
    )?;
    registry.register(
        "GET",
        "/session/:id/scan/:package_id",
        false,
        scan_package_handler(store.clone()),
    )?;
    registry.register(
        "POST",
        "/session/:id/validate",
        false,
        validate_package_handler(store.clone()),
    )?;
    registry.register(
        "POST",
        "/session/:id/qc",
        false,
        quality_check_handler(store.clone()),
    )?;
    registry.register(
        "POST",
        "/session/:id/label",
        false,
        label_package_handler(store.clone()),
    )?;
    registry.register("POST", "/commit/:id", false, commit_session_handler(store, bridge))?;
    Ok(())
}

/// Register the commitment-layer surface: only the replicate-commit handler.
pub fn register_l1_services(
    registry: &ServiceRegistry,
    store: Arc<SessionStore>,
) -> Result<(), RegistryError> {
    registry.register(
        "POST",
        "/session/:id/commit-l1",
        false,
        receive_commit_handler(store),
    )
}

fn create_test_package_handler(store: Arc<SessionStore>) -> HandlerFn {
    Arc::new(move |request: &Request| {
        match store.create_test_package(&request.request_id) {
            Ok(package) => Response::json(
                201,
                json!({ "package_id": package.id }).to_string(),
            ),
            Err(err) => store_error_response(&err),
        }
    })
}

#[derive(Debug, Deserialize)]
struct StartSessionBody {
    #[serde(default)]
    operator_id: String,
}

fn start_session_handler(store: Arc<SessionStore>) -> HandlerFn {
    Arc::new(move |request: &Request| {
        let body: StartSessionBody = match parse_body(request) {
            Ok(body) => body,
            Err(response) => return response,
        };
        if body.operator_id.is_empty() {
            return Response::json_error(400, "operator ID is required");
        }

        let session_id = format!("SESSION-{}", request.request_id);
        match store.create_session(&session_id, &body.operator_id) {
            Ok(session) => Response::json(
                201,
                json!({ "message": "Session generated", "id": session.id }).to_string(),
            ),
            Err(err) => store_error_response(&err),
        }
    })
}

fn scan_package_handler(store: Arc<SessionStore>) -> HandlerFn {
    Arc::new(move |request: &Request| {
        if let Err(response) = require_segments(request, 5) {
            return response;
        }
        let Some(package_id) = request.path_segment(4) else {
            return Response::json_error(400, "package id is required");
        };

        match store.scan_package(package_id) {
            Ok(details) => {
                let expected: Vec<_> = details
                    .items
                    .iter()
                    .map(|item| {
                        json!({
                            "item_id": item.id,
                            "item": item.description,
                            "qty": item.quantity,
                        })
                    })
                    .collect();
                Response::json(
                    200,
                    json!({
                        "status": 200,
                        "source": details.supplier_name,
                        "package_id": details.package.id,
                        "expected_contents": expected,
                        "supplier_signature": details.package.signature,
                        "next_step": "validate",
                    })
                    .to_string(),
                )
            }
            Err(err) => store_error_response(&err),
        }
    })
}

#[derive(Debug, Deserialize)]
struct ValidatePackageBody {
    #[serde(default)]
    signature: String,
    #[serde(default)]
    package_id: String,
}

fn validate_package_handler(store: Arc<SessionStore>) -> HandlerFn {
    Arc::new(move |request: &Request| {
        if let Err(response) = require_segments(request, 4) {
            return response;
        }
        let session_id = match request.path_segment(2) {
            Some(id) => id.to_string(),
            None => return Response::json_error(400, "Invalid path format"),
        };
        let body: ValidatePackageBody = match parse_body(request) {
            Ok(body) => body,
            Err(response) => return response,
        };
        if body.signature.is_empty() {
            return Response::json_error(400, "signature is required");
        }
        if body.package_id.is_empty() {
            return Response::json_error(400, "package_id is required");
        }

        // Signatures are accepted as-is; trust is recorded on the package row.
        match store.validate_package(&body.package_id, &session_id) {
            Ok(details) => Response::json(
                202,
                json!({
                    "message": "package validated successfully",
                    "package_id": details.package.id,
                    "supplier": details.supplier_name,
                    "session_id": session_id,
                })
                .to_string(),
            ),
            Err(err) => store_error_response(&err),
        }
    })
}

#[derive(Debug, Deserialize)]
struct QualityCheckBody {
    passed: bool,
    #[serde(default)]
    issues: Vec<String>,
}

fn quality_check_handler(store: Arc<SessionStore>) -> HandlerFn {
    Arc::new(move |request: &Request| {
        if let Err(response) = require_segments(request, 4) {
            return response;
        }
        let session_id = match request.path_segment(2) {
            Some(id) => id.to_string(),
            None => return Response::json_error(400, "Invalid path format"),
        };
        let body: QualityCheckBody = match parse_body(request) {
            Ok(body) => body,
            Err(response) => return response,
        };

        match store.quality_check(&session_id, body.passed, &body.issues) {
            Ok((package, qc)) => Response::json(
                202,
                json!({
                    "message": format!("QC record created for package {}", package.id),
                    "package_id": package.id,
                    "qc_record_id": qc.id,
                    "operator_id": qc.inspector_id,
                })
                .to_string(),
            ),
            Err(err) => store_error_response(&err),
        }
    })
}

#[derive(Debug, Deserialize)]
struct LabelPackageBody {
    #[serde(default)]
    destination: String,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default)]
    courier_id: String,
}

fn default_priority() -> String {
    "standard".to_string()
}

fn label_package_handler(store: Arc<SessionStore>) -> HandlerFn {
    Arc::new(move |request: &Request| {
        if let Err(response) = require_segments(request, 4) {
            return response;
        }
        let session_id = match request.path_segment(2) {
            Some(id) => id.to_string(),
            None => return Response::json_error(400, "Invalid path format"),
        };
        let body: LabelPackageBody = match parse_body(request) {
            Ok(body) => body,
            Err(response) => return response,
        };
        if body.destination.is_empty() {
            return Response::json_error(400, "destination is required");
        }
        if body.courier_id.is_empty() {
            return Response::json_error(400, "courier_id is required");
        }

        match store.label_package(&session_id, &body.destination, &body.priority, &body.courier_id)
        {
            Ok(label) => Response::json(202, json!({ "label_id": label.id }).to_string()),
            Err(err) => store_error_response(&err),
        }
    })
}

#[derive(Debug, Deserialize)]
struct CommitSessionBody {
    #[serde(default)]
    operator_id: String,
}

fn commit_session_handler(store: Arc<SessionStore>, bridge: Arc<L1Bridge>) -> HandlerFn {
    Arc::new(move |request: &Request| {
        if let Err(response) = require_segments(request, 3) {
            return response;
        }
        let session_id = match request.path_segment(2) {
            Some(id) => id.to_string(),
            None => return Response::json_error(400, "Invalid path format"),
        };
        let body: CommitSessionBody = match parse_body(request) {
            Ok(body) => body,
            Err(response) => return response,
        };

        // Commit gate: load the full rollup and validate under one store
        // transaction. Any failure is still broadcast for auditability.
        let rollup = match store.commit_rollup(&session_id, &body.operator_id) {
            Ok(rollup) => rollup,
            Err(err) => return store_error_response(&err),
        };

        let payload = CommitPayload {
            operator_id: rollup.session.operator_id.clone(),
            package_id: rollup.package.id.clone(),
            supplier_signature: rollup.package.signature.clone(),
            qc_passed: rollup.qc.passed,
            issues: rollup.qc.issue_list(),
            // Ingress timestamp travels with the envelope: input, not derived.
            timestamp: request.timestamp.to_rfc3339(),
            label: rollup.label.id.clone(),
            destination: rollup.label.destination.clone(),
            priority: rollup.label.priority.clone(),
            courier_id: rollup.label.courier_id.clone(),
        };

        let receipt = match bridge.replicate(&session_id, &payload) {
            Ok(receipt) => receipt,
            Err(err) => {
                error!(%session_id, error = %err, "L1 commit failed; session stays pre-commit");
                return Response::json_error(err.http_status(), &err.to_string());
            }
        };

        match store.finalize_commit(&session_id, &receipt.tx_hash, receipt.block_height) {
            Ok(record) => Response::json(
                202,
                json!({
                    "l1": {
                        "BlockHeight": receipt.block_height,
                        "TxHash": receipt.tx_hash,
                    },
                    "l2": record,
                })
                .to_string(),
            ),
            Err(err) => store_error_response(&err),
        }
    })
}

fn receive_commit_handler(store: Arc<SessionStore>) -> HandlerFn {
    Arc::new(move |request: &Request| {
        if let Err(response) = require_segments(request, 4) {
            return response;
        }
        let session_id = match request.path_segment(2) {
            Some(id) => id.to_string(),
            None => return Response::json_error(400, "Invalid path format"),
        };
        let payload: CommitPayload = match parse_body(request) {
            Ok(payload) => payload,
            Err(response) => return response,
        };

        let commit = ReplicatedCommit {
            operator_id: payload.operator_id,
            package_id: payload.package_id,
            supplier_signature: payload.supplier_signature,
            qc_passed: payload.qc_passed,
            issues: payload.issues,
            destination: payload.destination,
            priority: payload.priority,
            courier_id: payload.courier_id,
        };

        match store.replicate_commit(&session_id, &commit) {
            // Echo the payload back; identical resubmissions produce the
            // identical response required by replay equality.
            Ok(_) => Response::json(202, request.body.clone()),
            Err(err) => store_error_response(&err),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn request(method: &str, path: &str, body: &str) -> Request {
        Request {
            method: method.to_string(),
            path: path.to_string(),
            headers: BTreeMap::new(),
            body: body.to_string(),
            remote_addr: "127.0.0.1:9999".to_string(),
            request_id: "00112233445566778899aabbccddeeff".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        }
    }

    fn l2_registry() -> (ServiceRegistry, Arc<SessionStore>) {
        let registry = ServiceRegistry::new(false);
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        register_l2_services(&registry, store.clone(), Arc::new(L1Bridge::disconnected()))
            .unwrap();
        (registry, store)
    }

    fn body_json(response: &Response) -> serde_json::Value {
        serde_json::from_str(&response.body).unwrap()
    }

    #[test]
    fn test_package_handler_derives_id_from_request() {
        let (registry, _store) = l2_registry();
        let response = registry
            .execute(&request("POST", "/session/test-package", "{}"))
            .unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(body_json(&response)["package_id"], "PKG-00112233");
    }

    #[test]
    fn start_session_creates_session_for_known_operator() {
        let (registry, store) = l2_registry();
        let response = registry
            .execute(&request(
                "POST",
                "/session/start",
                r#"{"operator_id":"OPR-001"}"#,
            ))
            .unwrap();
        assert_eq!(response.status_code, 201);
        let id = body_json(&response)["id"].as_str().unwrap().to_string();
        assert_eq!(id, "SESSION-00112233445566778899aabbccddeeff");
        assert!(store.session(&id).unwrap().is_some());
    }

    #[test]
    fn start_session_unknown_operator_is_a_foreign_key_400() {
        let (registry, _store) = l2_registry();
        let response = registry
            .execute(&request(
                "POST",
                "/session/start",
                r#"{"operator_id":"OPR-ZZZ"}"#,
            ))
            .unwrap();
        assert_eq!(response.status_code, 400);
        assert!(response.body.contains("foreign key"));
    }

    #[test]
    fn start_session_malformed_body_is_422() {
        let (registry, _store) = l2_registry();
        let response = registry
            .execute(&request("POST", "/session/start", "not json"))
            .unwrap();
        assert_eq!(response.status_code, 422);
    }

    #[test]
    fn scan_returns_expected_contents() {
        let (registry, _store) = l2_registry();
        registry
            .execute(&request(
                "POST",
                "/session/start",
                r#"{"operator_id":"OPR-001"}"#,
            ))
            .unwrap();
        let sid = "SESSION-00112233445566778899aabbccddeeff";
        let response = registry
            .execute(&request(
                "GET",
                &format!("/session/{sid}/scan/PKG-001"),
                "",
            ))
            .unwrap();
        assert_eq!(response.status_code, 200);
        let body = body_json(&response);
        assert_eq!(body["package_id"], "PKG-001");
        assert_eq!(body["next_step"], "validate");
        assert_eq!(body["expected_contents"].as_array().unwrap().len(), 2);
        assert_eq!(body["supplier_signature"], "digital_sig_001");
    }

    #[test]
    fn scan_unknown_package_is_404() {
        let (registry, _store) = l2_registry();
        let response = registry
            .execute(&request("GET", "/session/S-1/scan/PKG-404", ""))
            .unwrap();
        assert_eq!(response.status_code, 404);
    }

    fn drive_to_labeled(registry: &ServiceRegistry) -> String {
        registry
            .execute(&request(
                "POST",
                "/session/start",
                r#"{"operator_id":"OPR-001"}"#,
            ))
            .unwrap();
        let sid = "SESSION-00112233445566778899aabbccddeeff".to_string();
        registry
            .execute(&request("GET", &format!("/session/{sid}/scan/PKG-001"), ""))
            .unwrap();
        let response = registry
            .execute(&request(
                "POST",
                &format!("/session/{sid}/validate"),
                r#"{"signature":"any","package_id":"PKG-001"}"#,
            ))
            .unwrap();
        assert_eq!(response.status_code, 202);
        let response = registry
            .execute(&request(
                "POST",
                &format!("/session/{sid}/qc"),
                r#"{"passed":true,"issues":["all good"]}"#,
            ))
            .unwrap();
        assert_eq!(response.status_code, 202);
        let response = registry
            .execute(&request(
                "POST",
                &format!("/session/{sid}/label"),
                r#"{"destination":"CUSTOMER A","priority":"standard","courier_id":"COU-001"}"#,
            ))
            .unwrap();
        assert_eq!(response.status_code, 202);
        sid
    }

    #[test]
    fn workflow_reaches_label_with_deterministic_ids() {
        let (registry, store) = l2_registry();
        let sid = drive_to_labeled(&registry);
        let label = store.label_for_session(&sid).unwrap().unwrap();
        assert_eq!(label.id, tandem_store::label_id("COU-001", "PKG-001", &sid));
    }

    #[test]
    fn premature_commit_is_conflict() {
        let (registry, _store) = l2_registry();
        registry
            .execute(&request(
                "POST",
                "/session/start",
                r#"{"operator_id":"OPR-001"}"#,
            ))
            .unwrap();
        let sid = "SESSION-00112233445566778899aabbccddeeff";
        registry
            .execute(&request("GET", &format!("/session/{sid}/scan/PKG-001"), ""))
            .unwrap();
        registry
            .execute(&request(
                "POST",
                &format!("/session/{sid}/validate"),
                r#"{"signature":"any","package_id":"PKG-001"}"#,
            ))
            .unwrap();

        let response = registry
            .execute(&request(
                "POST",
                &format!("/commit/{sid}"),
                r#"{"operator_id":"OPR-001"}"#,
            ))
            .unwrap();
        assert_eq!(response.status_code, 409);
        assert!(response.body.contains("not ready for commit"));
    }

    #[test]
    fn commit_without_l1_keeps_session_uncommitted() {
        let (registry, store) = l2_registry();
        let sid = drive_to_labeled(&registry);
        let response = registry
            .execute(&request(
                "POST",
                &format!("/commit/{sid}"),
                r#"{"operator_id":"OPR-001"}"#,
            ))
            .unwrap();
        // Gate passed but the bridge has no L1 nodes configured.
        assert_eq!(response.status_code, 500);
        let session = store.session(&sid).unwrap().unwrap();
        assert!(!session.is_committed);
        assert_eq!(session.status, "active");
    }

    #[test]
    fn replicate_commit_round_trips_and_conflicts() {
        let registry = ServiceRegistry::new(false);
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        register_l1_services(&registry, store.clone()).unwrap();

        let payload = r#"{"operator_id":"OPR-001","package_id":"PKG-777","supplier_signature":"sig","qc_passed":true,"issues":["all good"],"timestamp":"2025-01-01T12:00:00+00:00","label":"LBL-x","destination":"CUSTOMER A","priority":"standard","courier_id":"COU-001"}"#;
        let response = registry
            .execute(&request("POST", "/session/SESSION-R/commit-l1", payload))
            .unwrap();
        assert_eq!(response.status_code, 202);
        assert_eq!(response.body, payload);

        // Identical resubmission: same status, same body.
        let replay = registry
            .execute(&request("POST", "/session/SESSION-R/commit-l1", payload))
            .unwrap();
        assert_eq!(replay.status_code, 202);
        assert_eq!(replay.body, payload);

        // Divergent contents: detected cross-layer conflict.
        let altered = payload.replace("CUSTOMER A", "CUSTOMER B");
        let conflict = registry
            .execute(&request("POST", "/session/SESSION-R/commit-l1", &altered))
            .unwrap();
        assert_eq!(conflict.status_code, 409);
    }
}
