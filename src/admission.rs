/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of rexec-gate
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The admission webhook handler: an `admission.k8s.io/v1` `AdmissionReview`
//! envelope in, the same envelope (with a verdict) out.

use bytes::Bytes;
use http::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::{AuthorizationPredicate, Verdict};
use crate::audit::{AuditHandle, AuditRecord};
use crate::errors::{full_body, GatewayBody};
use crate::identity::CallerIdentity;

const EXEC_SUBRESOURCE: &str = "exec";

#[derive(Debug, Deserialize)]
pub struct AdmissionReview {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub request: AdmissionRequest,
}

#[derive(Debug, Deserialize)]
pub struct AdmissionRequest {
    pub uid: String,
    pub resource: ResourceRef,
    #[serde(rename = "subResource", default)]
    pub sub_resource: Option<String>,
    #[serde(rename = "userInfo")]
    pub user_info: UserInfo,
}

#[derive(Debug, Deserialize)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub resource: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct UserInfo {
    pub username: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: std::collections::BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct AdmissionReviewResponse {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize)]
pub struct AdmissionStatus {
    pub message: String,
}

impl UserInfo {
    fn into_identity(self) -> CallerIdentity {
        CallerIdentity {
            user: self.username,
            groups: self.groups,
            extra: self.extra,
        }
    }
}

/// Dispatch a raw admission webhook request body. Fails open on internal
/// errors per §4.2: a malformed or unparseable call must not block
/// unrelated cluster traffic.
pub fn handle(
    content_type: Option<&str>,
    body: &[u8],
    predicate: &AuthorizationPredicate,
    audit: &AuditHandle,
) -> Response<GatewayBody> {
    if !content_type
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false)
    {
        return Response::builder()
            .status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
            .body(full_body(Bytes::new()))
            .unwrap();
    }

    let review: AdmissionReview = match serde_json::from_slice(body) {
        Ok(review) => review,
        Err(err) => {
            error!(error = %err, "admission review is not valid JSON, allowing with warning");
            return json_response(&AdmissionReviewResponse {
                api_version: "admission.k8s.io/v1".to_string(),
                kind: "AdmissionReview".to_string(),
                response: AdmissionResponse {
                    uid: String::new(),
                    allowed: true,
                    status: Some(AdmissionStatus {
                        message: format!("allowed with warning: malformed admission review: {err}"),
                    }),
                },
            });
        }
    };

    let uid = review.request.uid.clone();
    let is_exec = review.request.resource.resource == EXEC_SUBRESOURCE
        || review.request.sub_resource.as_deref() == Some(EXEC_SUBRESOURCE);

    if !is_exec {
        return json_response(&allow(uid));
    }

    let identity = review.request.user_info.into_identity();
    match predicate.evaluate(&identity) {
        Verdict::AllowBypass | Verdict::AllowSession => json_response(&allow(uid)),
        Verdict::Deny => {
            let reason = if identity.user.is_none() {
                "No User found".to_string()
            } else {
                "missing or invalid session proof".to_string()
            };
            audit.submit(AuditRecord::denied(identity.user.clone(), reason.clone()));
            json_response(&AdmissionReviewResponse {
                api_version: "admission.k8s.io/v1".to_string(),
                kind: "AdmissionReview".to_string(),
                response: AdmissionResponse {
                    uid,
                    allowed: false,
                    status: Some(AdmissionStatus { message: reason }),
                },
            })
        }
    }
}

fn allow(uid: String) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponse {
            uid,
            allowed: true,
            status: None,
        },
    }
}

fn json_response(body: &AdmissionReviewResponse) -> Response<GatewayBody> {
    let json = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(full_body(Bytes::from(json)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn predicate() -> AuthorizationPredicate {
        AuthorizationPredicate::new(HashSet::from(["system:admin".to_string()]), "s3cr3t".to_string())
    }

    fn audit() -> AuditHandle {
        let (handle, _sink) = crate::audit::AuditSink::new(16);
        handle
    }

    fn review_body(username: Option<&str>, resource: &str, extra_proof: Option<&str>) -> Vec<u8> {
        let mut extra = serde_json::Map::new();
        if let Some(proof) = extra_proof {
            extra.insert("secret-sauce".to_string(), serde_json::json!([proof]));
        }
        let body = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "abc-123",
                "resource": {"group": "", "version": "v1", "resource": resource},
                "subResource": if resource == "exec" { serde_json::Value::Null } else { serde_json::json!("exec") },
                "userInfo": {
                    "username": username,
                    "groups": [],
                    "extra": extra,
                }
            }
        });
        serde_json::to_vec(&body).unwrap()
    }

    #[test]
    fn non_exec_resource_always_allowed() {
        let body = review_body(Some("eve"), "pods", None);
        let resp = handle(Some("application/json"), &body, &predicate(), &audit());
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn non_json_content_type_rejected() {
        let body = review_body(Some("eve"), "pods", None);
        let resp = handle(Some("text/plain"), &body, &predicate(), &audit());
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn malformed_json_allows_with_warning() {
        let resp = handle(Some("application/json"), b"not json", &predicate(), &audit());
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn bypass_user_exec_allowed() {
        let body = review_body(Some("system:admin"), "exec", None);
        let resp = handle(Some("application/json"), &body, &predicate(), &audit());
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn denied_exec_without_proof() {
        let body = review_body(Some("eve"), "exec", None);
        let resp = handle(Some("application/json"), &body, &predicate(), &audit());
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
