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

//! Static API discovery documents for the audit group this proxy serves.
//! Aggregated-API-server clients walk `/apis` then `/apis/<group>/<version>`
//! before ever issuing an exec call; both are answered locally instead of
//! falling through to the transparent proxy.

use bytes::Bytes;
use http::{Response, StatusCode};
use serde::Serialize;

use crate::errors::{full_body, GatewayBody};

pub const API_GROUP: &str = "rexec.example.com";
pub const API_VERSION: &str = "v1";

#[derive(Debug, Clone, Serialize)]
struct GroupVersionForDiscovery {
    #[serde(rename = "groupVersion")]
    group_version: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct ApiGroup {
    name: String,
    versions: Vec<GroupVersionForDiscovery>,
    #[serde(rename = "preferredVersion")]
    preferred_version: GroupVersionForDiscovery,
}

#[derive(Debug, Serialize)]
struct ApiGroupList {
    kind: String,
    #[serde(rename = "apiVersion")]
    api_version: String,
    groups: Vec<ApiGroup>,
}

#[derive(Debug, Serialize)]
struct ApiResource {
    name: String,
    namespaced: bool,
    kind: String,
    verbs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ApiResourceList {
    kind: String,
    #[serde(rename = "apiVersion")]
    api_version: String,
    #[serde(rename = "groupVersion")]
    group_version: String,
    resources: Vec<ApiResource>,
}

/// `GET /apis`.
pub fn group_list() -> Response<GatewayBody> {
    let gv = GroupVersionForDiscovery {
        group_version: format!("{API_GROUP}/{API_VERSION}"),
        version: API_VERSION.to_string(),
    };
    json_response(&ApiGroupList {
        kind: "APIGroupList".to_string(),
        api_version: "v1".to_string(),
        groups: vec![ApiGroup {
            name: API_GROUP.to_string(),
            versions: vec![gv.clone()],
            preferred_version: gv,
        }],
    })
}

/// `GET /apis/<group>/<version>`, advertising the `pods/exec` sub-resource
/// this proxy intercepts.
pub fn resource_list() -> Response<GatewayBody> {
    json_response(&ApiResourceList {
        kind: "APIResourceList".to_string(),
        api_version: "v1".to_string(),
        group_version: format!("{API_GROUP}/{API_VERSION}"),
        resources: vec![ApiResource {
            name: "pods/exec".to_string(),
            namespaced: true,
            kind: "PodExecOptions".to_string(),
            verbs: vec!["create".to_string(), "get".to_string()],
        }],
    })
}

/// The path `resource_list` is served on, given the fixed group/version
/// above: `/apis/<group>/<version>`.
pub fn resource_list_path() -> String {
    format!("/apis/{API_GROUP}/{API_VERSION}")
}

fn json_response<T: Serialize>(body: &T) -> Response<GatewayBody> {
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

    #[test]
    fn group_list_is_ok_json() {
        let resp = group_list();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn resource_list_path_matches_fixed_group_and_version() {
        assert_eq!(resource_list_path(), "/apis/rexec.example.com/v1");
    }

    #[test]
    fn resource_list_is_ok_json() {
        let resp = resource_list();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
