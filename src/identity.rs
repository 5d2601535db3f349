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

//! Caller identity as placed by a fronting control plane, following the
//! aggregated-API-server front-proxy header convention: `X-Remote-User`,
//! repeatable `X-Remote-Group`, and repeatable `X-Remote-Extra-<key>`.

use std::collections::BTreeMap;

use http::HeaderMap;

pub const REMOTE_USER_HEADER: &str = "x-remote-user";
pub const REMOTE_GROUP_HEADER: &str = "x-remote-group";
pub const REMOTE_EXTRA_PREFIX: &str = "x-remote-extra-";

/// Extras key the client-side helper uses to present its session proof.
pub const SECRET_SAUCE_EXTRA_KEY: &str = "secret-sauce";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user: Option<String>,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl CallerIdentity {
    /// Parse a caller identity from the trusted request headers. Returns an
    /// identity with `user: None` if the control plane did not place one;
    /// callers must treat that as `AuthError::MissingIdentity`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let user = headers
            .get(REMOTE_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let groups = headers
            .get_all(REMOTE_GROUP_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .collect();

        let mut extra: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers.iter() {
            let name = name.as_str();
            if let Some(key) = name.strip_prefix(REMOTE_EXTRA_PREFIX) {
                if let Ok(v) = value.to_str() {
                    extra.entry(key.to_string()).or_default().push(v.to_string());
                }
            }
        }

        CallerIdentity { user, groups, extra }
    }

    /// First value of the session-proof extras key, if present.
    pub fn session_proof(&self) -> Option<&str> {
        self.extra
            .get(SECRET_SAUCE_EXTRA_KEY)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    /// Build the `Impersonate-*` headers the upstream expects, reconstructed
    /// from this identity so the upstream logs the real caller rather than
    /// the proxy's own service identity.
    pub fn impersonation_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(user) = &self.user {
            headers.push(("Impersonate-User".to_string(), user.clone()));
        }
        for group in &self.groups {
            headers.push(("Impersonate-Group".to_string(), group.clone()));
        }
        for (key, values) in &self.extra {
            for value in values {
                headers.push((format!("Impersonate-Extra-{key}"), value.clone()));
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_from(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn parses_user_groups_and_extras() {
        let headers = headers_from(&[
            ("x-remote-user", "alice"),
            ("x-remote-group", "system:masters"),
            ("x-remote-group", "developers"),
            ("x-remote-extra-secret-sauce", "shh"),
        ]);
        let identity = CallerIdentity::from_headers(&headers);
        assert_eq!(identity.user.as_deref(), Some("alice"));
        assert_eq!(identity.groups, vec!["system:masters", "developers"]);
        assert_eq!(identity.session_proof(), Some("shh"));
    }

    #[test]
    fn missing_identity_is_none() {
        let headers = HeaderMap::new();
        let identity = CallerIdentity::from_headers(&headers);
        assert!(identity.user.is_none());
    }

    #[test]
    fn impersonation_headers_round_trip() {
        let headers = headers_from(&[
            ("x-remote-user", "bob"),
            ("x-remote-group", "ops"),
            ("x-remote-extra-secret-sauce", "token"),
        ]);
        let identity = CallerIdentity::from_headers(&headers);
        let out = identity.impersonation_headers();
        assert!(out.contains(&("Impersonate-User".to_string(), "bob".to_string())));
        assert!(out.contains(&("Impersonate-Group".to_string(), "ops".to_string())));
        assert!(out.contains(&(
            "Impersonate-Extra-secret-sauce".to_string(),
            "token".to_string()
        )));
    }
}
