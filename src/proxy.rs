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

//! Transparent reverse proxy: every request that is not the intercepted
//! exec path is forwarded to the real upstream control plane, preserving
//! method/path/query/headers and streaming both the request and response
//! bodies through untouched, so large bodies (`kubectl cp` tar streams,
//! paginated LIST responses) and any trailers they carry pass through
//! without ever being buffered in full.

use http::{HeaderMap, Request, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;
use tracing::error;

use crate::errors::{GatewayBody, GatewayError};
use crate::identity::CallerIdentity;

/// Headers that must not be blindly forwarded across a proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str, connection_header_values: &[String]) -> bool {
    let lower = name.to_lowercase();
    HOP_BY_HOP.contains(&lower.as_str())
        || lower.starts_with("proxy-")
        || connection_header_values.iter().any(|v| v.eq_ignore_ascii_case(&lower))
}

fn connection_header_values(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_string())
        .collect()
}

pub struct UpstreamClient {
    http: LegacyClient<hyper_rustls::HttpsConnector<HttpConnector>, Incoming>,
    base_url: String,
    bearer_token: String,
}

impl UpstreamClient {
    pub fn new(base_url: String, bearer_token: String) -> anyhow::Result<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .build();
        let http = LegacyClient::builder(TokioExecutor::new()).build(connector);
        Ok(UpstreamClient {
            http,
            base_url,
            bearer_token,
        })
    }

    /// Forward a request to the upstream control plane, injecting this
    /// proxy's own bearer token plus impersonation headers derived from the
    /// caller's identity. Both the request and response bodies are handed
    /// to the upstream/caller connections unbuffered: an `Incoming` body
    /// carries its trailer frames alongside its data frames, and boxing it
    /// with `BodyExt::boxed` (rather than collecting it) preserves both.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        identity: &CallerIdentity,
    ) -> Response<GatewayBody> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let uri: http::Uri = match format!("{}{}", self.base_url.trim_end_matches('/'), path_and_query).parse() {
            Ok(uri) => uri,
            Err(err) => {
                error!(error = %err, "failed to build upstream uri");
                return GatewayError::Internal(format!("bad upstream uri: {err}")).into_response();
            }
        };

        let connection_values = connection_header_values(&parts.headers);
        let mut headers = HeaderMap::with_capacity(parts.headers.len() + 4);
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop(name.as_str(), &connection_values) {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Ok(value) = http::HeaderValue::from_str(&format!("Bearer {}", self.bearer_token)) {
            headers.insert(http::header::AUTHORIZATION, value);
        }
        for (name, value) in identity.impersonation_headers() {
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::from_bytes(name.as_bytes()),
                http::HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }

        parts.uri = uri;
        parts.headers = headers;
        let upstream_req = Request::from_parts(parts, body);

        match self.http.request(upstream_req).await {
            Ok(resp) => build_downstream_response(resp),
            Err(err) => {
                error!(error = %err, "upstream request failed");
                GatewayError::Upstream(format!("upstream request failed: {err}")).into_response()
            }
        }
    }
}

/// Re-home an upstream `Response<Incoming>` onto the caller's connection,
/// stripping hop-by-hop headers and boxing the body as-is so its trailer
/// frames ride along with its data frames instead of being dropped.
fn build_downstream_response(resp: Response<Incoming>) -> Response<GatewayBody> {
    let (parts, body) = resp.into_parts();
    let connection_values = connection_header_values(&parts.headers);
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name.as_str(), &connection_values) {
            builder = builder.header(name, value);
        }
    }
    builder.body(body.boxed()).unwrap_or_else(|_| {
        GatewayError::Internal("failed to build downstream response".to_string()).into_response()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_recognized() {
        assert!(is_hop_by_hop("Connection", &[]));
        assert!(is_hop_by_hop("transfer-encoding", &[]));
        assert!(is_hop_by_hop("Proxy-Authorization", &[]));
        assert!(!is_hop_by_hop("content-type", &[]));
        assert!(!is_hop_by_hop("authorization", &[]));
    }

    #[test]
    fn header_named_by_connection_is_hop_by_hop() {
        let values = vec!["x-custom".to_string()];
        assert!(is_hop_by_hop("x-custom", &values));
        assert!(!is_hop_by_hop("x-other", &values));
    }
}
