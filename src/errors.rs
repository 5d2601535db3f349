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

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use thiserror::Error;

/// Body type every handler in the gateway responds with: owned buffers and
/// streamed/forwarded bodies (e.g. the transparent proxy's upstream
/// response) are boxed behind the same type so every route can share one
/// `Response<_>` signature.
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Wrap a fully-buffered body as a `GatewayBody`. `Full<Bytes>`'s error type
/// is uninhabited, so the `map_err` below is never actually invoked.
pub fn full_body(bytes: Bytes) -> GatewayBody {
    Full::new(bytes)
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed()
}

/// Error taxonomy for the gateway. Every variant knows how it should be
/// surfaced to a caller; handlers convert these into responses rather than
/// inventing ad-hoc status/body pairs at each call site.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no user found")]
    MissingIdentity,

    #[error("denied: {0}")]
    Denied(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("extractor error: {0}")]
    Extractor(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Status code a non-streaming handler should respond with.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingIdentity | GatewayError::Denied(_) => StatusCode::FORBIDDEN,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Stream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Extractor(_) => StatusCode::OK,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Literal wire body for non-streaming responses. `"No User found"` and
    /// the misspelled `"Internal errror"` are preserved verbatim for wire
    /// compatibility with any external monitoring that matches on them.
    pub fn body(&self) -> String {
        match self {
            GatewayError::MissingIdentity => "No User found".to_string(),
            GatewayError::Denied(reason) => reason.clone(),
            GatewayError::Upstream(reason) => reason.clone(),
            GatewayError::Stream(reason) => reason.clone(),
            GatewayError::Extractor(reason) => reason.clone(),
            GatewayError::Internal(_) => "Internal errror".to_string(),
        }
    }

    /// Render this error as the response a non-streaming handler should
    /// send back to the caller, so call sites build responses through the
    /// taxonomy instead of ad-hoc status/body pairs.
    pub fn into_response(self) -> Response<GatewayBody> {
        let status = self.status();
        let body = self.body();
        Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "text/plain")
            .body(full_body(Bytes::from(body)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(full_body(Bytes::from_static(b"Internal errror")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_identity_maps_to_forbidden_with_preserved_spelling() {
        let resp = GatewayError::MissingIdentity.into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn internal_error_preserves_wire_spelling() {
        assert_eq!(GatewayError::Internal("whatever".to_string()).body(), "Internal errror");
    }
}
