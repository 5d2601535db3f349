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

//! TLS listener lifecycle: binds the mTLS socket, dispatches every accepted
//! connection to the admission/exec/proxy router, and drains in-flight
//! sessions on shutdown.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::admission;
use crate::audit::{AuditHandle, AuditRecord};
use crate::auth::{AuthorizationPredicate, Verdict};
use crate::config::ProxyConfig;
use crate::discovery;
use crate::errors::{full_body, GatewayBody, GatewayError};
use crate::exec::{self, ExecRequest};
use crate::identity::CallerIdentity;
use crate::proxy::UpstreamClient;

/// Process-wide state shared by every accepted connection. Entirely
/// read-only once built in `main`.
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub predicate: AuthorizationPredicate,
    pub audit: AuditHandle,
    pub upstream: Arc<UpstreamClient>,
}

pub async fn run(state: Arc<AppState>, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let tls_acceptor = build_tls_acceptor(&state.config)?;
    let listener = TcpListener::bind(state.config.listen).await?;
    info!(addr = %state.config.listen, "rexec-gate listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp_stream, peer_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!(error = %err, "failed to accept TCP connection");
                        continue;
                    }
                };
                let tls_acceptor = tls_acceptor.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(tcp_stream, tls_acceptor, state).await {
                        debug!(peer_addr = %peer_addr, error = %err, "connection finished with error");
                    }
                });
            }
            _ = shutdown.notified() => {
                info!("listener shutting down, no longer accepting connections");
                return Ok(());
            }
        }
    }
}

fn build_tls_acceptor(config: &ProxyConfig) -> anyhow::Result<TlsAcceptor> {
    let cert_file = File::open(&config.tls_cert)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<Vec<_>, _>>()?;

    let key_file = File::open(&config.tls_key)?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", config.tls_key.display()))?;

    let ca_file = File::open(&config.ca_file)?;
    let ca_certs = rustls_pemfile::certs(&mut BufReader::new(ca_file)).collect::<Result<Vec<_>, _>>()?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

async fn handle_connection(
    tcp_stream: TcpStream,
    tls_acceptor: TlsAcceptor,
    state: Arc<AppState>,
) -> anyhow::Result<()> {
    let tls_stream = tls_acceptor.accept(tcp_stream).await?;
    let io = TokioIo::new(tls_stream);

    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, std::convert::Infallible>(dispatch(req, state).await) }
    });

    hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await?;
    Ok(())
}

async fn dispatch(req: Request<Incoming>, state: Arc<AppState>) -> Response<GatewayBody> {
    let path = req.uri().path().to_string();

    if req.method() == Method::GET && path == "/apis" {
        return discovery::group_list();
    }
    if req.method() == Method::GET && path == discovery::resource_list_path() {
        return discovery::resource_list();
    }

    if path == state.config.admission_path {
        let content_type = req
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = match http_body_util::BodyExt::collect(req.into_body()).await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!(error = %err, "failed to read admission request body");
                return GatewayError::Internal(format!("failed to read admission request body: {err}"))
                    .into_response();
            }
        };
        return admission::handle(content_type.as_deref(), &body, &state.predicate, &state.audit);
    }

    if is_exec_path(&path) {
        return handle_exec(req, state).await;
    }

    let identity = CallerIdentity::from_headers(req.headers());
    state.upstream.forward(req, &identity).await
}

fn is_exec_path(path: &str) -> bool {
    path.contains("/exec")
}

async fn handle_exec(req: Request<Incoming>, state: Arc<AppState>) -> Response<GatewayBody> {
    let identity = CallerIdentity::from_headers(req.headers());

    match state.predicate.evaluate(&identity) {
        Verdict::Deny => {
            let err = if identity.user.is_none() {
                GatewayError::MissingIdentity
            } else {
                GatewayError::Denied("missing or invalid session proof".to_string())
            };
            state
                .audit
                .submit(AuditRecord::denied(identity.user.clone(), err.body()));
            return err.into_response();
        }
        Verdict::AllowBypass | Verdict::AllowSession => {}
    }

    let exec_request = ExecRequest::from_uri(req.uri());
    let session_id = exec_request.session_id();
    let user = identity.user.clone().unwrap_or_default();

    state.audit.submit(AuditRecord::session_start(
        &user,
        &session_id,
        exec_request.argv.join(" "),
    ));

    let (upstream_host, upstream_port, tls) = match parse_upstream(&state.config.upstream) {
        Ok(parsed) => parsed,
        Err(err) => {
            error!(error = %err, "misconfigured --upstream");
            return GatewayError::Internal(format!("misconfigured upstream: {err}")).into_response();
        }
    };

    let tls_connector = if tls {
        Some(build_client_tls_connector(&state.config.ca_file))
    } else {
        None
    };
    let tls_connector = match tls_connector.transpose() {
        Ok(connector) => connector,
        Err(err) => {
            error!(error = %err, "failed to build upstream TLS connector");
            return GatewayError::Internal(format!("failed to build upstream tls connector: {err}")).into_response();
        }
    };

    let upstream_conn = exec::dial_upstream(
        &upstream_host,
        upstream_port,
        tls_connector.as_ref(),
        &exec_request.path_and_query,
        &state.config.bearer_token,
        &identity,
    )
    .await;

    let upstream_conn = match upstream_conn {
        Ok(conn) => conn,
        Err(err) => {
            warn!(error = %err, session = %session_id, "failed to establish upstream exec session");
            return GatewayError::Upstream(format!("upstream exec dial failed: {err}")).into_response();
        }
    };

    let tty = exec_request.tty;
    let max_strokes = state.config.max_strokes_per_line;
    let audit = state.audit.clone();
    let session_id_for_task = session_id.clone();

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::CONNECTION, "Upgrade")
        .header(http::header::UPGRADE, "SPDY/3.1")
        .body(full_body(Bytes::new()))
        .unwrap();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                exec::splice(
                    upgraded,
                    upstream_conn,
                    identity,
                    session_id_for_task,
                    tty,
                    max_strokes,
                    audit,
                )
                .await;
            }
            Err(err) => {
                error!(error = %err, "failed to take over caller upgrade");
            }
        }
    });

    response
}

fn parse_upstream(upstream: &str) -> anyhow::Result<(String, u16, bool)> {
    let uri: http::Uri = upstream.parse()?;
    let tls = uri.scheme_str() == Some("https");
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("--upstream has no host"))?
        .to_string();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok((host, port, tls))
}

fn build_client_tls_connector(ca_file: &std::path::Path) -> anyhow::Result<tokio_rustls::TlsConnector> {
    let ca_bytes = File::open(ca_file)?;
    let ca_certs = rustls_pemfile::certs(&mut BufReader::new(ca_bytes)).collect::<Result<Vec<_>, _>>()?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert)?;
    }
    let client_config = tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(client_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_exec_path() {
        assert!(is_exec_path(
            "/apis/rexec.example.com/v1/namespaces/default/pods/nginx/exec"
        ));
        assert!(!is_exec_path("/api/v1/namespaces/default/pods"));
    }

    #[test]
    fn parses_upstream_url() {
        let (host, port, tls) = parse_upstream("https://kubernetes.default.svc").unwrap();
        assert_eq!(host, "kubernetes.default.svc");
        assert_eq!(port, 443);
        assert!(tls);
    }

    #[test]
    fn parses_upstream_url_with_explicit_port() {
        let (host, port, tls) = parse_upstream("http://127.0.0.1:8080").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 8080);
        assert!(!tls);
    }
}
