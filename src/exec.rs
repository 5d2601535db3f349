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

//! The exec interception handler. Upgrades the caller's connection, dials a
//! matching upgraded connection to the real upstream under the proxy's own
//! identity plus impersonation headers, and splices the four standard
//! streams while tapping stdin (and stdout when not a TTY) into the
//! command extractor.
//!
//! Wire framing: each upgraded duplex byte stream carries frames of
//! `(stream-id: u8, length: u32 big-endian, payload: [u8; length])`.
//! `0=stdin 1=stdout 2=stderr 3=resize 4=error`.

use std::sync::Arc;

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditHandle, AuditRecord};
use crate::extractor::CommandExtractor;
use crate::identity::CallerIdentity;

pub const STREAM_STDIN: u8 = 0;
pub const STREAM_STDOUT: u8 = 1;
pub const STREAM_STDERR: u8 = 2;
pub const STREAM_RESIZE: u8 = 3;
pub const STREAM_ERROR: u8 = 4;

const UPSTREAM_DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Everything the exec handler needs about the request that was already
/// authorized by the time the upgrade is driven.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub path_and_query: String,
    pub tty: bool,
    pub stdin: bool,
    pub argv: Vec<String>,
}

impl ExecRequest {
    /// Parse the query parameters of an exec URI (`container`, repeated
    /// `command`, `stdin`, `stdout`, `stderr`, `tty`), mirroring the
    /// upstream exec resource's own query contract.
    pub fn from_uri(uri: &http::Uri) -> Self {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());
        let query = uri.query().unwrap_or("");
        let mut tty = false;
        let mut stdin = false;
        let mut argv = Vec::new();
        for pair in query.split('&') {
            let mut it = pair.splitn(2, '=');
            let key = it.next().unwrap_or("");
            let value = it.next().unwrap_or("");
            let decoded = percent_decode(value);
            match key {
                "tty" => tty = decoded == "true",
                "stdin" => stdin = decoded == "true",
                "command" => argv.push(decoded),
                _ => {}
            }
        }
        ExecRequest {
            path_and_query,
            tty,
            stdin,
            argv,
        }
    }

    /// Interactive sessions (tty or stdin) get a fresh random session id;
    /// one-shot execs share the literal id `"oneoff"`.
    pub fn session_id(&self) -> String {
        if self.tty || self.stdin {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)[..8].to_string()
        } else {
            "oneoff".to_string()
        }
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read one frame from an upgraded stream. Returns `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let stream_id = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok(Some((stream_id, payload)))
}

/// Write one frame to an upgraded stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, stream_id: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut header = [0u8; 5];
    header[0] = stream_id;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await
}

/// Dial the upstream exec endpoint and drive the HTTP/1.1 upgrade
/// handshake by hand, since the upgrade target speaks the cluster's own
/// stream-multiplex protocol rather than anything `hyper`'s client needs to
/// understand beyond the initial request/response line.
pub async fn dial_upstream(
    upstream_host: &str,
    upstream_port: u16,
    tls_connector: Option<&TlsConnector>,
    path_and_query: &str,
    bearer_token: &str,
    identity: &CallerIdentity,
) -> std::io::Result<UpstreamConn> {
    let tcp = tokio::time::timeout(
        UPSTREAM_DIAL_TIMEOUT,
        TcpStream::connect((upstream_host, upstream_port)),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream dial timed out"))??;

    let mut request = format!(
        "GET {path_and_query} HTTP/1.1\r\nHost: {upstream_host}\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\nAuthorization: Bearer {bearer_token}\r\n"
    );
    for (name, value) in identity.impersonation_headers() {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    match tls_connector {
        Some(connector) => {
            let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(upstream_host.to_string())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let mut stream = connector.connect(server_name, tcp).await?;
            stream.write_all(request.as_bytes()).await?;
            read_upgrade_response(&mut stream).await?;
            Ok(UpstreamConn::Tls(stream))
        }
        None => {
            let mut stream = tcp;
            stream.write_all(request.as_bytes()).await?;
            read_upgrade_response(&mut stream).await?;
            Ok(UpstreamConn::Plain(stream))
        }
    }
}

async fn read_upgrade_response<S: AsyncReadExt + Unpin>(stream: &mut S) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "upstream closed during upgrade"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let response = String::from_utf8_lossy(&buf);
    if !response.starts_with("HTTP/1.1 101") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("upstream refused upgrade: {}", response.lines().next().unwrap_or("")),
        ));
    }
    Ok(())
}

pub enum UpstreamConn {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

/// Splice the caller's upgraded connection with the upstream's upgraded
/// connection, tapping stdin (always) and stdout (only when not a TTY)
/// into the command extractor. Returns once every copy direction has
/// finished.
pub async fn splice(
    caller: Upgraded,
    upstream: UpstreamConn,
    identity: CallerIdentity,
    session_id: String,
    tty: bool,
    max_strokes_per_line: usize,
    audit: AuditHandle,
) {
    let caller_io = TokioIo::new(caller);
    let (caller_read, caller_write) = tokio::io::split(caller_io);

    match upstream {
        UpstreamConn::Plain(stream) => {
            let (up_read, up_write) = tokio::io::split(stream);
            run_splice(
                caller_read,
                caller_write,
                up_read,
                up_write,
                identity,
                session_id,
                tty,
                max_strokes_per_line,
                audit,
            )
            .await;
        }
        UpstreamConn::Tls(stream) => {
            let (up_read, up_write) = tokio::io::split(stream);
            run_splice(
                caller_read,
                caller_write,
                up_read,
                up_write,
                identity,
                session_id,
                tty,
                max_strokes_per_line,
                audit,
            )
            .await;
        }
    }
}

async fn run_splice<CR, CW, UR, UW>(
    mut caller_read: ReadHalf<CR>,
    caller_write: WriteHalf<CW>,
    mut upstream_read: ReadHalf<UR>,
    upstream_write: WriteHalf<UW>,
    identity: CallerIdentity,
    session_id: String,
    tty: bool,
    max_strokes_per_line: usize,
    audit: AuditHandle,
) where
    CR: tokio::io::AsyncRead + Unpin + Send + 'static,
    CW: tokio::io::AsyncWrite + Unpin + Send + 'static,
    UR: tokio::io::AsyncRead + Unpin + Send + 'static,
    UW: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let user = identity.user.clone().unwrap_or_default();
    let upstream_write = Arc::new(tokio::sync::Mutex::new(upstream_write));
    let caller_write = Arc::new(tokio::sync::Mutex::new(caller_write));
    // Flipped when either direction hits a terminal condition, so the
    // sibling direction stops blocking on its own read and the session
    // closes as a unit rather than leaking a half-spliced task.
    let closing = Arc::new(tokio::sync::Notify::new());

    // caller -> upstream, tapping stdin into the extractor.
    let c2u = {
        let upstream_write = upstream_write.clone();
        let audit = audit.clone();
        let user = user.clone();
        let session_id = session_id.clone();
        let closing = closing.clone();
        async move {
            let mut extractor = CommandExtractor::new(max_strokes_per_line);
            loop {
                let frame = tokio::select! {
                    frame = read_frame(&mut caller_read) => frame,
                    _ = closing.notified() => {
                        debug!(session = %session_id, "caller->upstream stopping, sibling direction closed");
                        break;
                    }
                };
                match frame {
                    Ok(Some((stream_id, payload))) => {
                        if stream_id == STREAM_STDIN {
                            for line in extractor.feed(&payload) {
                                audit.submit(AuditRecord::command(&user, &session_id, line.text));
                            }
                        }
                        let mut w = upstream_write.lock().await;
                        if write_frame(&mut *w, stream_id, &payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let mut w = upstream_write.lock().await;
                        let _ = write_frame(&mut *w, STREAM_STDIN, &[]).await;
                        break;
                    }
                    Err(err) => {
                        debug!(error = %err, "caller stream read error, ending session");
                        break;
                    }
                }
            }
            if let Some(line) = extractor.finish() {
                audit.submit(AuditRecord::command(&user, &session_id, line.text));
            }
        }
    };

    // upstream -> caller, tapping stdout only when the session has no TTY
    // (a TTY already echoes stdin back on stdout).
    let u2c = {
        let caller_write = caller_write.clone();
        let audit = audit.clone();
        let user = user.clone();
        let session_id = session_id.clone();
        let closing = closing.clone();
        async move {
            let mut extractor = CommandExtractor::new(max_strokes_per_line);
            loop {
                match read_frame(&mut upstream_read).await {
                    Ok(Some((stream_id, payload))) => {
                        if stream_id == STREAM_STDOUT && !tty {
                            for line in extractor.feed(&payload) {
                                audit.submit(AuditRecord::command(&user, &session_id, line.text));
                            }
                        }
                        let is_stream_error = stream_id == STREAM_ERROR && !payload.is_empty();
                        if is_stream_error {
                            warn!(session = %session_id, "upstream reported an error stream payload, closing session");
                        }
                        let mut w = caller_write.lock().await;
                        let write_failed = write_frame(&mut *w, stream_id, &payload).await.is_err();
                        drop(w);
                        if is_stream_error {
                            closing.notify_waiters();
                            break;
                        }
                        if write_failed {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(error = %err, "upstream stream read error, ending session");
                        break;
                    }
                }
            }
            closing.notify_waiters();
            if !tty {
                if let Some(line) = extractor.finish() {
                    audit.submit(AuditRecord::command(&user, &session_id, line.text));
                }
            }
        }
    };

    tokio::join!(c2u, u2c);
    info!(session = %session_id, user = %user, "exec session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exec_query_parameters() {
        let uri: http::Uri = "/apis/rexec.example.com/v1/namespaces/default/pods/nginx/exec?container=nginx&command=sh&command=-c&command=whoami&stdin=true&tty=true"
            .parse()
            .unwrap();
        let req = ExecRequest::from_uri(&uri);
        assert!(req.tty);
        assert!(req.stdin);
        assert_eq!(req.argv, vec!["sh", "-c", "whoami"]);
    }

    #[test]
    fn interactive_session_gets_random_id_oneoff_otherwise() {
        let interactive = ExecRequest {
            path_and_query: "/exec".to_string(),
            tty: true,
            stdin: true,
            argv: vec![],
        };
        assert_eq!(interactive.session_id().len(), 8);

        let oneoff = ExecRequest {
            path_and_query: "/exec".to_string(),
            tty: false,
            stdin: false,
            argv: vec![],
        };
        assert_eq!(oneoff.session_id(), "oneoff");
    }

    #[tokio::test]
    async fn frame_round_trips_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, STREAM_STDOUT, b"hello").await.unwrap();
        let (id, payload) = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(id, STREAM_STDOUT);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn percent_decode_handles_space_and_escape() {
        assert_eq!(percent_decode("sh%20-c"), "sh -c");
        assert_eq!(percent_decode("a+b"), "a b");
    }
}
