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

//! Command-line surface and the one-time identity/config bootstrap. Every
//! field here is built once at startup and handed to handlers read-only,
//! mirroring the teacher's single-config-built-in-`Init()` idiom.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use rand::RngCore;
use tracing::warn;

/// rexec-gate: an auditing interception proxy for container exec sessions.
#[derive(Debug, Parser)]
#[command(name = "rexec-gate", version)]
pub struct Cli {
    /// Bind address for the admission/exec/proxy listener.
    #[arg(long, env = "REXEC_LISTEN", default_value = "0.0.0.0:8443")]
    pub listen: SocketAddr,

    /// Serving certificate presented by this listener.
    #[arg(long, env = "REXEC_TLS_CERT", default_value = "/etc/pki/rexec/tls.crt")]
    pub tls_cert: PathBuf,

    /// Private key for the serving certificate.
    #[arg(long, env = "REXEC_TLS_KEY", default_value = "/etc/pki/rexec/tls.key")]
    pub tls_key: PathBuf,

    /// User name exempted from the session-proof check. Repeatable.
    #[arg(long = "by-pass-user", env = "REXEC_BYPASS_USERS", value_delimiter = ',')]
    pub by_pass_user: Vec<String>,

    /// Shared session-proof secret. A random one is generated and logged
    /// once if unset.
    #[arg(long, env = "REXEC_SECRET_SAUCE")]
    pub secret_sauce: Option<String>,

    /// Enable trace-level audit output.
    #[arg(long, env = "REXEC_AUDIT_TRACE")]
    pub audit_trace: bool,

    /// Enable system-facility debug output.
    #[arg(long, env = "REXEC_DEBUG")]
    pub debug: bool,

    /// Extractor per-line buffer bound.
    #[arg(long, env = "REXEC_MAX_STROKES_PER_LINE", default_value_t = 2000)]
    pub max_strokes_per_line: usize,

    /// Base URL of the real control-plane API server this proxy fronts.
    #[arg(long, env = "REXEC_UPSTREAM", default_value = "https://kubernetes.default.svc")]
    pub upstream: String,

    /// CA bundle trusted both for verifying the upstream and for this
    /// listener's client-certificate authentication.
    #[arg(long, env = "REXEC_CA_FILE", default_value = "/etc/pki/rexec/ca.crt")]
    pub ca_file: PathBuf,

    /// This proxy's own service-identity bearer token, sent upstream in
    /// place of the caller's credentials.
    #[arg(
        long,
        env = "REXEC_BEARER_TOKEN_FILE",
        default_value = "/var/run/secrets/rexec/token"
    )]
    pub bearer_token_file: PathBuf,

    /// Path the admission webhook is served on.
    #[arg(long, env = "REXEC_ADMISSION_PATH", default_value = "/admission")]
    pub admission_path: String,

    /// Seconds between refusing new connections and cancelling in-flight
    /// sessions on shutdown.
    #[arg(long, env = "REXEC_SHUTDOWN_GRACE_PERIOD", default_value_t = 10)]
    pub shutdown_grace_period: u64,

    /// Bound on the audit channel.
    #[arg(long, env = "REXEC_AUDIT_CHANNEL_CAPACITY", default_value_t = 4096)]
    pub audit_channel_capacity: usize,
}

/// Immutable process-wide state, built once from the CLI surface.
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub ca_file: PathBuf,
    pub bypass_users: HashSet<String>,
    pub secret_sauce: String,
    pub audit_trace: bool,
    pub debug: bool,
    pub max_strokes_per_line: usize,
    pub upstream: String,
    pub bearer_token: String,
    pub admission_path: String,
    pub shutdown_grace_period: std::time::Duration,
    pub audit_channel_capacity: usize,
}

impl ProxyConfig {
    /// Build the immutable configuration, reading the bearer token from
    /// disk and generating a session-proof secret if the operator did not
    /// supply one.
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let bearer_token = fs::read_to_string(&cli.bearer_token_file)
            .map_err(|e| {
                anyhow::anyhow!(
                    "failed to read bearer token at {}: {e}",
                    cli.bearer_token_file.display()
                )
            })?
            .trim()
            .to_string();

        let secret_sauce = match cli.secret_sauce {
            Some(secret) => secret,
            None => {
                let generated = generate_secret();
                warn!(secret_sauce = %generated, "no --secret-sauce configured, generated a random one");
                generated
            }
        };

        Ok(ProxyConfig {
            listen: cli.listen,
            tls_cert: cli.tls_cert,
            tls_key: cli.tls_key,
            ca_file: cli.ca_file,
            bypass_users: cli.by_pass_user.into_iter().collect(),
            secret_sauce,
            audit_trace: cli.audit_trace,
            debug: cli.debug,
            max_strokes_per_line: cli.max_strokes_per_line,
            upstream: cli.upstream,
            bearer_token,
            admission_path: cli.admission_path,
            shutdown_grace_period: std::time::Duration::from_secs(cli.shutdown_grace_period),
            audit_channel_capacity: cli.audit_channel_capacity,
        })
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
