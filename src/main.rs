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

mod admission;
mod audit;
mod auth;
mod config;
mod discovery;
mod errors;
mod exec;
mod extractor;
mod identity;
mod listener;
mod proxy;
mod readiness;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::AuthorizationPredicate;
use crate::config::{Cli, ProxyConfig};
use crate::listener::AppState;
use crate::proxy::UpstreamClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    let config = Arc::new(ProxyConfig::load(cli)?);
    info!(listen = %config.listen, upstream = %config.upstream, "rexec-gate starting");

    let predicate = AuthorizationPredicate::new(config.bypass_users.clone(), config.secret_sauce.clone());
    let (audit_handle, audit_sink) = audit::AuditSink::new(config.audit_channel_capacity);
    let audit_task = tokio::spawn(audit_sink.run());

    let upstream = Arc::new(UpstreamClient::new(config.upstream.clone(), config.bearer_token.clone())?);

    let state = Arc::new(AppState {
        config: config.clone(),
        predicate,
        audit: audit_handle.clone(),
        upstream,
    });

    let shutdown = Arc::new(Notify::new());
    let listener_shutdown = shutdown.clone();
    let listener_task = tokio::spawn(listener::run(state.clone(), listener_shutdown));

    let readiness_addr = config.listen;
    tokio::spawn(async move {
        if readiness::wait_until_ready(readiness_addr, 20, std::time::Duration::from_millis(100)).await {
            info!("listener is ready");
        } else {
            warn!("listener did not become ready within the retry window");
        }
    });

    wait_for_signal().await;
    info!(grace_period = ?config.shutdown_grace_period, "shutdown signal received, draining sessions");
    shutdown.notify_waiters();

    tokio::time::sleep(config.shutdown_grace_period).await;
    drop(audit_handle);

    let _ = listener_task.await;
    if let Err(err) = audit_task.await {
        warn!(error = %err, "audit sink task panicked");
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
