//! Kernel log tail
//!
//! `/dev/kmsg` yields one record per read, formatted as
//! `priority,sequence,micros[,flags];message`. Reads block, so the tail runs
//! on a blocking task and is reopened after EOF or an error.

use crate::docs::{Doc, KmsgDoc};
use crate::errors::AgentError;
use crate::input::{Input, StartupFuture};
use crate::stream::Stream;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::io::{ErrorKind, Read};
use std::time::Duration;
use sysinfo::System;
use tracing::error;

const KMSG_PATH: &str = "/dev/kmsg";
const REOPEN_DELAY: Duration = Duration::from_secs(5);
const READ_BUFFER: usize = 4096;

/// Parse one record; lines without metadata are ignored
pub fn parse_record(raw: &str, boot: DateTime<Utc>) -> Result<Option<KmsgDoc>, AgentError> {
    let Some((meta, message)) = raw.split_once(';') else {
        return Ok(None);
    };

    let metas: Vec<&str> = meta.split(',').collect();
    if metas.len() < 3 {
        return Ok(None);
    }

    let priority = metas[0]
        .parse()
        .map_err(|e| AgentError::parse_with("kmsg: Failed to parse doc priority", e))?;
    let sequence = metas[1]
        .parse()
        .map_err(|e| AgentError::parse_with("kmsg: Failed to parse doc sequence", e))?;
    let micros: i64 = metas[2]
        .parse()
        .map_err(|e| AgentError::parse_with("kmsg: Failed to parse doc timestamp", e))?;

    Ok(Some(KmsgDoc {
        timestamp: boot + ChronoDuration::microseconds(micros),
        boot: boot.timestamp(),
        priority,
        sequence,
        message: message.trim_end_matches('\n').to_string(),
    }))
}

fn boot_time() -> Result<DateTime<Utc>, AgentError> {
    Utc.timestamp_opt(System::boot_time() as i64, 0)
        .single()
        .ok_or_else(|| AgentError::read("kmsg: Failed to parse boottime", System::boot_time()))
}

/// Read until EOF; EPIPE (records overwritten) also ends the pass
fn tail(stream: &Stream, boot: DateTime<Utc>) -> Result<(), AgentError> {
    let mut file = std::fs::File::open(KMSG_PATH)
        .map_err(|e| AgentError::read("kmsg: Failed to open kmsg", e))?;
    let mut buffer = vec![0u8; READ_BUFFER];

    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::BrokenPipe => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(AgentError::read("kmsg: Failed to read kmsg", e)),
        };

        match parse_record(&String::from_utf8_lossy(&buffer[..n]), boot) {
            Ok(Some(doc)) => {
                stream.append(Doc::Kmsg(doc));
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "kmsg: Failed to handle kmsg"),
        }
    }
}

#[derive(Debug, Default)]
pub struct KmsgInput;

impl KmsgInput {
    pub fn new() -> Self {
        Self
    }
}

impl Input for KmsgInput {
    fn name(&self) -> &'static str {
        "kmsg"
    }

    fn startup(&mut self, stream: Stream) -> Option<StartupFuture> {
        Some(Box::pin(async move {
            let boot = boot_time()?;
            loop {
                let tail_stream = stream.clone();
                let result = tokio::task::spawn_blocking(move || tail(&tail_stream, boot))
                    .await
                    .map_err(|e| AgentError::unknown("kmsg: Reader task failed", e))
                    .and_then(|res| res);

                if let Err(e) = result {
                    error!(error = %e, kind = e.kind(), "kmsg: Input handler error");
                }
                tokio::time::sleep(REOPEN_DELAY).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record() {
        let boot = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let doc = parse_record("6,1042,2500000,-;usb 1-1: new high-speed USB device\n", boot)
            .unwrap()
            .unwrap();

        assert_eq!(doc.priority, 6);
        assert_eq!(doc.sequence, 1042);
        assert_eq!(doc.boot, boot.timestamp());
        assert_eq!(doc.timestamp, boot + ChronoDuration::milliseconds(2500));
        assert_eq!(doc.message, "usb 1-1: new high-speed USB device");
    }

    #[test]
    fn test_parse_record_skips_and_errors() {
        let boot = Utc::now();
        assert!(parse_record(" SUBSYSTEM=usb", boot).unwrap().is_none());
        assert!(parse_record("6,1;short", boot).unwrap().is_none());
        assert_eq!(
            parse_record("x,1,2;bad priority", boot).unwrap_err().kind(),
            "parse"
        );
    }
}
