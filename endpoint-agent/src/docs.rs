//! Telemetry records shipped over the stream
//!
//! Every record kind is one variant of [`Doc`]. On the wire a record is
//! `"{type}:" ++ json ++ "\n"` with short field names.

use crate::errors::AgentError;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Host summary sample
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemDoc {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "v")]
    pub version: String,
    #[serde(rename = "hn")]
    pub hostname: String,
    #[serde(rename = "ut")]
    pub uptime: u64,
    #[serde(rename = "pf")]
    pub platform: String,
    #[serde(rename = "pu")]
    pub package_updates: u32,
    #[serde(rename = "cc")]
    pub cpu_cores: usize,
    #[serde(rename = "cu")]
    pub cpu_usage: f64,
    #[serde(rename = "mt")]
    pub mem_total: u64,
    #[serde(rename = "mu")]
    pub mem_usage: f64,
    #[serde(rename = "st")]
    pub swap_total: u64,
    #[serde(rename = "su")]
    pub swap_usage: f64,
    #[serde(rename = "md")]
    pub mdadm: Vec<MdadmState>,
}

/// Software RAID array state from /proc/mdstat
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MdadmState {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "s")]
    pub state: String,
    #[serde(rename = "l")]
    pub level: String,
    #[serde(rename = "f")]
    pub failed: usize,
    #[serde(rename = "x")]
    pub spare: usize,
    #[serde(rename = "t")]
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadDoc {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "lx")]
    pub load1: f64,
    #[serde(rename = "ly")]
    pub load5: f64,
    #[serde(rename = "lz")]
    pub load15: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskDoc {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "m")]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Mount {
    #[serde(rename = "p")]
    pub path: String,
    #[serde(rename = "f")]
    pub format: String,
    #[serde(rename = "s")]
    pub size: u64,
    #[serde(rename = "u")]
    pub used: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskIoDoc {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "d")]
    pub disks: Vec<DiskIo>,
}

/// Per-disk counter deltas between two samples
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskIo {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "br")]
    pub bytes_read: u64,
    #[serde(rename = "bw")]
    pub bytes_write: u64,
    #[serde(rename = "cr")]
    pub count_read: u64,
    #[serde(rename = "cw")]
    pub count_write: u64,
    #[serde(rename = "tr")]
    pub time_read: u64,
    #[serde(rename = "tw")]
    pub time_write: u64,
    #[serde(rename = "ti")]
    pub time_io: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkDoc {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "i")]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Interface {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "bs")]
    pub bytes_sent: u64,
    #[serde(rename = "br")]
    pub bytes_recv: u64,
    #[serde(rename = "ps")]
    pub packets_sent: u64,
    #[serde(rename = "pr")]
    pub packets_recv: u64,
    #[serde(rename = "es")]
    pub errors_sent: u64,
    #[serde(rename = "er")]
    pub errors_recv: u64,
}

/// Kernel log line, `b` is the boot time the kernel clock counts from
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KmsgDoc {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "b")]
    pub boot: i64,
    #[serde(rename = "p")]
    pub priority: i32,
    #[serde(rename = "s")]
    pub sequence: i64,
    #[serde(rename = "m")]
    pub message: String,
}

/// Result of one check execution, lists are parallel per target
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckDoc {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "c")]
    pub check_id: String,
    #[serde(rename = "x")]
    pub targets: Vec<String>,
    #[serde(rename = "l")]
    pub latency: Vec<u64>,
    #[serde(rename = "r")]
    pub errors: Vec<String>,
}

/// One timestamped telemetry record
#[derive(Debug, Clone, PartialEq)]
pub enum Doc {
    System(SystemDoc),
    Load(LoadDoc),
    Disk(DiskDoc),
    DiskIo(DiskIoDoc),
    Network(NetworkDoc),
    Kmsg(KmsgDoc),
    Check(CheckDoc),
}

impl Doc {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Doc::System(_) => "system",
            Doc::Load(_) => "load",
            Doc::Disk(_) => "disk",
            Doc::DiskIo(_) => "diskio",
            Doc::Network(_) => "network",
            Doc::Kmsg(_) => "kmsg",
            Doc::Check(_) => "check",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Doc::System(d) => d.timestamp,
            Doc::Load(d) => d.timestamp,
            Doc::Disk(d) => d.timestamp,
            Doc::DiskIo(d) => d.timestamp,
            Doc::Network(d) => d.timestamp,
            Doc::Kmsg(d) => d.timestamp,
            Doc::Check(d) => d.timestamp,
        }
    }

    /// Stamp the ingestion time
    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        match self {
            Doc::System(d) => d.timestamp = timestamp,
            Doc::Load(d) => d.timestamp = timestamp,
            Doc::Disk(d) => d.timestamp = timestamp,
            Doc::DiskIo(d) => d.timestamp = timestamp,
            Doc::Network(d) => d.timestamp = timestamp,
            Doc::Kmsg(d) => d.timestamp = timestamp,
            Doc::Check(d) => d.timestamp = timestamp,
        }
    }

    /// Wire form: type prefix, JSON body, trailing newline
    pub fn encode(&self) -> Result<Vec<u8>, AgentError> {
        let mut msg = format!("{}:", self.type_tag()).into_bytes();
        let body = match self {
            Doc::System(d) => serde_json::to_vec(d),
            Doc::Load(d) => serde_json::to_vec(d),
            Doc::Disk(d) => serde_json::to_vec(d),
            Doc::DiskIo(d) => serde_json::to_vec(d),
            Doc::Network(d) => serde_json::to_vec(d),
            Doc::Kmsg(d) => serde_json::to_vec(d),
            Doc::Check(d) => serde_json::to_vec(d),
        }
        .map_err(|e| AgentError::write("stream: Failed to write json", e))?;

        msg.extend_from_slice(&body);
        msg.push(b'\n');
        Ok(msg)
    }
}
