//! Host metric producers
//!
//! Provides polled inputs built on `sysinfo` and `/proc`:
//! - System summary (CPU, memory, swap, package updates, mdadm arrays)
//! - Load averages
//! - Mounted filesystem usage
//! - Network interface counters
//! - Disk IO deltas between polls
//!
//! plus the kernel log tail in [`kmsg`].

pub mod dnf;
pub mod kmsg;
pub mod procfs;

pub use kmsg::KmsgInput;

use crate::docs::{
    DiskDoc, DiskIo, DiskIoDoc, Doc, Interface, LoadDoc, Mount, NetworkDoc, SystemDoc,
};
use crate::errors::AgentError;
use crate::input::{Input, StartupFuture};
use crate::stream::Stream;
use procfs::DiskCounters;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, Networks, System};
use tracing::{debug, error};

const RATE: Duration = Duration::from_secs(60);
const MIB: u64 = 1024 * 1024;
const PACKAGE_REFRESH: Duration = Duration::from_secs(3600);

/// Filesystem types skipped unless the config names its own list
pub const DEFAULT_DISK_IGNORES: [&str; 5] = ["devtmpfs", "devfs", "overlay", "aufs", "squashfs"];

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Host summary; package updates are refreshed hourly off the tick loop
pub struct SystemInput {
    sys: System,
    package_updates: Arc<AtomicU32>,
}

impl SystemInput {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            sys,
            package_updates: Arc::new(AtomicU32::new(0)),
        }
    }

    /// `None` until CPU usage has a baseline
    pub fn sample(&mut self) -> Option<SystemDoc> {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let cpu_usage = self.sys.global_cpu_info().cpu_usage() as f64;
        if cpu_usage == 0.0 {
            return None;
        }

        Some(SystemDoc {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: System::host_name().unwrap_or_default(),
            uptime: System::uptime(),
            platform: format!(
                "{}-{}-{}",
                std::env::consts::OS,
                System::distribution_id(),
                System::os_version().unwrap_or_default()
            ),
            package_updates: self.package_updates.load(Ordering::Relaxed),
            cpu_cores: self.sys.cpus().len(),
            cpu_usage,
            mem_total: self.sys.total_memory() / MIB,
            mem_usage: percent(self.sys.used_memory(), self.sys.total_memory()),
            swap_total: self.sys.total_swap() / MIB,
            swap_usage: percent(self.sys.used_swap(), self.sys.total_swap()),
            mdadm: procfs::read_mdstat(),
            ..Default::default()
        })
    }
}

impl Default for SystemInput {
    fn default() -> Self {
        Self::new()
    }
}

impl Input for SystemInput {
    fn name(&self) -> &'static str {
        "system"
    }

    fn rate(&self) -> Option<Duration> {
        Some(RATE)
    }

    fn poll(&mut self, stream: &Stream) -> Result<(), AgentError> {
        match self.sample() {
            Some(doc) => {
                stream.append(Doc::System(doc));
            }
            None => debug!("system: Skipping sample without cpu baseline"),
        }
        Ok(())
    }

    fn startup(&mut self, _stream: Stream) -> Option<StartupFuture> {
        let path = dnf::package_manager()?;
        let updates = self.package_updates.clone();

        Some(Box::pin(async move {
            loop {
                match dnf::check_update(&path).await {
                    Ok(count) => updates.store(count, Ordering::Relaxed),
                    Err(e) => error!(error = %e, kind = e.kind(), "system: Failed to check updates"),
                }
                tokio::time::sleep(PACKAGE_REFRESH).await;
            }
        }))
    }
}

#[derive(Debug, Default)]
pub struct LoadInput;

impl Input for LoadInput {
    fn name(&self) -> &'static str {
        "load"
    }

    fn rate(&self) -> Option<Duration> {
        Some(RATE)
    }

    fn poll(&mut self, stream: &Stream) -> Result<(), AgentError> {
        let load = System::load_average();
        stream.append(Doc::Load(LoadDoc {
            load1: load.one,
            load5: load.five,
            load15: load.fifteen,
            ..Default::default()
        }));
        Ok(())
    }
}

pub struct DiskInput {
    ignores: HashSet<String>,
    disks: Disks,
}

impl DiskInput {
    pub fn new(ignores: Option<Vec<String>>) -> Self {
        let ignores = match ignores {
            Some(list) => list.into_iter().collect(),
            None => DEFAULT_DISK_IGNORES.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            ignores,
            disks: Disks::new(),
        }
    }

    pub fn is_ignored(&self, file_system: &str) -> bool {
        self.ignores.contains(file_system)
    }
}

impl Input for DiskInput {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn rate(&self) -> Option<Duration> {
        Some(RATE)
    }

    fn poll(&mut self, stream: &Stream) -> Result<(), AgentError> {
        self.disks.refresh_list();

        let mut mounts = Vec::new();
        for disk in self.disks.list() {
            let format = disk.file_system().to_string_lossy().to_string();
            if self.is_ignored(&format) {
                continue;
            }
            let total = disk.total_space();
            mounts.push(Mount {
                path: disk.mount_point().display().to_string(),
                format,
                size: total,
                used: percent(total.saturating_sub(disk.available_space()), total),
            });
        }

        stream.append(Doc::Disk(DiskDoc {
            mounts,
            ..Default::default()
        }));
        Ok(())
    }
}

pub struct NetworkInput {
    networks: Networks,
}

impl NetworkInput {
    pub fn new() -> Self {
        Self {
            networks: Networks::new(),
        }
    }
}

impl Default for NetworkInput {
    fn default() -> Self {
        Self::new()
    }
}

impl Input for NetworkInput {
    fn name(&self) -> &'static str {
        "network"
    }

    fn rate(&self) -> Option<Duration> {
        Some(RATE)
    }

    fn poll(&mut self, stream: &Stream) -> Result<(), AgentError> {
        self.networks.refresh_list();

        let mut interfaces: Vec<Interface> = self
            .networks
            .iter()
            .map(|(name, data)| Interface {
                name: name.clone(),
                bytes_sent: data.total_transmitted(),
                bytes_recv: data.total_received(),
                packets_sent: data.total_packets_transmitted(),
                packets_recv: data.total_packets_received(),
                errors_sent: data.total_errors_on_transmitted(),
                errors_recv: data.total_errors_on_received(),
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        stream.append(Doc::Network(NetworkDoc {
            interfaces,
            ..Default::default()
        }));
        Ok(())
    }
}

/// Deltas for disks present in both samples, `None` if any counter reset
pub fn diskio_deltas(
    prev: &HashMap<String, DiskCounters>,
    current: &HashMap<String, DiskCounters>,
) -> Option<Vec<DiskIo>> {
    let mut disks = Vec::new();
    for (name, counters) in current {
        if let Some(before) = prev.get(name) {
            disks.push(counters.delta(before, name)?);
        }
    }
    disks.sort_by(|a, b| a.name.cmp(&b.name));
    Some(disks)
}

#[derive(Debug, Default)]
pub struct DiskIoInput {
    prev: HashMap<String, DiskCounters>,
}

impl Input for DiskIoInput {
    fn name(&self) -> &'static str {
        "diskio"
    }

    fn rate(&self) -> Option<Duration> {
        Some(RATE)
    }

    fn poll(&mut self, stream: &Stream) -> Result<(), AgentError> {
        let current = procfs::read_diskstats()?;
        let deltas = diskio_deltas(&self.prev, &current);
        self.prev = current;

        match deltas {
            Some(disks) if !disks.is_empty() => {
                stream.append(Doc::DiskIo(DiskIoDoc {
                    disks,
                    ..Default::default()
                }));
            }
            Some(_) => {}
            None => debug!("diskio: Counter reset, skipping sample"),
        }
        Ok(())
    }
}
