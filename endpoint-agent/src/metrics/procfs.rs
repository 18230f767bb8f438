//! Parsers for `/proc/mdstat` and `/proc/diskstats`

use crate::docs::{DiskIo, MdadmState};
use crate::errors::AgentError;
use std::collections::HashMap;

pub const MDSTAT_PATH: &str = "/proc/mdstat";
pub const DISKSTATS_PATH: &str = "/proc/diskstats";

const SECTOR_SIZE: u64 = 512;

/// Array states from mdstat content; fewer than three lines means no arrays
pub fn parse_mdstat(content: &str) -> Vec<MdadmState> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() < 3 {
        return Vec::new();
    }

    lines
        .iter()
        .filter(|line| {
            !line.trim().is_empty()
                && !line.starts_with(' ')
                && !line.starts_with("Personalities")
                && !line.starts_with("unused")
        })
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(MdadmState {
                name: fields[0].to_string(),
                state: fields[2].to_string(),
                level: fields[3].to_string(),
                failed: line.matches("(F)").count(),
                spare: line.matches("(S)").count(),
                total: line.matches('[').count(),
            })
        })
        .collect()
}

pub fn read_mdstat() -> Vec<MdadmState> {
    match std::fs::read_to_string(MDSTAT_PATH) {
        Ok(content) => parse_mdstat(&content),
        Err(_) => Vec::new(),
    }
}

/// Cumulative counters of one block device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub read_time: u64,
    pub write_time: u64,
    pub io_time: u64,
}

impl DiskCounters {
    /// Difference since `prev`, `None` when any counter went backwards
    pub fn delta(&self, prev: &DiskCounters, name: &str) -> Option<DiskIo> {
        Some(DiskIo {
            name: name.to_string(),
            bytes_read: self.read_bytes.checked_sub(prev.read_bytes)?,
            bytes_write: self.write_bytes.checked_sub(prev.write_bytes)?,
            count_read: self.read_count.checked_sub(prev.read_count)?,
            count_write: self.write_count.checked_sub(prev.write_count)?,
            time_read: self.read_time.checked_sub(prev.read_time)?,
            time_write: self.write_time.checked_sub(prev.write_time)?,
            time_io: self.io_time.checked_sub(prev.io_time)?,
        })
    }
}

/// Whole disks only: partitions, device mapper and loop devices are skipped
pub fn is_whole_disk(name: &str) -> bool {
    let bytes = name.as_bytes();
    let len = bytes.len();
    if len == 0 || name.starts_with("dm") || name.starts_with("loop") {
        return false;
    }

    if name.starts_with("nvme") {
        let at = |back: usize| len.checked_sub(back).map(|i| bytes[i]);
        return at(2) != Some(b'p') && at(3) != Some(b'p');
    }

    if name.starts_with("md") || name.starts_with("zram") {
        return true;
    }

    !bytes[len - 1].is_ascii_digit()
}

fn field(fields: &[&str], index: usize) -> Result<u64, AgentError> {
    fields
        .get(index)
        .ok_or_else(|| AgentError::parse("diskio: Truncated diskstats line"))?
        .parse()
        .map_err(|e| AgentError::parse_with("diskio: Failed to parse diskstats", e))
}

/// Counters of every whole disk in diskstats content
pub fn parse_diskstats(content: &str) -> Result<HashMap<String, DiskCounters>, AgentError> {
    let mut disks = HashMap::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = fields.get(2) else {
            continue;
        };
        if !is_whole_disk(name) {
            continue;
        }

        disks.insert(
            name.to_string(),
            DiskCounters {
                read_count: field(&fields, 3)?,
                read_bytes: field(&fields, 5)? * SECTOR_SIZE,
                read_time: field(&fields, 6)?,
                write_count: field(&fields, 7)?,
                write_bytes: field(&fields, 9)? * SECTOR_SIZE,
                write_time: field(&fields, 10)?,
                io_time: field(&fields, 12)?,
            },
        );
    }

    Ok(disks)
}

pub fn read_diskstats() -> Result<HashMap<String, DiskCounters>, AgentError> {
    let content = std::fs::read_to_string(DISKSTATS_PATH)
        .map_err(|e| AgentError::read("diskio: Failed to get disk io", e))?;
    parse_diskstats(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MDSTAT: &str = "\
Personalities : [raid1] [raid6] [raid5] [raid4]
md127 : active raid1 sdb1[1] sda1[0]
      976630464 blocks super 1.2 [2/2] [UU]
      bitmap: 0/8 pages [0KB], 65536KB chunk

md1 : active raid5 sde1[3](S) sdd1[2](F) sdc1[1] sdf1[0]
      1953260544 blocks super 1.2 level 5, 512k chunk [3/2] [UU_]

unused devices: <none>
";

    #[test]
    fn test_parse_mdstat() {
        let states = parse_mdstat(MDSTAT);
        assert_eq!(states.len(), 2);

        assert_eq!(states[0].name, "md127");
        assert_eq!(states[0].state, "active");
        assert_eq!(states[0].level, "raid1");
        assert_eq!(states[0].total, 2);
        assert_eq!(states[0].failed, 0);

        assert_eq!(states[1].level, "raid5");
        assert_eq!(states[1].failed, 1);
        assert_eq!(states[1].spare, 1);
        assert_eq!(states[1].total, 4);
    }

    #[test]
    fn test_parse_mdstat_without_arrays() {
        assert!(parse_mdstat("Personalities :\nunused devices: <none>\n").is_empty());
    }

    #[test]
    fn test_whole_disk_filter() {
        for name in ["sda", "vdb", "nvme0n1", "md0", "zram0"] {
            assert!(is_whole_disk(name), "{}", name);
        }
        for name in ["sda1", "nvme0n1p1", "nvme0n1p12", "dm-0", "loop3", ""] {
            assert!(!is_whole_disk(name), "{}", name);
        }
    }

    #[test]
    fn test_parse_diskstats() {
        let content = "\
   8       0 sda 100 5 2000 30 50 2 800 40 0 60 70
   8       1 sda1 90 5 1800 25 45 2 700 35 0 50 60
 253       0 dm-0 10 0 100 1 1 0 8 1 0 2 2
";
        let disks = parse_diskstats(content).unwrap();
        assert_eq!(disks.len(), 1);

        let sda = disks["sda"];
        assert_eq!(sda.read_count, 100);
        assert_eq!(sda.read_bytes, 2000 * 512);
        assert_eq!(sda.write_count, 50);
        assert_eq!(sda.write_bytes, 800 * 512);
        assert_eq!(sda.io_time, 60);

        assert!(parse_diskstats("   8 0 sdb 1 2").is_err());
    }

    #[test]
    fn test_counter_delta() {
        let prev = DiskCounters {
            read_bytes: 1024,
            io_time: 10,
            ..Default::default()
        };
        let next = DiskCounters {
            read_bytes: 4096,
            io_time: 15,
            ..Default::default()
        };
        let delta = next.delta(&prev, "sda").unwrap();
        assert_eq!(delta.bytes_read, 3072);
        assert_eq!(delta.time_io, 5);

        assert!(prev.delta(&next, "sda").is_none());
    }
}
