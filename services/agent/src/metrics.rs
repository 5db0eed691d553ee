//! Host metrics sampling for heartbeats and consumption queries.
//!
//! Totals (memory, disk) are computed once at construction; used values are
//! sampled fresh on every call. All sampling is non-blocking: CPU usage is
//! the delta since the previous refresh, so the very first reading may be 0.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::sync::Mutex;
use std::time::Instant;

use sysinfo::{Disks, System};
use tracing::debug;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Filesystems that never count toward disk totals.
const PSEUDO_FILESYSTEMS: &[&str] = &[
    "tmpfs", "devtmpfs", "overlay", "squashfs", "autofs", "proc", "sysfs", "cgroup", "cgroup2",
    "devpts",
];

/// One heartbeat's worth of host metrics.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub cpu_usage_percent: f64,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
    pub uptime_seconds: u64,
}

pub struct MetricsSampler {
    system: Mutex<System>,
    disks: Mutex<Disks>,
    memory_total_bytes: u64,
    disk_total_bytes: u64,
    started_at: Instant,
}

impl MetricsSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        let memory_total_bytes = system.total_memory();

        let disks = Disks::new_with_refreshed_list();
        let disk_total_bytes = sum_physical(&disks, |total, _available| total);

        debug!(
            memory_total_bytes,
            disk_total_bytes, "Computed cached metric totals"
        );

        Self {
            system: Mutex::new(system),
            disks: Mutex::new(disks),
            memory_total_bytes,
            disk_total_bytes,
            started_at: Instant::now(),
        }
    }

    /// System CPU utilization 0-100, measured since the previous call.
    pub fn cpu_usage_percent(&self) -> f64 {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(_) => return 0.0,
        };
        system.refresh_cpu();
        f64::from(system.global_cpu_info().cpu_usage())
    }

    pub fn memory_used_bytes(&self) -> u64 {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(_) => return 0,
        };
        system.refresh_memory();
        system.used_memory()
    }

    pub fn memory_total_bytes(&self) -> u64 {
        self.memory_total_bytes
    }

    /// Used bytes across physical partitions, deduplicated by device.
    pub fn disk_used_bytes(&self) -> u64 {
        let mut disks = match self.disks.lock() {
            Ok(guard) => guard,
            Err(_) => return 0,
        };
        disks.refresh_list();
        sum_physical(&disks, |total, available| total.saturating_sub(available))
    }

    pub fn disk_total_bytes(&self) -> u64 {
        self.disk_total_bytes
    }

    /// Agent process uptime, not host uptime.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// All metrics in heartbeat units (GB values rounded to one decimal).
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cpu_usage_percent: round1(self.cpu_usage_percent()),
            memory_used_gb: to_gb(self.memory_used_bytes()),
            memory_total_gb: to_gb(self.memory_total_bytes()),
            disk_used_gb: to_gb(self.disk_used_bytes()),
            disk_total_gb: to_gb(self.disk_total_bytes()),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum a per-disk figure over physical partitions only, counting each backing
/// device once.
fn sum_physical(disks: &Disks, figure: fn(u64, u64) -> u64) -> u64 {
    let mut seen = HashSet::new();
    let mut sum = 0u64;

    for disk in disks.list() {
        if is_pseudo_filesystem(disk.file_system()) {
            continue;
        }
        let device = disk.name().to_os_string();
        if !seen.insert(device) {
            continue;
        }
        sum += figure(disk.total_space(), disk.available_space());
    }

    sum
}

fn is_pseudo_filesystem(fs: &OsStr) -> bool {
    let fs = fs.to_string_lossy().to_ascii_lowercase();
    PSEUDO_FILESYSTEMS.iter().any(|pseudo| fs == *pseudo)
}

fn to_gb(bytes: u64) -> f64 {
    round1(bytes as f64 / BYTES_PER_GB)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_are_cached() {
        let sampler = MetricsSampler::new();
        let first = sampler.memory_total_bytes();
        let second = sampler.memory_total_bytes();
        assert_eq!(first, second);
        assert!(first > 0);
    }

    #[test]
    fn test_snapshot_units() {
        let sampler = MetricsSampler::new();
        let snapshot = sampler.snapshot();

        assert!(snapshot.cpu_usage_percent >= 0.0);
        assert!(snapshot.memory_total_gb > 0.0);
        assert!(snapshot.memory_used_gb <= snapshot.memory_total_gb + 0.1);
        // One-decimal rounding
        let scaled = snapshot.memory_total_gb * 10.0;
        assert!((scaled - scaled.round()).abs() < 1e-9);
    }

    #[test]
    fn test_pseudo_filesystem_filter() {
        assert!(is_pseudo_filesystem(OsStr::new("tmpfs")));
        assert!(is_pseudo_filesystem(OsStr::new("OVERLAY")));
        assert!(!is_pseudo_filesystem(OsStr::new("ext4")));
        assert!(!is_pseudo_filesystem(OsStr::new("xfs")));
    }

    #[test]
    fn test_uptime_is_monotonic() {
        let sampler = MetricsSampler::new();
        let a = sampler.uptime_seconds();
        let b = sampler.uptime_seconds();
        assert!(b >= a);
    }

    #[test]
    fn test_round1() {
        assert_eq!(round1(1.26), 1.3);
        assert_eq!(round1(1.24), 1.2);
        assert_eq!(round1(0.0), 0.0);
    }
}
