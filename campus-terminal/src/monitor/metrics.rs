//! Host resource sampling
//!
//! Provides:
//! - CPU usage (global, refreshed between samples)
//! - Memory usage and totals
//! - Disk usage of the filesystem holding the captures
//! - System uptime

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};
use tracing::debug;

/// One resource sample, merged into the status snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_usage: f32,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub uptime_seconds: u64,
}

/// Memory usage metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryMetrics {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub percent_used: f32,
}

/// Disk usage of one filesystem
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskMetrics {
    pub mount_point: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub percent_used: f32,
}

/// Source of resource samples (the pull loop samples every cycle)
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Result<ResourceSample>;
}

/// sysinfo-backed probe. Keeps one `System` so CPU usage is measured between
/// consecutive samples.
pub struct SysinfoProbe {
    system: Mutex<System>,
    disk_path: PathBuf,
}

impl SysinfoProbe {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            disk_path: disk_path.into(),
        }
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> Result<ResourceSample> {
        let (cpu_usage, memory) = {
            let mut sys = self.system.lock();
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            (sys.global_cpu_info().cpu_usage(), MemoryMetrics::collect(&sys)?)
        };
        let disk = DiskMetrics::collect(&self.disk_path)?;

        let sample = ResourceSample {
            cpu_usage,
            memory,
            disk,
            uptime_seconds: System::uptime(),
        };
        debug!(cpu = sample.cpu_usage, memory = sample.memory.percent_used, "Resources sampled");
        Ok(sample)
    }
}

impl MemoryMetrics {
    fn collect(sys: &System) -> Result<Self> {
        let total_bytes = sys.total_memory();
        if total_bytes == 0 {
            return Err(anyhow!("memory information unavailable"));
        }
        let available_bytes = sys.available_memory();
        let used_bytes = total_bytes.saturating_sub(available_bytes);

        Ok(MemoryMetrics {
            total_bytes,
            available_bytes,
            percent_used: percent(used_bytes, total_bytes),
        })
    }
}

impl DiskMetrics {
    /// Filesystem whose mount point is the longest prefix of `path`
    fn collect(path: &Path) -> Result<Self> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        let disk = disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .or_else(|| disks.list().iter().max_by_key(|d| d.total_space()))
            .ok_or_else(|| anyhow!("no disks reported"))?;

        let total_bytes = disk.total_space();
        let free_bytes = disk.available_space();
        Ok(DiskMetrics {
            mount_point: disk.mount_point().display().to_string(),
            total_bytes,
            free_bytes,
            percent_used: percent(total_bytes.saturating_sub(free_bytes), total_bytes),
        })
    }
}

fn percent(part: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64 * 100.0) as f32
    }
}
