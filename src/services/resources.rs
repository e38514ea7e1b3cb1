//! Resource sampling and admission capacity checks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::models::status::{HealthReport, HealthState, SystemSnapshot};

/// Fraction of a threshold above which the system is reported as `HighLoad`.
const HIGH_LOAD_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    /// Pending / capacity ratio above which admission is refused.
    pub queue_utilization: f64,
}

impl Default for CapacityThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 85.0,
            memory_percent: 80.0,
            disk_percent: 90.0,
            queue_utilization: 0.8,
        }
    }
}

/// Source of resource utilisation samples.
pub trait SystemSampler: Send + Sync {
    fn sample(&self) -> SystemSnapshot;
}

/// Applies [`CapacityThresholds`] to samples from a [`SystemSampler`].
#[derive(Clone)]
pub struct ResourceMonitor {
    sampler: Arc<dyn SystemSampler>,
    thresholds: CapacityThresholds,
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn SystemSampler>, thresholds: CapacityThresholds) -> Self {
        Self { sampler, thresholds }
    }

    pub fn thresholds(&self) -> CapacityThresholds {
        self.thresholds
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        self.sampler.sample()
    }

    /// CPU, memory and disk are all within their thresholds.
    pub fn check_system_capacity(&self) -> bool {
        self.system_within(&self.snapshot())
    }

    /// System capacity plus queue back-pressure.
    pub fn check_capacity(&self, queue_utilization: f64) -> bool {
        let snapshot = self.snapshot();
        let ok = self.system_within(&snapshot) && queue_utilization <= self.thresholds.queue_utilization;
        if !ok {
            tracing::debug!(
                cpu = snapshot.cpu_percent,
                memory = snapshot.memory_percent,
                disk = snapshot.disk_percent,
                queue_utilization,
                "Capacity check failed"
            );
        }
        ok
    }

    pub fn back_pressure_active(&self, queue_utilization: f64) -> bool {
        queue_utilization >= self.thresholds.queue_utilization
    }

    fn system_within(&self, s: &SystemSnapshot) -> bool {
        s.cpu_percent <= self.thresholds.cpu_percent
            && s.memory_percent <= self.thresholds.memory_percent
            && s.disk_percent <= self.thresholds.disk_percent
    }

    pub fn warnings(&self, s: &SystemSnapshot, queue_utilization: f64) -> Vec<String> {
        let t = &self.thresholds;
        let mut warnings = Vec::new();
        if s.cpu_percent > t.cpu_percent {
            warnings.push(format!("High CPU usage: {:.1}%", s.cpu_percent));
        }
        if s.memory_percent > t.memory_percent {
            warnings.push(format!("High memory usage: {:.1}%", s.memory_percent));
        }
        if s.disk_percent > t.disk_percent {
            warnings.push(format!("Low disk space: {:.1}% free", 100.0 - s.disk_percent));
        }
        if queue_utilization > t.queue_utilization {
            warnings.push(format!("High queue utilization: {:.2}", queue_utilization));
        }
        warnings
    }

    pub fn health(&self, s: &SystemSnapshot, queue_utilization: f64, shutting_down: bool) -> HealthReport {
        let t = &self.thresholds;
        let status = if shutting_down {
            HealthState::ShuttingDown
        } else if s.cpu_percent > t.cpu_percent || s.memory_percent > t.memory_percent {
            HealthState::Overloaded
        } else if s.cpu_percent > t.cpu_percent * HIGH_LOAD_FRACTION
            || s.memory_percent > t.memory_percent * HIGH_LOAD_FRACTION
        {
            HealthState::HighLoad
        } else {
            HealthState::Healthy
        };

        HealthReport {
            status,
            back_pressure_active: self.back_pressure_active(queue_utilization),
            warnings: self.warnings(s, queue_utilization),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Samples `/proc/stat`, `/proc/meminfo` and `statvfs` on Linux.
///
/// CPU usage is the busy share since the previous sample (since boot on the first call).
/// Other platforms report zero utilisation.
pub struct ProcfsSampler {
    disk_path: PathBuf,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl ProcfsSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            last_cpu: Mutex::new(None),
        }
    }

    fn cpu_percent(&self) -> f64 {
        let Some(now) = read_cpu_times() else {
            return 0.0;
        };
        let mut last = match self.last_cpu.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (busy, total) = match *last {
            Some(prev) if now.total > prev.total => (now.busy.saturating_sub(prev.busy), now.total - prev.total),
            _ => (now.busy, now.total),
        };
        *last = Some(now);
        if total == 0 {
            0.0
        } else {
            busy as f64 / total as f64 * 100.0
        }
    }
}

impl SystemSampler for ProcfsSampler {
    fn sample(&self) -> SystemSnapshot {
        let (memory_percent, available_memory_gb) = read_memory().unwrap_or((0.0, 0.0));
        SystemSnapshot {
            cpu_percent: self.cpu_percent(),
            memory_percent,
            disk_percent: disk_usage_percent(&self.disk_path).unwrap_or(0.0),
            available_memory_gb,
        }
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(content.lines().next()?)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "cpu" {
        return None;
    }
    // user nice system idle iowait irq softirq steal
    let values: Vec<u64> = parts.take(8).filter_map(|v| v.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

#[cfg(target_os = "linux")]
fn read_memory() -> Option<(f64, f64)> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&content)
}

#[cfg(not(target_os = "linux"))]
fn read_memory() -> Option<(f64, f64)> {
    None
}

/// Returns `(used percent, available GiB)` from `/proc/meminfo` content.
fn parse_meminfo(content: &str) -> Option<(f64, f64)> {
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find(|line| line.starts_with(name))
            // Format: "MemTotal:       16384000 kB"
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse().ok())
    };
    let total_kb = field("MemTotal:")?;
    let available_kb = field("MemAvailable:")?;
    if total_kb == 0 {
        return None;
    }
    let used = total_kb.saturating_sub(available_kb) as f64 / total_kb as f64 * 100.0;
    Some((used, available_kb as f64 / (1024.0 * 1024.0)))
}

#[cfg(unix)]
fn disk_usage_percent(path: &Path) -> Option<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs only writes into the zeroed struct we own; the path is NUL-terminated.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let frsize = stat.f_frsize as f64;
    let used = (stat.f_blocks as f64 - stat.f_bfree as f64) * frsize;
    let available = stat.f_bavail as f64 * frsize;
    if used + available <= 0.0 {
        return None;
    }
    Some(used / (used + available) * 100.0)
}

#[cfg(not(unix))]
fn disk_usage_percent(_path: &Path) -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock::StaticSampler;

    fn monitor(cpu: f64, memory: f64, disk: f64) -> ResourceMonitor {
        let sampler = StaticSampler::new(SystemSnapshot {
            cpu_percent: cpu,
            memory_percent: memory,
            disk_percent: disk,
            available_memory_gb: 4.0,
        });
        ResourceMonitor::new(Arc::new(sampler), CapacityThresholds::default())
    }

    #[test]
    fn test_capacity_within_thresholds() {
        let m = monitor(50.0, 50.0, 50.0);
        assert!(m.check_system_capacity());
        assert!(m.check_capacity(0.5));
        assert!(m.check_capacity(0.8));
        assert!(!m.check_capacity(0.81));
    }

    #[test]
    fn test_each_resource_can_refuse() {
        assert!(!monitor(86.0, 10.0, 10.0).check_system_capacity());
        assert!(!monitor(10.0, 81.0, 10.0).check_system_capacity());
        assert!(!monitor(10.0, 10.0, 91.0).check_system_capacity());
        assert!(monitor(85.0, 80.0, 90.0).check_system_capacity());
    }

    #[test]
    fn test_health_classification() {
        let idle = monitor(10.0, 10.0, 10.0);
        assert_eq!(idle.health(&idle.snapshot(), 0.0, false).status, HealthState::Healthy);

        let busy = monitor(70.0, 10.0, 10.0);
        assert_eq!(busy.health(&busy.snapshot(), 0.0, false).status, HealthState::HighLoad);

        let hot = monitor(95.0, 10.0, 95.0);
        let report = hot.health(&hot.snapshot(), 0.9, false);
        assert_eq!(report.status, HealthState::Overloaded);
        assert!(report.back_pressure_active);
        assert_eq!(report.warnings.len(), 3);

        assert_eq!(hot.health(&hot.snapshot(), 0.0, true).status, HealthState::ShuttingDown);
    }

    #[test]
    fn test_parse_cpu_line() {
        let times = parse_cpu_line("cpu  100 0 50 800 50 0 0 0 0 0").unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.busy, 150);
        assert!(parse_cpu_line("cpu0 1 2 3 4").is_none());
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        let (used, _) = parse_meminfo(content).unwrap();
        assert!((used - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_procfs_sampler_reports_percentages() {
        let sample = ProcfsSampler::new("/").sample();
        for value in [sample.cpu_percent, sample.memory_percent, sample.disk_percent] {
            assert!((0.0..=100.0).contains(&value));
        }
    }
}
