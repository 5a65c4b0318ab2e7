use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::{Components, System};
use tracing::trace;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// Percent, 0-100
    pub usage: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Memory figures in MiB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
}

/// Samples host CPU and memory for `system.get_metrics`.
///
/// CPU usage is measured between consecutive calls, so the first sample after
/// construction may read low.
pub struct SystemMonitor {
    sys: Mutex<System>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self {
            sys: Mutex::new(sys),
        }
    }

    pub fn metrics(&self) -> SystemMetrics {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let total = sys.total_memory();
        let used = sys.used_memory().min(total);
        let metrics = SystemMetrics {
            cpu: CpuMetrics {
                usage: sys.global_cpu_usage(),
                temperature: cpu_temperature(),
            },
            memory: MemoryMetrics {
                total: total / MIB,
                used: used / MIB,
                free: (total - used) / MIB,
            },
        };
        trace!("System metrics: {:?}", metrics);
        metrics
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Hottest CPU-labelled sensor, if the platform exposes one
fn cpu_temperature() -> Option<f32> {
    let components = Components::new_with_refreshed_list();
    components
        .iter()
        .filter(|c| {
            let label = c.label().to_ascii_lowercase();
            label.contains("cpu") || label.contains("package") || label.contains("tctl")
        })
        .map(|c| c.temperature())
        .filter(|t| t.is_finite() && *t > 0.0)
        .reduce(f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_consistent() {
        let monitor = SystemMonitor::new();
        let metrics = monitor.metrics();
        assert!(metrics.memory.total > 0);
        assert!(metrics.memory.used <= metrics.memory.total);
        assert!(metrics.memory.free <= metrics.memory.total);
        assert!((0.0..=100.0).contains(&metrics.cpu.usage) || metrics.cpu.usage.is_nan());
    }

    #[test]
    fn test_metrics_json_shape() {
        let metrics = SystemMetrics {
            cpu: CpuMetrics {
                usage: 12.5,
                temperature: None,
            },
            memory: MemoryMetrics {
                total: 16384,
                used: 8192,
                free: 8192,
            },
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["cpu"]["usage"], 12.5);
        assert!(json["cpu"].get("temperature").is_none());
        assert_eq!(json["memory"]["free"], 8192);
    }
}
