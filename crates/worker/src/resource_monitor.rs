use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::System;

/// Samples process-host CPU and RAM fractions with a short cache window
/// (§4.6 step 2 — "≈150ms") so a tight outer-loop iteration doesn't pay
/// a fresh `/proc` read on every pass.
pub struct ResourceMonitor {
    inner: Mutex<Inner>,
    cache_window: Duration,
}

struct Inner {
    system: System,
    last_sampled: Option<Instant>,
    cpu_fraction: f64,
    ram_fraction: f64,
}

impl ResourceMonitor {
    pub fn new(cache_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                system: System::new_all(),
                last_sampled: None,
                cpu_fraction: 0.0,
                ram_fraction: 0.0,
            }),
            cache_window,
        }
    }

    /// Returns `(cpu_fraction, ram_fraction)`, each in `[0.0, 1.0]`.
    pub fn sample(&self) -> (f64, f64) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = inner.last_sampled {
            if now.duration_since(last) < self.cache_window {
                return (inner.cpu_fraction, inner.ram_fraction);
            }
        }

        inner.system.refresh_cpu_usage();
        inner.system.refresh_memory();

        let cpu = (inner.system.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);
        let total = inner.system.total_memory();
        let ram = if total > 0 {
            (inner.system.used_memory() as f64 / total as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };

        inner.cpu_fraction = cpu;
        inner.ram_fraction = ram;
        inner.last_sampled = Some(now);
        (cpu, ram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_returns_fractions_in_range() {
        let monitor = ResourceMonitor::new(Duration::from_millis(150));
        let (cpu, ram) = monitor.sample();
        assert!((0.0..=1.0).contains(&cpu));
        assert!((0.0..=1.0).contains(&ram));
    }

    #[test]
    fn sample_is_cached_within_window() {
        let monitor = ResourceMonitor::new(Duration::from_secs(60));
        let first = monitor.sample();
        let second = monitor.sample();
        assert_eq!(first, second);
    }
}
