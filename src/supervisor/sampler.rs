//! Fixed-interval resource sampling for a running job's child process.
//!
//! Records peak resident memory and accumulates CPU% samples so the
//! normalizer can report resource peaks per execution. Sampling runs on
//! its own task and never blocks the termination path; the supervisor
//! aborts it before the job's tracking entry is removed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::debug;

/// Accumulated resource usage for one execution.
#[derive(Debug, Default, Clone)]
pub struct ResourceUsage {
    /// Highest resident set size observed, in bytes.
    pub peak_memory_bytes: u64,
    cpu_total_percent: f64,
    cpu_samples: u64,
}

impl ResourceUsage {
    pub fn record(&mut self, memory_bytes: u64, cpu_percent: f64) {
        self.peak_memory_bytes = self.peak_memory_bytes.max(memory_bytes);
        self.cpu_total_percent += cpu_percent;
        self.cpu_samples += 1;
    }

    /// Average CPU% across all samples taken, 0 when nothing was sampled.
    pub fn avg_cpu_percent(&self) -> f64 {
        if self.cpu_samples == 0 {
            0.0
        } else {
            self.cpu_total_percent / self.cpu_samples as f64
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.cpu_samples
    }
}

/// Shared cell the sampler writes into and the normalizer reads from.
pub type UsageCell = Arc<Mutex<ResourceUsage>>;

pub fn new_usage_cell() -> UsageCell {
    Arc::new(Mutex::new(ResourceUsage::default()))
}

/// Spawn the sampling task for `pid`. The task exits on its own when the
/// process disappears; the supervisor aborts it on every termination path.
pub fn spawn(pid: u32, interval: Duration, usage: UsageCell) -> JoinHandle<()> {
    tokio::spawn(async move {
        let target = Pid::from_u32(pid);
        let mut sys = System::new();
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately and only primes the CPU counters.
        ticker.tick().await;
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

        loop {
            ticker.tick().await;
            sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
            let Some(proc_) = sys.process(target) else {
                debug!(pid, "sampled process gone, stopping sampler");
                break;
            };
            let memory = proc_.memory();
            let cpu = f64::from(proc_.cpu_usage());
            if let Ok(mut u) = usage.lock() {
                u.record(memory, cpu);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_records_peak() {
        let mut u = ResourceUsage::default();
        u.record(100, 10.0);
        u.record(300, 20.0);
        u.record(200, 30.0);
        assert_eq!(u.peak_memory_bytes, 300);
        assert!((u.avg_cpu_percent() - 20.0).abs() < f64::EPSILON);
        assert_eq!(u.sample_count(), 3);
    }

    #[test]
    fn test_empty_usage_has_zero_cpu() {
        let u = ResourceUsage::default();
        assert_eq!(u.avg_cpu_percent(), 0.0);
        assert_eq!(u.peak_memory_bytes, 0);
    }

    #[tokio::test]
    async fn test_sampler_observes_own_process() {
        let usage = new_usage_cell();
        let handle = spawn(
            std::process::id(),
            Duration::from_millis(50),
            usage.clone(),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        let u = usage.lock().unwrap();
        assert!(u.sample_count() > 0, "expected at least one sample");
        assert!(u.peak_memory_bytes > 0, "own process should have RSS");
    }
}
