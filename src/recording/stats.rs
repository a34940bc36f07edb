// Recording statistics and coarse performance metrics

use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

use super::frame::Timestamp;
use super::state::RecordingStatus;

/// Number of CPU samples in the rolling average
const CPU_HISTORY_LEN: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Global CPU usage at the last sample, 0-100
    pub cpu_usage_percent: f32,
    /// Mean over the last `CPU_HISTORY_LEN` samples
    pub cpu_usage_avg_percent: f32,
    /// Resident memory of this process
    pub process_memory_bytes: u64,
    pub samples: usize,
}

/// Snapshot returned by `Recorder::get_statistics`
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordingStatistics {
    pub status: RecordingStatus,
    pub session_id: Option<String>,
    pub duration: Duration,
    pub total_frames: u64,
    pub total_bytes: u64,
    /// Bytes currently held by the circular buffer
    pub memory_usage_bytes: u64,
    pub buffered_frames: usize,
    pub oldest_buffered: Option<Timestamp>,
    pub newest_buffered: Option<Timestamp>,
    pub current_segment: u32,
    pub segments_completed: u32,
    /// Frames the writer has put into segment files
    pub frames_persisted: u64,
    pub frames_evicted: u64,
    pub frames_offloaded: u64,
    pub persistence_dropped: u64,
    pub write_failures: u64,
    pub frames_rejected: u64,
    pub pressure_events: u64,
    pub queued_frames: usize,
    pub performance_metrics: PerformanceMetrics,
}

impl RecordingStatistics {
    pub fn idle(performance_metrics: PerformanceMetrics) -> Self {
        Self {
            status: RecordingStatus::Idle,
            performance_metrics,
            ..Default::default()
        }
    }
}

struct SystemProbe {
    sys: System,
    pid: Option<Pid>,
}

/// Samples process-level metrics. Frame counters live with the session; this only
/// owns what cannot be derived from them.
pub struct StatisticsCollector {
    probe: Mutex<SystemProbe>,
    cpu_history: Mutex<HeapRb<f32>>,
    latest: Mutex<PerformanceMetrics>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("[Stats] Could not determine own pid: {}", e);
                None
            }
        };
        Self {
            probe: Mutex::new(SystemProbe {
                sys: System::new(),
                pid,
            }),
            cpu_history: Mutex::new(HeapRb::new(CPU_HISTORY_LEN)),
            latest: Mutex::new(PerformanceMetrics::default()),
        }
    }

    /// Refresh CPU and memory readings. Called from the supervisor heartbeat.
    pub fn sample_system(&self) {
        let (cpu, memory) = {
            let mut probe = self.probe.lock();
            probe.sys.refresh_cpu_usage();
            let memory = match probe.pid {
                Some(pid) => {
                    probe.sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                    probe.sys.process(pid).map(|p| p.memory()).unwrap_or(0)
                }
                None => 0,
            };
            (probe.sys.global_cpu_usage(), memory)
        };
        self.record_sample(cpu, memory);
    }

    fn record_sample(&self, cpu_percent: f32, process_memory_bytes: u64) {
        let (avg, samples) = {
            let mut history = self.cpu_history.lock();
            history.push_overwrite(cpu_percent);
            let samples = history.occupied_len();
            let sum: f32 = history.iter().sum();
            (sum / samples.max(1) as f32, samples)
        };

        *self.latest.lock() = PerformanceMetrics {
            cpu_usage_percent: cpu_percent,
            cpu_usage_avg_percent: avg,
            process_memory_bytes,
            samples,
        };
    }

    pub fn performance(&self) -> PerformanceMetrics {
        *self.latest.lock()
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_cpu_average_keeps_recent_samples() {
        let stats = StatisticsCollector::new();
        for _ in 0..CPU_HISTORY_LEN {
            stats.record_sample(10.0, 1000);
        }
        assert_eq!(stats.performance().cpu_usage_avg_percent, 10.0);

        // A full window of newer samples pushes the old ones out
        for _ in 0..CPU_HISTORY_LEN {
            stats.record_sample(50.0, 2000);
        }
        let perf = stats.performance();
        assert_eq!(perf.cpu_usage_avg_percent, 50.0);
        assert_eq!(perf.cpu_usage_percent, 50.0);
        assert_eq!(perf.samples, CPU_HISTORY_LEN);
        assert_eq!(perf.process_memory_bytes, 2000);
    }

    #[test]
    fn test_sample_system_does_not_panic() {
        let stats = StatisticsCollector::new();
        stats.sample_system();
        assert_eq!(stats.performance().samples, 1);
    }

    #[test]
    fn test_idle_statistics() {
        let s = RecordingStatistics::idle(PerformanceMetrics::default());
        assert_eq!(s.status, RecordingStatus::Idle);
        assert_eq!(s.total_frames, 0);
        assert!(s.session_id.is_none());
    }
}
