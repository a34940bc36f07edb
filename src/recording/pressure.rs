// Memory pressure monitoring for the circular buffer
//
// Reacts faster than segment rotation: once buffered bytes reach the configured
// threshold, the oldest share of the buffer is offloaded and a notification raised.
// The monitor re-arms only after occupancy has dropped back below the threshold.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Derived view of the memory budget. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryBudget {
    pub threshold_bytes: u64,
    pub offload_fraction: f64,
    pub usage_bytes: u64,
    pub last_offload_at: Option<DateTime<Utc>>,
    /// Offloads so far this session
    pub offload_count: u64,
    /// False between an offload and occupancy dropping back below the threshold
    pub armed: bool,
}

impl MemoryBudget {
    pub fn headroom_bytes(&self) -> u64 {
        self.threshold_bytes.saturating_sub(self.usage_bytes)
    }
}

/// What the caller should do after an observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PressureAction {
    /// Occupancy is fine, or the monitor already fired and is waiting to re-arm
    None,
    /// Occupancy crossed the threshold: drop this fraction of buffered bytes
    Offload {
        fraction: f64,
        usage_bytes: u64,
        threshold_bytes: u64,
    },
}

pub struct MemoryPressureMonitor {
    threshold_bytes: u64,
    offload_fraction: f64,
    armed: bool,
    last_offload_at: Option<DateTime<Utc>>,
    fire_count: u64,
}

impl MemoryPressureMonitor {
    pub fn new(threshold_bytes: u64, offload_fraction: f64) -> Self {
        Self {
            threshold_bytes,
            offload_fraction: offload_fraction.clamp(0.0, 1.0),
            armed: true,
            last_offload_at: None,
            fire_count: 0,
        }
    }

    /// Feed the current buffer occupancy.
    pub fn observe(&mut self, usage_bytes: u64) -> PressureAction {
        if usage_bytes < self.threshold_bytes {
            if !self.armed {
                log::debug!(
                    "[Pressure] Occupancy {} below threshold {}, re-armed",
                    usage_bytes,
                    self.threshold_bytes
                );
            }
            self.armed = true;
            return PressureAction::None;
        }

        if !self.armed {
            return PressureAction::None;
        }

        self.armed = false;
        self.fire_count += 1;
        self.last_offload_at = Some(Utc::now());
        log::warn!(
            "[Pressure] Buffer at {} bytes (threshold {}), offloading {:.0}%",
            usage_bytes,
            self.threshold_bytes,
            self.offload_fraction * 100.0
        );

        PressureAction::Offload {
            fraction: self.offload_fraction,
            usage_bytes,
            threshold_bytes: self.threshold_bytes,
        }
    }

    pub fn budget(&self, usage_bytes: u64) -> MemoryBudget {
        MemoryBudget {
            threshold_bytes: self.threshold_bytes,
            offload_fraction: self.offload_fraction,
            usage_bytes,
            last_offload_at: self.last_offload_at,
            offload_count: self.fire_count,
            armed: self.armed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_at_threshold() {
        let mut monitor = MemoryPressureMonitor::new(1000, 0.5);
        assert_eq!(monitor.observe(999), PressureAction::None);
        assert_eq!(
            monitor.observe(1000),
            PressureAction::Offload {
                fraction: 0.5,
                usage_bytes: 1000,
                threshold_bytes: 1000
            }
        );
        let budget = monitor.budget(1000);
        assert_eq!(budget.offload_count, 1);
        assert!(budget.last_offload_at.is_some());
    }

    #[test]
    fn test_hysteresis_suppresses_repeat_until_below_threshold() {
        let mut monitor = MemoryPressureMonitor::new(1000, 0.25);
        assert!(matches!(monitor.observe(1200), PressureAction::Offload { .. }));

        // Hovering at or above the threshold does not fire again
        assert_eq!(monitor.observe(1100), PressureAction::None);
        assert_eq!(monitor.observe(1000), PressureAction::None);
        assert!(!monitor.budget(1000).armed);

        // Dropping below re-arms, rising back fires once more
        assert_eq!(monitor.observe(900), PressureAction::None);
        assert!(monitor.budget(900).armed);
        assert!(matches!(monitor.observe(1000), PressureAction::Offload { .. }));
        assert_eq!(monitor.budget(1000).offload_count, 2);
    }

    #[test]
    fn test_budget_headroom() {
        let monitor = MemoryPressureMonitor::new(1000, 0.25);
        assert_eq!(monitor.budget(400).headroom_bytes(), 600);
        assert_eq!(monitor.budget(1400).headroom_bytes(), 0);
    }
}
