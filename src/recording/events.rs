// Lifecycle, segment and memory-pressure notifications
//
// Observers either register a callback or take a channel receiver. Emission is
// serialized, so every observer sees events in the order the state changes happened.
// Callbacks run without the registry locked and may call back into the recorder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;

use super::state::StopReason;
use crate::session::PatientContext;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecorderEvent {
    RecordingStateChanged {
        is_recording: bool,
        patient_context: PatientContext,
        /// Present on stop notifications
        reason: Option<StopReason>,
    },
    SegmentCompleted {
        segment_number: u32,
        path: PathBuf,
        duration: Duration,
    },
    MemoryPressureDetected {
        usage_bytes: u64,
        threshold_bytes: u64,
    },
    SegmentWriteFailed {
        segment_number: u32,
        error: String,
        consecutive_failures: u32,
    },
    PersistenceFault {
        error: String,
    },
}

type Callback = Arc<dyn Fn(&RecorderEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    callbacks: Vec<Callback>,
    channels: Vec<Sender<RecorderEvent>>,
}

/// Observer registry shared by the recorder, the writer thread and the supervisor
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Subscribers>,
    /// Held for a whole emission; re-entrant so a callback may emit in turn
    emitting: ReentrantMutex<()>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Callbacks run on the emitting thread and must not block
    /// on another thread that emits.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&RecorderEvent) + Send + Sync + 'static,
    {
        self.subscribers.lock().callbacks.push(Arc::new(callback));
    }

    /// Take an unbounded channel that receives every subsequent event
    pub fn channel(&self) -> Receiver<RecorderEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().channels.push(tx);
        rx
    }

    pub fn emit(&self, event: RecorderEvent) {
        log::debug!("[Events] {}", describe(&event));
        let _emitting = self.emitting.lock();
        let (callbacks, channels) = {
            let subscribers = self.subscribers.lock();
            (subscribers.callbacks.clone(), subscribers.channels.clone())
        };

        for callback in &callbacks {
            callback(&event);
        }

        let closed: Vec<Sender<RecorderEvent>> = channels
            .into_iter()
            .filter(|tx| tx.send(event.clone()).is_err())
            .collect();
        if !closed.is_empty() {
            // Drop channels whose receiver is gone
            self.subscribers
                .lock()
                .channels
                .retain(|tx| !closed.iter().any(|c| c.same_channel(tx)));
        }
    }
}

/// One-line human-readable summary of an event
pub fn describe(event: &RecorderEvent) -> String {
    match event {
        RecorderEvent::RecordingStateChanged {
            is_recording: true,
            patient_context,
            ..
        } => format!("Recording started for {}", patient_context.display_name()),
        RecorderEvent::RecordingStateChanged {
            is_recording: false,
            patient_context,
            reason,
        } => format!(
            "Recording stopped for {} ({:?})",
            patient_context.display_name(),
            reason.unwrap_or(StopReason::Requested)
        ),
        RecorderEvent::SegmentCompleted {
            segment_number,
            path,
            duration,
        } => format!(
            "Segment {} completed ({}) -> {}",
            segment_number,
            format_duration(duration.as_secs_f64()),
            path.display()
        ),
        RecorderEvent::MemoryPressureDetected {
            usage_bytes,
            threshold_bytes,
        } => format!(
            "Memory pressure: {} of {} bytes",
            usage_bytes, threshold_bytes
        ),
        RecorderEvent::SegmentWriteFailed {
            segment_number,
            error,
            consecutive_failures,
        } => format!(
            "Write to segment {} failed ({} in a row): {}",
            segment_number, consecutive_failures, error
        ),
        RecorderEvent::PersistenceFault { error } => format!("Persistence fault: {}", error),
    }
}

/// Format duration as human-readable string
pub fn format_duration(secs: f64) -> String {
    let total_secs = secs as u64;
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressure(n: u64) -> RecorderEvent {
        RecorderEvent::MemoryPressureDetected {
            usage_bytes: n,
            threshold_bytes: 100,
        }
    }

    #[test]
    fn test_channel_and_callback_see_same_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(move |event| {
            if let RecorderEvent::MemoryPressureDetected { usage_bytes, .. } = event {
                seen_clone.lock().push(*usage_bytes);
            }
        });
        let rx = bus.channel();

        for n in 1..=5 {
            bus.emit(pressure(n));
        }

        let from_channel: Vec<u64> = rx
            .try_iter()
            .filter_map(|e| match e {
                RecorderEvent::MemoryPressureDetected { usage_bytes, .. } => Some(usage_bytes),
                _ => None,
            })
            .collect();
        assert_eq!(from_channel, vec![1, 2, 3, 4, 5]);
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_callback_may_emit_and_subscribe() {
        let bus = Arc::new(EventBus::new());
        let rx = bus.channel();
        let weak = Arc::downgrade(&bus);
        bus.subscribe(move |event| {
            if let (Some(bus), RecorderEvent::MemoryPressureDetected { usage_bytes: 1, .. }) =
                (weak.upgrade(), event)
            {
                bus.subscribe(|_| {});
                bus.emit(pressure(2));
            }
        });

        bus.emit(pressure(1));

        let order: Vec<u64> = rx
            .try_iter()
            .filter_map(|e| match e {
                RecorderEvent::MemoryPressureDetected { usage_bytes, .. } => Some(usage_bytes),
                _ => None,
            })
            .collect();
        // The nested event reaches the channel first
        assert_eq!(order, vec![2, 1]);
        assert_eq!(bus.subscribers.lock().callbacks.len(), 2);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.channel();
        drop(rx);
        bus.emit(pressure(1));
        assert!(bus.subscribers.lock().channels.is_empty());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(75.0), "1:15");
        assert_eq!(format_duration(3725.0), "1:02:05");
    }
}
