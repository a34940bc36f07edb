// Shared helpers for the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use rewind_lib::recording::recorder::IngestReceipt;
use rewind_lib::{
    FrameFileSink, IngestError, ManualClock, RawFrame, Recorder, RecorderConfig, RecorderEvent,
    SessionHandle,
};

pub const MB: u64 = 1024 * 1024;

/// Small buffer, hour-long segments, fast heartbeat
pub fn test_config(storage: &Path) -> RecorderConfig {
    RecorderConfig {
        storage_path: storage.to_path_buf(),
        segment_duration_minutes: 60,
        max_recording_duration_minutes: 240,
        circular_buffer_size_mb: 1,
        memory_threshold_bytes: 2 * MB,
        heartbeat_interval_ms: 10,
        drain_timeout_secs: 5,
        extract_timeout_secs: 10,
        ..Default::default()
    }
}

pub fn recorder(clock: &Arc<ManualClock>) -> Recorder {
    Recorder::new(Arc::new(FrameFileSink::new()), clock.clone())
}

/// Push one video frame per second for `from..=to`, moving the clock along
pub fn feed_seconds(
    handle: &SessionHandle,
    clock: &ManualClock,
    from: u64,
    to: u64,
    frame_bytes: usize,
) -> Vec<Result<IngestReceipt, IngestError>> {
    (from..=to)
        .map(|secs| {
            let at = Duration::from_secs(secs);
            clock.set(at);
            handle.on_frame(RawFrame::video(vec![secs as u8; frame_bytes]), clock.at(at))
        })
        .collect()
}

/// Wait for the first event matching `pred`
pub fn wait_for_event<F>(rx: &Receiver<RecorderEvent>, timeout: Duration, pred: F) -> Option<RecorderEvent>
where
    F: Fn(&RecorderEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

pub fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
