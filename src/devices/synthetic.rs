// Synthetic test-pattern source

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::recording::clock::Clock;
use crate::recording::frame::RawFrame;
use crate::recording::recorder::{IngestError, SessionHandle};

#[derive(Debug, Clone)]
pub struct SyntheticSourceConfig {
    pub fps: u32,
    /// Payload size of each video frame
    pub frame_bytes: usize,
    /// Emit one audio frame per this many video frames (0 = no audio)
    pub audio_every: u32,
    pub audio_bytes: usize,
}

impl Default for SyntheticSourceConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            frame_bytes: 64 * 1024,
            audio_every: 3,
            audio_bytes: 3840,
        }
    }
}

/// Counters reported when the source stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub video_frames: u64,
    pub audio_frames: u64,
    pub rejected: u64,
}

/// Deterministic moving-bar pattern, so frames differ from one another
pub fn test_pattern(index: u64, size: usize) -> Vec<u8> {
    let bar = (index % 256) as u8;
    (0..size)
        .map(|i| if (i / 64) % 16 == (index % 16) as usize { 0xFF } else { bar })
        .collect()
}

/// Pushes test-pattern frames into a session on a dedicated thread
pub struct SyntheticSource {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<SourceStats>>,
}

impl SyntheticSource {
    pub fn start(
        handle: SessionHandle,
        clock: Arc<dyn Clock>,
        config: SyntheticSourceConfig,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let thread = std::thread::Builder::new()
            .name("rewind-synthetic-source".into())
            .spawn(move || produce(handle, clock, config, running_clone))?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) -> SourceStats {
        self.running.store(false, Ordering::SeqCst);
        self.thread
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn produce(
    handle: SessionHandle,
    clock: Arc<dyn Clock>,
    config: SyntheticSourceConfig,
    running: Arc<AtomicBool>,
) -> SourceStats {
    let interval = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
    let mut stats = SourceStats::default();
    let mut index = 0u64;
    let mut next_due = Instant::now();

    log::info!(
        "[Synthetic] Producing {} fps, {} bytes per frame",
        config.fps,
        config.frame_bytes
    );

    while running.load(Ordering::Relaxed) {
        let video = RawFrame::video(test_pattern(index, config.frame_bytes));
        if !push(&handle, video, clock.as_ref(), &mut stats) {
            break;
        }
        stats.video_frames += 1;

        if config.audio_every > 0 && index % config.audio_every as u64 == 0 {
            let audio = RawFrame::audio(vec![0u8; config.audio_bytes]);
            if push(&handle, audio, clock.as_ref(), &mut stats) {
                stats.audio_frames += 1;
            }
        }

        index += 1;
        next_due += interval;
        let now = Instant::now();
        if next_due > now {
            std::thread::sleep(next_due - now);
        } else {
            // Fell behind; don't try to catch up with a burst
            next_due = now;
        }
    }

    running.store(false, Ordering::SeqCst);
    log::info!(
        "[Synthetic] Stopped after {} video / {} audio frame(s), {} rejected",
        stats.video_frames,
        stats.audio_frames,
        stats.rejected
    );
    stats
}

/// Returns false once the session no longer accepts frames
fn push(handle: &SessionHandle, frame: RawFrame, clock: &dyn Clock, stats: &mut SourceStats) -> bool {
    match handle.on_frame(frame, clock.now()) {
        Ok(_) => true,
        Err(IngestError::NotRecording) | Err(IngestError::MaxDurationReached) => false,
        Err(e) => {
            stats.rejected += 1;
            log::debug!("[Synthetic] Frame rejected: {}", e);
            true
        }
    }
}
