//! Background segment writer.
//!
//! Producer-consumer, like the capture-side encoder it grew out of:
//! - Producer: the ingest path hands over `Arc<FrameRecord>`s via `submit()`
//! - Consumer: a dedicated thread writes them to the open segment and rotates
//!
//! The queue is bounded. When it is full the newest frame is not persisted (it is
//! still in the circular buffer) and `persistence_dropped` is incremented, so a slow
//! disk never stalls frame acceptance.
//!
//! Segments rotate on nominal boundaries `session_start + n * segment_duration`,
//! always between two frames. A period with no frames produces no segment. The
//! writer also checks the clock on every tick, so a stalled producer does not keep
//! a segment open past its boundary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use parking_lot::RwLock;

use super::{AudioSettings, SegmentFile, SegmentSink, SegmentSpec};
use crate::recording::clock::Clock;
use crate::recording::events::{EventBus, RecorderEvent};
use crate::recording::frame::{FrameRecord, Timestamp};
use crate::recording::state::StopReason;
use crate::recording::supervisor::SupervisorMessage;
use crate::session::{segment_path, Segment};

/// Log only the first drop and then every Nth, the queue can overflow at frame rate
const DROP_LOG_EVERY: u64 = 100;

/// Messages sent to the writer thread
enum WriterMessage {
    Frame(Arc<FrameRecord>),
    /// Close the open segment and exit
    Finish,
}

/// Per-session writer parameters, taken from the validated config
#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub session_dir: PathBuf,
    pub session_start: Timestamp,
    pub segment_duration: Duration,
    /// How often the writer checks the clock for a due rotation
    pub tick_interval: Duration,
    pub audio: AudioSettings,
    pub queue_capacity: usize,
    pub retry_attempts: u32,
    pub max_consecutive_failures: u32,
}

/// State shared between the writer thread and its owner
#[derive(Default)]
struct WriterShared {
    closed_segments: RwLock<Vec<Segment>>,
    current_segment: AtomicU32,
    frames_submitted: AtomicU64,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
    persistence_dropped: AtomicU64,
    abort: AtomicBool,
}

/// What the writer left behind when it was finished
#[derive(Debug, Clone, Default)]
pub struct WriterOutcome {
    pub segments: Vec<Segment>,
    /// The drain did not complete within the timeout
    pub drain_timed_out: bool,
    /// Frames handed to the writer that never reached a segment file
    pub frames_unpersisted: u64,
    /// Frames never handed to the writer because the queue was full
    pub persistence_dropped: u64,
    pub write_failures: u64,
}

/// Point-in-time writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterCounters {
    pub current_segment: u32,
    pub segments_completed: u32,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub persistence_dropped: u64,
    pub queued_frames: usize,
}

pub struct SegmentWriter {
    sender: Sender<WriterMessage>,
    done: Receiver<()>,
    shared: Arc<WriterShared>,
    thread: Option<JoinHandle<()>>,
}

impl SegmentWriter {
    /// Open segment #1 and spawn the writer thread.
    ///
    /// Opening the first segment on the caller's thread surfaces an unwritable
    /// storage location as a start failure rather than a background fault.
    pub fn start(
        sink: Arc<dyn SegmentSink>,
        settings: WriterSettings,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        control: Sender<SupervisorMessage>,
    ) -> std::io::Result<Self> {
        let first_spec = SegmentSpec {
            path: segment_path(&settings.session_dir, 1, sink.extension()),
            segment_number: 1,
            audio: settings.audio,
        };
        let first_file = sink.open_segment(&first_spec)?;
        log::info!("[Writer] Opened segment 1 at {}", first_spec.path.display());

        let (sender, receiver) = bounded::<WriterMessage>(settings.queue_capacity.max(1));
        let (done_tx, done) = bounded::<()>(1);
        let shared = Arc::new(WriterShared::default());
        shared.current_segment.store(1, Ordering::SeqCst);

        let mut worker = WriterWorker {
            active: Some(OpenSegment::new(first_spec, first_file)),
            next_number: 2,
            period_end: settings.session_start.add(settings.segment_duration),
            consecutive_failures: 0,
            fault_raised: false,
            sink,
            clock,
            settings,
            events,
            control,
            shared: shared.clone(),
        };

        let thread = std::thread::Builder::new()
            .name("rewind-segment-writer".into())
            .spawn(move || {
                worker.run(receiver);
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            sender,
            done,
            shared,
            thread: Some(thread),
        })
    }

    /// Queue a frame for persistence (non-blocking).
    ///
    /// Returns `false` if the frame was not queued.
    pub fn submit(&self, frame: Arc<FrameRecord>) -> bool {
        match self.sender.try_send(WriterMessage::Frame(frame)) {
            Ok(()) => {
                self.shared.frames_submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.shared.persistence_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                    log::warn!(
                        "[Writer] Queue full, frame not persisted ({} dropped so far)",
                        dropped
                    );
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.persistence_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Closed segments so far, in order
    pub fn closed_segments(&self) -> Vec<Segment> {
        self.shared.closed_segments.read().clone()
    }

    pub fn counters(&self) -> WriterCounters {
        WriterCounters {
            current_segment: self.shared.current_segment.load(Ordering::Relaxed),
            segments_completed: self.shared.closed_segments.read().len() as u32,
            frames_written: self.shared.frames_written.load(Ordering::Relaxed),
            bytes_written: self.shared.bytes_written.load(Ordering::Relaxed),
            write_failures: self.shared.write_failures.load(Ordering::Relaxed),
            persistence_dropped: self.shared.persistence_dropped.load(Ordering::Relaxed),
            queued_frames: self.sender.len(),
        }
    }

    /// Drain the queue, close the open segment and stop the thread.
    ///
    /// Waits at most `timeout`. On expiry the thread is told to discard what is
    /// still queued and is left to finish on its own.
    pub fn finish(mut self, timeout: Duration) -> WriterOutcome {
        let deadline = Instant::now() + timeout;
        let finish_sent = self
            .sender
            .send_timeout(WriterMessage::Finish, timeout)
            .is_ok();

        let drained = finish_sent
            && self
                .done
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                .is_ok();

        if drained {
            if let Some(handle) = self.thread.take() {
                if handle.join().is_err() {
                    log::error!("[Writer] Writer thread panicked");
                }
            }
        } else {
            self.shared.abort.store(true, Ordering::SeqCst);
            log::warn!(
                "[Writer] Drain did not complete within {:?}, {} frame(s) still queued",
                timeout,
                self.sender.len()
            );
        }

        let submitted = self.shared.frames_submitted.load(Ordering::SeqCst);
        let written = self.shared.frames_written.load(Ordering::SeqCst);
        WriterOutcome {
            segments: self.closed_segments(),
            drain_timed_out: !drained,
            frames_unpersisted: submitted.saturating_sub(written),
            persistence_dropped: self.shared.persistence_dropped.load(Ordering::SeqCst),
            write_failures: self.shared.write_failures.load(Ordering::SeqCst),
        }
    }
}

/// The segment currently owned by the writer thread
struct OpenSegment {
    spec: SegmentSpec,
    file: Box<dyn SegmentFile>,
    start_time: Option<Timestamp>,
    end_time: Option<Timestamp>,
    frame_count: u64,
    first_sequence: u64,
    last_sequence: u64,
    bytes_written: u64,
    degraded: bool,
}

impl OpenSegment {
    fn new(spec: SegmentSpec, file: Box<dyn SegmentFile>) -> Self {
        Self {
            spec,
            file,
            start_time: None,
            end_time: None,
            frame_count: 0,
            first_sequence: 0,
            last_sequence: 0,
            bytes_written: 0,
            degraded: false,
        }
    }

    fn record(&mut self, frame: &FrameRecord) {
        if self.frame_count == 0 {
            self.start_time = Some(frame.captured_at);
            self.first_sequence = frame.sequence;
        }
        self.end_time = Some(frame.captured_at);
        self.last_sequence = frame.sequence;
        self.frame_count += 1;
        self.bytes_written += frame.byte_size() as u64;
    }
}

struct WriterWorker {
    active: Option<OpenSegment>,
    next_number: u32,
    period_end: Timestamp,
    consecutive_failures: u32,
    fault_raised: bool,
    sink: Arc<dyn SegmentSink>,
    clock: Arc<dyn Clock>,
    settings: WriterSettings,
    events: Arc<EventBus>,
    control: Sender<SupervisorMessage>,
    shared: Arc<WriterShared>,
}

impl WriterWorker {
    fn run(&mut self, receiver: Receiver<WriterMessage>) {
        let ticker = tick(self.settings.tick_interval.max(Duration::from_millis(1)));
        loop {
            select! {
                recv(receiver) -> msg => match msg {
                    Ok(WriterMessage::Frame(frame)) => {
                        if self.shared.abort.load(Ordering::Relaxed) {
                            continue;
                        }
                        self.handle_frame(&frame);
                    }
                    Ok(WriterMessage::Finish) => {
                        log::info!("[Writer] Finishing, closing open segment");
                        break;
                    }
                    Err(_) => {
                        // Owner dropped without finishing
                        break;
                    }
                },
                recv(ticker) -> _ => {
                    // Queued frames rotate by their own timestamps
                    if receiver.is_empty() {
                        self.rotate_if_due();
                    }
                }
            }
        }
        self.close_active();
    }

    /// Close the open segment once the clock has passed its boundary
    fn rotate_if_due(&mut self) {
        let now = self.clock.now();
        if now < self.period_end {
            return;
        }
        if self.active.is_some() {
            log::debug!(
                "[Writer] No frame since segment boundary {}, rotating on the clock",
                self.period_end
            );
        }
        self.rotate(now);
    }

    fn handle_frame(&mut self, frame: &FrameRecord) {
        if frame.captured_at >= self.period_end {
            self.rotate(frame.captured_at);
        }

        if self.active.is_none() && !self.open_next() {
            return;
        }

        let attempts = self.settings.retry_attempts.max(1);
        let mut last_error = None;
        if let Some(segment) = self.active.as_mut() {
            for attempt in 1..=attempts {
                match segment.file.write(frame) {
                    Ok(()) => {
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        log::debug!(
                            "[Writer] Write attempt {}/{} for frame {} failed: {}",
                            attempt,
                            attempts,
                            frame.sequence,
                            e
                        );
                        last_error = Some(e);
                        if attempt < attempts {
                            std::thread::sleep(Duration::from_millis(5 * attempt as u64));
                        }
                    }
                }
            }

            if last_error.is_none() {
                segment.record(frame);
                self.consecutive_failures = 0;
                self.shared.frames_written.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .bytes_written
                    .fetch_add(frame.byte_size() as u64, Ordering::Relaxed);
                return;
            }
            segment.degraded = true;
        }

        if let Some(error) = last_error {
            let number = self.shared.current_segment.load(Ordering::Relaxed);
            self.write_failed(number, error.to_string());
        }
    }

    /// Close the open segment and advance the period to the one containing `at`
    fn rotate(&mut self, at: Timestamp) {
        let period_ns = self.settings.segment_duration.as_nanos().max(1);
        let elapsed_ns = at.duration_since(self.settings.session_start).as_nanos();
        let periods = (elapsed_ns / period_ns + 1) as u32;
        self.period_end = self
            .settings
            .session_start
            .add(self.settings.segment_duration * periods);

        self.close_active();
    }

    fn open_next(&mut self) -> bool {
        let number = self.next_number;
        let spec = SegmentSpec {
            path: segment_path(&self.settings.session_dir, number, self.sink.extension()),
            segment_number: number,
            audio: self.settings.audio,
        };
        self.shared.current_segment.store(number, Ordering::Relaxed);

        match self.sink.open_segment(&spec) {
            Ok(file) => {
                log::info!("[Writer] Opened segment {} at {}", number, spec.path.display());
                self.next_number += 1;
                self.active = Some(OpenSegment::new(spec, file));
                true
            }
            Err(e) => {
                self.write_failed(number, format!("Failed to open segment: {}", e));
                false
            }
        }
    }

    fn close_active(&mut self) {
        let Some(segment) = self.active.take() else {
            return;
        };
        let OpenSegment {
            spec,
            file,
            start_time,
            end_time,
            frame_count,
            first_sequence,
            last_sequence,
            bytes_written,
            mut degraded,
        } = segment;

        if let Err(e) = file.close() {
            log::warn!("[Writer] Closing segment {} failed: {}", spec.segment_number, e);
            degraded = true;
        }

        let (Some(start_time), Some(end_time)) = (start_time, end_time) else {
            // Nothing was written; don't leave an empty file behind
            let _ = std::fs::remove_file(&spec.path);
            log::debug!("[Writer] Discarded empty segment {}", spec.segment_number);
            return;
        };

        let closed = Segment {
            segment_number: spec.segment_number,
            start_time,
            end_time,
            file_path: spec.path.clone(),
            frame_count,
            first_sequence,
            last_sequence,
            bytes_written,
            degraded,
        };
        let duration = closed.duration();
        self.shared.closed_segments.write().push(closed);

        log::info!(
            "[Writer] Segment {} closed: {} frames, {} bytes{}",
            spec.segment_number,
            frame_count,
            bytes_written,
            if degraded { " (degraded)" } else { "" }
        );
        self.events.emit(RecorderEvent::SegmentCompleted {
            segment_number: spec.segment_number,
            path: spec.path,
            duration,
        });
    }

    fn write_failed(&mut self, segment_number: u32, error: String) {
        self.consecutive_failures += 1;
        self.shared.write_failures.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "[Writer] Segment {} write failed ({} consecutive): {}",
            segment_number,
            self.consecutive_failures,
            error
        );
        self.events.emit(RecorderEvent::SegmentWriteFailed {
            segment_number,
            error: error.clone(),
            consecutive_failures: self.consecutive_failures,
        });

        if self.consecutive_failures > self.settings.max_consecutive_failures && !self.fault_raised {
            self.fault_raised = true;
            log::error!(
                "[Writer] {} consecutive write failures, stopping the session",
                self.consecutive_failures
            );
            self.events.emit(RecorderEvent::PersistenceFault { error });
            let _ = self
                .control
                .send(SupervisorMessage::RequestStop(StopReason::PersistenceFailure));
        }
    }
}
