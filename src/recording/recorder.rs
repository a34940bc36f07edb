//! Public facade of the recording engine.
//!
//! A `Recorder` owns at most one live session. `start` returns the session's
//! `SessionHandle`, which is the only way to push frames into it. Lifecycle
//! transitions go through the pure state machine in `state.rs`; this module applies
//! the side effects.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::buffer::{BufferError, CircularBuffer};
use super::clock::{Clock, SystemClock};
use super::events::{EventBus, RecorderEvent};
use super::extract::{ClipReport, ExtractError, ExtractSource, RetroactiveExtractor};
use super::frame::{FrameKind, FrameRecord, RawFrame, Timestamp};
use super::pressure::{MemoryBudget, MemoryPressureMonitor, PressureAction};
use super::state::{
    transition, RecordingEvent, RecordingState, RecordingStatus, SideEffect, StopReason,
};
use super::stats::{RecordingStatistics, StatisticsCollector};
use super::supervisor::{StopHandler, Supervisor, SupervisorMessage, SupervisorSettings};
use crate::config::{ConfigError, RecorderConfig};
use crate::encoding::{FrameFileSink, SegmentSink, SegmentWriter, WriterSettings};
use crate::session::{
    create_session_dir, segment_path, write_manifest, PatientContext, Segment, SessionManifest,
    SessionTotals,
};

/// Log the first rejected frame of a kind and then every Nth
const REJECT_LOG_EVERY: u64 = 100;

/// Error type for lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("A recording session is already active")]
    AlreadyRecording,

    #[error("No recording session is active")]
    NotRecording,

    #[error("Invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a frame was not accepted. Never fatal to the session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngestError {
    #[error("Session is not accepting frames")]
    NotRecording,

    #[error("Audio recording is disabled")]
    AudioDisabled,

    #[error("Timestamp went backwards ({got} after {previous})")]
    TimestampRegression { previous: Timestamp, got: Timestamp },

    #[error("Session reached its maximum duration")]
    MaxDurationReached,

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Result of accepting one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReceipt {
    pub sequence: u64,
    /// Frames evicted from the buffer to make room
    pub evicted: usize,
    /// Whether the frame was queued for persistence
    pub queued_for_persistence: bool,
}

/// Summary returned by `stop`
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub session_id: String,
    pub reason: StopReason,
    pub session_dir: PathBuf,
    pub duration: Duration,
    pub segments: Vec<Segment>,
    pub totals: SessionTotals,
    /// The writer did not drain within `drain_timeout_secs`
    pub drain_timed_out: bool,
    pub frames_unpersisted: u64,
    pub manifest_path: Option<PathBuf>,
}

struct IngestCursor {
    next_sequence: u64,
    last_time: Option<Timestamp>,
    accepting: bool,
}

#[derive(Default)]
struct SessionCounters {
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
    frames_rejected: AtomicU64,
    regressions: AtomicU64,
}

/// The one live recording session
struct LiveSession {
    id: String,
    patient: PatientContext,
    config: RecorderConfig,
    started_at: Timestamp,
    dir: PathBuf,
    buffer: CircularBuffer,
    writer: Mutex<Option<SegmentWriter>>,
    pressure: Mutex<MemoryPressureMonitor>,
    ingest: Mutex<IngestCursor>,
    counters: SessionCounters,
    events: Arc<EventBus>,
    control: Sender<SupervisorMessage>,
    max_duration_signalled: AtomicBool,
}

impl LiveSession {
    fn on_frame(&self, raw: RawFrame, captured_at: Timestamp) -> Result<IngestReceipt, IngestError> {
        let mut cursor = self.ingest.lock();
        if !cursor.accepting {
            return Err(IngestError::NotRecording);
        }

        if raw.kind == FrameKind::Audio && !self.config.enable_audio_recording {
            self.reject();
            return Err(IngestError::AudioDisabled);
        }

        if let Some(previous) = cursor.last_time {
            if captured_at < previous {
                self.reject();
                let n = self.counters.regressions.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % REJECT_LOG_EVERY == 0 {
                    log::warn!(
                        "[Recorder] Dropping frame with timestamp {} before {} ({} so far)",
                        captured_at,
                        previous,
                        n
                    );
                }
                return Err(IngestError::TimestampRegression {
                    previous,
                    got: captured_at,
                });
            }
        }

        if captured_at.duration_since(self.started_at) >= self.config.max_recording_duration() {
            self.reject();
            if !self.max_duration_signalled.swap(true, Ordering::SeqCst) {
                log::info!("[Recorder] Frame past max duration, requesting stop");
                let _ = self
                    .control
                    .send(SupervisorMessage::RequestStop(StopReason::MaxDurationReached));
            }
            return Err(IngestError::MaxDurationReached);
        }

        if raw.len() > self.buffer.capacity_bytes() {
            self.reject();
            return Err(IngestError::Buffer(BufferError::FrameTooLarge {
                frame_bytes: raw.len(),
                capacity_bytes: self.buffer.capacity_bytes(),
            }));
        }

        let sequence = cursor.next_sequence;
        cursor.next_sequence += 1;
        cursor.last_time = Some(captured_at);

        let frame = Arc::new(FrameRecord::new(sequence, captured_at, raw));
        let byte_size = frame.byte_size() as u64;
        let evicted = self.buffer.append(frame.clone())?;
        let queued_for_persistence = match self.writer.lock().as_ref() {
            Some(writer) => writer.submit(frame),
            None => false,
        };

        self.counters.total_frames.fetch_add(1, Ordering::Relaxed);
        self.counters.total_bytes.fetch_add(byte_size, Ordering::Relaxed);

        self.check_pressure();

        Ok(IngestReceipt {
            sequence,
            evicted,
            queued_for_persistence,
        })
    }

    fn check_pressure(&self) {
        let usage = self.buffer.total_bytes() as u64;
        let action = self.pressure.lock().observe(usage);
        if let PressureAction::Offload {
            fraction,
            usage_bytes,
            threshold_bytes,
        } = action
        {
            let report = self.buffer.offload(fraction);
            log::info!(
                "[Recorder] Offloaded {} frame(s), {} bytes",
                report.frames,
                report.bytes
            );
            self.events.emit(RecorderEvent::MemoryPressureDetected {
                usage_bytes,
                threshold_bytes,
            });
        }
    }

    fn reject(&self) {
        self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Refuse all further frames. Waits for an in-flight `on_frame` to finish.
    fn close_ingest(&self) {
        self.ingest.lock().accepting = false;
    }

    fn closed_segments(&self) -> Vec<Segment> {
        self.writer
            .lock()
            .as_ref()
            .map(|w| w.closed_segments())
            .unwrap_or_default()
    }

    fn live_paths(&self, extension: &str) -> Vec<PathBuf> {
        let guard = self.writer.lock();
        let Some(writer) = guard.as_ref() else {
            return Vec::new();
        };
        let current = writer.counters().current_segment;
        let mut paths: Vec<PathBuf> = writer
            .closed_segments()
            .into_iter()
            .map(|s| s.file_path)
            .collect();
        paths.push(segment_path(&self.dir, current, extension));
        paths
    }

    fn totals(&self, persistence_dropped: u64, write_failures: u64) -> SessionTotals {
        let buffer = self.buffer.counters();
        SessionTotals {
            total_frames: self.counters.total_frames.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            frames_evicted: buffer.frames_evicted,
            frames_offloaded: buffer.frames_offloaded,
            persistence_dropped,
            write_failures,
            frames_rejected: self.counters.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Producer-side handle to the live session.
///
/// Cheap to clone; hand one to the capture thread. Once the session stops every
/// call returns `IngestError::NotRecording`.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<LiveSession>,
}

impl SessionHandle {
    /// Accept one frame from the capture source.
    ///
    /// The producer guarantees no two concurrent calls; frames must arrive in
    /// capture order.
    pub fn on_frame(
        &self,
        raw: RawFrame,
        captured_at: Timestamp,
    ) -> Result<IngestReceipt, IngestError> {
        self.session.on_frame(raw, captured_at)
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session.dir
    }

    pub fn started_at(&self) -> Timestamp {
        self.session.started_at
    }

    pub fn patient_context(&self) -> &PatientContext {
        &self.session.patient
    }

    pub fn memory_budget(&self) -> MemoryBudget {
        self.session
            .pressure
            .lock()
            .budget(self.session.buffer.total_bytes() as u64)
    }
}

struct RecorderInner {
    sink: Arc<dyn SegmentSink>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    stats: Arc<StatisticsCollector>,
    machine: Mutex<RecordingState>,
    session: RwLock<Option<Arc<LiveSession>>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Serializes start and stop
    lifecycle: Mutex<()>,
    last_manifest: Mutex<Option<SessionManifest>>,
}

impl RecorderInner {
    /// Feed an event to the state machine and return the effects to apply
    fn apply(&self, event: RecordingEvent) -> (RecordingState, Vec<SideEffect>) {
        let mut machine = self.machine.lock();
        let (next, effects) = transition(machine.clone(), event);
        *machine = next.clone();
        (next, effects)
    }

    fn emit_state_change(
        &self,
        patient: &PatientContext,
        effects: &[SideEffect],
    ) {
        for effect in effects {
            if let SideEffect::EmitStateChange {
                is_recording,
                reason,
            } = effect
            {
                self.events.emit(RecorderEvent::RecordingStateChanged {
                    is_recording: *is_recording,
                    patient_context: patient.clone(),
                    reason: *reason,
                });
            }
        }
    }

    fn start(
        self: &Arc<Self>,
        patient: PatientContext,
        config: RecorderConfig,
    ) -> Result<SessionHandle, RecorderError> {
        let _lifecycle = self.lifecycle.lock();

        if !self.machine.lock().can_start_recording() {
            return Err(RecorderError::AlreadyRecording);
        }
        config.validate()?;

        let started_at = self.clock.now();
        let id = uuid::Uuid::new_v4().to_string();
        let buffer = CircularBuffer::new(config.buffer_capacity_bytes())?;
        let dir = create_session_dir(&config.storage_path, started_at.wall, &patient)?;

        let (control, control_rx) = unbounded();
        let writer = SegmentWriter::start(
            self.sink.clone(),
            WriterSettings {
                session_dir: dir.clone(),
                session_start: started_at,
                segment_duration: config.segment_duration(),
                tick_interval: config.heartbeat_interval(),
                audio: config.audio_settings(),
                queue_capacity: config.writer_queue_capacity,
                retry_attempts: config.write_retry_attempts,
                max_consecutive_failures: config.max_consecutive_write_failures,
            },
            self.clock.clone(),
            self.events.clone(),
            control.clone(),
        )?;

        let weak: Weak<RecorderInner> = Arc::downgrade(self);
        let owner = id.clone();
        let on_stop: StopHandler = Arc::new(move |reason| {
            if let Some(inner) = weak.upgrade() {
                match inner.stop_session(&owner, reason) {
                    Ok(report) => log::info!(
                        "[Recorder] Session {} stopped automatically ({:?})",
                        report.session_id,
                        reason
                    ),
                    Err(e) => log::debug!("[Recorder] Automatic stop skipped: {}", e),
                }
            }
        });
        let supervisor = match Supervisor::spawn(
            SupervisorSettings {
                started_at,
                max_duration: config.max_recording_duration(),
                heartbeat: config.heartbeat_interval(),
            },
            control.clone(),
            control_rx,
            self.clock.clone(),
            self.stats.clone(),
            on_stop,
        ) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                writer.finish(config.drain_timeout());
                return Err(e.into());
            }
        };

        let session = Arc::new(LiveSession {
            id: id.clone(),
            pressure: Mutex::new(MemoryPressureMonitor::new(
                config.memory_threshold_bytes,
                config.offload_percentage,
            )),
            patient: patient.clone(),
            started_at,
            dir: dir.clone(),
            buffer,
            writer: Mutex::new(Some(writer)),
            ingest: Mutex::new(IngestCursor {
                next_sequence: 1,
                last_time: None,
                accepting: true,
            }),
            counters: SessionCounters::default(),
            events: self.events.clone(),
            control,
            max_duration_signalled: AtomicBool::new(false),
            config,
        });

        *self.session.write() = Some(session.clone());
        *self.supervisor.lock() = Some(supervisor);

        let (_, effects) = self.apply(RecordingEvent::SessionOpened {
            session_id: id.clone(),
            started_at,
        });
        log::info!(
            "[Recorder] Recording started for {} (session {}, {})",
            patient.display_name(),
            id,
            dir.display()
        );
        self.emit_state_change(&patient, &effects);

        Ok(SessionHandle { session })
    }

    fn stop(&self, reason: StopReason) -> Result<StopReport, RecorderError> {
        let _lifecycle = self.lifecycle.lock();
        self.stop_locked(reason)
    }

    /// Stop only if `session_id` is still the live session. Background stop
    /// requests may arrive after their session was already replaced.
    fn stop_session(
        &self,
        session_id: &str,
        reason: StopReason,
    ) -> Result<StopReport, RecorderError> {
        let _lifecycle = self.lifecycle.lock();
        let is_live = self
            .session
            .read()
            .as_ref()
            .is_some_and(|s| s.id == session_id);
        if !is_live {
            return Err(RecorderError::NotRecording);
        }
        self.stop_locked(reason)
    }

    /// Caller holds `lifecycle`
    fn stop_locked(&self, reason: StopReason) -> Result<StopReport, RecorderError> {
        let (_, effects) = self.apply(RecordingEvent::StopRequested { reason });
        if !effects
            .iter()
            .any(|e| matches!(e, SideEffect::SignalStop { .. }))
        {
            return Err(RecorderError::NotRecording);
        }

        let Some(session) = self.session.write().take() else {
            // Machine said Recording but no session; put the machine back to Idle
            self.apply(RecordingEvent::DrainCompleted);
            return Err(RecorderError::NotRecording);
        };

        log::info!("[Recorder] Stopping session {} ({:?})", session.id, reason);
        session.close_ingest();

        let writer = session.writer.lock().take();
        let outcome = match writer {
            Some(writer) => writer.finish(session.config.drain_timeout()),
            None => Default::default(),
        };
        if outcome.drain_timed_out {
            log::warn!(
                "[Recorder] Drain timed out, {} frame(s) not persisted",
                outcome.frames_unpersisted
            );
        }

        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.shutdown();
        }

        let stopped_at = self.clock.now();
        let duration = stopped_at.duration_since(session.started_at);
        let totals = session.totals(outcome.persistence_dropped, outcome.write_failures);
        session.buffer.clear();

        let manifest = SessionManifest {
            id: session.id.clone(),
            patient_context: session.patient.clone(),
            started_at: session.started_at.wall,
            stopped_at: Some(stopped_at.wall),
            stop_reason: Some(reason),
            path: session.dir.clone(),
            segments: outcome.segments.clone(),
            totals: totals.clone(),
            drain_timed_out: outcome.drain_timed_out,
        };
        let manifest_path = match write_manifest(&manifest) {
            Ok(path) => Some(path),
            Err(e) => {
                log::error!("[Recorder] Failed to write session manifest: {}", e);
                None
            }
        };
        *self.last_manifest.lock() = Some(manifest);

        let (_, effects) = self.apply(RecordingEvent::DrainCompleted);
        log::info!(
            "[Recorder] Recording stopped: {} frames, {} segment(s), {:.1}s",
            totals.total_frames,
            outcome.segments.len(),
            duration.as_secs_f64()
        );
        self.emit_state_change(&session.patient, &effects);

        Ok(StopReport {
            session_id: session.id.clone(),
            reason,
            session_dir: session.dir.clone(),
            duration,
            segments: outcome.segments,
            totals,
            drain_timed_out: outcome.drain_timed_out,
            frames_unpersisted: outcome.frames_unpersisted,
            manifest_path,
        })
    }
}

/// Continuous recorder with retroactive clip extraction
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl Recorder {
    pub fn new(sink: Arc<dyn SegmentSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                sink,
                clock,
                events: Arc::new(EventBus::new()),
                stats: Arc::new(StatisticsCollector::new()),
                machine: Mutex::new(RecordingState::Idle),
                session: RwLock::new(None),
                supervisor: Mutex::new(None),
                lifecycle: Mutex::new(()),
                last_manifest: Mutex::new(None),
            }),
        }
    }

    /// Recorder writing `.rseg` segments, timed by the system clock
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(FrameFileSink::new()), Arc::new(SystemClock::new()))
    }

    /// Open a new session. Fails with `AlreadyRecording` while one is live or stopping.
    pub fn start(
        &self,
        patient_context: PatientContext,
        config: RecorderConfig,
    ) -> Result<SessionHandle, RecorderError> {
        self.inner.start(patient_context, config)
    }

    /// Flush and close the open segment, tear down the buffer and return to Idle.
    pub fn stop(&self) -> Result<StopReport, RecorderError> {
        self.inner.stop(StopReason::Requested)
    }

    /// Write a clip covering the last `minutes` (1..=60) minutes
    pub fn save_last_minutes(
        &self,
        minutes: u32,
        reason: &str,
        output_path: Option<&Path>,
    ) -> Result<ClipReport, ExtractError> {
        let Some(session) = self.inner.session.read().clone() else {
            return Err(ExtractError::NotRecording);
        };

        let extractor = RetroactiveExtractor::new(
            self.inner.sink.clone(),
            self.inner.clock.clone(),
            session.config.extract_timeout(),
        );
        let source = ExtractSource {
            session_id: &session.id,
            patient: &session.patient,
            storage_path: &session.config.storage_path,
            buffer: &session.buffer,
            closed_segments: session.closed_segments(),
            live_paths: session.live_paths(self.inner.sink.extension()),
            audio: session.config.audio_settings(),
        };
        extractor.save_last(source, minutes, reason, output_path)
    }

    pub fn get_statistics(&self) -> RecordingStatistics {
        let performance = self.inner.stats.performance();
        let status = self.status();
        let Some(session) = self.inner.session.read().clone() else {
            return RecordingStatistics {
                status,
                ..RecordingStatistics::idle(performance)
            };
        };

        let writer = session
            .writer
            .lock()
            .as_ref()
            .map(|w| w.counters())
            .unwrap_or_default();
        let buffer = session.buffer.counters();
        let pressure = session
            .pressure
            .lock()
            .budget(session.buffer.total_bytes() as u64);

        RecordingStatistics {
            status,
            session_id: Some(session.id.clone()),
            duration: self.inner.clock.now().duration_since(session.started_at),
            total_frames: session.counters.total_frames.load(Ordering::Relaxed),
            total_bytes: session.counters.total_bytes.load(Ordering::Relaxed),
            memory_usage_bytes: session.buffer.total_bytes() as u64,
            buffered_frames: session.buffer.len(),
            oldest_buffered: session.buffer.oldest_time(),
            newest_buffered: session.buffer.newest_time(),
            current_segment: writer.current_segment,
            segments_completed: writer.segments_completed,
            frames_persisted: writer.frames_written,
            frames_evicted: buffer.frames_evicted,
            frames_offloaded: buffer.frames_offloaded,
            persistence_dropped: writer.persistence_dropped,
            write_failures: writer.write_failures,
            frames_rejected: session.counters.frames_rejected.load(Ordering::Relaxed),
            pressure_events: pressure.offload_count,
            queued_frames: writer.queued_frames,
            performance_metrics: performance,
        }
    }

    pub fn status(&self) -> RecordingStatus {
        self.inner.machine.lock().status()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.machine.lock().is_recording()
    }

    /// Register an observer callback. Runs on the emitting thread.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&RecorderEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(callback);
    }

    /// Receive every subsequent event on a channel
    pub fn events(&self) -> Receiver<RecorderEvent> {
        self.inner.events.channel()
    }

    /// Manifest of the most recently stopped session
    pub fn last_manifest(&self) -> Option<SessionManifest> {
        self.inner.last_manifest.lock().clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.is_recording() {
            log::warn!("[Recorder] Dropped while recording, stopping session");
            let _ = self.inner.stop(StopReason::Requested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::clock::ManualClock;

    fn config(dir: &Path) -> RecorderConfig {
        RecorderConfig {
            storage_path: dir.to_path_buf(),
            circular_buffer_size_mb: 1,
            heartbeat_interval_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_stale_stop_request_leaves_new_session_running() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let recorder = Recorder::new(Arc::new(FrameFileSink::new()), clock.clone());

        let first = recorder
            .start(PatientContext::new("P-1", ""), config(tmp.path()))
            .unwrap();
        let first_id = first.session_id().to_string();
        recorder.stop().unwrap();

        let second = recorder
            .start(PatientContext::new("P-2", ""), config(tmp.path()))
            .unwrap();

        // An auto-stop dispatched for the first session lands late
        let stale = recorder
            .inner
            .stop_session(&first_id, StopReason::MaxDurationReached);
        assert!(matches!(stale, Err(RecorderError::NotRecording)));
        assert_eq!(recorder.status(), RecordingStatus::Recording);
        assert!(second
            .on_frame(RawFrame::video(vec![0; 16]), clock.now())
            .is_ok());

        let current = recorder
            .inner
            .stop_session(second.session_id(), StopReason::PersistenceFailure)
            .unwrap();
        assert_eq!(current.reason, StopReason::PersistenceFailure);
        assert_eq!(recorder.status(), RecordingStatus::Idle);
    }
}
