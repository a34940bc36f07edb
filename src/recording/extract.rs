//! Retroactive clip extraction ("save the last N minutes").
//!
//! Frames come from two places: the live circular buffer, and closed segments on
//! disk when the window starts before the oldest buffered frame. The buffer part is
//! a snapshot of `Arc` references taken under a short read lock; reading segments
//! and encoding the clip happen on a worker thread with no engine lock held.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError};
use serde::Serialize;

use super::buffer::CircularBuffer;
use super::clock::Clock;
use super::frame::{FrameRecord, Timestamp};
use crate::encoding::{AudioSettings, SegmentSink, SegmentSpec};
use crate::session::{
    default_clip_path, sidecar_path, write_json_atomic, ClipMetadata, Coverage, PatientContext,
    Segment,
};

pub const MIN_MINUTES: u32 = 1;
pub const MAX_MINUTES: u32 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("No recording session is active")]
    NotRecording,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No frames available in the requested window")]
    EmptyWindow,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Clip was not written within {0:?}")]
    DrainTimeout(Duration),
}

/// Outcome of a successful extraction
#[derive(Debug, Clone, Serialize)]
pub struct ClipReport {
    pub path: PathBuf,
    pub metadata_path: PathBuf,
    pub coverage: Coverage,
    pub requested_start: Timestamp,
    pub actual_start: Timestamp,
    pub end: Timestamp,
    pub frame_count: u64,
    /// Sequence numbers absent between the first and last clip frame
    pub missing_frames: u64,
    pub segments_used: Vec<u32>,
}

/// What the extractor needs to know about the live session
pub struct ExtractSource<'a> {
    pub session_id: &'a str,
    pub patient: &'a PatientContext,
    pub storage_path: &'a Path,
    pub buffer: &'a CircularBuffer,
    /// Closed segments, in order
    pub closed_segments: Vec<Segment>,
    /// Files the writer owns or has written; a clip must not overwrite them
    pub live_paths: Vec<PathBuf>,
    pub audio: AudioSettings,
}

pub struct RetroactiveExtractor {
    sink: Arc<dyn SegmentSink>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RetroactiveExtractor {
    pub fn new(sink: Arc<dyn SegmentSink>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            sink,
            clock,
            timeout,
        }
    }

    pub fn save_last(
        &self,
        source: ExtractSource<'_>,
        minutes: u32,
        reason: &str,
        output_path: Option<&Path>,
    ) -> Result<ClipReport, ExtractError> {
        if !(MIN_MINUTES..=MAX_MINUTES).contains(&minutes) {
            return Err(ExtractError::InvalidArgument(format!(
                "minutes must be between {} and {}, got {}",
                MIN_MINUTES, MAX_MINUTES, minutes
            )));
        }

        let now = self.clock.now();
        let requested = Duration::from_secs(minutes as u64 * 60);
        // Clamped at the clock origin; coverage is judged against `requested`
        let window_start = now.saturating_sub(requested);

        let output = match output_path {
            Some(path) => path.to_path_buf(),
            None => default_clip_path(
                source.storage_path,
                Utc::now(),
                source.patient,
                minutes,
                self.sink.extension(),
            ),
        };
        let is_json = output
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            return Err(ExtractError::InvalidArgument(format!(
                "{} would collide with the clip's metadata file",
                output.display()
            )));
        }
        let resolved = resolve_path(&output);
        if source.live_paths.iter().any(|p| resolve_path(p) == resolved) {
            return Err(ExtractError::InvalidArgument(format!(
                "{} is a live segment file",
                output.display()
            )));
        }

        // Bounded copy of references; the only time the buffer lock is held
        let snapshot = source.buffer.window(window_start, now).into_frames();

        // Segments fill in what the buffer no longer holds
        let (upper_time, upper_sequence) = match snapshot.first() {
            Some(first) => (first.captured_at, first.sequence),
            None => (now, u64::MAX),
        };
        let needs_segments = upper_time > window_start;
        let segments: Vec<Segment> = if needs_segments {
            source
                .closed_segments
                .into_iter()
                .filter(|s| s.overlaps(window_start, upper_time) && s.first_sequence < upper_sequence)
                .collect()
        } else {
            Vec::new()
        };

        log::info!(
            "[Extract] Saving last {} min ({}): {} buffered frame(s), {} segment(s) to read",
            minutes,
            reason,
            snapshot.len(),
            segments.len()
        );

        let job = ClipJob {
            sink: self.sink.clone(),
            output,
            audio: source.audio,
            window_start,
            requested,
            end: now,
            upper_sequence,
            segments,
            buffered: snapshot,
        };
        let metadata = ClipMetadata {
            session_id: source.session_id.to_string(),
            patient_context: source.patient.clone(),
            reason: reason.to_string(),
            requested_minutes: minutes,
            requested_start: window_start,
            end: now,
            coverage: Coverage::Full,
            frame_count: 0,
            missing_frames: 0,
            segments_used: Vec::new(),
            created_at: Utc::now(),
        };

        let (tx, rx) = bounded(1);
        std::thread::Builder::new()
            .name("rewind-clip-writer".into())
            .spawn(move || {
                let _ = tx.send(job.run(metadata));
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "[Extract] Clip not finished within {:?}, giving up",
                    self.timeout
                );
                Err(ExtractError::DrainTimeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ExtractError::Io(io::Error::other(
                "clip writer thread exited without a result",
            ))),
        }
    }
}

/// Everything the clip worker owns
struct ClipJob {
    sink: Arc<dyn SegmentSink>,
    output: PathBuf,
    audio: AudioSettings,
    window_start: Timestamp,
    requested: Duration,
    end: Timestamp,
    /// Segment frames must precede the first buffered frame
    upper_sequence: u64,
    segments: Vec<Segment>,
    buffered: Vec<Arc<FrameRecord>>,
}

impl ClipJob {
    fn run(self, mut metadata: ClipMetadata) -> Result<ClipReport, ExtractError> {
        let mut frames: Vec<Arc<FrameRecord>> = Vec::new();
        let mut segments_used = Vec::new();

        for segment in &self.segments {
            let before = frames.len();
            self.read_segment_frames(segment, &mut frames);
            if frames.len() > before {
                segments_used.push(segment.segment_number);
            }
        }

        // Strict sequence order across the segment/buffer seam
        for frame in self.buffered.iter() {
            if frames.last().map_or(true, |last| frame.sequence > last.sequence) {
                frames.push(frame.clone());
            }
        }

        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            return Err(ExtractError::EmptyWindow);
        };
        let actual_start = first.captured_at;
        let end = last.captured_at;

        let missing_frames: u64 = frames
            .windows(2)
            .map(|pair| pair[1].sequence.saturating_sub(pair[0].sequence + 1))
            .sum();

        let coverage = coverage_for(&frames, self.end, self.requested);

        self.encode(&frames)?;

        metadata.coverage = coverage;
        metadata.frame_count = frames.len() as u64;
        metadata.missing_frames = missing_frames;
        metadata.segments_used = segments_used.clone();

        let metadata_path = sidecar_path(&self.output);
        write_json_atomic(&metadata_path, &metadata)
            .map_err(|e| io::Error::other(e.to_string()))?;

        match coverage {
            Coverage::Full => log::info!(
                "[Extract] Clip written to {} ({} frames)",
                self.output.display(),
                frames.len()
            ),
            Coverage::Partial { actual_start } => log::warn!(
                "[Extract] Partial clip written to {}: starts at {} instead of {}",
                self.output.display(),
                actual_start,
                self.window_start
            ),
        }
        if missing_frames > 0 {
            log::warn!("[Extract] Clip has {} missing frame(s)", missing_frames);
        }

        Ok(ClipReport {
            path: self.output,
            metadata_path,
            coverage,
            requested_start: self.window_start,
            actual_start,
            end,
            frame_count: frames.len() as u64,
            missing_frames,
            segments_used,
        })
    }

    fn read_segment_frames(&self, segment: &Segment, out: &mut Vec<Arc<FrameRecord>>) {
        let reader = match self.sink.read_segment(&segment.file_path) {
            Ok(reader) => reader,
            Err(e) => {
                log::warn!(
                    "[Extract] Segment {} unavailable ({}): {}",
                    segment.segment_number,
                    segment.file_path.display(),
                    e
                );
                return;
            }
        };

        for frame in reader {
            match frame {
                Ok(frame) => {
                    if frame.sequence >= self.upper_sequence || frame.captured_at > self.end {
                        break;
                    }
                    if frame.captured_at < self.window_start {
                        continue;
                    }
                    if out.last().map_or(true, |last| frame.sequence > last.sequence) {
                        out.push(Arc::new(frame));
                    }
                }
                Err(e) => {
                    log::warn!(
                        "[Extract] Stopped reading segment {}: {}",
                        segment.segment_number,
                        e
                    );
                    break;
                }
            }
        }
    }

    fn encode(&self, frames: &[Arc<FrameRecord>]) -> io::Result<()> {
        let mut file = self.sink.open_segment(&SegmentSpec {
            path: self.output.clone(),
            segment_number: 0,
            audio: self.audio,
        })?;
        for frame in frames {
            file.write(frame)?;
        }
        file.close()
    }
}

/// Absolute form of `path` with `.` and `..` folded away and the parent
/// directory's symlinks resolved when it exists
fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(dir) => dir.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut normal = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            other => normal.push(other.as_os_str()),
        }
    }

    match (normal.parent(), normal.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => parent.join(name),
            Err(_) => normal,
        },
        _ => normal,
    }
}

/// `Full` iff the frames reach back to within one mean frame interval of
/// `end - requested`. A session younger than `requested` is never `Full`.
fn coverage_for(frames: &[Arc<FrameRecord>], end: Timestamp, requested: Duration) -> Coverage {
    let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
        return Coverage::Partial { actual_start: end };
    };
    let interval = if frames.len() > 1 {
        last.captured_at.duration_since(first.captured_at) / (frames.len() as u32 - 1)
    } else {
        Duration::ZERO
    };

    if end.duration_since(first.captured_at) + interval >= requested {
        Coverage::Full
    } else {
        Coverage::Partial {
            actual_start: first.captured_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::FrameFileSink;
    use crate::recording::clock::ManualClock;
    use crate::recording::frame::RawFrame;

    fn frame(clock: &ManualClock, seq: u64, secs: u64) -> Arc<FrameRecord> {
        Arc::new(FrameRecord::new(
            seq,
            clock.at(Duration::from_secs(secs)),
            RawFrame::video(vec![seq as u8; 100]),
        ))
    }

    fn source<'a>(
        buffer: &'a CircularBuffer,
        patient: &'a PatientContext,
        storage: &'a Path,
    ) -> ExtractSource<'a> {
        ExtractSource {
            session_id: "s1",
            patient,
            storage_path: storage,
            buffer,
            closed_segments: Vec::new(),
            live_paths: Vec::new(),
            audio: AudioSettings::default(),
        }
    }

    #[test]
    fn test_coverage_within_one_interval_is_full() {
        let clock = ManualClock::default();
        let frames: Vec<_> = (0..10).map(|i| frame(&clock, i + 1, 10 + i * 2)).collect();
        let end = clock.at(Duration::from_secs(28));
        // Window opens 1 s before the first frame, interval is 2 s
        assert_eq!(
            coverage_for(&frames, end, Duration::from_secs(19)),
            Coverage::Full
        );
        assert_eq!(
            coverage_for(&frames, end, Duration::from_secs(23)),
            Coverage::Partial {
                actual_start: clock.at(Duration::from_secs(10))
            }
        );
    }

    #[test]
    fn test_window_reaching_before_clock_origin_is_partial() {
        let clock = ManualClock::default();
        // Everything since the origin, but only 30 s of it
        let frames: Vec<_> = (0..=30).map(|i| frame(&clock, i + 1, i)).collect();
        assert_eq!(
            coverage_for(
                &frames,
                clock.at(Duration::from_secs(30)),
                Duration::from_secs(60)
            ),
            Coverage::Partial {
                actual_start: clock.at(Duration::ZERO)
            }
        );
    }

    #[test]
    fn test_rejects_out_of_range_minutes() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let buffer = CircularBuffer::new(1 << 20).unwrap();
        let patient = PatientContext::new("P1", "");
        let extractor =
            RetroactiveExtractor::new(Arc::new(FrameFileSink), clock, Duration::from_secs(5));

        for minutes in [0, 61] {
            let err = extractor
                .save_last(source(&buffer, &patient, tmp.path()), minutes, "test", None)
                .unwrap_err();
            assert!(matches!(err, ExtractError::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_empty_buffer_is_empty_window() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let buffer = CircularBuffer::new(1 << 20).unwrap();
        let patient = PatientContext::new("P1", "");
        let extractor =
            RetroactiveExtractor::new(Arc::new(FrameFileSink), clock, Duration::from_secs(5));

        let err = extractor
            .save_last(source(&buffer, &patient, tmp.path()), 1, "test", None)
            .unwrap_err();
        assert!(matches!(err, ExtractError::EmptyWindow));
    }

    #[test]
    fn test_buffer_only_clip_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let buffer = CircularBuffer::new(1 << 20).unwrap();
        for secs in 0..=120 {
            buffer.append(frame(&clock, secs + 1, secs)).unwrap();
        }
        clock.set(Duration::from_secs(120));

        let patient = PatientContext::new("P1", "");
        let extractor = RetroactiveExtractor::new(
            Arc::new(FrameFileSink),
            clock.clone(),
            Duration::from_secs(5),
        );
        let output = tmp.path().join("clip.rseg");
        let report = extractor
            .save_last(
                source(&buffer, &patient, tmp.path()),
                1,
                "incident",
                Some(&output),
            )
            .unwrap();

        assert_eq!(report.coverage, Coverage::Full);
        assert_eq!(report.frame_count, 61);
        assert_eq!(report.actual_start, clock.at(Duration::from_secs(60)));
        assert_eq!(report.missing_frames, 0);
        assert!(report.segments_used.is_empty());

        let read: Vec<FrameRecord> = FrameFileSink
            .read_segment(&output)
            .unwrap()
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(read.len(), 61);
        assert_eq!(read[0].sequence, 61);

        let sidecar: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report.metadata_path).unwrap()).unwrap();
        assert_eq!(sidecar["reason"], "incident");
        assert_eq!(sidecar["coverage"]["kind"], "full");
    }

    #[test]
    fn test_refuses_to_overwrite_live_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let buffer = CircularBuffer::new(1 << 20).unwrap();
        buffer.append(frame(&clock, 1, 0)).unwrap();
        let patient = PatientContext::new("P1", "");
        let live = tmp.path().join("segment_0001.rseg");

        let mut src = source(&buffer, &patient, tmp.path());
        src.live_paths = vec![live.clone()];
        let extractor =
            RetroactiveExtractor::new(Arc::new(FrameFileSink), clock, Duration::from_secs(5));
        let err = extractor.save_last(src, 1, "test", Some(&live)).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidArgument(_)));
    }

    #[test]
    fn test_refuses_live_segment_behind_dot_dot() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let buffer = CircularBuffer::new(1 << 20).unwrap();
        buffer.append(frame(&clock, 1, 0)).unwrap();
        let patient = PatientContext::new("P1", "");
        let live = tmp.path().join("segment_0001.rseg");
        std::fs::write(&live, b"live").unwrap();
        let disguised = tmp
            .path()
            .join("missing")
            .join("..")
            .join(".")
            .join("segment_0001.rseg");

        let mut src = source(&buffer, &patient, tmp.path());
        src.live_paths = vec![live.clone()];
        let extractor =
            RetroactiveExtractor::new(Arc::new(FrameFileSink), clock, Duration::from_secs(5));
        let err = extractor
            .save_last(src, 1, "test", Some(&disguised))
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidArgument(_)));
        assert_eq!(std::fs::read(&live).unwrap(), b"live");
    }

    #[test]
    fn test_refuses_json_clip_path() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let buffer = CircularBuffer::new(1 << 20).unwrap();
        buffer.append(frame(&clock, 1, 0)).unwrap();
        let patient = PatientContext::new("P1", "");
        let extractor =
            RetroactiveExtractor::new(Arc::new(FrameFileSink), clock, Duration::from_secs(5));

        let output = tmp.path().join("clip.JSON");
        let err = extractor
            .save_last(source(&buffer, &patient, tmp.path()), 1, "test", Some(&output))
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidArgument(_)));
        assert!(!output.exists());
    }
}
