// Rewind - continuous recording with retroactive clip extraction
// Main library entry point

pub mod config;
pub mod devices;
pub mod encoding;
pub mod recording;
pub mod session;

pub use config::{ConfigError, RecorderConfig};
pub use encoding::{FrameFileSink, SegmentFile, SegmentSink, SegmentSpec};
pub use recording::{
    ClipReport, Clock, ExtractError, IngestError, ManualClock, RawFrame, Recorder, RecorderError,
    RecorderEvent, RecordingStatistics, RecordingStatus, SessionHandle, StopReason, StopReport,
    SystemClock, Timestamp,
};
pub use session::{Coverage, PatientContext, Segment, SessionManifest};
