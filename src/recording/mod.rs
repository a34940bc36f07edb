// Recording engine: ingest, buffering, lifecycle and retroactive extraction

pub mod buffer;
pub mod clock;
pub mod events;
pub mod extract;
pub mod frame;
pub mod pressure;
pub mod recorder;
pub mod state;
pub mod stats;
pub mod supervisor;

pub use buffer::{BufferError, BufferWindow, CircularBuffer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{EventBus, RecorderEvent};
pub use extract::{ClipReport, ExtractError, RetroactiveExtractor};
pub use frame::{FrameKind, FrameRecord, RawFrame, Timestamp};
pub use pressure::{MemoryBudget, MemoryPressureMonitor};
pub use recorder::{IngestError, IngestReceipt, Recorder, RecorderError, SessionHandle, StopReport};
pub use state::{RecordingState, RecordingStatus, StopReason};
pub use stats::{PerformanceMetrics, RecordingStatistics, StatisticsCollector};
