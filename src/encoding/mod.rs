// Segment persistence: the downstream sink contract and the background writer
//
// The recording engine never encodes media itself. It hands frames to a
// `SegmentSink`, which owns the container format. To add a new container:
// 1. Implement `SegmentFile` for the open-file handle
// 2. Implement `SegmentSink` (open, read back, file extension)
// 3. Pass the sink to `Recorder::new`

pub mod frame_file;
pub mod writer;

pub use frame_file::FrameFileSink;
pub use writer::{SegmentWriter, WriterOutcome, WriterSettings};

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::recording::frame::FrameRecord;

/// Audio parameters carried into every segment and clip header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub enabled: bool,
    pub sample_rate: u32,
    pub bitrate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48000,
            bitrate: 128000,
        }
    }
}

/// Everything a sink needs to open an output file
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    pub path: PathBuf,
    /// 1-based segment number, 0 for extracted clips
    pub segment_number: u32,
    pub audio: AudioSettings,
}

/// An open output file. Owned by exactly one thread at a time.
pub trait SegmentFile: Send {
    fn write(&mut self, frame: &FrameRecord) -> io::Result<()>;

    /// Flush and close. The file is complete once this returns `Ok`.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Frames read back from a closed file, in file order
pub type FrameReader = Box<dyn Iterator<Item = io::Result<FrameRecord>> + Send>;

/// Downstream persistence collaborator
pub trait SegmentSink: Send + Sync {
    /// File extension (without the dot) for segments and clips
    fn extension(&self) -> &str;

    fn open_segment(&self, spec: &SegmentSpec) -> io::Result<Box<dyn SegmentFile>>;

    /// Read a closed file back. Used to extend retroactive clips past the buffer.
    fn read_segment(&self, path: &Path) -> io::Result<FrameReader>;
}
