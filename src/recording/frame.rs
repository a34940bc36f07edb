// Frame records and capture timestamps

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capture timestamp: a monotonic offset (ordering) paired with wall-clock time (display).
///
/// Ordering and arithmetic use the monotonic part. The wall-clock part is carried along
/// so persisted segments and clips can be labelled in real time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Nanoseconds on the producer's monotonic clock
    pub monotonic_ns: u64,
    /// Wall-clock time at capture
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    pub fn new(monotonic: Duration, wall: DateTime<Utc>) -> Self {
        Self {
            monotonic_ns: monotonic.as_nanos() as u64,
            wall,
        }
    }

    pub fn monotonic(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns)
    }

    /// Time elapsed between `earlier` and `self`, zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.monotonic_ns.saturating_sub(earlier.monotonic_ns))
    }

    pub fn saturating_sub(&self, delta: Duration) -> Timestamp {
        let delta_ns = delta.as_nanos() as u64;
        let applied = delta_ns.min(self.monotonic_ns);
        Timestamp {
            monotonic_ns: self.monotonic_ns - applied,
            wall: self.wall - chrono::Duration::nanoseconds(applied as i64),
        }
    }

    pub fn add(&self, delta: Duration) -> Timestamp {
        let delta_ns = delta.as_nanos() as u64;
        Timestamp {
            monotonic_ns: self.monotonic_ns.saturating_add(delta_ns),
            wall: self.wall + chrono::Duration::nanoseconds(delta_ns as i64),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}s ({})",
            self.monotonic().as_secs_f64(),
            self.wall.format("%H:%M:%S%.3f")
        )
    }
}

/// Kind of captured media unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Video,
    Audio,
}

impl FrameKind {
    pub fn as_byte(&self) -> u8 {
        match self {
            FrameKind::Video => 0,
            FrameKind::Audio => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<FrameKind> {
        match b {
            0 => Some(FrameKind::Video),
            1 => Some(FrameKind::Audio),
            _ => None,
        }
    }
}

/// A frame as delivered by the upstream producer, before ingest assigns it a sequence
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn video(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Video,
            payload,
        }
    }

    pub fn audio(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Audio,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// One captured unit as held by the buffer and the persistence path.
///
/// Immutable once created; shared as `Arc<FrameRecord>` between the circular buffer
/// and the segment writer queue so neither copies the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub sequence: u64,
    pub captured_at: Timestamp,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl FrameRecord {
    pub fn new(sequence: u64, captured_at: Timestamp, raw: RawFrame) -> Self {
        Self {
            sequence,
            captured_at,
            kind: raw.kind,
            payload: raw.payload,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.payload.len()
    }
}
