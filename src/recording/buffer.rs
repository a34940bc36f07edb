// Byte-bounded circular buffer of recent frames
// Keeps the newest content in memory; the oldest frames fall off the head

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use super::frame::{FrameRecord, Timestamp};

/// Error type for buffer operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer capacity must be greater than zero")]
    ZeroCapacity,

    #[error("Frame of {frame_bytes} bytes exceeds buffer capacity of {capacity_bytes} bytes")]
    FrameTooLarge {
        frame_bytes: usize,
        capacity_bytes: usize,
    },
}

/// Result of an offload pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadReport {
    pub frames: usize,
    pub bytes: usize,
}

/// Running totals kept by the buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCounters {
    pub frames_evicted: u64,
    pub bytes_evicted: u64,
    pub frames_offloaded: u64,
    pub bytes_offloaded: u64,
}

struct BufferState {
    /// Arrival order == sequence order == time order
    frames: VecDeque<Arc<FrameRecord>>,
    total_bytes: usize,
    counters: BufferCounters,
}

/// Fixed-capacity FIFO of the most recent frames.
///
/// `sum(byte_size) <= capacity_bytes` holds after every append. Readers take a
/// snapshot of `Arc` references under a short read lock, so a window never holds
/// the lock while the caller walks or encodes it.
pub struct CircularBuffer {
    state: RwLock<BufferState>,
    capacity_bytes: usize,
}

impl CircularBuffer {
    pub fn new(capacity_bytes: usize) -> Result<Self, BufferError> {
        if capacity_bytes == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        Ok(Self {
            state: RwLock::new(BufferState {
                frames: VecDeque::new(),
                total_bytes: 0,
                counters: BufferCounters::default(),
            }),
            capacity_bytes,
        })
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Append at the tail, evicting from the head until the capacity invariant holds.
    /// Returns the number of frames evicted.
    pub fn append(&self, frame: Arc<FrameRecord>) -> Result<usize, BufferError> {
        let frame_bytes = frame.byte_size();
        if frame_bytes > self.capacity_bytes {
            return Err(BufferError::FrameTooLarge {
                frame_bytes,
                capacity_bytes: self.capacity_bytes,
            });
        }

        let mut state = self.state.write();
        state.total_bytes += frame_bytes;
        state.frames.push_back(frame);

        let mut evicted = 0;
        while state.total_bytes > self.capacity_bytes {
            let Some(removed) = state.frames.pop_front() else {
                break;
            };
            state.total_bytes = state.total_bytes.saturating_sub(removed.byte_size());
            state.counters.frames_evicted += 1;
            state.counters.bytes_evicted += removed.byte_size() as u64;
            evicted += 1;
        }

        if evicted > 0 {
            log::trace!(
                "[Buffer] Evicted {} frame(s), {} bytes buffered",
                evicted,
                state.total_bytes
            );
        }

        Ok(evicted)
    }

    /// Drop the oldest `fraction` of currently buffered bytes, always at a frame boundary.
    /// At least one frame is dropped when the buffer is non-empty and `fraction > 0`.
    pub fn offload(&self, fraction: f64) -> OffloadReport {
        let mut state = self.state.write();
        if state.frames.is_empty() || fraction <= 0.0 {
            return OffloadReport::default();
        }

        let target = ((state.total_bytes as f64) * fraction.min(1.0)).ceil() as usize;
        let mut report = OffloadReport::default();

        while report.bytes < target || report.frames == 0 {
            let Some(removed) = state.frames.pop_front() else {
                break;
            };
            report.frames += 1;
            report.bytes += removed.byte_size();
        }

        state.total_bytes = state.total_bytes.saturating_sub(report.bytes);
        state.counters.frames_offloaded += report.frames as u64;
        state.counters.bytes_offloaded += report.bytes as u64;
        report
    }

    /// Snapshot of the frames whose capture time lies in `[from, to]` (inclusive).
    ///
    /// Returns fewer frames than requested when the start of the range has already
    /// fallen off the head; that is a partial result, not an error.
    pub fn window(&self, from: Timestamp, to: Timestamp) -> BufferWindow {
        if from > to {
            return BufferWindow { frames: Vec::new() };
        }

        let state = self.state.read();
        let start = state.frames.partition_point(|f| f.captured_at < from);
        let end = state.frames.partition_point(|f| f.captured_at <= to);
        let frames = if start < end {
            state.frames.range(start..end).cloned().collect()
        } else {
            Vec::new()
        };
        BufferWindow { frames }
    }

    /// Snapshot of everything currently buffered
    pub fn snapshot(&self) -> BufferWindow {
        let state = self.state.read();
        BufferWindow {
            frames: state.frames.iter().cloned().collect(),
        }
    }

    pub fn oldest_time(&self) -> Option<Timestamp> {
        self.state.read().frames.front().map(|f| f.captured_at)
    }

    pub fn newest_time(&self) -> Option<Timestamp> {
        self.state.read().frames.back().map(|f| f.captured_at)
    }

    pub fn total_bytes(&self) -> usize {
        self.state.read().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state.read().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().frames.is_empty()
    }

    pub fn counters(&self) -> BufferCounters {
        self.state.read().counters
    }

    /// Discard all buffered frames
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.frames.clear();
        state.total_bytes = 0;
    }
}

/// Point-in-time copy of a range of buffered frames.
///
/// Finite and restartable: `iter()` may be called any number of times.
#[derive(Debug, Clone, Default)]
pub struct BufferWindow {
    frames: Vec<Arc<FrameRecord>>,
}

impl BufferWindow {
    pub fn iter(&self) -> std::slice::Iter<'_, Arc<FrameRecord>> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn first(&self) -> Option<&Arc<FrameRecord>> {
        self.frames.first()
    }

    pub fn last(&self) -> Option<&Arc<FrameRecord>> {
        self.frames.last()
    }

    pub fn into_frames(self) -> Vec<Arc<FrameRecord>> {
        self.frames
    }
}

impl<'a> IntoIterator for &'a BufferWindow {
    type Item = &'a Arc<FrameRecord>;
    type IntoIter = std::slice::Iter<'a, Arc<FrameRecord>>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::frame::RawFrame;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn time_of(i: u64) -> Timestamp {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        Timestamp::new(
            Duration::from_secs(i),
            base + chrono::Duration::seconds(i as i64),
        )
    }

    fn frame(seq: u64, bytes: usize) -> Arc<FrameRecord> {
        Arc::new(FrameRecord::new(
            seq,
            time_of(seq),
            RawFrame::video(vec![0u8; bytes]),
        ))
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            CircularBuffer::new(0).err(),
            Some(BufferError::ZeroCapacity)
        );
    }

    #[test]
    fn test_hundred_unit_capacity_keeps_last_hundred() {
        let buffer = CircularBuffer::new(100).unwrap();
        for seq in 1..=150 {
            buffer.append(frame(seq, 1)).unwrap();
        }

        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.oldest_time(), Some(time_of(51)));
        assert_eq!(buffer.newest_time(), Some(time_of(150)));

        let window = buffer.window(time_of(120), time_of(140));
        let seqs: Vec<u64> = window.iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, (120..=140).collect::<Vec<_>>());
    }

    #[test]
    fn test_capacity_invariant_holds_for_mixed_sizes() {
        let buffer = CircularBuffer::new(1000).unwrap();
        for seq in 1..=500u64 {
            let size = ((seq * 37) % 250 + 1) as usize;
            buffer.append(frame(seq, size)).unwrap();
            assert!(buffer.total_bytes() <= 1000);
        }
    }

    #[test]
    fn test_eviction_always_removes_oldest() {
        let buffer = CircularBuffer::new(64).unwrap();
        for seq in 1..=300u64 {
            let size = ((seq * 13) % 16 + 1) as usize;
            buffer.append(frame(seq, size)).unwrap();

            let seqs: Vec<u64> = buffer.snapshot().iter().map(|f| f.sequence).collect();
            // Survivors are always a contiguous run ending at the newest frame
            let first = seqs[0];
            assert_eq!(seqs, (first..=seq).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_append_reports_evictions() {
        let buffer = CircularBuffer::new(10).unwrap();
        for seq in 1..=5 {
            assert_eq!(buffer.append(frame(seq, 2)).unwrap(), 0);
        }
        assert_eq!(buffer.append(frame(6, 5)).unwrap(), 3);
        assert_eq!(buffer.counters().frames_evicted, 3);
        assert_eq!(buffer.counters().bytes_evicted, 6);
    }

    #[test]
    fn test_frame_larger_than_capacity_rejected() {
        let buffer = CircularBuffer::new(10).unwrap();
        buffer.append(frame(1, 4)).unwrap();
        let err = buffer.append(frame(2, 11)).unwrap_err();
        assert_eq!(
            err,
            BufferError::FrameTooLarge {
                frame_bytes: 11,
                capacity_bytes: 10
            }
        );
        // Nothing was partially buffered or evicted
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.total_bytes(), 4);
    }

    #[test]
    fn test_window_partial_when_start_evicted() {
        let buffer = CircularBuffer::new(10).unwrap();
        for seq in 1..=30 {
            buffer.append(frame(seq, 1)).unwrap();
        }
        let window = buffer.window(time_of(5), time_of(25));
        assert_eq!(window.first().map(|f| f.sequence), Some(21));
        assert_eq!(window.last().map(|f| f.sequence), Some(25));
    }

    #[test]
    fn test_window_is_restartable_and_detached() {
        let buffer = CircularBuffer::new(100).unwrap();
        for seq in 1..=10 {
            buffer.append(frame(seq, 1)).unwrap();
        }
        let window = buffer.window(time_of(3), time_of(6));
        buffer.clear();

        let first_pass: Vec<u64> = window.iter().map(|f| f.sequence).collect();
        let second_pass: Vec<u64> = (&window).into_iter().map(|f| f.sequence).collect();
        assert_eq!(first_pass, vec![3, 4, 5, 6]);
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn test_window_outside_range_is_empty() {
        let buffer = CircularBuffer::new(100).unwrap();
        for seq in 10..=20 {
            buffer.append(frame(seq, 1)).unwrap();
        }
        assert!(buffer.window(time_of(30), time_of(40)).is_empty());
        assert!(buffer.window(time_of(15), time_of(12)).is_empty());
    }

    #[test]
    fn test_offload_drops_fraction_from_head() {
        let buffer = CircularBuffer::new(1000).unwrap();
        for seq in 1..=10 {
            buffer.append(frame(seq, 10)).unwrap();
        }
        let report = buffer.offload(0.25);
        // 25 bytes requested -> three whole 10-byte frames
        assert_eq!(report, OffloadReport { frames: 3, bytes: 30 });
        assert_eq!(buffer.oldest_time(), Some(time_of(4)));
        assert_eq!(buffer.total_bytes(), 70);
        assert_eq!(buffer.counters().frames_offloaded, 3);
    }

    #[test]
    fn test_offload_on_empty_buffer_is_noop() {
        let buffer = CircularBuffer::new(1000).unwrap();
        assert_eq!(buffer.offload(0.5), OffloadReport::default());
    }
}
