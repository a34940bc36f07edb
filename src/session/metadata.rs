// Session metadata structures

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recording::frame::Timestamp;
use crate::recording::state::StopReason;

/// Sanitize a free-text value for use in file and folder names.
/// Replaces spaces, slashes, backslashes, colons and other reserved characters with underscores.
pub fn sanitize_path_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '^' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Who and what a recording session is about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientContext {
    pub patient_id: String,
    #[serde(default)]
    pub patient_name: String,
    #[serde(default)]
    pub study_description: Option<String>,
    #[serde(default)]
    pub accession_number: Option<String>,
}

impl PatientContext {
    pub fn new(patient_id: impl Into<String>, patient_name: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            patient_name: patient_name.into(),
            study_description: None,
            accession_number: None,
        }
    }

    pub fn with_study(mut self, description: impl Into<String>) -> Self {
        self.study_description = Some(description.into());
        self
    }

    pub fn display_name(&self) -> String {
        if self.patient_name.is_empty() {
            self.patient_id.clone()
        } else {
            format!("{} ({})", self.patient_name, self.patient_id)
        }
    }
}

/// A closed, persisted, time-contiguous range of frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// 1-based, increasing
    pub segment_number: u32,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub file_path: PathBuf,
    pub frame_count: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub bytes_written: u64,
    /// At least one write to this segment was lost
    #[serde(default)]
    pub degraded: bool,
}

impl Segment {
    pub fn duration(&self) -> Duration {
        self.end_time.duration_since(self.start_time)
    }

    /// Whether the segment's time range intersects `[from, to)`
    pub fn overlaps(&self, from: Timestamp, to: Timestamp) -> bool {
        self.start_time < to && self.end_time >= from
    }
}

/// Running totals frozen at stop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTotals {
    pub total_frames: u64,
    pub total_bytes: u64,
    pub frames_evicted: u64,
    pub frames_offloaded: u64,
    pub persistence_dropped: u64,
    pub write_failures: u64,
    pub frames_rejected: u64,
}

/// Complete session description, written to `session.json` on stop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    /// Unique session ID
    pub id: String,
    pub patient_context: PatientContext,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    /// Path to session folder
    pub path: PathBuf,
    pub segments: Vec<Segment>,
    pub totals: SessionTotals,
    /// Stop gave up waiting for the writer
    #[serde(default)]
    pub drain_timed_out: bool,
}

impl SessionManifest {
    pub fn duration_secs(&self) -> f64 {
        match self.stopped_at {
            Some(stopped) => (stopped - self.started_at).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        }
    }
}

/// Coverage of an extracted clip
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Coverage {
    /// The whole requested window is in the clip
    Full,
    /// The clip starts later than requested
    Partial { actual_start: Timestamp },
}

impl Coverage {
    pub fn is_partial(&self) -> bool {
        matches!(self, Coverage::Partial { .. })
    }
}

/// Sidecar written next to every extracted clip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipMetadata {
    pub session_id: String,
    pub patient_context: PatientContext,
    pub reason: String,
    pub requested_minutes: u32,
    pub requested_start: Timestamp,
    pub end: Timestamp,
    pub coverage: Coverage,
    pub frame_count: u64,
    pub missing_frames: u64,
    pub segments_used: Vec<u32>,
    pub created_at: DateTime<Utc>,
}
