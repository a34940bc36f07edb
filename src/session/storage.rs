// Session folder management: directory layout and manifest persistence

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{sanitize_path_component, PatientContext, SessionManifest};

pub const MANIFEST_FILE: &str = "session.json";
pub const CLIPS_DIR: &str = "clips";

/// Folder for a new session: `<storage>/<YYYYmmdd-HHMMSS>_<patient-id>`
pub fn session_dir(storage: &Path, started_at: DateTime<Utc>, patient: &PatientContext) -> PathBuf {
    storage.join(format!(
        "{}_{}",
        started_at.format("%Y%m%d-%H%M%S"),
        sanitize_path_component(&patient.patient_id)
    ))
}

/// Create the session folder, suffixing it if a folder with the same name exists
pub fn create_session_dir(
    storage: &Path,
    started_at: DateTime<Utc>,
    patient: &PatientContext,
) -> std::io::Result<PathBuf> {
    let base = session_dir(storage, started_at, patient);
    let mut candidate = base.clone();
    let mut attempt = 1;
    while candidate.exists() {
        attempt += 1;
        candidate = PathBuf::from(format!("{}-{}", base.display(), attempt));
    }
    std::fs::create_dir_all(&candidate)?;
    Ok(candidate)
}

pub fn segment_path(session_dir: &Path, segment_number: u32, extension: &str) -> PathBuf {
    session_dir.join(format!("segment_{:04}.{}", segment_number, extension))
}

pub fn clips_dir(storage: &Path) -> PathBuf {
    storage.join(CLIPS_DIR)
}

/// Default clip path: `<storage>/clips/clip_<YYYYmmdd-HHMMSS>_<patient-id>_<N>m.<ext>`
pub fn default_clip_path(
    storage: &Path,
    created_at: DateTime<Utc>,
    patient: &PatientContext,
    minutes: u32,
    extension: &str,
) -> PathBuf {
    clips_dir(storage).join(format!(
        "clip_{}_{}_{}m.{}",
        created_at.format("%Y%m%d-%H%M%S%.3f"),
        sanitize_path_component(&patient.patient_id),
        minutes,
        extension
    ))
}

/// Sidecar path for a clip (`clip.rseg` -> `clip.json`)
pub fn sidecar_path(clip_path: &Path) -> PathBuf {
    clip_path.with_extension("json")
}

/// Serialize `value` as pretty JSON and write it atomically (temp file + rename)
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn write_manifest(manifest: &SessionManifest) -> anyhow::Result<PathBuf> {
    let path = manifest.path.join(MANIFEST_FILE);
    write_json_atomic(&path, manifest)?;
    Ok(path)
}

pub fn load_manifest(session_dir: &Path) -> anyhow::Result<SessionManifest> {
    let contents = std::fs::read_to_string(session_dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Segment files present in a session folder, in segment-number order
pub fn list_segment_files(session_dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(session_dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            let is_segment = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("segment_"))
                .unwrap_or(false);
            is_segment && path.extension().and_then(|e| e.to_str()) == Some(extension)
        })
        .collect();
    // Zero-padded numbers sort lexicographically
    files.sort();
    Ok(files)
}
