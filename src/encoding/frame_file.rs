//! Default on-disk container (`.rseg`).
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! header:  "RSEG" | version u16 | audio_enabled u8 | sample_rate u32 | bitrate u32
//! record:  sequence u64 | monotonic_ns u64 | wall_ns i64 | kind u8 | len u32 | payload
//! ```
//!
//! Records are appended as frames arrive, so a file cut short by a crash is still
//! readable up to the last complete record. A write that fails part way leaves
//! nothing behind: the partial record is cut off before the next one goes in.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::DateTime;

use super::{AudioSettings, FrameReader, SegmentFile, SegmentSink, SegmentSpec};
use crate::recording::frame::{FrameKind, FrameRecord, Timestamp};

pub const MAGIC: &[u8; 4] = b"RSEG";
pub const VERSION: u16 = 1;
pub const EXTENSION: &str = "rseg";

const HEADER_LEN: usize = 4 + 2 + 1 + 4 + 4;
const RECORD_HEADER_LEN: usize = 8 + 8 + 8 + 1 + 4;

/// Writes and reads `.rseg` files
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFileSink;

impl FrameFileSink {
    pub fn new() -> Self {
        Self
    }
}

impl SegmentSink for FrameFileSink {
    fn extension(&self) -> &str {
        EXTENSION
    }

    fn open_segment(&self, spec: &SegmentSpec) -> io::Result<Box<dyn SegmentFile>> {
        if let Some(parent) = spec.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&spec.path)?;
        Ok(Box::new(FrameFile::create(file, spec)?))
    }

    fn read_segment(&self, path: &Path) -> io::Result<FrameReader> {
        let (reader, _) = FrameFileReader::open(path)?;
        Ok(Box::new(reader))
    }
}

/// Where a frame file's bytes go. `File` outside of tests.
trait RecordStore: Write + Seek + Send {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl RecordStore for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

struct FrameFile<S: RecordStore = File> {
    writer: BufWriter<S>,
    path: PathBuf,
    /// File header plus every complete record
    committed: u64,
    /// A write failed; bytes past `committed` are garbage
    dirty: bool,
}

impl<S: RecordStore> FrameFile<S> {
    fn create(store: S, spec: &SegmentSpec) -> io::Result<Self> {
        let mut writer = BufWriter::new(store);
        write_header(&mut writer, &spec.audio)?;
        Ok(Self {
            writer,
            path: spec.path.clone(),
            committed: HEADER_LEN as u64,
            dirty: false,
        })
    }

    /// Push out what is buffered and cut the file back to the last complete record
    fn discard_partial(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let store = self.writer.get_mut();
        store.truncate(self.committed)?;
        store.seek(SeekFrom::Start(self.committed))?;
        self.dirty = false;
        log::debug!(
            "[FrameFile] Dropped partial record in {} after a failed write",
            self.path.display()
        );
        Ok(())
    }
}

impl<S: RecordStore + 'static> SegmentFile for FrameFile<S> {
    fn write(&mut self, frame: &FrameRecord) -> io::Result<()> {
        if self.dirty {
            self.discard_partial()?;
        }

        let wall_ns = frame.captured_at.wall.timestamp_nanos_opt().unwrap_or(0);
        let mut header = [0u8; RECORD_HEADER_LEN];
        header[0..8].copy_from_slice(&frame.sequence.to_le_bytes());
        header[8..16].copy_from_slice(&frame.captured_at.monotonic_ns.to_le_bytes());
        header[16..24].copy_from_slice(&wall_ns.to_le_bytes());
        header[24] = frame.kind.as_byte();
        header[25..29].copy_from_slice(&(frame.payload.len() as u32).to_le_bytes());

        let written = self
            .writer
            .write_all(&header)
            .and_then(|()| self.writer.write_all(&frame.payload));
        match written {
            Ok(()) => {
                self.committed += (RECORD_HEADER_LEN + frame.payload.len()) as u64;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                Err(e)
            }
        }
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        if self.dirty {
            self.discard_partial()?;
        }
        let FrameFile { writer, path, .. } = *self;
        let mut store = writer.into_inner().map_err(|e| e.into_error())?;
        store.sync()?;
        log::debug!("[FrameFile] Closed {}", path.display());
        Ok(())
    }
}

fn write_header<W: Write>(writer: &mut W, audio: &AudioSettings) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = audio.enabled as u8;
    header[7..11].copy_from_slice(&audio.sample_rate.to_le_bytes());
    header[11..15].copy_from_slice(&audio.bitrate.to_le_bytes());
    writer.write_all(&header)
}

/// Read as many bytes as are available up to `buf.len()`
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streaming reader over the records of one `.rseg` file
pub struct FrameFileReader {
    reader: BufReader<File>,
    path: PathBuf,
    finished: bool,
}

impl FrameFileReader {
    /// Open a file and validate its header
    pub fn open(path: &Path) -> io::Result<(Self, AudioSettings)> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a frame file", path.display()),
            ));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported frame file version {}", version),
            ));
        }

        let audio = AudioSettings {
            enabled: header[6] != 0,
            sample_rate: u32::from_le_bytes([header[7], header[8], header[9], header[10]]),
            bitrate: u32::from_le_bytes([header[11], header[12], header[13], header[14]]),
        };

        Ok((
            Self {
                reader,
                path: path.to_path_buf(),
                finished: false,
            },
            audio,
        ))
    }

    fn read_record(&mut self) -> io::Result<Option<FrameRecord>> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        let got = read_up_to(&mut self.reader, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < RECORD_HEADER_LEN {
            self.warn_truncated();
            return Ok(None);
        }

        let sequence = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
        let monotonic_ns = u64::from_le_bytes(header[8..16].try_into().unwrap_or_default());
        let wall_ns = i64::from_le_bytes(header[16..24].try_into().unwrap_or_default());
        let kind = FrameKind::from_byte(header[24]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown frame kind {} in {}", header[24], self.path.display()),
            )
        })?;
        let len = u32::from_le_bytes(header[25..29].try_into().unwrap_or_default()) as usize;

        let mut payload = vec![0u8; len];
        if read_up_to(&mut self.reader, &mut payload)? < len {
            self.warn_truncated();
            return Ok(None);
        }

        Ok(Some(FrameRecord {
            sequence,
            captured_at: Timestamp {
                monotonic_ns,
                wall: DateTime::from_timestamp_nanos(wall_ns),
            },
            kind,
            payload,
        }))
    }

    fn warn_truncated(&self) {
        log::warn!(
            "[FrameFile] {} ends with a truncated record, stopping there",
            self.path.display()
        );
    }
}

impl Iterator for FrameFileReader {
    type Item = io::Result<FrameRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
