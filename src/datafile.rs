// On-disk container for recorded sample streams.
//
// The format is a fixed binary header followed by the sample region. Samples
// on disk are row-major (one full row of channels per time point, i16 LE),
// which makes a time-range read a single contiguous span; in-memory matrices
// are column-major, so append and read transpose at the boundary. The sample
// count lives at a fixed header offset and is rewritten in place on every
// append, so a crashed recording still opens with the data written so far.

use crate::frame::SampleMatrix;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: &[u8; 8] = b"BLDSDATA";
const VERSION: u32 = 1;
/// Byte offset of the `nsamples` field within the header.
const NSAMPLES_OFFSET: u64 = 28;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("The requested file already exists, remove it first.")]
    AlreadyExists,

    #[error("{0} is not a BLDS data file")]
    BadMagic(PathBuf),

    #[error("unsupported data file version {0}")]
    BadVersion(u32),

    #[error("data file header is corrupt: {0}")]
    BadHeader(String),

    #[error("channel count mismatch: file has {expected}, batch has {got}")]
    ChannelMismatch { expected: u32, got: u32 },

    #[error("requested samples [{start}, {end}) outside recorded data of {len} samples")]
    BadRange { start: u64, end: u64, len: u64 },
}

/// Metadata written into a new data file's header.
#[derive(Debug, Clone, Default)]
pub struct DataFileParams {
    pub nchannels: u32,
    pub sample_rate: f32,
    pub gain: f32,
    pub offset: f32,
    pub device_type: String,
    pub date: String,
    /// HiDens electrode configuration; empty for other device types.
    pub configuration: Vec<u32>,
    /// Size of the analog-output buffer, zero when the device has none.
    pub analog_output_size: u32,
}

/// A single recording on disk, open for reading, writing, or both.
#[derive(Debug)]
pub struct DataFile {
    file: File,
    path: PathBuf,
    params: DataFileParams,
    nsamples: u64,
    data_offset: u64,
}

impl DataFile {
    /// Create a new, empty data file. Fails if `path` already exists.
    pub fn create(path: &Path, params: DataFileParams) -> Result<Self, FileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => FileError::AlreadyExists,
                _ => FileError::Io(e),
            })?;

        let mut header = Vec::with_capacity(128);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&VERSION.to_le_bytes());
        header.extend_from_slice(&params.nchannels.to_le_bytes());
        header.extend_from_slice(&params.sample_rate.to_le_bytes());
        header.extend_from_slice(&params.gain.to_le_bytes());
        header.extend_from_slice(&params.offset.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes()); // nsamples
        write_text(&mut header, &params.device_type);
        write_text(&mut header, &params.date);
        header.extend_from_slice(&(params.configuration.len() as u32).to_le_bytes());
        for electrode in &params.configuration {
            header.extend_from_slice(&electrode.to_le_bytes());
        }
        header.extend_from_slice(&params.analog_output_size.to_le_bytes());
        file.write_all(&header)?;
        file.flush()?;

        let data_offset = header.len() as u64;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            params,
            nsamples: 0,
            data_offset,
        })
    }

    /// Open an existing data file for reading.
    pub fn open(path: &Path) -> Result<Self, FileError> {
        let mut file = OpenOptions::new().read(true).open(path)?;

        let mut fixed = [0u8; 36];
        file.read_exact(&mut fixed)
            .map_err(|_| FileError::BadHeader("file shorter than fixed header".into()))?;
        if &fixed[0..8] != MAGIC {
            return Err(FileError::BadMagic(path.to_path_buf()));
        }
        let version = u32::from_le_bytes(fixed[8..12].try_into().unwrap());
        if version != VERSION {
            return Err(FileError::BadVersion(version));
        }
        let nchannels = u32::from_le_bytes(fixed[12..16].try_into().unwrap());
        let sample_rate = f32::from_le_bytes(fixed[16..20].try_into().unwrap());
        let gain = f32::from_le_bytes(fixed[20..24].try_into().unwrap());
        let offset = f32::from_le_bytes(fixed[24..28].try_into().unwrap());
        let nsamples = u64::from_le_bytes(fixed[28..36].try_into().unwrap());

        let device_type = read_text(&mut file)?;
        let date = read_text(&mut file)?;
        let nconfig = read_u32(&mut file)? as usize;
        let mut configuration = Vec::with_capacity(nconfig);
        for _ in 0..nconfig {
            configuration.push(read_u32(&mut file)?);
        }
        let analog_output_size = read_u32(&mut file)?;
        let data_offset = file.stream_position()?;

        if nchannels == 0 || sample_rate <= 0.0 {
            return Err(FileError::BadHeader(format!(
                "nchannels {nchannels}, sample rate {sample_rate}"
            )));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            params: DataFileParams {
                nchannels,
                sample_rate,
                gain,
                offset,
                device_type,
                date,
                configuration,
                analog_output_size,
            },
            nsamples,
            data_offset,
        })
    }

    /// Append one batch of samples at the current end of the file.
    pub fn append(&mut self, samples: &SampleMatrix) -> Result<(), FileError> {
        if samples.nchannels() != self.params.nchannels {
            return Err(FileError::ChannelMismatch {
                expected: self.params.nchannels,
                got: samples.nchannels(),
            });
        }

        // Transpose the column-major batch into the row-major sample region.
        let rows = samples.nsamples();
        let cols = samples.nchannels();
        let mut buf = Vec::with_capacity(rows as usize * cols as usize * 2);
        for row in 0..rows {
            for col in 0..cols {
                buf.extend_from_slice(&samples.get(row, col).to_le_bytes());
            }
        }

        let pos = self.data_offset + self.nsamples * self.row_bytes();
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(&buf)?;

        self.nsamples += u64::from(rows);
        self.file.seek(SeekFrom::Start(NSAMPLES_OFFSET))?;
        self.file.write_all(&self.nsamples.to_le_bytes())?;
        Ok(())
    }

    /// Read samples `[start, end)` across all channels.
    pub fn read_range(&mut self, start: u64, end: u64) -> Result<SampleMatrix, FileError> {
        if start >= end || end > self.nsamples {
            return Err(FileError::BadRange {
                start,
                end,
                len: self.nsamples,
            });
        }

        let rows = (end - start) as usize;
        let cols = self.params.nchannels as usize;
        let mut buf = vec![0u8; rows * cols * 2];
        self.file
            .seek(SeekFrom::Start(self.data_offset + start * self.row_bytes()))?;
        self.file.read_exact(&mut buf)?;

        // Transpose row-major disk order back to column-major.
        let mut out = SampleMatrix::zeros(rows as u32, cols as u32);
        for (row, chunk) in buf.chunks_exact(cols * 2).enumerate() {
            for col in 0..cols {
                let raw = [chunk[col * 2], chunk[col * 2 + 1]];
                out.set(row as u32, col as u32, i16::from_le_bytes(raw));
            }
        }
        Ok(out)
    }

    pub fn nsamples(&self) -> u64 {
        self.nsamples
    }

    pub fn nchannels(&self) -> u32 {
        self.params.nchannels
    }

    pub fn sample_rate(&self) -> f32 {
        self.params.sample_rate
    }

    pub fn gain(&self) -> f32 {
        self.params.gain
    }

    pub fn offset(&self) -> f32 {
        self.params.offset
    }

    pub fn device_type(&self) -> &str {
        &self.params.device_type
    }

    pub fn date(&self) -> &str {
        &self.params.date
    }

    pub fn configuration(&self) -> &[u32] {
        &self.params.configuration
    }

    pub fn analog_output_size(&self) -> u32 {
        self.params.analog_output_size
    }

    /// Length of the recorded data in seconds.
    pub fn length_s(&self) -> f64 {
        self.nsamples as f64 / f64::from(self.params.sample_rate)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered writes and their metadata to disk.
    pub fn sync(&mut self) -> Result<(), FileError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn row_bytes(&self) -> u64 {
        u64::from(self.params.nchannels) * 2
    }
}

fn write_text(buf: &mut Vec<u8>, text: &str) {
    buf.extend_from_slice(&(text.len() as u32).to_le_bytes());
    buf.extend_from_slice(text.as_bytes());
}

fn read_u32(file: &mut File) -> Result<u32, FileError> {
    let mut raw = [0u8; 4];
    file.read_exact(&mut raw)
        .map_err(|_| FileError::BadHeader("truncated header field".into()))?;
    Ok(u32::from_le_bytes(raw))
}

fn read_text(file: &mut File) -> Result<String, FileError> {
    let len = read_u32(file)? as usize;
    let mut raw = vec![0u8; len];
    file.read_exact(&mut raw)
        .map_err(|_| FileError::BadHeader("truncated header string".into()))?;
    String::from_utf8(raw).map_err(|_| FileError::BadHeader("header string is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params() -> DataFileParams {
        DataFileParams {
            nchannels: 4,
            sample_rate: 1000.0,
            gain: 0.5,
            offset: -5.0,
            device_type: "file".into(),
            date: "2024-03-01T10:00:00".into(),
            configuration: vec![],
            analog_output_size: 0,
        }
    }

    fn batch(nsamples: u32, nchannels: u32, base: i16) -> SampleMatrix {
        let mut m = SampleMatrix::zeros(nsamples, nchannels);
        for c in 0..nchannels {
            for r in 0..nsamples {
                m.set(r, c, base + (r * nchannels + c) as i16);
            }
        }
        m
    }

    #[test]
    fn create_append_reopen_read() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("rec.h5");

        {
            let mut file = DataFile::create(&path, params()).expect("create");
            file.append(&batch(10, 4, 0)).expect("append");
            file.append(&batch(10, 4, 40)).expect("append");
            assert_eq!(file.nsamples(), 20);
            assert!((file.length_s() - 0.02).abs() < 1e-9);
            file.sync().expect("sync");
        }

        let mut file = DataFile::open(&path).expect("open");
        assert_eq!(file.nsamples(), 20);
        assert_eq!(file.nchannels(), 4);
        assert_eq!(file.sample_rate(), 1000.0);
        assert_eq!(file.device_type(), "file");

        // Rows 8..12 span the two appended batches.
        let range = file.read_range(8, 12).expect("read");
        assert_eq!(range.nsamples(), 4);
        assert_eq!(range.get(0, 0), 32); // row 8 of first batch
        assert_eq!(range.get(1, 3), 39); // row 9, channel 3
        assert_eq!(range.get(2, 0), 40); // row 0 of second batch
        assert_eq!(range.get(3, 1), 45);
    }

    #[test]
    fn never_overwrites_existing_files() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("rec.h5");
        std::fs::write(&path, b"precious").expect("write");
        assert!(matches!(
            DataFile::create(&path, params()),
            Err(FileError::AlreadyExists)
        ));
        assert_eq!(std::fs::read(&path).expect("read"), b"precious");
    }

    #[test]
    fn rejects_mismatched_batches_and_bad_ranges() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("rec.h5");
        let mut file = DataFile::create(&path, params()).expect("create");
        assert!(matches!(
            file.append(&batch(10, 3, 0)),
            Err(FileError::ChannelMismatch { expected: 4, got: 3 })
        ));
        file.append(&batch(10, 4, 0)).expect("append");
        assert!(matches!(
            file.read_range(5, 15),
            Err(FileError::BadRange { len: 10, .. })
        ));
        assert!(file.read_range(3, 3).is_err());
    }

    #[test]
    fn hidens_metadata_roundtrips() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("hidens.h5");
        let mut p = params();
        p.device_type = "hidens".into();
        p.configuration = vec![3, 17, 126];
        DataFile::create(&path, p).expect("create");

        let file = DataFile::open(&path).expect("open");
        assert_eq!(file.device_type(), "hidens");
        assert_eq!(file.configuration(), &[3, 17, 126]);
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("not-blds.h5");
        std::fs::write(&path, vec![0u8; 128]).expect("write");
        assert!(matches!(
            DataFile::open(&path),
            Err(FileError::BadMagic(_))
        ));
    }
}
