// Recording management: wraps an open data file and mediates every access
// behind one mutex, so range reads issued while a batch append is in flight
// stay well ordered.

use crate::datafile::{DataFile, DataFileParams, FileError};
use crate::frame::SampleMatrix;
use chrono::Local;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Timestamp format used to derive a save-file name when the client has not
/// chosen one.
pub const SAVE_NAME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    File(#[from] FileError),

    #[error("source status is missing '{0}', cannot create a recording")]
    MissingStatus(&'static str),
}

/// Resolve the on-disk file name for a new recording: derive one from the
/// current time when unset, then ensure an HDF5-style suffix.
pub fn resolve_save_name(save_file: &str) -> String {
    let mut name = if save_file.is_empty() {
        Local::now().format(SAVE_NAME_FORMAT).to_string()
    } else {
        save_file.to_string()
    };
    if !name.ends_with(".h5") && !name.ends_with(".hdf5") {
        name.push_str(".h5");
    }
    name
}

/// An active recording.
pub struct Recorder {
    file: Mutex<DataFile>,
    path: PathBuf,
    sample_rate: f32,
    nchannels: u32,
}

impl Recorder {
    /// Create the recording file at `directory/file_name`, initialized from
    /// the source's status map. Never overwrites an existing file.
    pub fn create(
        directory: &Path,
        file_name: &str,
        status: &Map<String, Value>,
    ) -> Result<Self, RecorderError> {
        let sample_rate = status
            .get("sample-rate")
            .and_then(Value::as_f64)
            .ok_or(RecorderError::MissingStatus("sample-rate"))? as f32;
        let nchannels = status
            .get("nchannels")
            .and_then(Value::as_u64)
            .ok_or(RecorderError::MissingStatus("nchannels"))? as u32;
        let device_type = status
            .get("device-type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let mut params = DataFileParams {
            nchannels,
            sample_rate,
            gain: status.get("gain").and_then(Value::as_f64).unwrap_or(0.0) as f32,
            offset: status
                .get("adc-range")
                .and_then(Value::as_f64)
                .unwrap_or(0.0) as f32,
            device_type: device_type.clone(),
            date: Local::now().to_rfc3339(),
            configuration: Vec::new(),
            analog_output_size: 0,
        };

        if device_type.starts_with("hidens") {
            if let Some(config) = status.get("configuration").and_then(Value::as_array) {
                params.configuration = config
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|v| v as u32)
                    .collect();
            }
        } else if status
            .get("has-analog-output")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            params.analog_output_size = status
                .get("analog-output")
                .and_then(Value::as_array)
                .map(|a| a.len() as u32)
                .unwrap_or(0);
        }

        let path = directory.join(file_name);
        let file = DataFile::create(&path, params)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            sample_rate,
            nchannels,
        })
    }

    /// Append a batch at the end of the recording.
    pub fn append(&self, samples: &SampleMatrix) -> Result<(), FileError> {
        self.file.lock().append(samples)
    }

    /// Read samples `[start, end)`.
    pub fn read_range(&self, start: u64, end: u64) -> Result<SampleMatrix, FileError> {
        self.file.lock().read_range(start, end)
    }

    pub fn nsamples(&self) -> u64 {
        self.file.lock().nsamples()
    }

    /// Seconds of data recorded so far.
    pub fn length_s(&self) -> f64 {
        self.file.lock().length_s()
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn nchannels(&self) -> u32 {
        self.nchannels
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the recording, keeping the file on disk.
    pub fn close(self) -> Result<(), FileError> {
        self.file.into_inner().sync()
    }

    /// Close the recording and remove its file, for recordings that never
    /// started streaming.
    pub fn discard(self) {
        let path = self.path.clone();
        drop(self.file);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!("could not remove unused recording {:?}: {}", path, e);
        }
    }
}
