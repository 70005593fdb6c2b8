// Sample containers and the wire representation of a chunk of data.
//
// A `SampleMatrix` is one batch of samples from the data source, shaped
// `(nsamples, nchannels)` and stored column-major so each channel occupies
// one contiguous run. A `DataFrame` pairs a matrix with the start and stop
// times of the chunk within the stream, and serializes bit-exactly for
// transfer to remote clients.

use thiserror::Error;

/// Errors raised when decoding a frame from raw bytes.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame header truncated: need {needed} bytes, have {have}")]
    TruncatedHeader { needed: usize, have: usize },

    #[error("frame body truncated: need {needed} sample bytes, have {have}")]
    TruncatedBody { needed: usize, have: usize },

    #[error("frame times are invalid: stop {stop} must exceed start {start}")]
    InvalidTimes { start: f32, stop: f32 },
}

/// A batch of signed 16-bit samples, rows are time points and columns are
/// channels. Data is column-major: `data[c * nsamples + r]` is row `r` of
/// channel `c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMatrix {
    nsamples: u32,
    nchannels: u32,
    data: Vec<i16>,
}

impl SampleMatrix {
    /// Create a zero-filled matrix of the given shape.
    pub fn zeros(nsamples: u32, nchannels: u32) -> Self {
        Self {
            nsamples,
            nchannels,
            data: vec![0; nsamples as usize * nchannels as usize],
        }
    }

    /// Build a matrix from column-major data. The vector length must be
    /// exactly `nsamples * nchannels`.
    pub fn from_column_major(nsamples: u32, nchannels: u32, data: Vec<i16>) -> Self {
        assert_eq!(
            data.len(),
            nsamples as usize * nchannels as usize,
            "sample vector does not match matrix shape"
        );
        Self {
            nsamples,
            nchannels,
            data,
        }
    }

    pub fn nsamples(&self) -> u32 {
        self.nsamples
    }

    pub fn nchannels(&self) -> u32 {
        self.nchannels
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One channel's samples as a contiguous slice.
    pub fn channel(&self, channel: u32) -> &[i16] {
        let n = self.nsamples as usize;
        let start = channel as usize * n;
        &self.data[start..start + n]
    }

    /// Sample at `(row, channel)`.
    pub fn get(&self, row: u32, channel: u32) -> i16 {
        self.data[channel as usize * self.nsamples as usize + row as usize]
    }

    pub fn set(&mut self, row: u32, channel: u32, value: i16) {
        self.data[channel as usize * self.nsamples as usize + row as usize] = value;
    }

    /// The full column-major sample run.
    pub fn as_slice(&self) -> &[i16] {
        &self.data
    }
}

/// One chunk of data sent to remote clients: the samples plus the start and
/// stop times of the chunk within the recorded stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    start: f32,
    stop: f32,
    samples: SampleMatrix,
}

impl DataFrame {
    pub fn new(start: f32, stop: f32, samples: SampleMatrix) -> Self {
        Self {
            start,
            stop,
            samples,
        }
    }

    pub fn start(&self) -> f32 {
        self.start
    }

    pub fn stop(&self) -> f32 {
        self.stop
    }

    pub fn samples(&self) -> &SampleMatrix {
        &self.samples
    }

    pub fn nsamples(&self) -> u32 {
        self.samples.nsamples()
    }

    pub fn nchannels(&self) -> u32 {
        self.samples.nchannels()
    }

    /// Size in bytes of the serialized frame.
    pub fn byte_len(&self) -> usize {
        2 * std::mem::size_of::<f32>()
            + 2 * std::mem::size_of::<u32>()
            + self.samples.as_slice().len() * std::mem::size_of::<i16>()
    }

    /// Append the wire representation to `buf`. Layout, little-endian and
    /// tightly packed:
    ///
    /// ```text
    /// f32 start | f32 stop | u32 nsamples | u32 nchannels | i16 samples...
    /// ```
    ///
    /// Samples are column-major, matching the in-memory layout.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.byte_len());
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&self.stop.to_le_bytes());
        buf.extend_from_slice(&self.samples.nsamples().to_le_bytes());
        buf.extend_from_slice(&self.samples.nchannels().to_le_bytes());
        for sample in self.samples.as_slice() {
            buf.extend_from_slice(&sample.to_le_bytes());
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_len());
        self.serialize_into(&mut buf);
        buf
    }

    /// Decode a frame previously produced by [`serialize`](Self::serialize).
    pub fn deserialize(bytes: &[u8]) -> Result<Self, FrameError> {
        const HEADER: usize = 16;
        if bytes.len() < HEADER {
            return Err(FrameError::TruncatedHeader {
                needed: HEADER,
                have: bytes.len(),
            });
        }
        let start = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let stop = f32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let nsamples = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let nchannels = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        if stop <= start {
            return Err(FrameError::InvalidTimes { start, stop });
        }

        let nelem = nsamples as usize * nchannels as usize;
        let needed = nelem * 2;
        let body = &bytes[HEADER..];
        if body.len() < needed {
            return Err(FrameError::TruncatedBody {
                needed,
                have: body.len(),
            });
        }
        let mut data = Vec::with_capacity(nelem);
        for chunk in body[..needed].chunks_exact(2) {
            data.push(i16::from_le_bytes([chunk[0], chunk[1]]));
        }
        Ok(Self {
            start,
            stop,
            samples: SampleMatrix::from_column_major(nsamples, nchannels, data),
        })
    }
}
