// Source backed by a networked HiDens array.
//
// The device is managed by a server process on the acquisition machine;
// `location` names that machine as `host[:port]`. Control commands are
// newline-terminated text; once streaming, the device sends raw interleaved
// little-endian i16 samples, one full row of channels per time point.

use super::{Source, SourceError, SourceResult};
use crate::frame::SampleMatrix;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

/// Port of the HiDens data server.
const DEFAULT_PORT: u16 = 11112;

/// The HiDens chip routes up to this many electrodes onto its channels.
const NELECTRODES: u32 = 11_011;

const NCHANNELS: u32 = 126;
const SAMPLE_RATE: f32 = 20_000.0;
const GAIN: f32 = 0.01;
const ADC_RANGE: f32 = 2.5;

pub struct HidensSource {
    location: String,
    stream: Option<TcpStream>,
    configuration: Vec<u32>,
}

impl HidensSource {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            stream: None,
            configuration: Vec::new(),
        }
    }

    fn address(&self) -> String {
        if self.location.contains(':') {
            self.location.clone()
        } else {
            format!("{}:{}", self.location, DEFAULT_PORT)
        }
    }

    fn stream_mut(&mut self) -> SourceResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| SourceError::Connection("Not connected to the HiDens server.".into()))
    }

    async fn send_command(&mut self, command: &str) -> SourceResult<()> {
        let stream = self.stream_mut()?;
        stream
            .write_all(command.as_bytes())
            .await
            .map_err(|e| SourceError::Connection(format!("HiDens write failed: {e}")))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|e| SourceError::Connection(format!("HiDens write failed: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| SourceError::Connection(format!("HiDens write failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Source for HidensSource {
    fn kind(&self) -> &'static str {
        "hidens"
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn sample_rate(&self) -> f32 {
        SAMPLE_RATE
    }

    fn status(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("source-type".into(), Value::from("hidens"));
        map.insert("device-type".into(), Value::from("hidens"));
        map.insert("location".into(), Value::from(self.location.as_str()));
        map.insert("nchannels".into(), Value::from(NCHANNELS));
        map.insert("sample-rate".into(), Value::from(f64::from(SAMPLE_RATE)));
        map.insert("gain".into(), Value::from(f64::from(GAIN)));
        map.insert("adc-range".into(), Value::from(f64::from(ADC_RANGE)));
        map.insert("has-analog-output".into(), Value::from(false));
        map.insert(
            "configuration".into(),
            Value::Array(self.configuration.iter().map(|&e| Value::from(e)).collect()),
        );
        map
    }

    async fn initialize(&mut self) -> SourceResult<()> {
        let addr = self.address();
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            SourceError::Connection(format!("Could not reach HiDens server at {addr}: {e}"))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        info!("connected to HiDens server at {}", addr);
        self.stream = Some(stream);
        Ok(())
    }

    async fn start_stream(&mut self) -> SourceResult<()> {
        self.send_command("stream start").await
    }

    async fn stop_stream(&mut self) -> SourceResult<()> {
        self.send_command("stream stop").await
    }

    async fn read_batch(&mut self, nsamples: u32) -> SourceResult<Option<SampleMatrix>> {
        let nchannels = NCHANNELS;
        let mut buf = vec![0u8; nsamples as usize * nchannels as usize * 2];
        let stream = self.stream_mut()?;
        match stream.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(SourceError::Stream(format!("HiDens read failed: {e}"))),
        }

        // Device order is row-major; matrices are column-major.
        let mut batch = SampleMatrix::zeros(nsamples, nchannels);
        for (row, chunk) in buf.chunks_exact(nchannels as usize * 2).enumerate() {
            for col in 0..nchannels as usize {
                let raw = [chunk[col * 2], chunk[col * 2 + 1]];
                batch.set(row as u32, col as u32, i16::from_le_bytes(raw));
            }
        }
        Ok(Some(batch))
    }

    fn get(&self, param: &str) -> SourceResult<Value> {
        self.status()
            .remove(param)
            .ok_or_else(|| SourceError::UnknownParameter(param.to_string()))
    }

    async fn set(&mut self, param: &str, value: &Value) -> SourceResult<()> {
        match param {
            "configuration" => {
                let items = value.as_array().ok_or_else(|| SourceError::InvalidValue {
                    param: param.into(),
                    reason: "expected a list of electrode indices".into(),
                })?;
                let mut configuration = Vec::with_capacity(items.len());
                for item in items {
                    let electrode =
                        item.as_u64().ok_or_else(|| SourceError::InvalidValue {
                            param: param.into(),
                            reason: "electrode indices must be unsigned integers".into(),
                        })? as u32;
                    if electrode >= NELECTRODES {
                        return Err(SourceError::InvalidValue {
                            param: param.into(),
                            reason: format!(
                                "electrode {electrode} outside the array of {NELECTRODES}"
                            ),
                        });
                    }
                    configuration.push(electrode);
                }
                if configuration.len() > NCHANNELS as usize {
                    return Err(SourceError::InvalidValue {
                        param: param.into(),
                        reason: format!(
                            "at most {NCHANNELS} electrodes can be routed at once"
                        ),
                    });
                }
                self.configuration = configuration;
                Ok(())
            }
            known if self.status().contains_key(known) => {
                Err(SourceError::ReadOnly(param.to_string()))
            }
            _ => Err(SourceError::UnknownParameter(param.to_string())),
        }
    }
}
