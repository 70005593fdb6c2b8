// File-backed source that replays a previously recorded data file as if it
// were live, one batch per read-interval tick. Useful for testing the server
// without hardware and for re-serving past experiments.

use super::{Source, SourceError, SourceResult};
use crate::datafile::DataFile;
use crate::frame::SampleMatrix;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct FileSource {
    path: PathBuf,
    file: Option<Arc<Mutex<DataFile>>>,
    position: u64,
}

impl FileSource {
    pub fn new(location: &str) -> Self {
        Self {
            path: PathBuf::from(location),
            file: None,
            position: 0,
        }
    }

    fn file(&self) -> SourceResult<&Arc<Mutex<DataFile>>> {
        self.file
            .as_ref()
            .ok_or_else(|| SourceError::Connection("The data file is not open.".into()))
    }
}

#[async_trait]
impl Source for FileSource {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn location(&self) -> &str {
        self.path.to_str().unwrap_or("")
    }

    fn sample_rate(&self) -> f32 {
        self.file
            .as_ref()
            .map(|f| f.lock().sample_rate())
            .unwrap_or(0.0)
    }

    fn status(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("source-type".into(), Value::from("file"));
        map.insert("location".into(), Value::from(self.location()));
        if let Some(file) = &self.file {
            let file = file.lock();
            map.insert("device-type".into(), Value::from(file.device_type()));
            map.insert("nchannels".into(), Value::from(file.nchannels()));
            map.insert(
                "sample-rate".into(),
                Value::from(f64::from(file.sample_rate())),
            );
            map.insert("gain".into(), Value::from(f64::from(file.gain())));
            map.insert("adc-range".into(), Value::from(f64::from(file.offset())));
            map.insert("date".into(), Value::from(file.date()));
            map.insert(
                "length".into(),
                Value::from(file.length_s()),
            );
            map.insert(
                "has-analog-output".into(),
                Value::from(file.analog_output_size() > 0),
            );
            if !file.configuration().is_empty() {
                map.insert(
                    "configuration".into(),
                    Value::Array(
                        file.configuration()
                            .iter()
                            .map(|&e| Value::from(e))
                            .collect(),
                    ),
                );
            }
        }
        map
    }

    async fn initialize(&mut self) -> SourceResult<()> {
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || DataFile::open(&path))
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))??;
        info!(
            "opened replay file {:?}: {} channels at {} Hz, {:.3} s of data",
            self.path,
            file.nchannels(),
            file.sample_rate(),
            file.length_s()
        );
        self.file = Some(Arc::new(Mutex::new(file)));
        self.position = 0;
        Ok(())
    }

    async fn start_stream(&mut self) -> SourceResult<()> {
        self.file()?;
        self.position = 0;
        Ok(())
    }

    async fn stop_stream(&mut self) -> SourceResult<()> {
        self.position = 0;
        Ok(())
    }

    async fn read_batch(&mut self, nsamples: u32) -> SourceResult<Option<SampleMatrix>> {
        let file = Arc::clone(self.file()?);
        let start = self.position;
        let total = file.lock().nsamples();
        if start >= total {
            return Ok(None);
        }
        let end = total.min(start + u64::from(nsamples));

        let batch = tokio::task::spawn_blocking(move || file.lock().read_range(start, end))
            .await
            .map_err(|e| SourceError::Stream(e.to_string()))??;
        self.position = end;
        Ok(Some(batch))
    }

    fn get(&self, param: &str) -> SourceResult<Value> {
        self.status()
            .remove(param)
            .ok_or_else(|| SourceError::UnknownParameter(param.to_string()))
    }

    async fn set(&mut self, param: &str, _value: &Value) -> SourceResult<()> {
        // Everything about a replayed file is fixed by the file itself.
        if self.status().contains_key(param) {
            Err(SourceError::ReadOnly(param.to_string()))
        } else {
            Err(SourceError::UnknownParameter(param.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafile::DataFileParams;
    use tempfile::TempDir;

    fn write_fixture(dir: &TempDir, nsamples: u32) -> PathBuf {
        let path = dir.path().join("replay.h5");
        let mut file = DataFile::create(
            &path,
            DataFileParams {
                nchannels: 2,
                sample_rate: 100.0,
                gain: 1.0,
                offset: 0.0,
                device_type: "file".into(),
                date: "2024-01-01T00:00:00".into(),
                configuration: vec![],
                analog_output_size: 0,
            },
        )
        .expect("create");
        let mut batch = SampleMatrix::zeros(nsamples, 2);
        for r in 0..nsamples {
            batch.set(r, 0, r as i16);
            batch.set(r, 1, -(r as i16));
        }
        file.append(&batch).expect("append");
        file.sync().expect("sync");
        path
    }

    #[tokio::test]
    async fn replays_file_in_batches_until_eof() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_fixture(&dir, 25);

        let mut source = FileSource::new(path.to_str().unwrap());
        source.initialize().await.expect("initialize");
        assert_eq!(source.sample_rate(), 100.0);
        source.start_stream().await.expect("start");

        let first = source.read_batch(10).await.expect("read").expect("batch");
        assert_eq!(first.nsamples(), 10);
        assert_eq!(first.get(3, 0), 3);

        let second = source.read_batch(10).await.expect("read").expect("batch");
        assert_eq!(second.get(0, 0), 10);

        // Final partial batch, then EOF.
        let third = source.read_batch(10).await.expect("read").expect("batch");
        assert_eq!(third.nsamples(), 5);
        assert!(source.read_batch(10).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn initialize_fails_for_missing_files() {
        let mut source = FileSource::new("/nonexistent/replay.h5");
        assert!(source.initialize().await.is_err());
    }

    #[tokio::test]
    async fn parameters_are_read_only() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_fixture(&dir, 5);
        let mut source = FileSource::new(path.to_str().unwrap());
        source.initialize().await.expect("initialize");

        assert_eq!(source.get("nchannels").unwrap(), Value::from(2u32));
        assert!(matches!(
            source.set("gain", &Value::from(2.0)).await,
            Err(SourceError::ReadOnly(_))
        ));
        assert!(matches!(
            source.get("no-such-param"),
            Err(SourceError::UnknownParameter(_))
        ));
    }
}
