use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use serde_json::{Map, Value};
use tracing::warn;

use crate::{config::LoggingConfig, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
}

impl Split {
    pub fn prefix(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
        }
    }
}

/// Flat snapshot of scalar metrics for one logging event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub split: Split,
    pub step: usize,
    pub epoch: usize,
    pub tokens: u64,
    values: BTreeMap<String, f64>,
}

impl LogRecord {
    pub fn new(split: Split, step: usize, epoch: usize, tokens: u64) -> Self {
        Self {
            split,
            step,
            epoch,
            tokens,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Metric names prefixed with the split, e.g. `train/loss`.
    pub fn prefixed(&self) -> impl Iterator<Item = (String, f64)> + '_ {
        let prefix = self.split.prefix();
        self.values
            .iter()
            .map(move |(name, value)| (format!("{}/{}", prefix, name), *value))
    }
}

/// Destination for log records.
pub trait MetricSink: Send {
    fn name(&self) -> &'static str;

    fn write(&mut self, record: &LogRecord) -> Result<(), TrainingError>;

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Stand-in used when no sink is configured or on non-coordinator workers.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn write(&mut self, _record: &LogRecord) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Sinks fed by the coordinator. A failing sink is reported and skipped;
/// it never aborts training.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Box<dyn MetricSink>>) -> Self {
        Self { sinks }
    }

    pub fn noop() -> Self {
        Self::new(vec![Box::new(NoopSink)])
    }

    pub fn push(&mut self, sink: Box<dyn MetricSink>) {
        self.sinks.push(sink);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    pub fn emit(&mut self, record: &LogRecord) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.write(record) {
                warn!(sink = sink.name(), error = %err, "failed to write metrics");
            }
        }
    }

    pub fn flush(&mut self) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.flush() {
                warn!(sink = sink.name(), error = %err, "failed to flush metrics");
            }
        }
    }
}

/// Builds the sinks selected by `config` under `<directory>/<name>`.
/// Workers other than the coordinator get a no-op set.
pub fn build_sinks(config: &LoggingConfig, coordinator: bool) -> Result<SinkSet, TrainingError> {
    if !coordinator {
        return Ok(SinkSet::noop());
    }
    let run_dir = config.run_dir();
    let mut sinks = SinkSet::default();
    if config.tensorboard {
        sinks.push(Box::new(TensorBoardSink::create(&run_dir.join("tensorboard"))?));
    }
    if config.wandb {
        sinks.push(Box::new(TrackingSink::create(&run_dir.join("tracking.jsonl"))?));
    }
    if sinks.sinks.is_empty() {
        sinks.push(Box::new(NoopSink));
    }
    Ok(sinks)
}

/// Scalar summaries in the TensorBoard event-file format.
pub struct TensorBoardSink {
    writer: TensorBoardWriter,
}

impl TensorBoardSink {
    pub fn create(dir: &Path) -> Result<Self, TrainingError> {
        Ok(Self {
            writer: TensorBoardWriter::create(dir, 16)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }
}

impl MetricSink for TensorBoardSink {
    fn name(&self) -> &'static str {
        "tensorboard"
    }

    fn write(&mut self, record: &LogRecord) -> Result<(), TrainingError> {
        let step = record.step as i64;
        for (tag, value) in record.prefixed() {
            self.writer.write_scalar(&tag, step, value)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush()
    }
}

/// Experiment-tracking stream: one JSON object per record, carrying the step,
/// the token count and every prefixed metric.
pub struct TrackingSink {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl TrackingSink {
    pub fn create(path: &Path) -> Result<Self, TrainingError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricSink for TrackingSink {
    fn name(&self) -> &'static str {
        "tracking"
    }

    fn write(&mut self, record: &LogRecord) -> Result<(), TrainingError> {
        let mut row = Map::new();
        row.insert("step".into(), Value::from(record.step as u64));
        row.insert("epoch".into(), Value::from(record.epoch as u64));
        row.insert("tokens".into(), Value::from(record.tokens));
        for (name, value) in record.prefixed() {
            row.insert(name, Value::from(value));
        }
        serde_json::to_writer(&mut self.writer, &Value::Object(row))
            .map_err(|err| TrainingError::runtime(format!("failed to encode tracking row: {err}")))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush()?;
        Ok(())
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::configuration(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::configuration(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            path,
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
