// Data sources and the task that drives them.
//
// A source is the single upstream producer of samples: a file replaying a
// past recording, or a live acquisition device. Sources implement the
// `Source` trait and run inside their own tokio task, consuming
// `SourceCommand`s and emitting `SourceEvent`s back to the server's control
// task. While streaming, the task reads one batch per read-interval tick.
//
// New source types are added by implementing the trait and registering in
// `create_source`.

mod file;
mod hidens;
pub mod values;

pub use file::FileSource;
pub use hidens::HidensSource;

use crate::frame::SampleMatrix;
use crate::session::ClientId;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Unknown source type: {0}")]
    UnknownType(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    File(#[from] crate::datafile::FileError),

    #[error("Parameter '{0}' is read-only")]
    ReadOnly(String),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Invalid value for '{param}': {reason}")]
    InvalidValue { param: String, reason: String },

    #[error("{0}")]
    Unsupported(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

/// Contract implemented by every data source back-end.
///
/// `initialize` runs once after creation and must succeed before the stream
/// can start or parameters can be touched. `read_batch` is called once per
/// read-interval tick while streaming; `Ok(None)` signals a clean end of the
/// stream.
#[async_trait]
pub trait Source: Send {
    fn kind(&self) -> &'static str;

    fn location(&self) -> &str;

    /// Samples per second per channel; valid once initialized.
    fn sample_rate(&self) -> f32;

    /// Full parameter map, served to clients and the HTTP status path.
    fn status(&self) -> Map<String, Value>;

    async fn initialize(&mut self) -> SourceResult<()>;

    async fn start_stream(&mut self) -> SourceResult<()>;

    async fn stop_stream(&mut self) -> SourceResult<()>;

    /// Read the next batch of up to `nsamples` rows.
    async fn read_batch(&mut self, nsamples: u32) -> SourceResult<Option<SampleMatrix>>;

    fn get(&self, param: &str) -> SourceResult<Value>;

    async fn set(&mut self, param: &str, value: &Value) -> SourceResult<()>;
}

/// Instantiate a source from its type token and location identifier.
///
/// Recognized types: `file` (replay of a recorded data file at `location`),
/// `hidens` (networked HiDens array, `location` is `host[:port]`), and `mcs`
/// (MCS array managed through a local vendor driver).
pub fn create_source(kind: &str, location: &str) -> SourceResult<Box<dyn Source>> {
    match kind {
        "file" => Ok(Box::new(FileSource::new(location))),
        "hidens" => Ok(Box::new(HidensSource::new(location))),
        "mcs" => {
            if cfg!(windows) {
                Err(SourceError::Unsupported(
                    "The MCS acquisition driver is not available in this build.".into(),
                ))
            } else {
                Err(SourceError::Unsupported(
                    "Cannot create MCS sources on non-Windows machines.".into(),
                ))
            }
        }
        other => Err(SourceError::UnknownType(other.to_string())),
    }
}

/// Requests sent from the control task to the source task.
#[derive(Debug)]
pub enum SourceCommand {
    Initialize,
    StartStream,
    StopStream,
    Get { param: String },
    Set { param: String, value: Value },
    RequestStatus,
    SetReadInterval(u32),
    Shutdown,
}

/// Completions and data emitted by the source task.
#[derive(Debug)]
pub enum SourceEvent {
    Initialized { success: bool, msg: String },
    StreamStarted { success: bool, msg: String },
    StreamStopped { success: bool, msg: String },
    /// On success `value` is the parameter value; on failure it is the error
    /// message as a string.
    GetResponse { param: String, success: bool, value: Value },
    SetResponse { param: String, success: bool, msg: String },
    Status(Map<String, Value>),
    Samples(SampleMatrix),
    /// Fatal. The source is unusable after emitting this.
    Error(String),
}

/// Number of rows one read-interval tick should produce.
fn batch_samples(interval_ms: u32, sample_rate: f32) -> u32 {
    ((f64::from(interval_ms) / 1000.0 * f64::from(sample_rate)).round() as u32).max(1)
}

/// Spawn the task driving a source. Returns the command channel; events
/// arrive on `events` until the task stops or `cancel` fires.
pub fn spawn_source(
    mut source: Box<dyn Source>,
    read_interval_ms: u32,
    events: mpsc::Sender<SourceEvent>,
    cancel: CancellationToken,
) -> mpsc::UnboundedSender<SourceCommand> {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut initialized = false;
        let mut streaming = false;
        let mut interval_ms = read_interval_ms.max(1);
        let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(interval_ms)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        SourceCommand::Initialize => {
                            let event = match source.initialize().await {
                                Ok(()) => {
                                    initialized = true;
                                    SourceEvent::Initialized { success: true, msg: String::new() }
                                }
                                Err(e) => SourceEvent::Initialized { success: false, msg: e.to_string() },
                            };
                            let ok = initialized;
                            if events.send(event).await.is_err() {
                                break;
                            }
                            if ok && events.send(SourceEvent::Status(source.status())).await.is_err() {
                                break;
                            }
                        }
                        SourceCommand::StartStream => {
                            let event = if !initialized {
                                SourceEvent::StreamStarted {
                                    success: false,
                                    msg: "The data source is not initialized.".into(),
                                }
                            } else if streaming {
                                SourceEvent::StreamStarted {
                                    success: false,
                                    msg: "The data stream is already running.".into(),
                                }
                            } else {
                                match source.start_stream().await {
                                    Ok(()) => {
                                        streaming = true;
                                        ticker = tokio::time::interval(
                                            Duration::from_millis(u64::from(interval_ms)),
                                        );
                                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                                        SourceEvent::StreamStarted { success: true, msg: String::new() }
                                    }
                                    Err(e) => SourceEvent::StreamStarted {
                                        success: false,
                                        msg: e.to_string(),
                                    },
                                }
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        SourceCommand::StopStream => {
                            let event = if !streaming {
                                SourceEvent::StreamStopped {
                                    success: false,
                                    msg: "The data stream is not running.".into(),
                                }
                            } else {
                                match source.stop_stream().await {
                                    Ok(()) => {
                                        streaming = false;
                                        SourceEvent::StreamStopped { success: true, msg: String::new() }
                                    }
                                    Err(e) => SourceEvent::StreamStopped {
                                        success: false,
                                        msg: e.to_string(),
                                    },
                                }
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        SourceCommand::Get { param } => {
                            let event = if !initialized {
                                SourceEvent::GetResponse {
                                    param,
                                    success: false,
                                    value: Value::String("The data source is not initialized.".into()),
                                }
                            } else {
                                match source.get(&param) {
                                    Ok(value) => SourceEvent::GetResponse { param, success: true, value },
                                    Err(e) => SourceEvent::GetResponse {
                                        param,
                                        success: false,
                                        value: Value::String(e.to_string()),
                                    },
                                }
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        SourceCommand::Set { param, value } => {
                            let (event, changed) = if !initialized {
                                (SourceEvent::SetResponse {
                                    param,
                                    success: false,
                                    msg: "The data source is not initialized.".into(),
                                }, false)
                            } else if streaming {
                                (SourceEvent::SetResponse {
                                    param,
                                    success: false,
                                    msg: "Cannot set parameters while the stream is running.".into(),
                                }, false)
                            } else {
                                match source.set(&param, &value).await {
                                    Ok(()) => (SourceEvent::SetResponse {
                                        param,
                                        success: true,
                                        msg: String::new(),
                                    }, true),
                                    Err(e) => (SourceEvent::SetResponse {
                                        param,
                                        success: false,
                                        msg: e.to_string(),
                                    }, false),
                                }
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                            // Refresh the server's status cache after every
                            // successful mutation.
                            if changed
                                && events.send(SourceEvent::Status(source.status())).await.is_err()
                            {
                                break;
                            }
                        }
                        SourceCommand::RequestStatus => {
                            if events.send(SourceEvent::Status(source.status())).await.is_err() {
                                break;
                            }
                        }
                        SourceCommand::SetReadInterval(ms) => {
                            interval_ms = ms.max(1);
                            if !streaming {
                                ticker = tokio::time::interval(
                                    Duration::from_millis(u64::from(interval_ms)),
                                );
                                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            }
                        }
                        SourceCommand::Shutdown => break,
                    }
                }

                _ = ticker.tick(), if streaming => {
                    match source.read_batch(batch_samples(interval_ms, source.sample_rate())).await {
                        Ok(Some(batch)) => {
                            if events.send(SourceEvent::Samples(batch)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            streaming = false;
                            let msg = "The data source reached the end of its stream.".to_string();
                            if events.send(SourceEvent::Error(msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            streaming = false;
                            if events.send(SourceEvent::Error(e.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        debug!("source task stopped");
    });

    cmd_tx
}

/// The five asynchronous source operations a client request can be waiting
/// on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Initialize,
    Start,
    Stop,
    Get,
    Set,
}

impl CompletionKind {
    fn name(self) -> &'static str {
        match self {
            CompletionKind::Initialize => "create-source",
            CompletionKind::Start => "start-recording",
            CompletionKind::Stop => "stop-recording",
            CompletionKind::Get => "get-source",
            CompletionKind::Set => "set-source",
        }
    }
}

/// Raised when a request of some kind arrives while another of the same kind
/// is still waiting on the source.
#[derive(Debug, Error)]
#[error("Another {} request is still waiting on the data source.", .0.name())]
pub struct AdapterBusy(pub CompletionKind);

/// Correlation slots routing each source completion back to the one client
/// that asked for it. Each kind holds at most one waiter.
#[derive(Debug, Default)]
pub struct PendingCompletions {
    initialize: Option<ClientId>,
    start: Option<ClientId>,
    stop: Option<ClientId>,
    get: Option<ClientId>,
    set: Option<ClientId>,
}

impl PendingCompletions {
    /// Bind `client` as the waiter for the next completion of `kind`.
    pub fn bind(&mut self, kind: CompletionKind, client: ClientId) -> Result<(), AdapterBusy> {
        let slot = self.slot(kind);
        if slot.is_some() {
            return Err(AdapterBusy(kind));
        }
        *slot = Some(client);
        Ok(())
    }

    /// Detach and return the waiter for `kind`, freeing the slot for the
    /// next request.
    pub fn take(&mut self, kind: CompletionKind) -> Option<ClientId> {
        self.slot(kind).take()
    }

    fn slot(&mut self, kind: CompletionKind) -> &mut Option<ClientId> {
        match kind {
            CompletionKind::Initialize => &mut self.initialize,
            CompletionKind::Start => &mut self.start,
            CompletionKind::Stop => &mut self.stop,
            CompletionKind::Get => &mut self.get,
            CompletionKind::Set => &mut self.set,
        }
    }
}

/// Control-task handle to a spawned source.
pub struct SourceHandle {
    pub kind: String,
    pub location: String,
    pub pending: PendingCompletions,
    commands: mpsc::UnboundedSender<SourceCommand>,
    cancel: CancellationToken,
}

impl SourceHandle {
    pub fn new(
        kind: String,
        location: String,
        commands: mpsc::UnboundedSender<SourceCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kind,
            location,
            pending: PendingCompletions::default(),
            commands,
            cancel,
        }
    }

    /// Forward a command; the source task may already be gone during
    /// shutdown, which is fine.
    pub fn send(&self, cmd: SourceCommand) {
        let _ = self.commands.send(cmd);
    }

    /// Stop the source task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(SourceCommand::Shutdown);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_source_types_fail_synchronously() {
        assert!(matches!(
            create_source("laser", "nowhere"),
            Err(SourceError::UnknownType(t)) if t == "laser"
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn mcs_sources_fail_on_non_windows_hosts() {
        assert!(matches!(
            create_source("mcs", ""),
            Err(SourceError::Unsupported(_))
        ));
    }

    #[test]
    fn batch_sizes_follow_interval_and_rate() {
        assert_eq!(batch_samples(10, 10_000.0), 100);
        assert_eq!(batch_samples(100, 10_000.0), 1000);
        assert_eq!(batch_samples(1, 100.0), 1); // never zero
    }

    #[test]
    fn completion_slots_hold_one_waiter_each() {
        let mut pending = PendingCompletions::default();
        let a = ClientId::new();
        let b = ClientId::new();

        pending.bind(CompletionKind::Get, a).expect("first bind");
        assert!(matches!(
            pending.bind(CompletionKind::Get, b),
            Err(AdapterBusy(CompletionKind::Get))
        ));
        // A different kind is independent.
        pending.bind(CompletionKind::Set, b).expect("other kind");

        assert_eq!(pending.take(CompletionKind::Get), Some(a));
        assert_eq!(pending.take(CompletionKind::Get), None);
        // Slot is free again after take.
        pending.bind(CompletionKind::Get, b).expect("rebind");
    }
}
