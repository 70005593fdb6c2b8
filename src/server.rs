// Server core: one control task owning every piece of mutable server state.
//
// The control task is the sole owner of the source handle, the recorder, the
// client roster, the server parameters, and the source-status cache. Client
// I/O tasks and the source task talk to it exclusively through the control
// channel, so every invariant between those pieces is enforced from a single
// place, without locks. The HTTP status path reads through a shared snapshot
// that only this task writes.

use crate::config::Config;
use crate::frame::{DataFrame, SampleMatrix};
use crate::protocol::{ClientRequest, ParamValue, ServerReply};
use crate::recorder::{resolve_save_name, Recorder};
use crate::session::{self, ClientId};
use crate::source::{
    self, values, CompletionKind, SourceCommand, SourceEvent, SourceHandle,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the control task can be asked to do.
#[derive(Debug)]
pub enum ControlMessage {
    ClientConnected {
        id: ClientId,
        addr: SocketAddr,
        replies: mpsc::UnboundedSender<ServerReply>,
        cancel: CancellationToken,
    },
    ClientRequest {
        id: ClientId,
        request: ClientRequest,
    },
    ClientProtocolError {
        id: ClientId,
        message: String,
    },
    ClientDisconnected {
        id: ClientId,
    },
    Source(SourceEvent),
}

/// A client's request for a time range of data that is not recorded yet.
/// Serviced, in arrival order, once the recording grows past `stop`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingRequest {
    pub start: f32,
    pub stop: f32,
}

/// Control-task state for one connected client.
struct ClientHandle {
    addr: SocketAddr,
    replies: mpsc::UnboundedSender<ServerReply>,
    cancel: CancellationToken,
    pending: VecDeque<PendingRequest>,
    all_data: bool,
}

impl ClientHandle {
    fn send(&self, reply: ServerReply) {
        // The session may be tearing down; its disconnect message is on the
        // way if so.
        let _ = self.replies.send(reply);
    }
}

/// Snapshot of server state served by `GET /status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStatus {
    #[serde(rename = "start-time")]
    pub start_time: String,
    #[serde(rename = "save-directory")]
    pub save_directory: String,
    #[serde(rename = "save-file")]
    pub save_file: String,
    #[serde(rename = "recording-length")]
    pub recording_length: u32,
    #[serde(rename = "read-interval")]
    pub read_interval: u32,
    #[serde(rename = "recording-exists")]
    pub recording_exists: bool,
    #[serde(rename = "recording-position")]
    pub recording_position: f64,
    #[serde(rename = "source-exists")]
    pub source_exists: bool,
    #[serde(rename = "source-type")]
    pub source_type: Option<String>,
    #[serde(rename = "source-location")]
    pub source_location: Option<String>,
    pub clients: Vec<String>,
}

/// Read-only view of server and source state, written by the control task
/// and read by the HTTP status handlers.
#[derive(Default)]
pub struct SharedStatus {
    pub server: RwLock<ServerStatus>,
    pub source: RwLock<Option<Map<String, Value>>>,
}

pub struct Server {
    config: Config,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    cancel: CancellationToken,
    shared: Arc<SharedStatus>,
    nclients: Arc<AtomicUsize>,

    clients: HashMap<ClientId, ClientHandle>,
    /// Roster in connection order, for stable fan-out.
    client_order: Vec<ClientId>,
    source: Option<SourceHandle>,
    source_status: Map<String, Value>,
    recorder: Option<Recorder>,

    save_directory: PathBuf,
    save_file: String,
    recording_length: u32,
    read_interval: u32,
    start_time: chrono::DateTime<chrono::Local>,
}

impl Server {
    /// Bind the main client listener. Failure here fails server startup.
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let local_addr = listener.local_addr()?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let server = Self {
            save_directory: config.save_directory(),
            save_file: String::new(),
            recording_length: config.recording_length,
            read_interval: config.read_interval,
            config,
            listener: Some(listener),
            local_addr,
            control_tx,
            control_rx,
            cancel: CancellationToken::new(),
            shared: Arc::new(SharedStatus::default()),
            nclients: Arc::new(AtomicUsize::new(0)),
            clients: HashMap::new(),
            client_order: Vec::new(),
            source: None,
            source_status: Map::new(),
            recorder: None,
            start_time: chrono::Local::now(),
        };
        server.refresh_status();
        Ok(server)
    }

    /// Address the client listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shared_status(&self) -> Arc<SharedStatus> {
        Arc::clone(&self.shared)
    }

    /// Token cancelling the whole server; cancel it to shut down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the accept loop and the control task until shutdown.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("server is already running"))?;
        info!(
            "Data server listening on port {}. Allowing up to {} clients.",
            self.local_addr.port(),
            self.config.max_connections
        );

        tokio::spawn(accept_loop(
            listener,
            self.control_tx.clone(),
            Arc::clone(&self.nclients),
            self.config.max_connections,
            self.cancel.clone(),
        ));

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.shutdown();
                    break;
                }

                msg = self.control_rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_message(msg);
                    self.refresh_status();
                }
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::ClientConnected {
                id,
                addr,
                replies,
                cancel,
            } => {
                info!("New client at {}", addr);
                self.clients.insert(
                    id,
                    ClientHandle {
                        addr,
                        replies,
                        cancel,
                        pending: VecDeque::new(),
                        all_data: false,
                    },
                );
                self.client_order.push(id);
            }
            ControlMessage::ClientDisconnected { id } => {
                if let Some(handle) = self.clients.remove(&id) {
                    info!("Client disconnected {}", handle.addr);
                    handle.cancel.cancel();
                    self.client_order.retain(|&c| c != id);
                    self.nclients.fetch_sub(1, Ordering::Relaxed);
                }
            }
            ControlMessage::ClientProtocolError { id, message } => {
                if let Some(handle) = self.clients.get(&id) {
                    warn!("Error communicating with client at {}: {}", handle.addr, message);
                }
                self.reply(id, ServerReply::Error(message));
            }
            ControlMessage::ClientRequest { id, request } => self.dispatch(id, request),
            ControlMessage::Source(event) => self.handle_source_event(event),
        }
    }

    fn dispatch(&mut self, id: ClientId, request: ClientRequest) {
        match request {
            ClientRequest::CreateSource { kind, location } => {
                self.handle_create_source(id, kind, location);
            }
            ClientRequest::DeleteSource => self.handle_delete_source(id),
            ClientRequest::SetServerParam { param, value } => {
                self.handle_set_server_param(id, param, value);
            }
            ClientRequest::GetServerParam { param } => self.handle_get_server_param(id, param),
            ClientRequest::SetSourceParam { param, value } => {
                self.handle_set_source_param(id, param, value);
            }
            ClientRequest::GetSourceParam { param } => self.handle_get_source_param(id, param),
            ClientRequest::StartRecording => self.handle_start_recording(id),
            ClientRequest::StopRecording => self.handle_stop_recording(id),
            ClientRequest::GetData { start, stop } => self.handle_get_data(id, start, stop),
            ClientRequest::GetAllData { enabled } => self.handle_all_data_request(id, enabled),
        }
    }

    fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Initialized { success, msg } => self.on_initialized(success, msg),
            SourceEvent::StreamStarted { success, msg } => self.on_stream_started(success, msg),
            SourceEvent::StreamStopped { success, msg } => self.on_stream_stopped(success, msg),
            SourceEvent::GetResponse {
                param,
                success,
                value,
            } => self.on_get_response(param, success, value),
            SourceEvent::SetResponse {
                param,
                success,
                msg,
            } => self.on_set_response(param, success, msg),
            SourceEvent::Status(status) => {
                self.source_status = status;
            }
            SourceEvent::Samples(batch) => self.on_samples(batch),
            SourceEvent::Error(msg) => self.on_source_error(msg),
        }
    }

    /* Client request handlers. */

    fn handle_create_source(&mut self, id: ClientId, kind: String, location: String) {
        if self.source.is_some() {
            let msg = "Cannot create data source while another exists.";
            warn!("{}", msg);
            self.reply(
                id,
                ServerReply::SourceCreated {
                    success: false,
                    msg: msg.into(),
                },
            );
            return;
        }

        match source::create_source(&kind, &location) {
            Err(e) => {
                let msg = format!("Could not create source! {e}");
                warn!("{}", msg);
                self.reply(id, ServerReply::SourceCreated { success: false, msg });
            }
            Ok(src) => {
                let cancel = self.cancel.child_token();
                let (event_tx, mut event_rx) = mpsc::channel(64);
                let commands =
                    source::spawn_source(src, self.read_interval, event_tx, cancel.clone());

                // Bridge source events onto the control channel.
                let control = self.control_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        if control.send(ControlMessage::Source(event)).is_err() {
                            break;
                        }
                    }
                });

                let mut handle = SourceHandle::new(kind, location, commands, cancel);
                // A fresh adapter always has a free initialize slot.
                let _ = handle.pending.bind(CompletionKind::Initialize, id);
                handle.send(SourceCommand::Initialize);
                self.source = Some(handle);
            }
        }
    }

    fn on_initialized(&mut self, success: bool, msg: String) {
        let Some(src) = self.source.as_mut() else {
            return;
        };
        let client = src.pending.take(CompletionKind::Initialize);
        if success {
            info!("Data source successfully initialized");
        } else {
            warn!("Could not initialize data source: {}", msg);
            self.delete_source();
        }
        if let Some(client) = client {
            self.reply(client, ServerReply::SourceCreated { success, msg });
        }
    }

    fn handle_delete_source(&mut self, id: ClientId) {
        let (success, msg) = if self.source.is_none() {
            (false, "No source exists to be deleted.".to_string())
        } else if self.recorder.is_some() {
            (
                false,
                "Cannot delete source while recording is active, stop it first.".to_string(),
            )
        } else {
            self.delete_source();
            if let Some(handle) = self.clients.get(&id) {
                info!("Data source deleted by client at {}", handle.addr);
            }
            (true, String::new())
        };
        if !success {
            warn!("{}", msg);
        }
        self.reply(id, ServerReply::SourceDeleted { success, msg });
    }

    fn handle_set_server_param(&mut self, id: ClientId, param: String, value: ParamValue) {
        if self.recorder.is_some() {
            let msg = "Cannot set server parameters while a recording is active. Stop it first.";
            warn!("{}", msg);
            self.reply(
                id,
                ServerReply::ServerParamSet {
                    param,
                    success: false,
                    msg: msg.into(),
                },
            );
            return;
        }

        let addr = self.clients.get(&id).map(|c| c.addr);
        let (success, msg) = match (param.as_str(), value) {
            ("save-directory", ParamValue::Text(dir)) => {
                let path = PathBuf::from(&dir);
                if path.is_dir() {
                    if let Some(addr) = addr {
                        info!("Client at {} set the save directory to {}", addr, dir);
                    }
                    self.save_directory = path;
                    (true, String::new())
                } else {
                    (false, format!("Save directory does not exist: {dir}"))
                }
            }
            ("save-file", ParamValue::Text(name)) => {
                if self.save_directory.join(&name).exists() {
                    (
                        false,
                        "The requested file already exists, remove it first.".to_string(),
                    )
                } else {
                    if let Some(addr) = addr {
                        info!("Client at {} set the save file to {}", addr, name);
                    }
                    self.save_file = name;
                    (true, String::new())
                }
            }
            ("recording-length", ParamValue::UInt(length)) => {
                if let Some(addr) = addr {
                    info!("Client at {} set the recording length to {}", addr, length);
                }
                self.recording_length = length;
                (true, String::new())
            }
            ("read-interval", ParamValue::UInt(interval)) => {
                if interval == 0 {
                    (false, "The read interval must be positive.".to_string())
                } else {
                    if let Some(addr) = addr {
                        info!("Client at {} set the read interval to {}", addr, interval);
                    }
                    self.read_interval = interval;
                    if let Some(src) = &self.source {
                        src.send(SourceCommand::SetReadInterval(interval));
                    }
                    (true, String::new())
                }
            }
            // The parser only admits the four parameters above.
            _ => (false, format!("Unknown parameter type: {param}")),
        };
        if !success {
            warn!("Parameter '{}' not set: {}", param, msg);
        }
        self.reply(
            id,
            ServerReply::ServerParamSet {
                param,
                success,
                msg,
            },
        );
    }

    fn handle_get_server_param(&mut self, id: ClientId, param: String) {
        let result: Result<Vec<u8>, String> = match param.as_str() {
            "save-file" => Ok(self.save_file.clone().into_bytes()),
            "save-directory" => Ok(self.save_directory.display().to_string().into_bytes()),
            "recording-length" => Ok(self.recording_length.to_le_bytes().to_vec()),
            "read-interval" => Ok(self.read_interval.to_le_bytes().to_vec()),
            "start-time" => Ok(self.start_time.to_rfc3339().into_bytes()),
            "recording-exists" => Ok(vec![u8::from(self.recorder.is_some())]),
            "recording-position" => {
                let position = self.recorder.as_ref().map_or(0.0, Recorder::length_s);
                Ok((position as f32).to_le_bytes().to_vec())
            }
            "source-exists" => Ok(vec![u8::from(self.source.is_some())]),
            "source-type" => self
                .source
                .as_ref()
                .map(|s| s.kind.clone().into_bytes())
                .ok_or_else(|| "There is no active data source.".to_string()),
            "source-location" => self
                .source
                .as_ref()
                .map(|s| s.location.clone().into_bytes())
                .ok_or_else(|| "There is no active data source.".to_string()),
            _ => Err(format!("Unknown parameter type: {param}")),
        };

        let (success, value) = match result {
            Ok(value) => (true, value),
            Err(msg) => (false, msg.into_bytes()),
        };
        self.reply(
            id,
            ServerReply::ServerParamGot {
                param,
                success,
                value,
            },
        );
    }

    fn handle_set_source_param(&mut self, id: ClientId, param: String, value: Value) {
        let Some(src) = self.source.as_mut() else {
            self.reply(
                id,
                ServerReply::SourceParamSet {
                    param,
                    success: false,
                    msg: "There is no active data source.".into(),
                },
            );
            return;
        };
        if let Err(busy) = src.pending.bind(CompletionKind::Set, id) {
            self.reply(
                id,
                ServerReply::SourceParamSet {
                    param,
                    success: false,
                    msg: busy.to_string(),
                },
            );
            return;
        }
        src.send(SourceCommand::Set { param, value });
    }

    fn on_set_response(&mut self, param: String, success: bool, msg: String) {
        let Some(src) = self.source.as_mut() else {
            return;
        };
        let client = src.pending.take(CompletionKind::Set);
        if success {
            info!("Source parameter '{}' set", param);
        } else {
            warn!("Parameter '{}' not set: {}", param, msg);
        }
        if let Some(client) = client {
            self.reply(
                client,
                ServerReply::SourceParamSet {
                    param,
                    success,
                    msg,
                },
            );
        }
    }

    fn handle_get_source_param(&mut self, id: ClientId, param: String) {
        let Some(src) = self.source.as_mut() else {
            self.reply(
                id,
                ServerReply::SourceParamGot {
                    param,
                    success: false,
                    value: b"There is no active data source.".to_vec(),
                },
            );
            return;
        };
        if let Err(busy) = src.pending.bind(CompletionKind::Get, id) {
            self.reply(
                id,
                ServerReply::SourceParamGot {
                    param,
                    success: false,
                    value: busy.to_string().into_bytes(),
                },
            );
            return;
        }
        src.send(SourceCommand::Get { param });
    }

    fn on_get_response(&mut self, param: String, success: bool, value: Value) {
        let Some(src) = self.source.as_mut() else {
            return;
        };
        let client = src.pending.take(CompletionKind::Get);
        let encoded = if success {
            self.source_status.insert(param.clone(), value.clone());
            values::serialize(&param, &value)
        } else {
            warn!("Error retrieving parameter from source: {}", param);
            value.as_str().unwrap_or_default().as_bytes().to_vec()
        };
        if let Some(client) = client {
            self.reply(
                client,
                ServerReply::SourceParamGot {
                    param,
                    success,
                    value: encoded,
                },
            );
        }
    }

    fn handle_start_recording(&mut self, id: ClientId) {
        if self.recorder.is_some() {
            let msg = "Cannot create recording, one is already active.";
            warn!("{}", msg);
            self.reply(
                id,
                ServerReply::RecordingStarted {
                    success: false,
                    msg: msg.into(),
                },
            );
            return;
        }

        let Some(src) = self.source.as_mut() else {
            let msg = "Cannot start recording, there is no active data source.";
            warn!("{}", msg);
            self.reply(
                id,
                ServerReply::RecordingStarted {
                    success: false,
                    msg: msg.into(),
                },
            );
            return;
        };
        if let Err(busy) = src.pending.bind(CompletionKind::Start, id) {
            self.reply(
                id,
                ServerReply::RecordingStarted {
                    success: false,
                    msg: busy.to_string(),
                },
            );
            return;
        }

        let file_name = resolve_save_name(&self.save_file);
        match Recorder::create(&self.save_directory, &file_name, &self.source_status) {
            Err(e) => {
                src.pending.take(CompletionKind::Start);
                let msg = e.to_string();
                warn!("{}", msg);
                self.reply(id, ServerReply::RecordingStarted { success: false, msg });
            }
            Ok(recorder) => {
                self.save_file = file_name;
                self.recorder = Some(recorder);
                src.send(SourceCommand::StartStream);
            }
        }
    }

    fn on_stream_started(&mut self, success: bool, msg: String) {
        let client = self
            .source
            .as_mut()
            .and_then(|s| s.pending.take(CompletionKind::Start));
        if success {
            info!("Recording started");
        } else {
            warn!("Could not start recording: {}", msg);
            // The file never saw data; remove it so the name can be reused.
            if let Some(recorder) = self.recorder.take() {
                recorder.discard();
            }
        }
        if let Some(client) = client {
            self.reply(client, ServerReply::RecordingStarted { success, msg });
        }
    }

    fn handle_stop_recording(&mut self, id: ClientId) {
        if self.recorder.is_none() && self.source.is_some() {
            let msg = "Cannot stop recording, there is no recording to stop.";
            warn!("{}", msg);
            self.reply(
                id,
                ServerReply::RecordingStopped {
                    success: false,
                    msg: msg.into(),
                },
            );
            return;
        }

        let Some(src) = self.source.as_mut() else {
            let msg = "Cannot stop recording, there is no active data source.";
            warn!("{}", msg);
            self.reply(
                id,
                ServerReply::RecordingStopped {
                    success: false,
                    msg: msg.into(),
                },
            );
            return;
        };
        if let Err(busy) = src.pending.bind(CompletionKind::Stop, id) {
            self.reply(
                id,
                ServerReply::RecordingStopped {
                    success: false,
                    msg: busy.to_string(),
                },
            );
            return;
        }
        src.send(SourceCommand::StopStream);
    }

    fn on_stream_stopped(&mut self, success: bool, msg: String) {
        let client = self
            .source
            .as_mut()
            .and_then(|s| s.pending.take(CompletionKind::Stop));
        if success {
            if let Some(recorder) = self.recorder.take() {
                info!(
                    "Recording stopped after {:.3} seconds",
                    recorder.length_s()
                );
                if let Err(e) = recorder.close() {
                    warn!("Error closing recording file: {}", e);
                }
                self.save_file.clear();
            }
        } else {
            warn!("Could not stop recording: {}", msg);
        }
        if let Some(client) = client {
            self.reply(client, ServerReply::RecordingStopped { success, msg });
        }
    }

    fn handle_get_data(&mut self, id: ClientId, start: f32, stop: f32) {
        let Some(recorder) = &self.recorder else {
            self.reply(
                id,
                ServerReply::Error(
                    "There is no active recording, data cannot be requested.".into(),
                ),
            );
            return;
        };

        let sample_rate = f64::from(recorder.sample_rate());
        if let Err(msg) = validate_chunk(
            f64::from(start),
            f64::from(stop),
            sample_rate,
            self.config.max_chunk_size,
            f64::from(self.recording_length),
        ) {
            self.reply(id, ServerReply::Error(msg));
            return;
        }

        let start_sample = (f64::from(start) * sample_rate).round() as u64;
        let stop_sample = (f64::from(stop) * sample_rate).round() as u64;
        if stop_sample <= recorder.nsamples() {
            // Available now; read and send immediately.
            let reply = match recorder.read_range(start_sample, stop_sample) {
                Ok(samples) => ServerReply::Data(DataFrame::new(start, stop, samples)),
                Err(e) => ServerReply::Error(format!("Could not read requested data: {e}")),
            };
            self.reply(id, reply);
        } else if let Some(client) = self.clients.get_mut(&id) {
            client.pending.push_back(PendingRequest { start, stop });
        }
    }

    fn handle_all_data_request(&mut self, id: ClientId, enabled: bool) {
        let (success, msg) = if enabled && self.recorder.is_some() {
            (
                false,
                "Can only request all data before a recording starts. \
                 Data must now be requested in individual chunks."
                    .to_string(),
            )
        } else {
            if let Some(client) = self.clients.get_mut(&id) {
                client.all_data = enabled;
            }
            (true, String::new())
        };
        self.reply(id, ServerReply::AllData { success, msg });
    }

    /* Sample pipeline. */

    fn on_samples(&mut self, batch: SampleMatrix) {
        let Some(recorder) = &self.recorder else {
            debug!("dropping a batch of samples: no active recording");
            return;
        };

        if let Err(e) = recorder.append(&batch) {
            self.fatal_error(format!("Failed writing data to the recording: {e}"));
            return;
        }

        let sample_rate = f64::from(recorder.sample_rate());
        let after = recorder.nsamples();
        let before = after - u64::from(batch.nsamples());
        let frame = DataFrame::new(
            (before as f64 / sample_rate) as f32,
            (after as f64 / sample_rate) as f32,
            batch,
        );
        let now_s = recorder.length_s();

        for id in self.client_order.clone() {
            let Some(client) = self.clients.get_mut(&id) else {
                continue;
            };

            // All-data frames first, then any requests this batch unblocked.
            if client.all_data {
                client.send(ServerReply::Data(frame.clone()));
            }
            loop {
                let Some(request) = client.pending.front().copied() else {
                    break;
                };
                if f64::from(request.stop) > now_s {
                    break;
                }
                client.pending.pop_front();
                let start_sample = (f64::from(request.start) * sample_rate).round() as u64;
                let stop_sample = (f64::from(request.stop) * sample_rate).round() as u64;
                match recorder.read_range(start_sample, stop_sample) {
                    Ok(samples) => client.send(ServerReply::Data(DataFrame::new(
                        request.start,
                        request.stop,
                        samples,
                    ))),
                    Err(e) => {
                        client.send(ServerReply::Error(format!(
                            "Could not read requested data: {e}"
                        )));
                    }
                }
            }
        }

        if now_s >= f64::from(self.recording_length) {
            self.finish_recording(now_s);
        }
    }

    /// Normal end of a recording: the requested length has been collected.
    fn finish_recording(&mut self, length: f64) {
        info!(
            "{:.3} seconds of data finished streaming to the data file.",
            length
        );
        if let Some(src) = &self.source {
            src.send(SourceCommand::StopStream);
        }
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.close() {
                warn!("Error closing recording file: {}", e);
            }
        }
        self.save_file.clear();
    }

    /// Fatal source or recording failure: every client is notified and
    /// disconnected, the source is deleted, and any partial file is kept.
    fn fatal_error(&mut self, msg: String) {
        warn!("Error from data source: {}", msg);
        for (_, handle) in self.clients.drain() {
            handle.send(ServerReply::Error(msg.clone()));
            handle.cancel.cancel();
        }
        self.client_order.clear();
        self.nclients.store(0, Ordering::Relaxed);
        self.delete_source();
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.close() {
                warn!("Error closing recording file: {}", e);
            }
        }
        self.save_file.clear();
    }

    fn on_source_error(&mut self, msg: String) {
        self.fatal_error(msg);
    }

    fn delete_source(&mut self) {
        if let Some(src) = self.source.take() {
            src.shutdown();
        }
        self.source_status.clear();
    }

    /// Shutdown order: stop accepting (the accept loop shares our token),
    /// close the recorder, close all sessions, stop the source task.
    fn shutdown(&mut self) {
        info!("Server shutting down");
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.close() {
                warn!("Error closing recording file: {}", e);
            }
        }
        for (_, handle) in self.clients.drain() {
            handle.cancel.cancel();
        }
        self.client_order.clear();
        self.delete_source();
    }

    fn reply(&self, id: ClientId, reply: ServerReply) {
        if let Some(client) = self.clients.get(&id) {
            client.send(reply);
        }
    }

    fn refresh_status(&self) {
        let status = ServerStatus {
            start_time: self.start_time.to_rfc3339(),
            save_directory: self.save_directory.display().to_string(),
            save_file: self.save_file.clone(),
            recording_length: self.recording_length,
            read_interval: self.read_interval,
            recording_exists: self.recorder.is_some(),
            recording_position: self.recorder.as_ref().map_or(0.0, Recorder::length_s),
            source_exists: self.source.is_some(),
            source_type: self.source.as_ref().map(|s| s.kind.clone()),
            source_location: self.source.as_ref().map(|s| s.location.clone()),
            clients: self
                .client_order
                .iter()
                .filter_map(|id| self.clients.get(id))
                .map(|c| c.addr.to_string())
                .collect(),
        };
        *self.shared.server.write() = status;
        *self.shared.source.write() = if self.source.is_some() {
            Some(self.source_status.clone())
        } else {
            None
        };
    }
}

/// Check a `get-data` request against the chunk rules. Returns the error
/// message for the client when the request can never be serviced.
fn validate_chunk(
    start: f64,
    stop: f64,
    sample_rate: f64,
    max_chunk_size: f64,
    recording_length: f64,
) -> Result<(), String> {
    if !(start >= 0.0) {
        return Err("Requested chunk start must be non-negative.".into());
    }
    if !(stop > start + 1.0 / sample_rate) {
        return Err("Requested chunk must span at least one sample.".into());
    }
    if stop - start > max_chunk_size {
        return Err(format!(
            "Cannot request chunks of more than {max_chunk_size} seconds of data."
        ));
    }
    if stop > recording_length {
        return Err("Cannot request more data than will exist in the recording.".into());
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    control: mpsc::UnboundedSender<ControlMessage>,
    nclients: Arc<AtomicUsize>,
    max_connections: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    if nclients.load(Ordering::Relaxed) >= max_connections {
                        warn!(
                            "Connection attempt from {} while already at the maximum of {} \
                             clients. Ignoring the connection.",
                            addr, max_connections
                        );
                        continue;
                    }
                    nclients.fetch_add(1, Ordering::Relaxed);

                    let id = ClientId::new();
                    let session_cancel = cancel.child_token();
                    let replies =
                        session::spawn_session(socket, id, control.clone(), session_cancel.clone());
                    if control
                        .send(ControlMessage::ClientConnected {
                            id,
                            addr,
                            replies,
                            cancel: session_cancel,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => warn!("Failed accepting a connection: {}", e),
            },
        }
    }
    debug!("accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    const SAMPLE_RATE: f64 = 100.0;
    const NCHANNELS: u32 = 2;

    async fn test_server(dir: &TempDir) -> Server {
        let config = Config {
            port: 0,
            save_directory: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        Server::bind(config).await.expect("bind")
    }

    fn connect_client(server: &mut Server) -> (ClientId, UnboundedReceiver<ServerReply>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        server.handle_message(ControlMessage::ClientConnected {
            id,
            addr: "127.0.0.1:5000".parse().unwrap(),
            replies: tx,
            cancel: CancellationToken::new(),
        });
        (id, rx)
    }

    /// Attach a fabricated source whose command channel is held open by the
    /// returned receiver, with a status map good enough to record from.
    fn attach_source(server: &mut Server) -> mpsc::UnboundedReceiver<SourceCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        server.source = Some(SourceHandle::new(
            "file".into(),
            "/data/replay.h5".into(),
            tx,
            CancellationToken::new(),
        ));
        server.source_status = [
            ("source-type".to_string(), json!("file")),
            ("device-type".to_string(), json!("file")),
            ("sample-rate".to_string(), json!(SAMPLE_RATE)),
            ("nchannels".to_string(), json!(NCHANNELS)),
            ("gain".to_string(), json!(1.0)),
            ("adc-range".to_string(), json!(5.0)),
        ]
        .into_iter()
        .collect();
        rx
    }

    fn start_recording(server: &mut Server, id: ClientId) {
        server.dispatch(id, ClientRequest::StartRecording);
        server.handle_message(ControlMessage::Source(SourceEvent::StreamStarted {
            success: true,
            msg: String::new(),
        }));
    }

    fn batch(nsamples: u32) -> SampleMatrix {
        SampleMatrix::zeros(nsamples, NCHANNELS)
    }

    fn recv(rx: &mut UnboundedReceiver<ServerReply>) -> ServerReply {
        rx.try_recv().expect("expected a reply")
    }

    #[tokio::test]
    async fn server_params_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);

        server.dispatch(
            id,
            ClientRequest::SetServerParam {
                param: "recording-length".into(),
                value: ParamValue::UInt(2),
            },
        );
        assert!(matches!(
            recv(&mut rx),
            ServerReply::ServerParamSet { success: true, .. }
        ));

        server.dispatch(
            id,
            ClientRequest::GetServerParam {
                param: "recording-length".into(),
            },
        );
        match recv(&mut rx) {
            ServerReply::ServerParamGot {
                success, value, ..
            } => {
                assert!(success);
                assert_eq!(value, 2u32.to_le_bytes());
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        server.dispatch(
            id,
            ClientRequest::GetServerParam {
                param: "bogus".into(),
            },
        );
        assert!(matches!(
            recv(&mut rx),
            ServerReply::ServerParamGot { success: false, .. }
        ));
    }

    #[tokio::test]
    async fn save_directory_must_exist() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);

        server.dispatch(
            id,
            ClientRequest::SetServerParam {
                param: "save-directory".into(),
                value: ParamValue::Text("/definitely/not/a/directory".into()),
            },
        );
        assert!(matches!(
            recv(&mut rx),
            ServerReply::ServerParamSet { success: false, .. }
        ));
        assert_eq!(server.save_directory, dir.path());
    }

    #[tokio::test]
    async fn no_parameter_changes_while_recording() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);
        let _commands = attach_source(&mut server);
        start_recording(&mut server, id);
        let _ = recv(&mut rx); // recording-started

        server.dispatch(
            id,
            ClientRequest::SetServerParam {
                param: "recording-length".into(),
                value: ParamValue::UInt(5000),
            },
        );
        assert!(matches!(
            recv(&mut rx),
            ServerReply::ServerParamSet { success: false, .. }
        ));
        assert_eq!(server.recording_length, Config::default().recording_length);
    }

    #[tokio::test]
    async fn get_data_requires_a_recording() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);

        server.dispatch(
            id,
            ClientRequest::GetData {
                start: 0.0,
                stop: 1.0,
            },
        );
        assert!(matches!(recv(&mut rx), ServerReply::Error(_)));
    }

    #[tokio::test]
    async fn chunk_rules_are_enforced() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);
        let _commands = attach_source(&mut server);
        start_recording(&mut server, id);
        let _ = recv(&mut rx);

        // Oversized chunk.
        server.dispatch(
            id,
            ClientRequest::GetData {
                start: 0.0,
                stop: 11.0,
            },
        );
        assert!(matches!(recv(&mut rx), ServerReply::Error(_)));

        // Past the end of the recording.
        server.recording_length = 1;
        server.dispatch(
            id,
            ClientRequest::GetData {
                start: 0.5,
                stop: 2.0,
            },
        );
        assert!(matches!(recv(&mut rx), ServerReply::Error(_)));

        // Neither request was queued.
        assert!(server.clients[&id].pending.is_empty());
    }

    #[tokio::test]
    async fn pending_requests_drain_fifo_as_data_arrives() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);
        let _commands = attach_source(&mut server);
        server.recording_length = 10;
        start_recording(&mut server, id);
        let _ = recv(&mut rx);

        // Nothing recorded yet, so both requests queue.
        server.dispatch(
            id,
            ClientRequest::GetData {
                start: 0.0,
                stop: 0.1,
            },
        );
        server.dispatch(
            id,
            ClientRequest::GetData {
                start: 0.1,
                stop: 0.3,
            },
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(server.clients[&id].pending.len(), 2);

        // 0.2 s arrives: only the first request is fully covered.
        server.handle_message(ControlMessage::Source(SourceEvent::Samples(batch(20))));
        match recv(&mut rx) {
            ServerReply::Data(frame) => {
                assert_eq!(frame.start(), 0.0);
                assert_eq!(frame.stop(), 0.1);
                assert_eq!(frame.nsamples(), 10);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        // Another 0.2 s unblocks the second.
        server.handle_message(ControlMessage::Source(SourceEvent::Samples(batch(20))));
        match recv(&mut rx) {
            ServerReply::Data(frame) => {
                assert_eq!(frame.start(), 0.1);
                assert_eq!(frame.stop(), 0.3);
                assert_eq!(frame.nsamples(), 20);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(server.clients[&id].pending.is_empty());
    }

    #[tokio::test]
    async fn all_data_subscribers_get_one_frame_per_batch() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);
        let (other, mut other_rx) = connect_client(&mut server);
        let _commands = attach_source(&mut server);
        server.recording_length = 10;

        server.dispatch(id, ClientRequest::GetAllData { enabled: true });
        assert!(matches!(
            recv(&mut rx),
            ServerReply::AllData { success: true, .. }
        ));

        start_recording(&mut server, other);
        let _ = recv(&mut other_rx);

        for _ in 0..3 {
            server.handle_message(ControlMessage::Source(SourceEvent::Samples(batch(50))));
        }

        let mut stops = Vec::new();
        while let Ok(reply) = rx.try_recv() {
            match reply {
                ServerReply::Data(frame) => {
                    assert_eq!(frame.nsamples(), 50);
                    stops.push(frame.stop());
                }
                other => panic!("unexpected reply: {other:?}"),
            }
        }
        assert_eq!(stops, vec![0.5, 1.0, 1.5]);
        // The unsubscribed client saw nothing.
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn all_data_cannot_be_enabled_during_a_recording() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);
        let _commands = attach_source(&mut server);
        start_recording(&mut server, id);
        let _ = recv(&mut rx);

        server.dispatch(id, ClientRequest::GetAllData { enabled: true });
        assert!(matches!(
            recv(&mut rx),
            ServerReply::AllData { success: false, .. }
        ));

        // Cancelling is always allowed.
        server.dispatch(id, ClientRequest::GetAllData { enabled: false });
        assert!(matches!(
            recv(&mut rx),
            ServerReply::AllData { success: true, .. }
        ));
    }

    #[tokio::test]
    async fn recording_finishes_at_the_requested_length() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);
        let mut commands = attach_source(&mut server);
        server.recording_length = 1;
        server.save_file = "short".into();
        start_recording(&mut server, id);
        let _ = recv(&mut rx);
        assert_eq!(server.save_file, "short.h5");

        // 100 samples at 100 Hz crosses the 1 s limit exactly.
        server.handle_message(ControlMessage::Source(SourceEvent::Samples(batch(100))));
        assert!(server.recorder.is_none());
        assert!(server.save_file.is_empty());
        assert!(dir.path().join("short.h5").exists());

        // StartStream, then the finishing StopStream.
        assert!(matches!(
            commands.try_recv(),
            Ok(SourceCommand::StartStream)
        ));
        assert!(matches!(commands.try_recv(), Ok(SourceCommand::StopStream)));
    }

    #[tokio::test]
    async fn failed_stream_start_clears_the_recorder() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);
        let _commands = attach_source(&mut server);
        server.save_file = "stillborn".into();

        server.dispatch(id, ClientRequest::StartRecording);
        assert!(server.recorder.is_some());
        server.handle_message(ControlMessage::Source(SourceEvent::StreamStarted {
            success: false,
            msg: "device refused".into(),
        }));

        match recv(&mut rx) {
            ServerReply::RecordingStarted { success, msg } => {
                assert!(!success);
                assert!(msg.contains("refused"), "{msg}");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(server.recorder.is_none());
        // The empty file was removed so the name can be reused.
        assert!(!dir.path().join("stillborn.h5").exists());
    }

    #[tokio::test]
    async fn duplicate_source_requests_are_rejected_as_busy() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);
        let _commands = attach_source(&mut server);

        server.dispatch(
            id,
            ClientRequest::GetSourceParam {
                param: "gain".into(),
            },
        );
        // No completion yet; a second get must be rejected locally.
        server.dispatch(
            id,
            ClientRequest::GetSourceParam {
                param: "gain".into(),
            },
        );
        assert!(matches!(
            recv(&mut rx),
            ServerReply::SourceParamGot { success: false, .. }
        ));

        // Completion frees the slot and answers the first request.
        server.handle_message(ControlMessage::Source(SourceEvent::GetResponse {
            param: "gain".into(),
            success: true,
            value: json!(1.0),
        }));
        match recv(&mut rx) {
            ServerReply::SourceParamGot {
                success, value, ..
            } => {
                assert!(success);
                assert_eq!(value, 1.0f32.to_le_bytes());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_source_errors_disconnect_everyone() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (a, mut rx_a) = connect_client(&mut server);
        let (_b, mut rx_b) = connect_client(&mut server);
        let _commands = attach_source(&mut server);
        server.save_file = "partial".into();
        start_recording(&mut server, a);
        let _ = recv(&mut rx_a);
        server.handle_message(ControlMessage::Source(SourceEvent::Samples(batch(10))));

        server.handle_message(ControlMessage::Source(SourceEvent::Error(
            "device on fire".into(),
        )));

        // Every client got the error; the roster, source, and recorder are gone.
        assert!(matches!(recv(&mut rx_a), ServerReply::Error(msg) if msg.contains("on fire")));
        assert!(matches!(recv(&mut rx_b), ServerReply::Error(_)));
        assert!(server.clients.is_empty());
        assert!(server.source.is_none());
        assert!(server.recorder.is_none());
        // The partial file is kept.
        assert!(dir.path().join("partial.h5").exists());
    }

    #[tokio::test]
    async fn delete_source_is_blocked_during_recording() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);
        let _commands = attach_source(&mut server);
        start_recording(&mut server, id);
        let _ = recv(&mut rx);

        server.dispatch(id, ClientRequest::DeleteSource);
        assert!(matches!(
            recv(&mut rx),
            ServerReply::SourceDeleted { success: false, .. }
        ));
        assert!(server.source.is_some());
    }

    #[tokio::test]
    async fn unknown_source_types_fail_the_create_request() {
        let dir = TempDir::new().expect("tempdir");
        let mut server = test_server(&dir).await;
        let (id, mut rx) = connect_client(&mut server);

        server.dispatch(
            id,
            ClientRequest::CreateSource {
                kind: "laser".into(),
                location: String::new(),
            },
        );
        assert!(matches!(
            recv(&mut rx),
            ServerReply::SourceCreated { success: false, .. }
        ));
        assert!(server.source.is_none());
    }

    #[test]
    fn chunk_validation_covers_the_rules() {
        // Valid request.
        assert!(validate_chunk(0.5, 1.0, 100.0, 10.0, 1000.0).is_ok());
        // Negative start.
        assert!(validate_chunk(-0.1, 1.0, 100.0, 10.0, 1000.0).is_err());
        // Sub-sample span.
        assert!(validate_chunk(1.0, 1.005, 100.0, 10.0, 1000.0).is_err());
        // Too large.
        assert!(validate_chunk(0.0, 11.0, 100.0, 10.0, 1000.0).is_err());
        // Past the recording's final length.
        assert!(validate_chunk(999.5, 1000.5, 100.0, 10.0, 1000.0).is_err());
        // NaN never passes.
        assert!(validate_chunk(f64::NAN, 1.0, 100.0, 10.0, 1000.0).is_err());
        assert!(validate_chunk(0.0, f64::NAN, 100.0, 10.0, 1000.0).is_err());
    }
}
