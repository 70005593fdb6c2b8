// Socket-facing half of a client connection.
//
// Each accepted client gets two tasks: a reader that accumulates
// length-prefixed frames, parses them, and forwards typed requests to the
// control task, and a writer that drains the client's reply channel in
// order. All per-client server state (the pending-request queue, the
// all-data flag) lives with the control task; these tasks only move bytes.

use crate::protocol::{self, ServerReply, MAX_REQUEST_SIZE};
use crate::server::ControlMessage;
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifies one connected client across the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Spawn the reader and writer tasks for a freshly accepted socket. Returns
/// the channel on which the control task queues this client's replies.
pub fn spawn_session(
    socket: TcpStream,
    id: ClientId,
    control: mpsc::UnboundedSender<ControlMessage>,
    cancel: CancellationToken,
) -> mpsc::UnboundedSender<ServerReply> {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let (read_half, write_half) = socket.into_split();

    tokio::spawn(write_loop(write_half, reply_rx, cancel.clone()));
    tokio::spawn(read_loop(read_half, id, control, cancel));

    reply_tx
}

async fn read_loop(
    mut read: OwnedReadHalf,
    id: ClientId,
    control: mpsc::UnboundedSender<ControlMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = read_frame(&mut read) => match result {
                Ok(Some(payload)) => match protocol::parse_request(&payload) {
                    Ok(request) => {
                        if control.send(ControlMessage::ClientRequest { id, request }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = control.send(ControlMessage::ClientProtocolError {
                            id,
                            message: e.to_string(),
                        });
                    }
                },
                Ok(None) => break, // clean disconnect
                Err(ReadError::TooLarge(size)) => {
                    // The stream cannot be resynced after a bogus size word.
                    warn!("client {} sent an impossible frame size {}, closing", id, size);
                    let _ = control.send(ControlMessage::ClientProtocolError {
                        id,
                        message: format!("Message of {size} bytes exceeds the maximum size."),
                    });
                    break;
                }
                Err(ReadError::Io(e)) => {
                    debug!("client {} socket error: {}", id, e);
                    break;
                }
            },
        }
    }

    let _ = control.send(ControlMessage::ClientDisconnected { id });
}

enum ReadError {
    TooLarge(u32),
    Io(std::io::Error),
}

/// Read one `u32 size | payload` frame. `Ok(None)` on a clean EOF at a
/// frame boundary.
async fn read_frame(read: &mut OwnedReadHalf) -> Result<Option<Vec<u8>>, ReadError> {
    let mut size_buf = [0u8; 4];
    match read.read_exact(&mut size_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ReadError::Io(e)),
    }

    let size = u32::from_le_bytes(size_buf);
    if size > MAX_REQUEST_SIZE {
        return Err(ReadError::TooLarge(size));
    }

    let mut payload = vec![0u8; size as usize];
    read.read_exact(&mut payload).await.map_err(ReadError::Io)?;
    Ok(Some(payload))
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    mut replies: mpsc::UnboundedReceiver<ServerReply>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush replies queued before the cancellation, so a final
                // error frame still reaches the client.
                while let Ok(reply) = replies.try_recv() {
                    if write.write_all(&protocol::encode_reply(&reply)).await.is_err() {
                        break;
                    }
                }
                break;
            }

            reply = replies.recv() => match reply {
                Some(reply) => {
                    if write.write_all(&protocol::encode_reply(&reply)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = write.shutdown().await;
}
