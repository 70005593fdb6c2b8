// The length-prefixed control protocol spoken with remote clients.
//
// Every message in either direction is framed as `u32 size (LE) | payload`,
// where `size` counts the payload bytes only. The payload opens with an
// ASCII message-type token terminated by a single newline; the remainder is
// type-specific. Integers and floats are little-endian, floats are IEEE-754
// single precision, and bools are one byte.

use crate::frame::DataFrame;
use crate::source::values::{self, ValueError};
use serde_json::Value;
use thiserror::Error;

/// Upper bound on an inbound control payload. Every client message is a few
/// hundred bytes at most; anything larger means the stream is corrupt, and
/// the protocol has no resync marker, so the session must be closed.
pub const MAX_REQUEST_SIZE: u32 = 1 << 20;

/// Errors produced while parsing an inbound payload. None of these close the
/// session; the client receives an `error` reply instead.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message type is malformed, must have newline after message type.")]
    MissingTypeToken,

    #[error("Unknown message type from client: {0}")]
    UnknownType(String),

    #[error("Unknown server parameter: {0}")]
    UnknownServerParam(String),

    #[error("Message body for '{kind}' is malformed: {reason}")]
    MalformedBody { kind: &'static str, reason: String },

    #[error("{0}")]
    BadValue(#[from] ValueError),
}

/// A parsed client request, handed to the server core for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    CreateSource { kind: String, location: String },
    DeleteSource,
    SetServerParam { param: String, value: ParamValue },
    GetServerParam { param: String },
    SetSourceParam { param: String, value: Value },
    GetSourceParam { param: String },
    StartRecording,
    StopRecording,
    GetData { start: f32, stop: f32 },
    GetAllData { enabled: bool },
}

/// A server parameter value as carried on the wire: `recording-length` and
/// `read-interval` are `u32`, the path-valued parameters are text.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    UInt(u32),
}

/// A reply or pushed frame bound for one client. `value` fields carry the
/// already-encoded bytes of the parameter value (or an error message).
#[derive(Debug, Clone)]
pub enum ServerReply {
    SourceCreated { success: bool, msg: String },
    SourceDeleted { success: bool, msg: String },
    ServerParamSet { param: String, success: bool, msg: String },
    ServerParamGot { param: String, success: bool, value: Vec<u8> },
    SourceParamSet { param: String, success: bool, msg: String },
    SourceParamGot { param: String, success: bool, value: Vec<u8> },
    RecordingStarted { success: bool, msg: String },
    RecordingStopped { success: bool, msg: String },
    AllData { success: bool, msg: String },
    Data(DataFrame),
    Error(String),
}

/// Parse one inbound payload (the bytes following the size prefix).
pub fn parse_request(payload: &[u8]) -> Result<ClientRequest, ProtocolError> {
    let (token, body) = split_line(payload).ok_or(ProtocolError::MissingTypeToken)?;
    match token {
        b"create-source" => parse_create_source(body),
        b"delete-source" => Ok(ClientRequest::DeleteSource),
        b"set" => parse_server_set(body),
        b"get" => Ok(ClientRequest::GetServerParam {
            param: text(body, "get")?,
        }),
        b"set-source" => parse_source_set(body),
        b"get-source" => Ok(ClientRequest::GetSourceParam {
            param: text(body, "get-source")?,
        }),
        b"start-recording" => Ok(ClientRequest::StartRecording),
        b"stop-recording" => Ok(ClientRequest::StopRecording),
        b"get-data" => parse_get_data(body),
        b"get-all-data" => parse_get_all_data(body),
        other => Err(ProtocolError::UnknownType(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

fn parse_create_source(body: &[u8]) -> Result<ClientRequest, ProtocolError> {
    let (kind, location) = split_line(body).ok_or(ProtocolError::MalformedBody {
        kind: "create-source",
        reason: "missing newline after source type".into(),
    })?;
    Ok(ClientRequest::CreateSource {
        kind: utf8(kind, "create-source")?,
        location: utf8(location, "create-source")?,
    })
}

fn parse_server_set(body: &[u8]) -> Result<ClientRequest, ProtocolError> {
    let (param, rest) = split_line(body).ok_or(ProtocolError::MalformedBody {
        kind: "set",
        reason: "missing newline after parameter name".into(),
    })?;
    let param = utf8(param, "set")?;
    let value = match param.as_str() {
        "save-file" | "save-directory" => ParamValue::Text(utf8(rest, "set")?),
        "recording-length" | "read-interval" => {
            let raw: [u8; 4] = rest.try_into().map_err(|_| ProtocolError::MalformedBody {
                kind: "set",
                reason: format!("'{param}' takes a 4-byte unsigned value, got {}", rest.len()),
            })?;
            ParamValue::UInt(u32::from_le_bytes(raw))
        }
        _ => return Err(ProtocolError::UnknownServerParam(param)),
    };
    Ok(ClientRequest::SetServerParam { param, value })
}

fn parse_source_set(body: &[u8]) -> Result<ClientRequest, ProtocolError> {
    let (param, rest) = split_line(body).ok_or(ProtocolError::MalformedBody {
        kind: "set-source",
        reason: "missing newline after parameter name".into(),
    })?;
    let param = utf8(param, "set-source")?;
    let value = values::deserialize(&param, rest)?;
    Ok(ClientRequest::SetSourceParam { param, value })
}

fn parse_get_data(body: &[u8]) -> Result<ClientRequest, ProtocolError> {
    if body.len() != 8 {
        return Err(ProtocolError::MalformedBody {
            kind: "get-data",
            reason: format!("expected 8 bytes of start/stop times, got {}", body.len()),
        });
    }
    Ok(ClientRequest::GetData {
        start: f32::from_le_bytes(body[0..4].try_into().unwrap()),
        stop: f32::from_le_bytes(body[4..8].try_into().unwrap()),
    })
}

fn parse_get_all_data(body: &[u8]) -> Result<ClientRequest, ProtocolError> {
    if body.len() != 1 {
        return Err(ProtocolError::MalformedBody {
            kind: "get-all-data",
            reason: format!("expected a single flag byte, got {}", body.len()),
        });
    }
    Ok(ClientRequest::GetAllData {
        enabled: body[0] != 0,
    })
}

/// Encode a reply as a complete wire frame, size prefix included.
pub fn encode_reply(reply: &ServerReply) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    match reply {
        ServerReply::SourceCreated { success, msg } => {
            ack(&mut payload, "source-created", *success, msg.as_bytes());
        }
        ServerReply::SourceDeleted { success, msg } => {
            ack(&mut payload, "source-deleted", *success, msg.as_bytes());
        }
        ServerReply::ServerParamSet {
            param,
            success,
            msg,
        } => param_reply(&mut payload, "set", *success, param, msg.as_bytes()),
        ServerReply::ServerParamGot {
            param,
            success,
            value,
        } => param_reply(&mut payload, "get", *success, param, value),
        ServerReply::SourceParamSet {
            param,
            success,
            msg,
        } => param_reply(&mut payload, "set-source", *success, param, msg.as_bytes()),
        ServerReply::SourceParamGot {
            param,
            success,
            value,
        } => param_reply(&mut payload, "get-source", *success, param, value),
        ServerReply::RecordingStarted { success, msg } => {
            ack(&mut payload, "recording-started", *success, msg.as_bytes());
        }
        ServerReply::RecordingStopped { success, msg } => {
            ack(&mut payload, "recording-stopped", *success, msg.as_bytes());
        }
        ServerReply::AllData { success, msg } => {
            ack(&mut payload, "get-all-data", *success, msg.as_bytes());
        }
        ServerReply::Data(frame) => {
            payload.extend_from_slice(b"data\n");
            frame.serialize_into(&mut payload);
        }
        ServerReply::Error(msg) => {
            payload.extend_from_slice(b"error\n");
            payload.extend_from_slice(msg.as_bytes());
        }
    }

    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    framed
}

/// `<token>\n bool | msg` replies.
fn ack(buf: &mut Vec<u8>, token: &str, success: bool, msg: &[u8]) {
    buf.extend_from_slice(token.as_bytes());
    buf.push(b'\n');
    buf.push(u8::from(success));
    buf.extend_from_slice(msg);
}

/// `<token>\n bool | param \n | body` replies.
fn param_reply(buf: &mut Vec<u8>, token: &str, success: bool, param: &str, body: &[u8]) {
    buf.extend_from_slice(token.as_bytes());
    buf.push(b'\n');
    buf.push(u8::from(success));
    buf.extend_from_slice(param.as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(body);
}

/// Split at the first newline. Returns the bytes before it and everything
/// after; `None` when no newline exists.
fn split_line(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes.iter().position(|&b| b == b'\n')?;
    Some((&bytes[..pos], &bytes[pos + 1..]))
}

/// Decode a parameter name, tolerating an optional trailing newline.
fn text(bytes: &[u8], kind: &'static str) -> Result<String, ProtocolError> {
    let trimmed = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    utf8(trimmed, kind)
}

fn utf8(bytes: &[u8], kind: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::MalformedBody {
        kind,
        reason: "text field is not valid UTF-8".into(),
    })
}
