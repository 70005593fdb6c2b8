// Wire encoding of source parameter values.
//
// The control protocol treats source parameter values as opaque bytes; the
// encoding is keyed by parameter name so both ends agree without a schema.
// Parameters not listed here round-trip as raw UTF-8 text.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("value for '{param}' must be {expected} bytes, got {got}")]
    BadLength {
        param: String,
        expected: usize,
        got: usize,
    },

    #[error("value for '{param}' is truncated")]
    Truncated { param: String },

    #[error("value for '{param}' is not valid UTF-8")]
    BadText { param: String },
}

/// Encode a parameter value for transfer to a client.
///
/// The inverse of [`deserialize`]; both are keyed on the parameter name.
pub fn serialize(param: &str, value: &Value) -> Vec<u8> {
    match param {
        "nchannels" => (value.as_u64().unwrap_or(0) as u32).to_le_bytes().to_vec(),
        "sample-rate" | "gain" | "adc-range" => (value.as_f64().unwrap_or(0.0) as f32)
            .to_le_bytes()
            .to_vec(),
        "has-analog-output" => vec![u8::from(value.as_bool().unwrap_or(false))],
        "analog-output" => {
            let empty = Vec::new();
            let items = value.as_array().unwrap_or(&empty);
            let mut buf = Vec::with_capacity(4 + items.len() * 8);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                buf.extend_from_slice(&item.as_f64().unwrap_or(0.0).to_le_bytes());
            }
            buf
        }
        "configuration" => {
            let empty = Vec::new();
            let items = value.as_array().unwrap_or(&empty);
            let mut buf = Vec::with_capacity(4 + items.len() * 4);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                buf.extend_from_slice(&(item.as_u64().unwrap_or(0) as u32).to_le_bytes());
            }
            buf
        }
        _ => match value {
            Value::String(s) => s.as_bytes().to_vec(),
            other => other.to_string().into_bytes(),
        },
    }
}

/// Decode a parameter value received from a client.
pub fn deserialize(param: &str, bytes: &[u8]) -> Result<Value, ValueError> {
    match param {
        "nchannels" => {
            let raw = fixed::<4>(param, bytes)?;
            Ok(Value::from(u32::from_le_bytes(raw)))
        }
        "sample-rate" | "gain" | "adc-range" => {
            let raw = fixed::<4>(param, bytes)?;
            Ok(Value::from(f32::from_le_bytes(raw) as f64))
        }
        "has-analog-output" => {
            let raw = fixed::<1>(param, bytes)?;
            Ok(Value::from(raw[0] != 0))
        }
        "analog-output" => {
            let (count, body) = counted(param, bytes, 8)?;
            let values: Vec<Value> = body
                .chunks_exact(8)
                .take(count)
                .map(|c| Value::from(f64::from_le_bytes(c.try_into().unwrap())))
                .collect();
            Ok(Value::Array(values))
        }
        "configuration" => {
            let (count, body) = counted(param, bytes, 4)?;
            let values: Vec<Value> = body
                .chunks_exact(4)
                .take(count)
                .map(|c| Value::from(u32::from_le_bytes(c.try_into().unwrap())))
                .collect();
            Ok(Value::Array(values))
        }
        _ => std::str::from_utf8(bytes)
            .map(|s| Value::String(s.to_string()))
            .map_err(|_| ValueError::BadText {
                param: param.to_string(),
            }),
    }
}

fn fixed<const N: usize>(param: &str, bytes: &[u8]) -> Result<[u8; N], ValueError> {
    bytes.try_into().map_err(|_| ValueError::BadLength {
        param: param.to_string(),
        expected: N,
        got: bytes.len(),
    })
}

fn counted<'a>(
    param: &str,
    bytes: &'a [u8],
    elem_size: usize,
) -> Result<(usize, &'a [u8]), ValueError> {
    if bytes.len() < 4 {
        return Err(ValueError::Truncated {
            param: param.to_string(),
        });
    }
    let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let body = &bytes[4..];
    if body.len() < count * elem_size {
        return Err(ValueError::Truncated {
            param: param.to_string(),
        });
    }
    Ok((count, body))
}
