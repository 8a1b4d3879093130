// EventStream header block decoding.
//
// Each header is `name_len:u8 | name | value_type:u8 | value`. Decoding is
// tolerant: a malformed block yields whatever names were already decoded
// so the frame layer can force-complete instead of dropping the frame.

use std::collections::HashMap;

pub const HEADER_MESSAGE_TYPE: &str = ":message-type";
pub const HEADER_EVENT_TYPE: &str = ":event-type";
pub const HEADER_CONTENT_TYPE: &str = ":content-type";

pub const MESSAGE_TYPE_EVENT: &str = "event";
pub const EVENT_TYPE_ASSISTANT_RESPONSE: &str = "assistantResponseEvent";
pub const EVENT_TYPE_TOOL_USE: &str = "toolUseEvent";

/// Typed header values from the EventStream wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    BoolTrue,
    BoolFalse,
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Bytes(Vec<u8>),
    String(String),
    /// Milliseconds since epoch.
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

pub type HeaderMap = HashMap<String, HeaderValue>;

/// The defaults synthesized for an empty or unrecoverable header block.
pub fn default_headers() -> HeaderMap {
    HashMap::from([
        (
            HEADER_MESSAGE_TYPE.to_string(),
            HeaderValue::String(MESSAGE_TYPE_EVENT.to_string()),
        ),
        (
            HEADER_EVENT_TYPE.to_string(),
            HeaderValue::String(EVENT_TYPE_ASSISTANT_RESPONSE.to_string()),
        ),
        (
            HEADER_CONTENT_TYPE.to_string(),
            HeaderValue::String("application/json".to_string()),
        ),
    ])
}

#[derive(Debug, thiserror::Error)]
#[error("header block malformed at offset {offset}: {reason}")]
pub struct HeaderParseError {
    pub offset: usize,
    pub reason: &'static str,
    /// Names decoded before the failure; force-completion uses these.
    pub partial: HeaderMap,
}

/// Decode a full header block. On failure the partially decoded map rides
/// along in the error.
pub fn parse_headers(data: &[u8]) -> Result<HeaderMap, HeaderParseError> {
    let mut headers = HeaderMap::new();
    let mut offset = 0usize;

    macro_rules! bail {
        ($reason:expr) => {
            return Err(HeaderParseError {
                offset,
                reason: $reason,
                partial: headers,
            })
        };
    }

    while offset < data.len() {
        let name_len = data[offset] as usize;
        offset += 1;
        if name_len == 0 || offset + name_len > data.len() {
            bail!("bad name length");
        }
        let name = match std::str::from_utf8(&data[offset..offset + name_len]) {
            Ok(s) => s.to_string(),
            Err(_) => bail!("name not utf-8"),
        };
        offset += name_len;

        if offset >= data.len() {
            bail!("missing value type");
        }
        let value_type = data[offset];
        offset += 1;

        let value = match value_type {
            0 => HeaderValue::BoolTrue,
            1 => HeaderValue::BoolFalse,
            2 => {
                if offset + 1 > data.len() {
                    bail!("short byte value");
                }
                let v = HeaderValue::Byte(data[offset]);
                offset += 1;
                v
            }
            3 => {
                if offset + 2 > data.len() {
                    bail!("short int16 value");
                }
                let v = HeaderValue::Int16(i16::from_be_bytes([data[offset], data[offset + 1]]));
                offset += 2;
                v
            }
            4 => {
                if offset + 4 > data.len() {
                    bail!("short int32 value");
                }
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[offset..offset + 4]);
                offset += 4;
                HeaderValue::Int32(i32::from_be_bytes(raw))
            }
            5 => {
                if offset + 8 > data.len() {
                    bail!("short int64 value");
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[offset..offset + 8]);
                offset += 8;
                HeaderValue::Int64(i64::from_be_bytes(raw))
            }
            6 | 7 => {
                if offset + 2 > data.len() {
                    bail!("short length prefix");
                }
                let len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
                offset += 2;
                if offset + len > data.len() {
                    bail!("short variable value");
                }
                let raw = &data[offset..offset + len];
                offset += len;
                if value_type == 7 {
                    match std::str::from_utf8(raw) {
                        Ok(s) => HeaderValue::String(s.to_string()),
                        Err(_) => bail!("string value not utf-8"),
                    }
                } else {
                    HeaderValue::Bytes(raw.to_vec())
                }
            }
            8 => {
                if offset + 8 > data.len() {
                    bail!("short timestamp value");
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[offset..offset + 8]);
                offset += 8;
                HeaderValue::Timestamp(i64::from_be_bytes(raw))
            }
            9 => {
                if offset + 16 > data.len() {
                    bail!("short uuid value");
                }
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&data[offset..offset + 16]);
                offset += 16;
                HeaderValue::Uuid(raw)
            }
            _ => bail!("unknown value type"),
        };

        headers.insert(name, value);
    }

    Ok(headers)
}

/// Serialize one header entry; used by the frame encoder in tests and by
/// anything needing round-trip frames.
pub fn encode_header(buf: &mut Vec<u8>, name: &str, value: &HeaderValue) {
    buf.push(name.len() as u8);
    buf.extend_from_slice(name.as_bytes());
    match value {
        HeaderValue::BoolTrue => buf.push(0),
        HeaderValue::BoolFalse => buf.push(1),
        HeaderValue::Byte(v) => {
            buf.push(2);
            buf.push(*v);
        }
        HeaderValue::Int16(v) => {
            buf.push(3);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Int32(v) => {
            buf.push(4);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Int64(v) => {
            buf.push(5);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Bytes(v) => {
            buf.push(6);
            buf.extend_from_slice(&(v.len() as u16).to_be_bytes());
            buf.extend_from_slice(v);
        }
        HeaderValue::String(v) => {
            buf.push(7);
            buf.extend_from_slice(&(v.len() as u16).to_be_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
        HeaderValue::Timestamp(v) => {
            buf.push(8);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Uuid(v) => {
            buf.push(9);
            buf.extend_from_slice(v);
        }
    }
}
