//! Wire codec
//!
//! Requests and responses travel either as JSON text or as MessagePack with
//! named fields. Every message is a single frame: a 4-byte big-endian length
//! followed by the payload.
//!
//! `FindResult` has a custom representation: it is sent as a tagged object
//! `{dataType: "TotalArray", total, lookupMap, value}` so that the total
//! count and lookup map survive both encodings. Decoding also accepts a plain
//! array.

use std::fmt;
use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, Status, SyncError};
use crate::model::FindResult;

/// Frames above this size are rejected before the payload is read
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const TOTAL_ARRAY: &str = "TotalArray";

/// Request id: clients use either numbers or strings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReqId {
    Num(i64),
    Str(String),
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReqId::Num(n) => write!(f, "{}", n),
            ReqId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ReqId {
    fn from(n: i64) -> Self {
        ReqId::Num(n)
    }
}

impl From<i32> for ReqId {
    fn from(n: i32) -> Self {
        ReqId::Num(n as i64)
    }
}

impl From<&str> for ReqId {
    fn from(s: &str) -> Self {
        ReqId::Str(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Absent for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ReqId>,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    /// Client send time; when present the response echoes processing time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

impl Request {
    pub fn new(id: impl Into<ReqId>, method: &str, params: Vec<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: method.to_string(),
            params,
            time: None,
        }
    }

    /// Deserialize positional parameter `index`; missing params read as null.
    pub fn param<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.params.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| SyncError::InvalidParams {
            method: self.method.clone(),
            reason: format!("param {}: {}", index, e),
        })
    }
}

/// Same shape as `Request` but with an untyped method, so a non-string
/// method is reported as a protocol error rather than a generic parse error.
#[derive(Deserialize)]
struct RawRequest {
    #[serde(default)]
    id: Option<ReqId>,
    #[serde(default)]
    method: Value,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    #[serde(rename = "final")]
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub remaining: u32,
    pub limit: u32,
    pub reset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ReqId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Status>,
    /// Server asks the client to drop the connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
    /// Server-side processing time in ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    /// Requests in flight on the session when this one completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<usize>,
}

impl Response {
    pub fn ok(id: Option<ReqId>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn error(id: Option<ReqId>, err: &SyncError) -> Self {
        Self {
            id,
            error: Some(err.status()),
            ..Default::default()
        }
    }

    /// Server-initiated broadcast (no id)
    pub fn broadcast(result: Value) -> Self {
        Self::ok(None, result)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Deserialize the result payload into a concrete type.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.result.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

// ============================================================================
// FindResult representation
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TotalArrayRef<'a, T> {
    data_type: &'static str,
    total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    lookup_map: Option<&'a Map<String, Value>>,
    value: &'a [T],
}

impl<T: Serialize> Serialize for FindResult<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        TotalArrayRef {
            data_type: TOTAL_ARRAY,
            total: self.total,
            lookup_map: self.lookup_map.as_ref(),
            value: &self.value,
        }
        .serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound = "T: Deserialize<'de>")]
struct TotalArray<T> {
    #[allow(dead_code)]
    data_type: String,
    #[serde(default = "unknown_total")]
    total: i64,
    #[serde(default)]
    lookup_map: Option<Map<String, Value>>,
    value: Vec<T>,
}

fn unknown_total() -> i64 {
    -1
}

#[derive(Deserialize)]
#[serde(untagged)]
#[serde(bound = "T: Deserialize<'de>")]
enum FindResultRepr<T> {
    Tagged(TotalArray<T>),
    Plain(Vec<T>),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for FindResult<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match FindResultRepr::deserialize(deserializer)? {
            FindResultRepr::Tagged(t) => FindResult {
                value: t.value,
                total: t.total,
                lookup_map: t.lookup_map,
            },
            FindResultRepr::Plain(value) => FindResult {
                total: value.len() as i64,
                value,
                lookup_map: None,
            },
        })
    }
}

// ============================================================================
// Encode / decode
// ============================================================================

fn encode<T: Serialize>(value: &T, binary: bool) -> Result<Vec<u8>> {
    if binary {
        Ok(rmp_serde::to_vec_named(value)?)
    } else {
        Ok(serde_json::to_vec(value)?)
    }
}

pub fn encode_request(request: &Request, binary: bool) -> Result<Vec<u8>> {
    encode(request, binary)
}

pub fn encode_response(response: &Response, binary: bool) -> Result<Vec<u8>> {
    encode(response, binary)
}

/// Decode a request frame.
///
/// Any parse failure, and a method that is not a string, is a
/// `MalformedRequest`.
pub fn decode_request(bytes: &[u8], binary: bool) -> Result<Request> {
    let raw: RawRequest = if binary {
        rmp_serde::from_slice(bytes).map_err(|e| SyncError::MalformedRequest(e.to_string()))?
    } else {
        serde_json::from_slice(bytes).map_err(|e| SyncError::MalformedRequest(e.to_string()))?
    };

    let method = match raw.method {
        Value::String(m) => m,
        other => {
            return Err(SyncError::MalformedRequest(format!(
                "method must be a string, got {}",
                other
            )))
        }
    };

    Ok(Request {
        id: raw.id,
        method,
        params: raw.params,
        time: raw.time,
    })
}

/// Decode a response frame.
///
/// In binary mode the peer may still answer in text (e.g. before the
/// handshake switched modes), so text is tried first. When both fail the
/// error carries both reasons.
pub fn decode_response(bytes: &[u8], binary: bool) -> Result<Response> {
    match serde_json::from_slice::<Response>(bytes) {
        Ok(resp) => Ok(resp),
        Err(text_err) if binary => rmp_serde::from_slice::<Response>(bytes).map_err(|bin_err| {
            SyncError::MalformedResponse(format!("text: {}; binary: {}", text_err, bin_err))
        }),
        Err(text_err) => Err(SyncError::MalformedResponse(text_err.to_string())),
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Read one length-prefixed frame. `Ok(None)` on clean EOF.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(SyncError::FrameTooLarge(data.len()));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes())?;
    writer.write_all(data)?;
    writer.flush()?;
    Ok(())
}
