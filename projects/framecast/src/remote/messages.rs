use crate::error::{FramecastError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestMessage {
    GetStatus,
    GetSource,
    SetSource { source_path: String },
    GetTarget,
    SetTarget { target_path: String },
    GetQuality,
    SetQuality { quality: u8 },
    GetPosition,
    SetPosition { position: u64 },
    GetMetadata,
    GetFrame { position: u64 },
    /// File bytes travel in the payload frame.
    SetSourceFile { filename: String },
    SetTargetFile { filename: String },
    CmdStartProcessing { position: u64 },
    CmdStopProcessing,
    CmdFrameProcessed { position: u64 },
}

impl RequestMessage {
    /// Wire name of the request, echoed in the response header.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestMessage::GetStatus => "GET_STATUS",
            RequestMessage::GetSource => "GET_SOURCE",
            RequestMessage::SetSource { .. } => "SET_SOURCE",
            RequestMessage::GetTarget => "GET_TARGET",
            RequestMessage::SetTarget { .. } => "SET_TARGET",
            RequestMessage::GetQuality => "GET_QUALITY",
            RequestMessage::SetQuality { .. } => "SET_QUALITY",
            RequestMessage::GetPosition => "GET_POSITION",
            RequestMessage::SetPosition { .. } => "SET_POSITION",
            RequestMessage::GetMetadata => "GET_METADATA",
            RequestMessage::GetFrame { .. } => "GET_FRAME",
            RequestMessage::SetSourceFile { .. } => "SET_SOURCE_FILE",
            RequestMessage::SetTargetFile { .. } => "SET_TARGET_FILE",
            RequestMessage::CmdStartProcessing { .. } => "CMD_START_PROCESSING",
            RequestMessage::CmdStopProcessing => "CMD_STOP_PROCESSING",
            RequestMessage::CmdFrameProcessed { .. } => "CMD_FRAME_PROCESSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResponseMessage {
    pub fn ok(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            status: ResponseStatus::Ok,
            message: None,
            fields: Map::new(),
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            status: ResponseStatus::Error,
            message: Some(message.into()),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Merges the fields of a serializable struct into the response.
    pub fn with_all<T: Serialize>(mut self, value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => {
                self.fields.extend(map);
                Ok(self)
            }
            other => Err(FramecastError::protocol(format!(
                "expected an object to merge into the response, got {other}"
            ))),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Turns `status = error` into `FramecastError::Remote`.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            ResponseStatus::Ok => Ok(self),
            ResponseStatus::Error => Err(FramecastError::Remote(
                self.message.unwrap_or_else(|| format!("{} failed", self.kind)),
            )),
        }
    }

    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .fields
            .get(key)
            .cloned()
            .ok_or_else(|| FramecastError::protocol(format!("response has no '{key}' field")))?;
        serde_json::from_value(value)
            .map_err(|e| FramecastError::protocol(format!("bad '{key}' field: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationMessage {
    /// A frame was stored in the buffer.
    NtfFrame { index: u64, time: f64, fps: f64 },
    /// First message on every subscription; later notifications are
    /// guaranteed to reach this subscriber.
    NtfSubscribed,
}

/// A header plus an optional binary payload frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub header: T,
    pub payload: Option<Vec<u8>>,
}

impl<T> Envelope<T> {
    pub fn new(header: T) -> Self {
        Self {
            header,
            payload: None,
        }
    }

    pub fn with_payload(header: T, payload: Vec<u8>) -> Self {
        Self {
            header,
            payload: Some(payload),
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn encode(&self) -> Result<Vec<Vec<u8>>> {
        let mut parts = vec![serde_json::to_vec(&self.header)?];
        if let Some(payload) = &self.payload {
            parts.push(payload.clone());
        }
        Ok(parts)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    pub fn decode(parts: Vec<Vec<u8>>) -> Result<Self> {
        let mut parts = parts.into_iter();
        let header = parts
            .next()
            .ok_or_else(|| FramecastError::protocol("message has no header frame"))?;
        let value: Value = serde_json::from_slice(&header)
            .map_err(|e| FramecastError::protocol(format!("header is not JSON: {e}")))?;
        if !value.get("type").map(Value::is_string).unwrap_or(false) {
            return Err(FramecastError::protocol("header has no 'type' field"));
        }
        let header = serde_json::from_value(value)
            .map_err(|e| FramecastError::protocol(format!("unexpected header: {e}")))?;
        let payload = parts.next();
        if parts.next().is_some() {
            return Err(FramecastError::protocol("more than two frames in message"));
        }
        Ok(Self { header, payload })
    }
}
