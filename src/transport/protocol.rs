//! Wire protocol between clients and helpers
//!
//! Messages are JSON text frames on a WebSocket running over the helper's
//! Unix socket. Replies, arguments and signal payloads stay in the binary
//! encoding of [`crate::codec`] so that what a helper returns reaches the
//! client byte for byte.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::action::{DetailsMap, VariantMap};
use crate::codec::{self, Decoder, Encoder};
use crate::error::Result;

/// Messages from client to helper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving remote signals on this connection
    Subscribe,
    /// Run an action; answered with `ActionReply`
    PerformAction {
        request_id: Uuid,
        action: String,
        caller_id: Vec<u8>,
        details: DetailsMap,
        arguments: Vec<u8>,
    },
    /// Ask the running handler to stop, no answer
    StopAction { action: String },
}

/// Messages from helper to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperMessage {
    /// First message on every connection
    Connected { helper_id: String, connection: String },
    /// Subscription is active (also sent when it already was)
    Subscribed,
    /// Direct answer to `PerformAction`
    ActionReply { request_id: Uuid, reply: Vec<u8> },
    RemoteSignal(RemoteSignal),
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    ActionStarted,
    ActionPerformed,
    DebugMessage,
    ProgressStepIndicator,
    ProgressStepData,
}

/// A signal broadcast to every subscribed connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSignal {
    pub signal: SignalType,
    pub action: String,
    pub request_id: Option<Uuid>,
    pub payload: Vec<u8>,
}

/// Severity carried by `DebugMessage` signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLevel {
    Debug = 0,
    Warning = 1,
    Critical = 2,
    Info = 4,
}

impl DebugLevel {
    pub fn from_raw(value: u32) -> Self {
        match value {
            1 => DebugLevel::Warning,
            2 | 3 => DebugLevel::Critical,
            4 => DebugLevel::Info,
            _ => DebugLevel::Debug,
        }
    }
}

impl From<&tracing::Level> for DebugLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => DebugLevel::Critical,
            tracing::Level::WARN => DebugLevel::Warning,
            tracing::Level::INFO => DebugLevel::Info,
            _ => DebugLevel::Debug,
        }
    }
}

impl ClientMessage {
    pub fn to_frame(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

impl HelperMessage {
    pub fn to_frame(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

pub fn progress_step_payload(percent: i32) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_i32(percent);
    enc.finish()
}

pub fn parse_progress_step(payload: &[u8]) -> Result<i32> {
    let mut dec = Decoder::new(payload);
    let percent = dec.get_i32()?;
    dec.finish()?;
    Ok(percent)
}

pub fn progress_data_payload(data: &VariantMap) -> Result<Vec<u8>> {
    codec::encode_map(data)
}

pub fn parse_progress_data(payload: &[u8]) -> Result<VariantMap> {
    codec::decode_map(payload)
}

pub fn debug_payload(level: DebugLevel, message: &str) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_u32(level as u32);
    enc.put_str(message);
    enc.finish()
}

pub fn parse_debug(payload: &[u8]) -> Result<(DebugLevel, String)> {
    let mut dec = Decoder::new(payload);
    let level = DebugLevel::from_raw(dec.get_u32()?);
    let message = dec.get_str()?;
    dec.finish()?;
    Ok((level, message))
}
