//! Structured replies produced by helpers and by the broker itself

use serde::{Deserialize, Serialize};

use crate::action::VariantMap;
use crate::codec::{Decoder, Encoder};
use crate::error::{BrokerError, Result};

/// Who produced a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// Failure detected by the broker (client or dispatcher side)
    BrokerError = 0,
    /// Failure reported by a helper handler
    HelperError = 1,
    Success = 2,
    /// The helper could not be reached
    TransportError = 3,
}

impl ReplyKind {
    fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(ReplyKind::BrokerError),
            1 => Some(ReplyKind::HelperError),
            2 => Some(ReplyKind::Success),
            3 => Some(ReplyKind::TransportError),
            _ => None,
        }
    }
}

/// Error codes of broker-produced replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoError = 0,
    NoResponder = 1,
    NoSuchAction = 2,
    InvalidAction = 3,
    AuthorizationDenied = 4,
    UserCancelled = 5,
    HelperBusy = 6,
    AlreadyStarted = 7,
    Transport = 8,
    Backend = 9,
    /// The job was killed before the helper answered
    Killed = 10,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let known = [
            ErrorCode::NoError,
            ErrorCode::NoResponder,
            ErrorCode::NoSuchAction,
            ErrorCode::InvalidAction,
            ErrorCode::AuthorizationDenied,
            ErrorCode::UserCancelled,
            ErrorCode::HelperBusy,
            ErrorCode::AlreadyStarted,
            ErrorCode::Transport,
            ErrorCode::Backend,
            ErrorCode::Killed,
        ];
        known.into_iter().find(|c| c.code() == code)
    }
}

/// Outcome of an action
///
/// Two replies compare equal when kind and code match; data and
/// description do not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReply {
    kind: ReplyKind,
    error: i32,
    error_description: String,
    data: VariantMap,
}

impl ActionReply {
    pub fn new(kind: ReplyKind) -> Self {
        Self {
            kind,
            error: 0,
            error_description: String::new(),
            data: VariantMap::new(),
        }
    }

    pub fn success_reply() -> Self {
        Self::new(ReplyKind::Success)
    }

    pub fn helper_error_reply() -> Self {
        Self::helper_error_reply_with_code(-1)
    }

    pub fn helper_error_reply_with_code(code: i32) -> Self {
        let mut reply = Self::new(ReplyKind::HelperError);
        reply.error = code;
        reply
    }

    fn broker_error(code: ErrorCode) -> Self {
        let mut reply = Self::new(ReplyKind::BrokerError);
        reply.error = code.code();
        reply
    }

    pub fn no_responder_reply() -> Self {
        Self::broker_error(ErrorCode::NoResponder)
    }

    pub fn no_such_action_reply() -> Self {
        Self::broker_error(ErrorCode::NoSuchAction)
    }

    pub fn invalid_action_reply() -> Self {
        Self::broker_error(ErrorCode::InvalidAction)
    }

    pub fn authorization_denied_reply() -> Self {
        Self::broker_error(ErrorCode::AuthorizationDenied)
    }

    pub fn user_cancelled_reply() -> Self {
        Self::broker_error(ErrorCode::UserCancelled)
    }

    pub fn helper_busy_reply() -> Self {
        Self::broker_error(ErrorCode::HelperBusy)
    }

    pub fn already_started_reply() -> Self {
        Self::broker_error(ErrorCode::AlreadyStarted)
    }

    pub fn backend_error_reply() -> Self {
        Self::broker_error(ErrorCode::Backend)
    }

    pub fn killed_reply() -> Self {
        Self::broker_error(ErrorCode::Killed)
    }

    pub fn transport_error_reply(description: impl Into<String>) -> Self {
        let mut reply = Self::new(ReplyKind::TransportError);
        reply.error = ErrorCode::Transport.code();
        reply.error_description = description.into();
        reply
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = description.into();
        self
    }

    pub fn with_data(mut self, data: VariantMap) -> Self {
        self.data = data;
        self
    }

    pub fn kind(&self) -> ReplyKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: ReplyKind) {
        self.kind = kind;
    }

    pub fn succeeded(&self) -> bool {
        self.kind == ReplyKind::Success
    }

    pub fn failed(&self) -> bool {
        !self.succeeded()
    }

    pub fn error(&self) -> i32 {
        self.error
    }

    /// The broker-defined code, when this is not a helper error
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.kind {
            ReplyKind::HelperError => None,
            _ => ErrorCode::from_code(self.error),
        }
    }

    /// Sets the error code; a helper error keeps its kind, anything else
    /// becomes a broker error.
    pub fn set_error(&mut self, code: i32) {
        self.error = code;
        if self.kind != ReplyKind::HelperError {
            self.kind = ReplyKind::BrokerError;
        }
    }

    pub fn set_error_code(&mut self, code: ErrorCode) {
        self.set_error(code.code());
    }

    pub fn error_description(&self) -> &str {
        &self.error_description
    }

    pub fn set_error_description(&mut self, description: impl Into<String>) {
        self.error_description = description.into();
    }

    pub fn data(&self) -> &VariantMap {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut VariantMap {
        &mut self.data
    }

    pub fn set_data(&mut self, data: VariantMap) {
        self.data = data;
    }

    pub fn add_data(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// `[data][code: u32][kind: u32][description]`
    ///
    /// Fails when the data is nested deeper than [`codec::MAX_DEPTH`], which
    /// [`ActionReply::deserialize`] would refuse.
    ///
    /// [`codec::MAX_DEPTH`]: crate::codec::MAX_DEPTH
    pub fn serialized(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.put_map(&self.data)?;
        enc.put_u32(self.error as u32);
        enc.put_u32(self.kind as u32);
        enc.put_str(&self.error_description);
        Ok(enc.finish())
    }

    /// Replaces a reply that cannot be serialized by a helper error saying why
    pub fn into_encodable(self) -> (Self, Vec<u8>) {
        match self.serialized() {
            Ok(bytes) => (self, bytes),
            Err(e) => {
                let reply = Self::helper_error_reply()
                    .with_description(format!("The reply could not be encoded: {}", e));
                let bytes = reply.serialized().unwrap_or_default();
                (reply, bytes)
            }
        }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let data = dec.get_map()?;
        let error = dec.get_u32()? as i32;
        let raw_kind = dec.get_u32()?;
        let kind = ReplyKind::from_raw(raw_kind)
            .ok_or_else(|| BrokerError::Codec(format!("unknown reply kind {}", raw_kind)))?;
        let error_description = dec.get_str()?;
        dec.finish()?;
        Ok(Self {
            kind,
            error,
            error_description,
            data,
        })
    }
}

impl Default for ActionReply {
    fn default() -> Self {
        Self::success_reply()
    }
}

impl PartialEq for ActionReply {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.error == other.error
    }
}

impl Eq for ActionReply {}
