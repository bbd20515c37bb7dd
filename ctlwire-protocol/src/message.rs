//! JSON envelope types for commands and responses.

use crate::error::ProtocolError;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Command types understood by the remote controller.
///
/// The envelope's `type` field is a free-form string; these are the
/// well-known values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    // Session
    Authenticate,

    // Mouse
    MouseMove,
    MouseClick,
    MouseScroll,

    // Keyboard
    KeyPress,
    KeyRelease,
    TypeText,

    // Display and windows
    CaptureScreen,
    GetDisplays,
    GetWindowInfo,
    ListWindows,
}

impl CommandType {
    /// Returns the wire name of this command type.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Authenticate => "authenticate",
            CommandType::MouseMove => "mouse_move",
            CommandType::MouseClick => "mouse_click",
            CommandType::MouseScroll => "mouse_scroll",
            CommandType::KeyPress => "key_press",
            CommandType::KeyRelease => "key_release",
            CommandType::TypeText => "type_text",
            CommandType::CaptureScreen => "capture_screen",
            CommandType::GetDisplays => "get_displays",
            CommandType::GetWindowInfo => "get_window_info",
            CommandType::ListWindows => "list_windows",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CommandType> for String {
    fn from(command_type: CommandType) -> Self {
        command_type.as_str().to_string()
    }
}

/// Current time as an RFC 3339 / ISO-8601 UTC timestamp.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Command envelope sent to the remote controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Correlation ID, unique among in-flight commands.
    pub id: String,

    /// Command type.
    #[serde(rename = "type")]
    pub command_type: String,

    /// Command-specific payload.
    #[serde(default)]
    pub payload: Value,

    /// Creation time (ISO-8601).
    pub timestamp: String,

    /// Opaque session token, passed through unvalidated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Command {
    pub fn new(id: impl Into<String>, command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            command_type: command_type.into(),
            payload,
            timestamp: now_timestamp(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Response envelope produced by the remote controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// ID of the command this response settles.
    pub command_id: String,

    /// Outcome.
    pub status: ResponseStatus,

    /// Result payload (for successful responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Error message (for error responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Peer timestamp.
    #[serde(default)]
    pub timestamp: String,

    /// Fields outside the envelope (e.g. `type` on heartbeat replies).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    pub fn success(command_id: impl Into<String>, data: Value) -> Self {
        Self {
            command_id: command_id.into(),
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
            timestamp: now_timestamp(),
            extra: Map::new(),
        }
    }

    pub fn error(command_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: ResponseStatus::Error,
            data: None,
            error: Some(message.into()),
            timestamp: now_timestamp(),
            extra: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

/// A decoded inbound document.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A reply carrying a `command_id`.
    Response(Response),
    /// Events, heartbeat replies and anything else without a correlation ID.
    Unsolicited(Value),
}

impl Inbound {
    /// Classifies a decoded JSON document.
    ///
    /// Objects typed `"event"` or without a `command_id` are unsolicited.
    /// Anything carrying a string `command_id` must match the response
    /// envelope shape.
    pub fn classify(doc: Value) -> Result<Self, ProtocolError> {
        let obj = doc
            .as_object()
            .ok_or(ProtocolError::InvalidEnvelope("expected a JSON object"))?;

        if obj.get("type").and_then(Value::as_str) == Some("event") {
            return Ok(Inbound::Unsolicited(doc));
        }

        match obj.get("command_id") {
            None | Some(Value::Null) => Ok(Inbound::Unsolicited(doc)),
            Some(Value::String(_)) => Ok(Inbound::Response(serde_json::from_value(doc)?)),
            Some(_) => Err(ProtocolError::InvalidEnvelope("command_id must be a string")),
        }
    }
}

// ============================================================================
// Command-specific result types
// ============================================================================

/// Result of an `authenticate` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A display attached to the remote machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    pub id: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub is_primary: bool,
}

/// Result of a `get_displays` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayList {
    #[serde(default)]
    pub displays: Vec<DisplayData>,
}

/// A top-level window on the remote machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowData {
    pub id: u64,
    pub title: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub process_name: String,
}

/// Result of a `list_windows` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowList {
    #[serde(default)]
    pub windows: Vec<WindowData>,
}
