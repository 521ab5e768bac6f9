//! Wire model for the daemon <-> UI channel.
//!
//! One JSON object per line. Every object carries a `type`; requests carry
//! a caller-chosen `id` and their answers echo it back under a type ending
//! in `_result`, which is how a reader tells an answer from a push.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RESULT_SUFFIX: &str = "_result";
pub const DEFAULT_LOG_LINES: usize = 50;

const KNOWN_TYPES: &[&str] = &[
    "status",
    "reload_config",
    "restart",
    "logs",
    "input_response",
    "status_result",
    "reload_config_result",
    "restart_result",
    "logs_result",
    "error",
    "status_update",
    "input_request",
];

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed line: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("message has no type field")]
    MissingType,
    #[error("invalid {kind} message: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("message cannot be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Every message kind the daemon and its clients exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // Client -> daemon requests.
    Status {
        id: String,
    },
    ReloadConfig {
        id: String,
    },
    Restart {
        id: String,
    },
    Logs {
        id: String,
        #[serde(default = "default_log_lines")]
        lines: usize,
    },
    InputResponse {
        id: String,
        #[serde(default, skip_serializing_if = "is_false")]
        cancelled: bool,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        data: Map<String, Value>,
    },

    // Daemon -> client answers.
    StatusResult {
        id: String,
        #[serde(flatten)]
        status: DaemonStatus,
    },
    ReloadConfigResult {
        id: String,
        success: bool,
        message: String,
    },
    RestartResult {
        id: String,
        success: bool,
    },
    LogsResult {
        id: String,
        content: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },

    // Daemon -> client pushes.
    StatusUpdate {
        connected: bool,
        port: Option<String>,
    },
    InputRequest(InputRequest),

    /// A well-formed line whose `type` is not part of the protocol.
    #[serde(skip)]
    Unknown { kind: String, id: Option<String> },
}

impl Message {
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line).map_err(ProtocolError::Malformed)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            let id = value.get("id").and_then(Value::as_str).map(str::to_string);
            return Ok(Message::Unknown { kind, id });
        }

        serde_json::from_value(value).map_err(|source| ProtocolError::Invalid { kind, source })
    }

    /// Serialize as one newline-terminated line.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self).map_err(ProtocolError::Encode)?;
        line.push('\n');
        Ok(line)
    }

    pub fn kind(&self) -> &str {
        match self {
            Message::Status { .. } => "status",
            Message::ReloadConfig { .. } => "reload_config",
            Message::Restart { .. } => "restart",
            Message::Logs { .. } => "logs",
            Message::InputResponse { .. } => "input_response",
            Message::StatusResult { .. } => "status_result",
            Message::ReloadConfigResult { .. } => "reload_config_result",
            Message::RestartResult { .. } => "restart_result",
            Message::LogsResult { .. } => "logs_result",
            Message::Error { .. } => "error",
            Message::StatusUpdate { .. } => "status_update",
            Message::InputRequest(_) => "input_request",
            Message::Unknown { kind, .. } => kind,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Status { id }
            | Message::ReloadConfig { id }
            | Message::Restart { id }
            | Message::Logs { id, .. }
            | Message::InputResponse { id, .. }
            | Message::StatusResult { id, .. }
            | Message::ReloadConfigResult { id, .. }
            | Message::RestartResult { id, .. }
            | Message::LogsResult { id, .. } => Some(id),
            Message::InputRequest(request) => Some(&request.id),
            Message::Error { id, .. } | Message::Unknown { id, .. } => id.as_deref(),
            Message::StatusUpdate { .. } => None,
        }
    }

    /// True for answers to a request (`<request>_result`).
    pub fn is_result(&self) -> bool {
        self.kind().ends_with(RESULT_SUFFIX)
    }

    pub fn error(id: Option<&str>, message: impl Into<String>) -> Self {
        Message::Error {
            id: id.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Requests a client can issue through `request()`; the id is filled in
/// by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Status,
    ReloadConfig,
    Restart,
    Logs { lines: usize },
}

impl RequestKind {
    pub fn into_message(self, id: String) -> Message {
        match self {
            RequestKind::Status => Message::Status { id },
            RequestKind::ReloadConfig => Message::ReloadConfig { id },
            RequestKind::Restart => Message::Restart { id },
            RequestKind::Logs { lines } => Message::Logs { id, lines },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonStatus {
    pub connected: bool,
    pub port: Option<String>,
    pub jira_enabled: bool,
    pub notion_enabled: bool,
    pub weather_enabled: bool,
    pub calendar_enabled: bool,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    WorkDescription,
    Duration,
    MeetingLog,
    #[serde(other)]
    Other,
}

/// Pushed to every UI when a device workflow needs a human answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    pub id: String,
    pub prompt: PromptKind,
    pub fields: Vec<InputField>,
    /// Workflow context shown next to the prompt (`issue_key`, `duration`, ...).
    #[serde(flatten)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub kind: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub default: String,
}

impl InputField {
    pub fn text(name: &str, label: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            kind: default_field_type(),
            label: label.into(),
            default: default.into(),
        }
    }
}

/// The human's answer to an [`InputRequest`], as delivered to the waiting
/// workflow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputReply {
    pub cancelled: bool,
    pub data: Map<String, Value>,
}

impl InputReply {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }
}

fn default_log_lines() -> usize {
    DEFAULT_LOG_LINES
}

fn default_field_type() -> String {
    "text".to_string()
}

fn is_false(value: &bool) -> bool {
    !*value
}
