//! Error kinds shared by every agent module
//!
//! Each variant maps to one failure class:
//! - Parse: malformed input, URL, JSON or undecryptable payload
//! - Read / Write: local or socket I/O
//! - Request / Connection: HTTP and duplex transport failures
//! - Authentication: signature, nonce or timestamp-window rejections
//! - Exec / Timeout / Unknown: process, deadline and randomness failures

use serde::{Deserialize, Serialize};

/// Agent error with a module-prefixed message and optional cause
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{msg}{}", cause_suffix(.cause))]
    Parse { msg: String, cause: Option<String> },
    #[error("{msg}{}", cause_suffix(.cause))]
    Read { msg: String, cause: Option<String> },
    #[error("{msg}{}", cause_suffix(.cause))]
    Write { msg: String, cause: Option<String> },
    #[error("{msg}{}", cause_suffix(.cause))]
    Request { msg: String, cause: Option<String> },
    #[error("{msg}{}", cause_suffix(.cause))]
    Connection { msg: String, cause: Option<String> },
    #[error("{msg}")]
    Authentication { msg: String },
    #[error("{msg}{}", cause_suffix(.cause))]
    Exec { msg: String, cause: Option<String> },
    #[error("{msg}")]
    Timeout { msg: String },
    #[error("{msg}{}", cause_suffix(.cause))]
    Unknown { msg: String, cause: Option<String> },
}

fn cause_suffix(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(": {}", cause),
        None => String::new(),
    }
}

impl AgentError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse { msg: msg.into(), cause: None }
    }

    pub fn parse_with(msg: impl Into<String>, cause: impl ToString) -> Self {
        Self::Parse { msg: msg.into(), cause: Some(cause.to_string()) }
    }

    pub fn read(msg: impl Into<String>, cause: impl ToString) -> Self {
        Self::Read { msg: msg.into(), cause: Some(cause.to_string()) }
    }

    pub fn write(msg: impl Into<String>, cause: impl ToString) -> Self {
        Self::Write { msg: msg.into(), cause: Some(cause.to_string()) }
    }

    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request { msg: msg.into(), cause: None }
    }

    pub fn request_with(msg: impl Into<String>, cause: impl ToString) -> Self {
        Self::Request { msg: msg.into(), cause: Some(cause.to_string()) }
    }

    pub fn connection(msg: impl Into<String>, cause: impl ToString) -> Self {
        Self::Connection { msg: msg.into(), cause: Some(cause.to_string()) }
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication { msg: msg.into() }
    }

    pub fn exec(msg: impl Into<String>) -> Self {
        Self::Exec { msg: msg.into(), cause: None }
    }

    pub fn exec_with(msg: impl Into<String>, cause: impl ToString) -> Self {
        Self::Exec { msg: msg.into(), cause: Some(cause.to_string()) }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout { msg: msg.into() }
    }

    pub fn unknown(msg: impl Into<String>, cause: impl ToString) -> Self {
        Self::Unknown { msg: msg.into(), cause: Some(cause.to_string()) }
    }

    /// Stable tag used as the `kind` field of log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Request { .. } => "request",
            Self::Connection { .. } => "connection",
            Self::Authentication { .. } => "authentication",
            Self::Exec { .. } => "exec",
            Self::Timeout { .. } => "timeout",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Error body returned by the collector on 4xx responses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub error: String,
    #[serde(default, rename = "error_msg")]
    pub message: String,
}
