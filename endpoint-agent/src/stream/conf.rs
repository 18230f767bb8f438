//! Server-pushed check configuration
//!
//! The collector sends a whole [`Conf`] at a time. It replaces the active
//! one in a single swap; definitions are normalized lazily by the check
//! runner on every evaluation.

use crate::crypto::filter_str;
use crate::errors::AgentError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const MIN_FREQUENCY: i64 = 10;
const MAX_FREQUENCY: i64 = 3600;
const DEFAULT_TIMEOUT: i64 = 5;
const MAX_TIMEOUT: i64 = 30;
const DEFAULT_STATUS_CODE: u16 = 200;
const MAX_STATUS_CODE: i64 = 900;
const MAX_HEADER_KEY: usize = 256;
const MAX_HEADER_VALUE: usize = 2048;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Check exactly as received from the collector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckDefinition {
    pub id: String,
    pub name: String,
    pub roles: Option<Vec<String>>,
    pub frequency: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub targets: Option<Vec<String>>,
    pub timeout: i64,
    pub method: String,
    pub status_code: i64,
    pub headers: Option<Vec<Header>>,
}

/// Configuration document pushed over the stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conf {
    #[serde(default)]
    pub checks: Option<Vec<CheckDefinition>>,
}

impl Conf {
    pub fn checks(&self) -> &[CheckDefinition] {
        self.checks.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Http,
    /// Accepted but performs no network action
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// Validated check with every field clamped into range
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub id: String,
    pub name: String,
    pub roles: Vec<String>,
    pub frequency: Duration,
    pub kind: ProbeKind,
    pub method: HttpMethod,
    pub targets: Vec<String>,
    pub timeout: Duration,
    pub status_code: u16,
    pub headers: Vec<Header>,
}

impl CheckDefinition {
    /// Validate required fields and clamp the rest
    pub fn normalize(&self) -> Result<Check, AgentError> {
        if self.id.is_empty() {
            return Err(AgentError::parse("stream: Check ID is invalid"));
        }

        let kind = match self.kind.as_str() {
            "http" => ProbeKind::Http,
            "ping" => ProbeKind::Ping,
            other => {
                return Err(AgentError::parse(format!(
                    "stream: Check type ({}) is invalid",
                    other
                )))
            }
        };

        let method = HttpMethod::parse(&self.method).ok_or_else(|| {
            AgentError::parse(format!("stream: Check method ({}) is invalid", self.method))
        })?;

        let name = if self.name.is_empty() {
            "unknown".to_string()
        } else {
            self.name.clone()
        };

        let frequency = self.frequency.clamp(MIN_FREQUENCY, MAX_FREQUENCY);

        let timeout = if self.timeout < 1 {
            DEFAULT_TIMEOUT
        } else {
            self.timeout.min(MAX_TIMEOUT)
        };

        let status_code = if self.status_code <= 0 || self.status_code > MAX_STATUS_CODE {
            DEFAULT_STATUS_CODE
        } else {
            self.status_code as u16
        };

        let headers = self
            .headers
            .iter()
            .flatten()
            .map(|h| Header {
                key: filter_str(&h.key, MAX_HEADER_KEY),
                value: filter_str(&h.value, MAX_HEADER_VALUE),
            })
            .collect();

        Ok(Check {
            id: self.id.clone(),
            name,
            roles: self.roles.clone().unwrap_or_default(),
            frequency: Duration::from_secs(frequency as u64),
            kind,
            method,
            targets: self.targets.clone().unwrap_or_default(),
            timeout: Duration::from_secs(timeout as u64),
            status_code,
            headers,
        })
    }
}

/// Slot holding the configuration currently in force
#[derive(Debug, Clone, Default)]
pub struct ActiveConf {
    current: Arc<RwLock<Arc<Conf>>>,
}

impl ActiveConf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot; later replacements never mutate it
    pub fn load(&self) -> Arc<Conf> {
        self.current.read().clone()
    }

    pub fn replace(&self, conf: Conf) {
        *self.current.write() = Arc::new(conf);
    }
}
