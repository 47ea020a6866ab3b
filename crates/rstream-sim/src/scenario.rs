//! Scenario files
//!
//! A scenario pairs a client configuration with one script per opened
//! connection:
//!
//! ```toml
//! method = "/market.Ticker/Subscribe"
//! request = "ABC"
//!
//! [client.stream]
//! retry = true
//! is_object = true
//!
//! [client.backoff]
//! type = "exponential"
//! initial_ms = 200
//!
//! [[connections]]
//! steps = [
//!     { after_ms = 50, type = "data", json = { px = 101.5 } },
//!     { after_ms = 300, type = "error", code = 14, message = "upstream reset" },
//! ]
//!
//! [[connections]]
//! fail = "connection refused"
//! ```
//!
//! Opens beyond the last script get a stream that stays silent until it is
//! cancelled.

use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use rstream_client::{ClientConfig, Metadata, Notification, RpcStatus};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Scenario {
    pub method: String,
    /// Request payload, sent as UTF-8 bytes
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionScript>,
}

/// What happens on one `open`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConnectionScript {
    /// Fail the open with this message instead of returning a stream
    #[serde(default)]
    pub fail: Option<String>,
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptStep {
    /// Delay before this step, relative to the previous one
    #[serde(default)]
    pub after_ms: u64,
    #[serde(flatten)]
    pub emit: ScriptedNotification,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScriptedNotification {
    Metadata {
        #[serde(default)]
        entries: Metadata,
    },
    Data {
        #[serde(default)]
        json: Option<serde_json::Value>,
        #[serde(default)]
        text: Option<String>,
    },
    End,
    Error {
        #[serde(default = "default_error_code")]
        code: i32,
        #[serde(default)]
        message: String,
    },
}

/// UNAVAILABLE
fn default_error_code() -> i32 {
    14
}

impl ScriptedNotification {
    pub fn to_notification(&self) -> Notification {
        match self {
            ScriptedNotification::Metadata { entries } => Notification::Metadata(entries.clone()),
            ScriptedNotification::Data { json, text } => {
                let payload = match (json, text) {
                    (Some(value), _) => Bytes::from(value.to_string()),
                    (None, Some(text)) => Bytes::from(text.clone()),
                    (None, None) => Bytes::new(),
                };
                Notification::Data(payload)
            }
            ScriptedNotification::End => Notification::End,
            ScriptedNotification::Error { code, message } => Notification::Error(RpcStatus {
                code: *code,
                message: message.clone(),
            }),
        }
    }
}

impl Scenario {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(content).context("Failed to parse scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid scenario file: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if !self.method.starts_with('/') {
            bail!("method must be fully qualified (\"/package.Service/Method\"), got {:?}", self.method);
        }
        self.client.validate()?;
        for (index, connection) in self.connections.iter().enumerate() {
            if connection.fail.is_some() && !connection.steps.is_empty() {
                bail!("connection {index}: a failing open cannot have steps");
            }
        }
        Ok(())
    }

    pub fn request_bytes(&self) -> Bytes {
        Bytes::from(self.request.clone())
    }
}
