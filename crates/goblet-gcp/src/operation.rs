//! Long-running operation polling.
//!
//! ```text
//! Pending ──poll──▶ Pending ──poll──▶ … ──▶ Done | Errored
//!    └──────────────── deadline ─────────────▶ TimedOut
//! ```
//!
//! Only values that look like operations (a `done` or `operationType`
//! field, or an `operations/` name) are polled; anything else is already finished.

use crate::api::{ApiCall, CloudApi, HttpMethod};
use crate::error::{GcpError, GcpResult};
use log::debug;
use serde_json::Value;
use std::time::{Duration, Instant};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl PollSettings {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationState {
    Pending { name: String },
    Done(Value),
    Errored { code: u16, message: String },
}

impl OperationState {
    pub fn from_value(op: &Value) -> Self {
        let done = op.get("done").and_then(|v| v.as_bool()).unwrap_or(false)
            || op.get("status").and_then(|v| v.as_str()) == Some("DONE");
        let name = op.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let is_operation = op.get("done").is_some()
            || op.get("operationType").is_some()
            || name.starts_with("operations/")
            || name.contains("/operations/");

        if done || name.is_empty() || !is_operation {
            if let Some(err) = op.get("error").filter(|e| !e.is_null()) {
                let code = err
                    .get("code")
                    .and_then(|v| v.as_u64())
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(500);
                let message = err
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Operation failed")
                    .to_string();
                return OperationState::Errored { code, message };
            }
            let result = op.get("response").cloned().unwrap_or_else(|| op.clone());
            return OperationState::Done(result);
        }
        OperationState::Pending {
            name: name.to_string(),
        }
    }
}

/// Poll `{version_path}/{operation.name}` until done, errored or timed out.
pub async fn wait_for_operation(
    api: &dyn CloudApi,
    service: &str,
    version_path: &str,
    operation: &Value,
    settings: PollSettings,
) -> GcpResult<Value> {
    let started = Instant::now();
    let mut current = operation.clone();
    loop {
        match OperationState::from_value(&current) {
            OperationState::Done(result) => return Ok(result),
            OperationState::Errored { code, message } => {
                return Err(GcpError::operation_failed(service, code, &message));
            }
            OperationState::Pending { name } => {
                if started.elapsed() >= settings.timeout {
                    return Err(GcpError::operation_timeout(
                        service,
                        &name,
                        settings.timeout.as_secs(),
                    ));
                }
                debug!(target: "goblet::client", "waiting on operation {}", name);
                tokio::time::sleep(settings.interval).await;
                let call = ApiCall::new(service, HttpMethod::Get, format!("{}/{}", version_path, name));
                current = api.send(call).await?;
            }
        }
    }
}
