use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone)]
pub enum ToolError {
    /// Transport-level failure worth retrying (connection loss, timeouts).
    #[error("tool transport failure: {0}")]
    Transient(String),
    /// The invocation itself is invalid; retrying cannot help.
    #[error("tool invocation failed: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Result of one tool invocation. `is_error` marks a tool-level failure
/// (the tool ran and reported an error), distinct from transport failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn combined_text(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Tool-invocation seam. The orchestrator never talks to tool processes
/// directly; it routes every call, first-attempt or retry, through this
/// trait.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn execute_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError>;
}

/// Delay curve and attempt ceiling for transient-failure retry. Both are
/// policy, not protocol: embedders tune them in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt. The first attempt runs
    /// immediately; attempt `n` waits `initial * multiplier^(n-2)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = u64::from(self.multiplier).saturating_pow(attempt - 2);
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor))
    }
}

/// Run `op` with backoff on transient failures.
///
/// `on_attempt(attempt, delay)` fires before each attempt (delay is zero for
/// the first) so callers can surface "retrying in Ns" versus "executing"
/// status text.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
    mut on_attempt: impl FnMut(u32, Duration),
) -> Result<T, ToolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ToolError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let delay = policy.delay_before(attempt);
        on_attempt(attempt, delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(ToolError::Transient(message)) => {
                debug!(attempt, "transient tool failure: {message}");
                last_error = Some(ToolError::Transient(message));
            }
            Err(fatal) => return Err(fatal),
        }
    }

    Err(last_error.unwrap_or_else(|| ToolError::Transient("no attempts made".to_string())))
}

/// Backoff-aware wrapper around a [`ToolClient`]. One executor is shared by
/// every retry the orchestrator issues.
#[derive(Clone)]
pub struct ToolCallExecutor {
    client: Arc<dyn ToolClient>,
    policy: RetryPolicy,
}

impl ToolCallExecutor {
    pub fn new(client: Arc<dyn ToolClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        on_attempt: impl FnMut(u32, Duration),
    ) -> Result<ToolOutput, ToolError> {
        retry_with_backoff(
            &self.policy,
            || self.client.execute_tool(name, arguments),
            on_attempt,
        )
        .await
    }
}
