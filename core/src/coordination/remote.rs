// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Master-to-worker tool invocation.

use std::time::Duration;
use tracing::{debug, warn};

use crate::coordination::protocol::ToolCallResponse;
use crate::coordination::types::{CoordinationError, CoordinationResult, WorkerRecord};
use crate::tools::ToolResult;

/// Total attempts per call: the initial try plus three retries.
const MAX_ATTEMPTS: u32 = 4;

/// First retry delay; doubles per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Invokes a single tool on a worker over HTTP, with bounded retries.
///
/// The executor never mutates the registry: a final failure surfaces as
/// [`CoordinationError::WorkerUnreachable`] and the caller decides where
/// to route next.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    client: reqwest::Client,
    call_timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl RemoteExecutor {
    /// Executor with the given per-attempt timeout.
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            call_timeout,
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
        }
    }

    /// Override the retry policy. Tests shrink the backoff to keep
    /// retry paths fast.
    pub fn with_retry_policy(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    /// Invoke `tool` on `worker`.
    ///
    /// Transport failures and 5xx responses are retried with exponential
    /// backoff; a 4xx response is a protocol error and is not retried.
    pub async fn call(
        &self,
        worker: &WorkerRecord,
        tool: &str,
        params: &serde_json::Value,
    ) -> CoordinationResult<ToolResult> {
        let url = format!("{}/tools/{tool}", worker.base_url());
        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self
                .client
                .post(&url)
                .timeout(self.call_timeout)
                .json(params)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_client_error() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(CoordinationError::ToolFailed(format!(
                            "worker {} rejected tool {tool}: {status} {body}",
                            worker.instance_id
                        )));
                    }
                    if status.is_server_error() {
                        last_error = format!("{status}");
                        warn!(
                            worker = %worker.instance_id,
                            tool,
                            attempt,
                            %status,
                            "remote tool call failed"
                        );
                        continue;
                    }
                    let parsed = response
                        .json::<ToolCallResponse>()
                        .await
                        .map_err(|e| CoordinationError::Communication(e.to_string()))?;
                    return Ok(ToolResult {
                        success: parsed.success,
                        result: parsed.result,
                        error: parsed.error,
                    });
                }
                Err(error) => {
                    last_error = error.to_string();
                    debug!(
                        worker = %worker.instance_id,
                        tool,
                        attempt,
                        %error,
                        "remote tool call transport error"
                    );
                }
            }
        }

        warn!(
            worker = %worker.instance_id,
            tool,
            attempts = self.max_attempts,
            last_error,
            "worker unreachable after retries"
        );
        Err(CoordinationError::WorkerUnreachable(
            worker.instance_id.clone(),
        ))
    }
}
