//! Tool invocation transport.
//!
//! The tool catalog itself is an external collaborator; from the executor's
//! point of view a tool is an address that accepts a JSON request and
//! returns a JSON response within a bounded time. The transport seam is a
//! trait so tests can drop in scripted implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RunError;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tool returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("tool address {0:?} is not a valid URL")]
    BadAddress(String),

    #[error("tool returned a non-JSON response: {0}")]
    InvalidResponse(String),
}

impl ToolError {
    /// Timeouts, transport failures, and server-side errors are worth
    /// retrying; everything else means the request itself is wrong.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Timeout(_) | ToolError::Transport(_) => true,
            ToolError::Status { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            ToolError::BadAddress(_) | ToolError::InvalidResponse(_) => false,
        }
    }
}

impl From<ToolError> for RunError {
    fn from(err: ToolError) -> Self {
        if err.is_retryable() {
            RunError::retryable(err.to_string())
        } else {
            RunError::terminal(err.to_string())
        }
    }
}

/// Something that can deliver a tool request and bring back the response.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn invoke(
        &self,
        address: &str,
        input: Value,
        timeout: Duration,
    ) -> Result<Value, ToolError>;
}

/// HTTP transport: POSTs the rendered input to the tool's catalog address.
pub struct HttpToolTransport {
    client: reqwest::Client,
}

impl HttpToolTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpToolTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn invoke(
        &self,
        address: &str,
        input: Value,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let url: reqwest::Url = address
            .parse()
            .map_err(|_| ToolError::BadAddress(address.to_string()))?;

        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(&input)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout(timeout)
                } else {
                    ToolError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Status {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ToolError::InvalidResponse(e.to_string()))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_status_class() {
        assert!(ToolError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ToolError::Transport("connection reset".into()).is_retryable());
        assert!(ToolError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(ToolError::Status { status: 429, body: String::new() }.is_retryable());

        assert!(!ToolError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!ToolError::Status { status: 404, body: String::new() }.is_retryable());
        assert!(!ToolError::BadAddress("not a url".into()).is_retryable());
        assert!(!ToolError::InvalidResponse("trailing garbage".into()).is_retryable());
    }

    #[test]
    fn run_errors_inherit_the_classification() {
        let retry: RunError = ToolError::Status { status: 502, body: "bad gateway".into() }.into();
        assert!(retry.is_retryable());

        let terminal: RunError = ToolError::Status { status: 422, body: "bad input".into() }.into();
        assert!(!terminal.is_retryable());
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let err = ToolError::Status { status: 500, body: truncate(&body, 512) };
        assert!(err.to_string().len() < 600);
    }
}
