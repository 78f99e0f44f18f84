//! Helpers shared by the HTTP relay backends.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde_json::Value;

use super::{RelayError, RelayOperation, RelayResult};
use crate::util::compact_text;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub(super) fn build_client() -> RelayResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|error| RelayError::Unknown(format!("Failed to build HTTP client: {error}")))
}

/// Classify a failure that happened before a status code was received.
pub(super) fn transport_error(
    operation: RelayOperation,
    target: &str,
    error: &reqwest::Error,
) -> RelayError {
    let message = format!("{operation} {target} failed: {error}");
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        RelayError::Transient(message)
    } else if let Some(status) = error.status() {
        RelayError::from_status(status.as_u16(), message)
    } else {
        RelayError::Unknown(message)
    }
}

/// Non-success response with its body already read.
#[derive(Debug)]
pub(super) struct ApiFailure {
    pub status: StatusCode,
    pub body: String,
}

impl ApiFailure {
    pub async fn read(response: Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self { status, body }
    }

    /// Best human readable description of the failure.
    pub fn summary(&self) -> String {
        parse_api_error(self.status, &self.body)
    }

    pub fn into_error(self, operation: RelayOperation, target: &str) -> RelayError {
        RelayError::from_status(
            self.status.as_u16(),
            format!("{operation} {target}: {}", self.summary()),
        )
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<Value>(body) {
        let message = ["error_summary", "message", "error_description", "error"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|message| !message.is_empty());
        if let Some(message) = message {
            return format!("{} ({})", compact_text(message), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact_text(trimmed), status.as_u16())
    }
}

/// Read a successful response body.
pub(super) async fn read_bytes(
    operation: RelayOperation,
    target: &str,
    response: Response,
) -> RelayResult<Vec<u8>> {
    response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|error| transport_error(operation, target, &error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_api_error_prefers_error_summary() {
        let body = r#"{"error_summary": "path/not_found/..", "error": {".tag": "path"}}"#;
        assert_eq!(
            parse_api_error(StatusCode::CONFLICT, body),
            "path/not_found/.. (409)"
        );
    }

    #[test]
    fn parse_api_error_falls_back_to_body_or_status() {
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, "  upstream down "),
            "upstream down (502)"
        );
        assert_eq!(parse_api_error(StatusCode::UNAUTHORIZED, ""), "HTTP 401");
    }
}
