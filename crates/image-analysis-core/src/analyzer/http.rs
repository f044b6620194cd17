use log::debug;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use std::time::Duration;

use super::RemoteCallError;
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("image-analysis/", env!("CARGO_PKG_VERSION"));

/// Longest slice of a response body carried into an error message
const EXCERPT_LEN: usize = 200;

pub(crate) fn build_client(timeout: Duration, cookies: bool) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .cookie_store(cookies)
        .build()
        .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// Send a request and turn every failure shape into a [`RemoteCallError`]
pub(crate) fn send_json(request: RequestBuilder) -> std::result::Result<Value, RemoteCallError> {
    let response = request.send().map_err(classify_transport)?;
    let status = response.status();

    if status.as_u16() == 429 {
        let retry_after = parse_retry_after(
            response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        return Err(RemoteCallError::RateLimited { retry_after });
    }

    let body = response.text().map_err(classify_transport)?;

    if !status.is_success() {
        return Err(RemoteCallError::Http {
            status: status.as_u16(),
            message: excerpt(&error_message(&body).unwrap_or_else(|| body.clone())),
        });
    }

    let value: Value = serde_json::from_str(&body)
        .map_err(|e| RemoteCallError::InvalidResponse(format!("Body is not JSON: {}", e)))?;
    check_application_error(&value)?;

    debug!("Remote call succeeded with status {}", status);
    Ok(value)
}

/// Map a reqwest failure, dropping the URL so query-string secrets never surface
pub(crate) fn classify_transport(err: reqwest::Error) -> RemoteCallError {
    if err.is_timeout() {
        return RemoteCallError::Timeout;
    }
    let err = err.without_url();
    if err.is_decode() {
        RemoteCallError::InvalidResponse(excerpt(&err.to_string()))
    } else {
        RemoteCallError::Network(excerpt(&err.to_string()))
    }
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored
pub(crate) fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// A 2xx body that still reports failure
pub(crate) fn check_application_error(value: &Value) -> std::result::Result<(), RemoteCallError> {
    let flagged = value.get("status").and_then(Value::as_str) == Some("error");
    let has_error = value.get("error").map(|e| !e.is_null()).unwrap_or(false);

    if flagged || has_error {
        let message = error_from_value(value).unwrap_or_else(|| "unspecified error".to_string());
        return Err(RemoteCallError::Application(excerpt(&message)));
    }
    Ok(())
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| error_from_value(&v))
}

fn error_from_value(value: &Value) -> Option<String> {
    match value.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(obj @ Value::Object(_)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Single-line, bounded excerpt of a message
pub(crate) fn excerpt(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_LEN {
        flat
    } else {
        let cut: String = flat.chars().take(EXCERPT_LEN).collect();
        format!("{}...", cut)
    }
}
