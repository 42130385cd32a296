// ── Failure classification ──
//
// Maps a non-2xx response onto the fixed error taxonomy. Pure: no I/O,
// no side effects. The session-expiry side effects live in the coordinator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::error::Error;

/// Fallback when the server gave no usable message.
pub const GENERIC_FAILURE_MESSAGE: &str = "request failed";

/// Heuristic for rate-limit wording in server messages.
///
/// Some upstreams report throttling as a 400 or 503 with prose instead of
/// a 429. Matches "too many requests" and "rate limit" (also spelled
/// "rate-limit" / "ratelimit"), case-insensitively.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("too many requests")
        || lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("ratelimit")
}

/// Classify a non-success response.
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Error {
    if status == StatusCode::UNAUTHORIZED {
        return Error::SessionExpired;
    }

    let parsed: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let message = parsed
        .as_ref()
        .and_then(json_message)
        .or_else(|| text_message(body));

    let throttled = status == StatusCode::TOO_MANY_REQUESTS
        || message.as_deref().is_some_and(is_rate_limit_message);
    if throttled {
        return Error::RateLimited {
            retry_after: retry_after(headers, parsed.as_ref()),
        };
    }

    Error::Server {
        status: status.as_u16(),
        message: message.unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_owned()),
    }
}

/// `message`, then `error` (string), then `error.message`.
fn json_message(value: &serde_json::Value) -> Option<String> {
    value["message"]
        .as_str()
        .or_else(|| value["error"].as_str())
        .or_else(|| value["error"]["message"].as_str())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
}

/// Plain-text bodies are passed through; HTML error pages are not.
fn text_message(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?.trim();
    if text.is_empty() || text.starts_with('<') || text.starts_with('{') {
        return None;
    }
    Some(text.to_owned())
}

/// `Retry-After` header, else a `retryAfter` / `retry_after` body field (seconds).
fn retry_after(headers: &HeaderMap, body: Option<&serde_json::Value>) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
        .or_else(|| {
            let body = body?;
            body["retryAfter"]
                .as_u64()
                .or_else(|| body["retry_after"].as_u64())
                .map(Duration::from_secs)
        })
}

/// Delta-seconds or an HTTP-date. A date already in the past means "now".
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
