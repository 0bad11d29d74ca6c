//! Rate limit headers and the 429 response.

use axum::http::header::{ACCEPT, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ratelimit::Decision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_WINDOW: HeaderName = HeaderName::from_static("x-ratelimit-window");

const X_REQUESTED_WITH: HeaderName = HeaderName::from_static("x-requested-with");

/// Machine-readable code carried by every denial body.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// JSON body of a denied API request.
#[derive(Debug, Serialize)]
pub struct RateLimitExceeded {
    pub error: bool,
    pub message: String,
    pub code: &'static str,
    pub retry_after: u64,
    pub reset_at: i64,
    pub limit: u64,
    pub action: String,
}

impl RateLimitExceeded {
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            error: true,
            message: format!(
                "Rate limit exceeded. Try again in {}",
                format_wait(decision.retry_after)
            ),
            code: RATE_LIMIT_EXCEEDED,
            retry_after: decision.retry_after,
            reset_at: decision.reset_at,
            limit: decision.limit,
            action: decision.action.clone(),
        }
    }
}

/// Set the `X-RateLimit-*` headers for `decision`.
pub fn write_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
    headers.insert(X_RATELIMIT_WINDOW, HeaderValue::from(decision.window_seconds));
}

/// Build the 429 response for a denied request.
///
/// API callers get [`RateLimitExceeded`] as JSON, browsers a short page.
pub fn denied(decision: &Decision, is_api: bool) -> Response {
    let mut response = if is_api {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitExceeded::from_decision(decision)),
        )
            .into_response()
    } else {
        (StatusCode::TOO_MANY_REQUESTS, Html(denied_page(decision.retry_after))).into_response()
    };

    let headers = response.headers_mut();
    write_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after));
    response
}

/// Whether the request wants a JSON denial.
pub fn is_api_request(headers: &HeaderMap, uri: &Uri) -> bool {
    let xhr = headers
        .get(X_REQUESTED_WITH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"));
    let wants_json = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json") && !v.contains("text/html"));

    xhr || wants_json || uri.path().starts_with("/api/")
}

/// Human wait text, e.g. `45 seconds`, `2 minutes`, `1 hour`.
pub fn format_wait(seconds: u64) -> String {
    let (amount, unit) = if seconds < 60 {
        (seconds, "second")
    } else if seconds < 3_600 {
        (seconds.div_ceil(60), "minute")
    } else {
        (seconds.div_ceil(3_600), "hour")
    };

    if amount == 1 {
        format!("{} {}", amount, unit)
    } else {
        format!("{} {}s", amount, unit)
    }
}

fn denied_page(retry_after: u64) -> String {
    let minutes = retry_after.div_ceil(60);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Rate Limit Exceeded</title>
</head>
<body>
    <h1>429</h1>
    <h2>Rate Limit Exceeded</h2>
    <p>You have made too many requests. Please wait {} minute(s) before trying again.</p>
    <a href="/">Return Home</a>
</body>
</html>
"#,
        minutes
    )
}
