//! Response classification for the request pipeline
//!
//! Every inbound response lands in exactly one class. Only `AuthExpired`
//! involves the refresh coordinator; everything else goes straight back to the
//! caller.

use learn_auth::REFRESH_PATH;
use serde_json::Value;

/// Error code the backend's JWT layer puts in the body of an expired or
/// invalid access token rejection.
pub const TOKEN_NOT_VALID: &str = "token_not_valid";

/// Outcome class of one HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 1xx-3xx: returned to the caller as-is
    Success,
    /// 401, or a 4xx carrying `code: token_not_valid`: the access token must be renewed
    AuthExpired,
    /// Any other 4xx/5xx: surfaced as a domain error
    Failure,
}

impl ResponseClass {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            ResponseClass::Success => "success",
            ResponseClass::AuthExpired => "auth_expired",
            ResponseClass::Failure => "failure",
        }
    }
}

/// Classify a response by status code and body.
pub fn classify_response(status: u16, body: &[u8]) -> ResponseClass {
    match status {
        100..=399 => ResponseClass::Success,
        401 => ResponseClass::AuthExpired,
        400..=499 if carries_token_not_valid(body) => ResponseClass::AuthExpired,
        _ => ResponseClass::Failure,
    }
}

fn carries_token_not_valid(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("code")?.as_str().map(|code| code == TOKEN_NOT_VALID))
        .unwrap_or(false)
}

/// Whether a request path targets the refresh endpoint. Query strings and a
/// missing leading or trailing slash are ignored.
pub fn is_refresh_path(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    path.trim_matches('/') == REFRESH_PATH.trim_matches('/')
}
