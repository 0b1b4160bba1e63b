//! Error taxonomy for API calls
//!
//! - `Network`/`Timeout`: no response arrived; never triggers a refresh.
//! - `AuthExpired`: a request was rejected again after its one replay.
//! - `RefreshFailed`: the session could not be renewed and has been torn down.
//! - `Domain`: any other 4xx/5xx, passed through with status and body.

use serde_json::Value;

/// Why a refresh episode failed.
///
/// Cloneable because one outcome is shared by every request waiting on the
/// same refresh.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("no stored credentials to refresh")]
    NoCredentials,

    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("refresh token rejected (status {status})")]
    Rejected { status: u16 },

    #[error("refresh endpoint returned status {status}")]
    Endpoint { status: u16 },

    #[error("refresh transport failure: {0}")]
    Transport(String),

    #[error("failed to persist refreshed credentials: {0}")]
    Storage(String),

    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

impl From<learn_auth::Error> for RefreshError {
    fn from(err: learn_auth::Error) -> Self {
        match err {
            learn_auth::Error::InvalidCredentials { status, .. } => RefreshError::Rejected { status },
            learn_auth::Error::TokenExchange { status, .. } => RefreshError::Endpoint { status },
            learn_auth::Error::Http(msg) | learn_auth::Error::Timeout(msg) => {
                RefreshError::Transport(msg)
            }
            learn_auth::Error::CredentialParse(msg) | learn_auth::Error::Io(msg) => {
                RefreshError::Storage(msg)
            }
        }
    }
}

/// Errors surfaced to callers of the API client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("authentication rejected after refresh (status {status})")]
    AuthExpired { status: u16, body: String },

    #[error("session refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    #[error("request failed with status {status}")]
    Domain { status: u16, body: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("credential storage error: {0}")]
    Storage(String),
}

impl From<learn_auth::Error> for ApiError {
    fn from(err: learn_auth::Error) -> Self {
        match err {
            learn_auth::Error::Http(msg) => ApiError::Network(msg),
            learn_auth::Error::Timeout(msg) => ApiError::Timeout(msg),
            learn_auth::Error::TokenExchange { status, body }
            | learn_auth::Error::InvalidCredentials { status, body } => {
                ApiError::Domain { status, body }
            }
            learn_auth::Error::CredentialParse(msg) | learn_auth::Error::Io(msg) => {
                ApiError::Storage(msg)
            }
        }
    }
}

impl ApiError {
    /// HTTP status of the failing response, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::AuthExpired { status, .. } | ApiError::Domain { status, .. } => Some(*status),
            ApiError::RefreshFailed(RefreshError::Rejected { status })
            | ApiError::RefreshFailed(RefreshError::Endpoint { status }) => Some(*status),
            _ => None,
        }
    }

    /// True when the session is gone and the user must log in again.
    pub fn is_session_ended(&self) -> bool {
        matches!(self, ApiError::RefreshFailed(_))
    }

    /// The backend's `detail` message, when the error body carries one.
    pub fn detail(&self) -> Option<String> {
        let body = self.body_json()?;
        body.get("detail")?.as_str().map(str::to_owned)
    }

    /// Per-field validation messages from an error body shaped like
    /// `{"field": ["message", ...], "non_field_errors": [...]}`.
    ///
    /// A single string instead of a list is accepted. `detail` and `code`
    /// are not field errors and are skipped.
    pub fn field_errors(&self) -> Vec<(String, String)> {
        let Some(Value::Object(map)) = self.body_json() else {
            return Vec::new();
        };

        let mut errors = Vec::new();
        for (field, messages) in map {
            if field == "detail" || field == "code" {
                continue;
            }
            match messages {
                Value::Array(items) => {
                    for item in items {
                        if let Some(msg) = item.as_str() {
                            errors.push((field.clone(), msg.to_owned()));
                        }
                    }
                }
                Value::String(msg) => errors.push((field.clone(), msg)),
                _ => {}
            }
        }
        errors
    }

    fn body_json(&self) -> Option<Value> {
        match self {
            ApiError::AuthExpired { body, .. } | ApiError::Domain { body, .. } => {
                serde_json::from_str(body).ok()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(status: u16, body: &str) -> ApiError {
        ApiError::Domain {
            status,
            body: body.into(),
        }
    }

    #[test]
    fn detail_extracted_from_body() {
        let err = domain(404, r#"{"detail":"Not found."}"#);
        assert_eq!(err.detail().as_deref(), Some("Not found."));
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn detail_absent_for_non_json_body() {
        let err = domain(502, "<html>Bad Gateway</html>");
        assert!(err.detail().is_none());
        assert!(err.field_errors().is_empty());
    }

    #[test]
    fn field_errors_flatten_lists_and_strings() {
        let err = domain(
            400,
            r#"{"username":["This field is required."],"email":"Enter a valid email address.","non_field_errors":["Bad combo.","Try again."]}"#,
        );
        let mut fields = err.field_errors();
        fields.sort();
        assert_eq!(
            fields,
            vec![
                ("email".to_string(), "Enter a valid email address.".to_string()),
                ("non_field_errors".to_string(), "Bad combo.".to_string()),
                ("non_field_errors".to_string(), "Try again.".to_string()),
                ("username".to_string(), "This field is required.".to_string()),
            ]
        );
    }

    #[test]
    fn field_errors_skip_detail_and_code() {
        let err = domain(
            403,
            r#"{"detail":"You do not have permission to perform this action.","code":"permission_denied"}"#,
        );
        assert!(err.field_errors().is_empty());
    }

    #[test]
    fn refresh_failure_ends_session() {
        let err = ApiError::from(RefreshError::Rejected { status: 401 });
        assert!(err.is_session_ended());
        assert_eq!(err.status(), Some(401));
        assert!(!domain(500, "").is_session_ended());
    }

    #[test]
    fn auth_errors_map_to_refresh_errors() {
        let rejected = RefreshError::from(learn_auth::Error::InvalidCredentials {
            status: 401,
            body: String::new(),
        });
        assert_eq!(rejected, RefreshError::Rejected { status: 401 });

        let timeout = RefreshError::from(learn_auth::Error::Timeout("slow".into()));
        assert_eq!(timeout, RefreshError::Transport("slow".into()));
    }

    #[test]
    fn login_rejection_maps_to_domain_error() {
        let err = ApiError::from(learn_auth::Error::InvalidCredentials {
            status: 401,
            body: r#"{"detail":"No active account found with the given credentials"}"#.into(),
        });
        assert_eq!(err.status(), Some(401));
        assert_eq!(
            err.detail().as_deref(),
            Some("No active account found with the given credentials")
        );
    }
}
