//! Error types for credential storage and token endpoint calls

/// Errors from credential storage and accounts endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No response was received (connect failure, TLS, body read).
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The transport gave up waiting for the endpoint.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The endpoint answered with a non-auth error or an unreadable body.
    #[error("token exchange failed (status {status}): {body}")]
    TokenExchange { status: u16, body: String },

    /// 401/403 from a token endpoint: the credentials or refresh token are not accepted.
    #[error("invalid credentials (status {status}): {body}")]
    InvalidCredentials { status: u16, body: String },

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    pub(crate) fn from_transport(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(format!("{context}: {err}"))
        } else {
            Error::Http(format!("{context}: {err}"))
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
