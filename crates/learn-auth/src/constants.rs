//! Accounts endpoint paths and credential storage keys
//!
//! Paths are relative to the API base URL (which already carries the `/api`
//! prefix). They keep their trailing slash; the backend router rejects
//! requests without it.

/// Default API base when none is configured.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api";

/// Username/password exchange for an access/refresh pair
pub const LOGIN_PATH: &str = "/accounts/login/";

/// Refresh endpoint. Only the refresh coordinator may call it.
pub const REFRESH_PATH: &str = "/accounts/token/refresh/";

/// Self-service account creation
pub const REGISTER_PATH: &str = "/accounts/register/";

/// Authenticated user's profile (GET/PATCH)
pub const PROFILE_PATH: &str = "/accounts/profile/";

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Join an API base URL and an endpoint path with exactly one slash between them.
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
