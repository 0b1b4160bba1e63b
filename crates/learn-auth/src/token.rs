//! Accounts endpoint calls that run without a bearer token
//!
//! Handles the three unauthenticated interactions with the accounts API:
//! 1. Username/password login (token pair issuance)
//! 2. Token refresh
//! 3. Registration
//!
//! None of these go through the client's request pipeline. Login and register
//! must not carry a stale bearer (the backend rejects invalid bearers even on
//! open endpoints), and the refresh call must never be routed back into the
//! refresh coordinator.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{LOGIN_PATH, REFRESH_PATH, REGISTER_PATH, endpoint_url};
use crate::error::{Error, Result};

/// Login body.
#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Registration body. `role` is assigned by the backend when omitted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Pair issued by the login endpoint. Some deployments omit `refresh`.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Refresh endpoint response. `refresh` is present only when the backend
/// rotates refresh tokens.
#[derive(Debug, Deserialize, Serialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh: &'a str,
}

/// Exchange username/password for a token pair.
///
/// 401/403 (unknown account, wrong password) map to `InvalidCredentials`;
/// validation failures (400) map to `TokenExchange` with the backend body.
pub async fn obtain_token_pair(
    client: &reqwest::Client,
    base_url: &str,
    request: &LoginRequest,
) -> Result<TokenPair> {
    let url = endpoint_url(base_url, LOGIN_PATH);
    debug!(username = %request.username, "requesting token pair");
    let response = client
        .post(&url)
        .json(request)
        .send()
        .await
        .map_err(|e| Error::from_transport("login request failed", e))?;

    read_json(response, "invalid login response").await
}

/// Obtain a new access token using a refresh token.
///
/// Only the refresh coordinator calls this. Any error, including a timeout,
/// ends the session.
pub async fn refresh_token(
    client: &reqwest::Client,
    base_url: &str,
    refresh: &str,
) -> Result<RefreshResponse> {
    let url = endpoint_url(base_url, REFRESH_PATH);
    let response = client
        .post(&url)
        .json(&RefreshBody { refresh })
        .send()
        .await
        .map_err(|e| Error::from_transport("token refresh request failed", e))?;

    read_json(response, "invalid refresh response").await
}

/// Create an account. Returns the created user as the backend serialized it.
pub async fn register(
    client: &reqwest::Client,
    base_url: &str,
    request: &RegisterRequest,
) -> Result<serde_json::Value> {
    let url = endpoint_url(base_url, REGISTER_PATH);
    let response = client
        .post(&url)
        .json(request)
        .send()
        .await
        .map_err(|e| Error::from_transport("register request failed", e))?;

    read_json(response, "invalid register response").await
}

/// Map a token endpoint response to its JSON body or an auth error.
async fn read_json<T: DeserializeOwned>(response: reqwest::Response, context: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials {
                status: status.as_u16(),
                body,
            });
        }
        return Err(Error::TokenExchange {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::from_transport("reading token endpoint body", e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::TokenExchange {
        status: status.as_u16(),
        body: format!("{context}: {e}"),
    })
}
