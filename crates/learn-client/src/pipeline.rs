//! Authenticated request pipeline
//!
//! Every call goes through `ApiClient::execute`:
//! 1. Attach `Authorization: Bearer <access>` from the credential store
//! 2. Send and classify the response
//! 3. On an auth rejection, ask the refresh coordinator for a usable token and
//!    replay the request once
//! 4. A second rejection, or a failed refresh, is returned to the caller
//!
//! Network errors and timeouts never trigger a refresh.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use learn_auth::{CredentialStore, DEFAULT_BASE_URL, endpoint_url};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::classify::{ResponseClass, classify_response, is_refresh_path};
use crate::coordinator::RefreshCoordinator;
use crate::error::{ApiError, RefreshError};
use crate::request::{ApiRequest, ApiResponse, MultipartForm, RequestBody};
use crate::terminator::{SessionEvent, SessionTerminator, TerminationReason};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Construction options for `ApiClient`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// API root including the `/api` prefix
    pub base_url: String,
    /// Applied to every request unless the request sets its own
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    coordinator: Arc<RefreshCoordinator>,
}

/// HTTP client that authenticates requests and recovers from token expiry.
///
/// Cheap to clone; clones share the credential store, the refresh state and
/// the session event channel.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn new(options: ClientOptions, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("building HTTP client: {e}")))?;
        let terminator = Arc::new(SessionTerminator::new(store.clone()));
        let coordinator =
            RefreshCoordinator::new(http.clone(), options.base_url.clone(), store, terminator);
        Ok(Self::with_coordinator(http, options.base_url, coordinator))
    }

    /// Build a client around an existing coordinator (shared session state).
    pub fn with_coordinator(
        http: reqwest::Client,
        base_url: impl Into<String>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                http,
                base_url: base_url.into(),
                coordinator,
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.inner.coordinator
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        self.inner.coordinator.store()
    }

    pub fn terminator(&self) -> &Arc<SessionTerminator> {
        self.inner.coordinator.terminator()
    }

    /// Session lifecycle events (login, teardown).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.terminator().subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.terminator().is_authenticated()
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::get(path)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        decode(&self.get(path).await?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        decode(&self.execute(ApiRequest::post(path).json(body)?).await?)
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        decode(&self.execute(ApiRequest::put(path).json(body)?).await?)
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        decode(&self.execute(ApiRequest::patch(path).json(body)?).await?)
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::delete(path)).await
    }

    pub async fn post_multipart(
        &self,
        path: &str,
        form: MultipartForm,
    ) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::post(path).multipart(form)).await
    }

    /// Send a request, refreshing the access token and replaying once if the
    /// backend rejects it for auth reasons.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        self.dispatch(request, request_id).await
    }

    #[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.path()))]
    async fn dispatch(
        &self,
        mut request: ApiRequest,
        request_id: String,
    ) -> Result<ApiResponse, ApiError> {
        let mut access = self.store().get().map(|pair| pair.access);

        loop {
            let response = match self.send(&request, access.as_ref()).await {
                Ok(response) => response,
                Err(e) => {
                    if matches!(e, ApiError::Network(_) | ApiError::Timeout(_)) {
                        debug!(error = %e, "no response received");
                        metrics::counter!("api_requests_total", "class" => "network").increment(1);
                    }
                    return Err(e);
                }
            };
            let status = response.status().as_u16();
            let class = classify_response(status, response.body());
            metrics::counter!("api_requests_total", "class" => class.label()).increment(1);

            match class {
                ResponseClass::Success => return Ok(response),
                ResponseClass::Failure => {
                    debug!(status, "request failed");
                    return Err(ApiError::Domain {
                        status,
                        body: response.text(),
                    });
                }
                ResponseClass::AuthExpired if is_refresh_path(request.path()) => {
                    warn!(status, "refresh endpoint rejected the session");
                    self.terminator().terminate(TerminationReason::RefreshFailed);
                    return Err(RefreshError::Rejected { status }.into());
                }
                ResponseClass::AuthExpired if request.is_retried() => {
                    warn!(status, "request rejected again after refresh");
                    return Err(ApiError::AuthExpired {
                        status,
                        body: response.text(),
                    });
                }
                ResponseClass::AuthExpired => {
                    debug!(status, "access token rejected, recovering");
                    let rejected = access.as_ref().map(|token| token.expose().as_str());
                    let renewed = self.coordinator().recover(rejected).await?;
                    access = Some(renewed);
                    request.mark_retried();
                }
            }
        }
    }

    async fn send(
        &self,
        request: &ApiRequest,
        access: Option<&Secret<String>>,
    ) -> Result<ApiResponse, ApiError> {
        let url = endpoint_url(&self.inner.base_url, request.path());

        let mut headers = request.headers().clone();
        headers.remove(AUTHORIZATION);
        if let Some(access) = access {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", access.expose()))
                .map_err(|e| ApiError::InvalidRequest(format!("access token is not a valid header: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = self.inner.http.request(request.method().clone(), &url);
        if !request.query_pairs().is_empty() {
            builder = builder.query(request.query_pairs());
        }
        if let Some(timeout) = request.request_timeout() {
            builder = builder.timeout(timeout);
        }

        builder = match request.body() {
            RequestBody::Empty => builder.headers(headers),
            RequestBody::Json(value) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                builder.headers(headers).json(value)
            }
            RequestBody::Multipart(form) => {
                // The transport sets the content type with the boundary.
                headers.remove(CONTENT_TYPE);
                builder.headers(headers).multipart(form.to_form()?)
            }
            RequestBody::Raw {
                bytes,
                content_type,
            } => {
                if let Some(content_type) = content_type {
                    let value = HeaderValue::from_str(content_type).map_err(|e| {
                        ApiError::InvalidRequest(format!("invalid content type {content_type}: {e}"))
                    })?;
                    headers.insert(CONTENT_TYPE, value);
                }
                builder.headers(headers).body(bytes.clone())
            }
        };

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(transport_error)?;
        Ok(ApiResponse::new(status, headers, body))
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout(err.to_string())
    } else {
        ApiError::Network(err.to_string())
    }
}

/// Decode a JSON body; an empty body decodes as `null` so `()` and `Option`
/// targets accept 204 responses.
fn decode<T: DeserializeOwned>(response: &ApiResponse) -> Result<T, ApiError> {
    if response.body().is_empty() {
        return serde_json::from_slice(b"null").map_err(|e| ApiError::Decode(e.to_string()));
    }
    response.json()
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{any, get, post};
    use axum::{Json, Router};
    use learn_auth::{CredentialPair, MemoryCredentialStore};
    use reqwest::header::HeaderName;
    use serde_json::{Value, json};

    use super::*;

    async fn echo(headers: HeaderMap) -> Json<Value> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        Json(json!({
            "authorization": header("authorization"),
            "content_type": header("content-type"),
            "x_trace": header("x-trace"),
        }))
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/api/echo/", any(echo))
            .route(
                "/api/missing/",
                get(|| async { (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."}))) }),
            )
            .route(
                "/api/forbidden/",
                get(|| async {
                    (
                        StatusCode::FORBIDDEN,
                        Json(json!({"detail": "You do not have permission to perform this action."})),
                    )
                }),
            )
            .route(
                "/api/slow/",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .route(
                "/api/accounts/token/refresh/",
                post(|| async { (StatusCode::UNAUTHORIZED, Json(json!({"code": "token_not_valid"}))) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/api")
    }

    fn client(base_url: String, pair: Option<CredentialPair>) -> ApiClient {
        let store: Arc<dyn CredentialStore> = match pair {
            Some(pair) => Arc::new(MemoryCredentialStore::with_pair(pair)),
            None => Arc::new(MemoryCredentialStore::new()),
        };
        ApiClient::new(
            ClientOptions {
                base_url,
                timeout: Duration::from_secs(5),
            },
            store,
        )
        .unwrap()
    }

    fn logged_in() -> Option<CredentialPair> {
        Some(CredentialPair::new("T1", Some("R1".into())))
    }

    #[tokio::test]
    async fn attaches_bearer_token() {
        let client = client(serve().await, logged_in());
        let echoed: Value = client.get_json("/echo/").await.unwrap();
        assert_eq!(echoed["authorization"], "Bearer T1");
    }

    #[tokio::test]
    async fn omits_authorization_when_logged_out() {
        let client = client(serve().await, None);
        let echoed: Value = client.get_json("/echo/").await.unwrap();
        assert!(echoed["authorization"].is_null());
    }

    #[tokio::test]
    async fn caller_authorization_is_replaced() {
        let client = client(serve().await, logged_in());
        let request = ApiRequest::get("/echo/")
            .header(AUTHORIZATION, HeaderValue::from_static("Bearer forged"))
            .header(HeaderName::from_static("x-trace"), HeaderValue::from_static("abc"));
        let echoed: Value = client.execute(request).await.unwrap().json().unwrap();
        assert_eq!(echoed["authorization"], "Bearer T1");
        assert_eq!(echoed["x_trace"], "abc");
    }

    #[tokio::test]
    async fn json_body_sets_json_content_type() {
        let client = client(serve().await, logged_in());
        let echoed: Value = client
            .post_json("/echo/", &json!({"title": "Fractions"}))
            .await
            .unwrap();
        assert_eq!(echoed["content_type"], "application/json");
    }

    #[tokio::test]
    async fn multipart_body_carries_boundary() {
        let client = client(serve().await, logged_in());
        let request = ApiRequest::post("/echo/")
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .multipart(MultipartForm::new().text("title", "Worksheet").file(
                "file",
                "sheet.pdf",
                Some("application/pdf"),
                vec![0u8; 16],
            ));
        let echoed: Value = client.execute(request).await.unwrap().json().unwrap();
        let content_type = echoed["content_type"].as_str().unwrap();
        assert!(
            content_type.starts_with("multipart/form-data; boundary="),
            "got {content_type}"
        );
    }

    #[tokio::test]
    async fn raw_body_keeps_caller_content_type() {
        let client = client(serve().await, logged_in());
        let request = ApiRequest::put("/echo/").raw(&b"a,b\n1,2\n"[..], Some("text/csv"));
        let echoed: Value = client.execute(request).await.unwrap().json().unwrap();
        assert_eq!(echoed["content_type"], "text/csv");
    }

    #[tokio::test]
    async fn domain_errors_pass_through() {
        let client = client(serve().await, logged_in());

        let err = client.get("/missing/").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.detail().as_deref(), Some("Not found."));

        let err = client.get("/forbidden/").await.unwrap_err();
        assert!(matches!(err, ApiError::Domain { status: 403, .. }));
        assert_eq!(client.coordinator().episodes(), 0);
        assert!(client.store().get().is_some());
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client(format!("http://{addr}/api"), logged_in());
        let err = client.get("/echo/").await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_)), "got {err:?}");
        assert_eq!(client.coordinator().episodes(), 0);
        assert!(client.store().get().is_some());
    }

    #[tokio::test]
    async fn per_request_timeout_is_timeout_error() {
        let client = client(serve().await, logged_in());
        let request = ApiRequest::get("/slow/").timeout(Duration::from_millis(50));
        let err = client.execute(request).await.unwrap_err();
        assert!(matches!(err, ApiError::Timeout(_)), "got {err:?}");
        assert!(client.store().get().is_some());
    }

    #[tokio::test]
    async fn refresh_path_rejection_terminates_without_recovery() {
        let client = client(serve().await, logged_in());
        let mut events = client.subscribe();

        let err = client
            .execute(ApiRequest::post("/accounts/token/refresh/"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::RefreshFailed(RefreshError::Rejected { status: 401 })
        ));
        assert_eq!(client.coordinator().episodes(), 0);
        assert!(client.store().get().is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated {
                reason: TerminationReason::RefreshFailed
            }
        );
    }
}
